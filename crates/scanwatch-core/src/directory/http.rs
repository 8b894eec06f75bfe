use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Result, ScanwatchError};
use crate::task::{Task, TaskKey, TaskStatus};

use super::{ScanTarget, SubmittedTask, TaskDirectory, clamp_limit};

#[derive(Debug, Deserialize)]
struct TaskList {
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct ScanJobResponse {
    tasks: Vec<SubmittedTask>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ScanJobRequest {
    LibraryPath { library_path_id: i64 },
    All { all: bool },
}

impl From<ScanTarget> for ScanJobRequest {
    fn from(target: ScanTarget) -> Self {
        match target {
            ScanTarget::LibraryPath(library_path_id) => {
                ScanJobRequest::LibraryPath { library_path_id }
            }
            ScanTarget::All => ScanJobRequest::All { all: true },
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusPatch {
    status: TaskStatus,
}

/// REST client for the backend task endpoints.
#[derive(Debug, Clone)]
pub struct HttpTaskDirectory {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpTaskDirectory {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self::with_client(builder.build()?, config))
    }

    pub fn with_client(client: Client, config: &ServerConfig) -> Self {
        let base_url = config.base_url.trim().trim_end_matches('/').to_owned();
        info!(%base_url, "task directory client ready");

        Self {
            client,
            base_url,
            api_token: config.api_token.clone(),
        }
    }

    pub fn build_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        Err(ScanwatchError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let bytes = self.send(request).await?.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| ScanwatchError::Decode(err.to_string()))
    }
}

#[async_trait]
impl TaskDirectory for HttpTaskDirectory {
    async fn list_tasks(&self, limit: u32) -> Result<Vec<Task>> {
        let limit = clamp_limit(limit);
        let request = self
            .client
            .get(self.build_url("tasks"))
            .query(&[("limit", limit)]);
        let list: TaskList = self.execute(request).await?;
        debug!(count = list.tasks.len(), limit, "listed tasks");
        Ok(list.tasks)
    }

    async fn get_task(&self, id: TaskKey) -> Result<Task> {
        let request = self.client.get(self.build_url(&format!("tasks/{id}")));
        self.execute(request).await
    }

    async fn cancel_task(&self, id: TaskKey) -> Result<()> {
        let request = self
            .client
            .patch(self.build_url(&format!("tasks/{id}")))
            .json(&StatusPatch {
                status: TaskStatus::Cancelled,
            });
        self.send(request).await?;
        info!(task = id, "cancellation requested");
        Ok(())
    }

    async fn submit_scan(&self, target: ScanTarget) -> Result<Vec<SubmittedTask>> {
        let request = self
            .client
            .post(self.build_url("scan-jobs"))
            .json(&ScanJobRequest::from(target));
        let response: ScanJobResponse = self.execute(request).await?;
        info!(%target, tasks = response.tasks.len(), "scan submitted");
        Ok(response.tasks)
    }
}
