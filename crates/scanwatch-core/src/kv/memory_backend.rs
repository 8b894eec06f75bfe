use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

use super::{KvBackend, KvKey};

/// Process-local backend; nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<KvKey, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &KvKey, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
