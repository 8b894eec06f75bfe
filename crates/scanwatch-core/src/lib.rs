pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod directory;
pub mod error;
pub mod kv;
pub mod prelude;
pub mod scan;
pub mod scheduler;
pub mod task;

mod poller;
#[cfg(test)]
mod testing;

pub use config::*;
pub use coordinator::*;
pub use error::*;
pub use task::*;
