//! Per-job capability-service connections.

mod manager;
mod state;

pub use manager::{ConnectSummary, LifecycleOptions, ServiceManager};
pub use state::ConnectionState;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ServiceSpec;

/// Opens and closes the transport behind a service.
///
/// Both calls for one connection are made from the same supervising task.
#[async_trait]
pub trait ServiceConnector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn open(&self, spec: &ServiceSpec) -> Result<Self::Connection>;

    async fn close(&self, connection: Arc<Self::Connection>) -> Result<()>;
}
