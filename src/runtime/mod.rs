use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RuntimeError;
use crate::types::{Container, LifecycleEvent};

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Forward container lifecycle events to `event_tx` until the
    /// runtime's event stream ends.  Never reconnects.
    async fn monitor(&self, event_tx: mpsc::Sender<LifecycleEvent>) -> Result<(), RuntimeError>;

    /// Look up one container. A container that no longer exists is `None`.
    async fn inspect(&self, container_id: &str) -> Result<Option<Container>, RuntimeError>;

    /// All currently running containers.
    async fn list_running(&self) -> Result<Vec<Container>, RuntimeError>;
}
