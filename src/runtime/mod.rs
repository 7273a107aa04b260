use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::container::{ContainerDetail, ContainerEvent};
use crate::error::RuntimeError;

pub mod docker;
pub use docker::DockerRuntime;

/// Lifecycle events the controller subscribes to.
pub const WATCHED_EVENTS: [&str; 5] = ["die", "kill", "pause", "start", "unpause"];

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Ids of the currently running containers.
    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    /// Container events in [`WATCHED_EVENTS`] that happened at or after
    /// `since` (unix seconds).
    fn events(&self, since: i64) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>>;
}
