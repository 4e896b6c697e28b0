//! Notification dispatcher trait: delivers task lifecycle events.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::TaskEvent;

/// Fire-and-forget delivery target. Errors are logged by the caller and never
/// affect task state.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &TaskEvent) -> Result<()>;
}
