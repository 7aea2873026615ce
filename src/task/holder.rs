use async_trait::async_trait;

use super::Result;
use crate::event::Event;

/// The business logic executed by a task.
///
/// Instances are produced by a [`TaskRegistry`](super::TaskRegistry)
/// factory from an opaque config mapping. The engine drives the instance
/// through [`execute`](Self::execute) with the task's seed event; events
/// that reach the task while it runs (join fan-in, broker subscriptions)
/// are handed to [`data_received`](Self::data_received) one at a time,
/// interleaved with the execution at its suspension points.
#[async_trait]
pub trait TaskHolder: Send + Sync {
    /// Run the task. The returned event is passed to downstream tasks; if
    /// it carries no source the engine stamps it with this task's
    /// descriptor.
    async fn execute(&self, event: Event) -> Result<Event>;

    /// Sink for events delivered mid-execution. Default: drop them.
    async fn data_received(&self, event: Event) {
        let _ = event;
    }

    /// Extra execution details merged into workflow reports.
    fn report(&self) -> Option<serde_json::Value> {
        None
    }
}
