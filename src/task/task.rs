use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{TaskHolder, TaskTemplate};
use crate::broker::RegistrationKey;
use crate::event::{Event, EventSource};
use crate::state::FutureState;
use crate::workflow::{WeakWorkflow, Workflow};

tokio::task_local! {
    pub(crate) static CURRENT_TASK: Arc<TukioTask>;
}

/// The task whose body (or inbox sink) is currently executing on this
/// tokio task, if any.
#[must_use]
pub fn current_task() -> Option<Arc<TukioTask>> {
    CURRENT_TASK.try_with(Arc::clone).ok()
}

/// How a task ended. Set exactly once.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task returned an event, handed to its downstream tasks.
    Finished(Event),
    /// The task's body (or its constructor-provided logic) failed.
    Exception(Arc<super::Error>),
    /// The task was cancelled, directly or through workflow cancellation.
    Cancelled,
    /// The task's own timer cancelled it.
    Timeout,
}

impl TaskOutcome {
    #[must_use]
    pub fn state(&self) -> FutureState {
        match self {
            TaskOutcome::Finished(_) => FutureState::Finished,
            TaskOutcome::Exception(_) => FutureState::Exception,
            TaskOutcome::Cancelled => FutureState::Cancelled,
            TaskOutcome::Timeout => FutureState::Timeout,
        }
    }
}

/// A running (or finished) task execution.
///
/// Owned by its workflow; holds a non-owning back-reference the other way
/// so task logic can reach the workflow through
/// [`Workflow::current_workflow`]. Completes exactly once with a result, a
/// failure, a cancellation or a timeout cancellation.
pub struct TukioTask {
    uid: String,
    template: Arc<TaskTemplate>,
    holder: Arc<dyn TaskHolder>,
    workflow: WeakWorkflow,
    source: EventSource,
    inbox: mpsc::UnboundedSender<Event>,
    registrations: Vec<(RegistrationKey, Option<String>)>,
    abort: OnceLock<AbortHandle>,
    start: DateTime<Utc>,
    end: OnceLock<DateTime<Utc>>,
    outcome: OnceLock<TaskOutcome>,
}

impl TukioTask {
    pub(crate) fn new(
        uid: String,
        template: Arc<TaskTemplate>,
        holder: Arc<dyn TaskHolder>,
        workflow: WeakWorkflow,
        source: EventSource,
        inbox: mpsc::UnboundedSender<Event>,
        registrations: Vec<(RegistrationKey, Option<String>)>,
    ) -> Self {
        Self {
            uid,
            template,
            holder,
            workflow,
            source,
            inbox,
            registrations,
            abort: OnceLock::new(),
            start: Utc::now(),
            end: OnceLock::new(),
            outcome: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    #[must_use]
    pub fn template(&self) -> &Arc<TaskTemplate> {
        &self.template
    }

    #[must_use]
    pub fn holder(&self) -> &Arc<dyn TaskHolder> {
        &self.holder
    }

    /// The workflow that started this task, if it is still alive.
    #[must_use]
    pub fn workflow(&self) -> Option<Workflow> {
        self.workflow.upgrade()
    }

    /// Source descriptor identifying this execution.
    #[must_use]
    pub fn source(&self) -> &EventSource {
        &self.source
    }

    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end.get().copied()
    }

    /// Terminal state, or `None` while the task is still running.
    #[must_use]
    pub fn state(&self) -> Option<FutureState> {
        self.outcome.get().map(TaskOutcome::state)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.outcome.get().is_some()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.get()
    }

    /// The event the task finished with, when it finished.
    #[must_use]
    pub fn result(&self) -> Option<&Event> {
        match self.outcome.get() {
            Some(TaskOutcome::Finished(event)) => Some(event),
            Some(TaskOutcome::Exception(_) | TaskOutcome::Cancelled | TaskOutcome::Timeout)
            | None => None,
        }
    }

    /// The error the task failed with, when it failed.
    #[must_use]
    pub fn error(&self) -> Option<&Arc<super::Error>> {
        match self.outcome.get() {
            Some(TaskOutcome::Exception(error)) => Some(error),
            Some(TaskOutcome::Finished(_) | TaskOutcome::Cancelled | TaskOutcome::Timeout)
            | None => None,
        }
    }

    /// Push an event into the task's inbox. Returns `false` when the task
    /// is no longer consuming events (it already completed); such events
    /// are dropped.
    pub(crate) fn deliver(&self, event: Event) -> bool {
        self.inbox.send(event).is_ok()
    }

    pub(crate) fn registrations(&self) -> &[(RegistrationKey, Option<String>)] {
        &self.registrations
    }

    pub(crate) fn set_abort(&self, handle: AbortHandle) {
        let _ = self.abort.set(handle);
    }

    /// Request cancellation of the in-flight execution. Cooperative: the
    /// body is interrupted at its next suspension point.
    pub(crate) fn abort(&self) {
        if let Some(handle) = self.abort.get() {
            handle.abort();
        }
    }

    pub(crate) fn finalize(&self, outcome: TaskOutcome) {
        let _ = self.outcome.set(outcome);
        let _ = self.end.set(Utc::now());
    }

    /// Execution metadata in declarative form.
    #[must_use]
    pub fn as_dict(&self) -> Value {
        json!({
            "id": self.uid,
            "name": self.template.name,
            "template_id": self.template.uid,
            "start": self.start.to_rfc3339(),
            "end": self.end().map(|end| end.to_rfc3339()),
            "state": self.state(),
        })
    }
}

impl std::fmt::Debug for TukioTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TukioTask")
            .field("uid", &self.uid)
            .field("template", &self.template.uid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
