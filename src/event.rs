//! Events routed between tasks, workflows and the broker.

use serde::{Deserialize, Serialize};

/// Describes where an event comes from: which workflow template, which
/// execution instance, and (when emitted by a task) which task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub workflow_template_id: String,
    pub workflow_exec_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_exec_id: Option<String>,
}

impl EventSource {
    /// Source descriptor for events emitted by the workflow itself.
    #[must_use]
    pub fn workflow(workflow_template_id: &str, workflow_exec_id: &str) -> Self {
        Self {
            workflow_template_id: workflow_template_id.to_owned(),
            workflow_exec_id: workflow_exec_id.to_owned(),
            task_template_id: None,
            task_exec_id: None,
        }
    }

    /// Source descriptor for events emitted by a single task execution.
    #[must_use]
    pub fn task(
        workflow_template_id: &str,
        workflow_exec_id: &str,
        task_template_id: &str,
        task_exec_id: &str,
    ) -> Self {
        Self {
            workflow_template_id: workflow_template_id.to_owned(),
            workflow_exec_id: workflow_exec_id.to_owned(),
            task_template_id: Some(task_template_id.to_owned()),
            task_exec_id: Some(task_exec_id.to_owned()),
        }
    }
}

/// A unit of data flowing through a workflow.
///
/// Tasks receive their seed as an [`Event`], may receive further events
/// through their inbox while running, and produce an [`Event`] as result.
/// An event without a source is stamped by the engine with the producing
/// task's descriptor before it is handed to downstream tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
}

impl Event {
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self { data, source: None }
    }

    #[must_use]
    pub fn with_source(data: serde_json::Value, source: EventSource) -> Self {
        Self {
            data,
            source: Some(source),
        }
    }
}

impl From<serde_json::Value> for Event {
    fn from(data: serde_json::Value) -> Self {
        Self::new(data)
    }
}
