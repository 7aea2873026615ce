//! Overrun policies: what to do when a workflow template must start while
//! prior instances of the same template are still running.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::broker::EventBroker;
use crate::task::TaskRegistry;
use crate::template::WorkflowTemplate;
use crate::workflow::Workflow;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("expected template ID {expected}, got {found}"))]
    TemplateMismatch { expected: String, found: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Admission rule for new instances of a workflow template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrunPolicy {
    /// Skip until all running instances are finished.
    Skip,
    /// Start a new instance whatever the running instances.
    StartNew,
    /// Skip until all running instances have been unlocked.
    #[default]
    SkipUntilUnlock,
    /// Abort all running instances before creating a new one.
    AbortRunning,
}

impl OverrunPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OverrunPolicy::Skip => "skip",
            OverrunPolicy::StartNew => "start-new",
            OverrunPolicy::SkipUntilUnlock => "skip-until-unlock",
            OverrunPolicy::AbortRunning => "abort-running",
        }
    }
}

impl std::fmt::Display for OverrunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a new execution of a template may start, given the
/// instances of that template currently running.
pub struct OverrunPolicyHandler {
    template: Arc<WorkflowTemplate>,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn EventBroker>,
}

impl OverrunPolicyHandler {
    #[must_use]
    pub fn new(
        template: Arc<WorkflowTemplate>,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        Self {
            template,
            registry,
            broker,
        }
    }

    /// Apply the template's policy to `running` and return a new workflow
    /// instance, or `None` when the policy denies one. Every running
    /// instance must be an execution of this handler's template.
    pub fn new_workflow(&self, running: &[Workflow]) -> Result<Option<Workflow>> {
        for workflow in running {
            let found = &workflow.template().uid;
            ensure!(
                *found == self.template.uid,
                TemplateMismatchSnafu {
                    expected: self.template.uid.clone(),
                    found: found.clone(),
                }
            );
        }
        let workflow = match self.template.policy {
            OverrunPolicy::Skip => running.is_empty().then(|| self.instance()),
            OverrunPolicy::StartNew => Some(self.instance()),
            OverrunPolicy::SkipUntilUnlock => {
                let locked = running.iter().any(Workflow::is_locked);
                (!locked).then(|| self.instance())
            }
            OverrunPolicy::AbortRunning => {
                for workflow in running {
                    workflow.cancel();
                }
                Some(self.instance())
            }
        };
        Ok(workflow)
    }

    fn instance(&self) -> Workflow {
        Workflow::new(
            Arc::clone(&self.template),
            Arc::clone(&self.registry),
            Arc::clone(&self.broker),
        )
    }
}

/// Shorthand: run `template`'s overrun policy against `running` and return
/// a new instance if one may start.
pub fn new_workflow(
    template: Arc<WorkflowTemplate>,
    running: &[Workflow],
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn EventBroker>,
) -> Result<Option<Workflow>> {
    OverrunPolicyHandler::new(template, registry, broker).new_workflow(running)
}
