#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Overrun policies: admission of new workflow instances while prior
//! instances of the same template are live.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tukio::overrun::{self, OverrunPolicyHandler};
use tukio::{
    Event, EventBroker, FutureState, MemoryBroker, TaskHolder, TaskRegistry, Workflow,
    WorkflowTemplate,
};

use common::registry;

fn template(policy: &str) -> Arc<WorkflowTemplate> {
    Arc::new(
        WorkflowTemplate::from_dict(json!({
            "id": "overrun",
            "policy": policy,
            "tasks": [{"id": "slow", "name": "sleep", "config": {"seconds": 0.3}}],
            "graph": {"slow": []},
        }))
        .unwrap(),
    )
}

fn handler(template: &Arc<WorkflowTemplate>) -> OverrunPolicyHandler {
    OverrunPolicyHandler::new(
        Arc::clone(template),
        registry(),
        Arc::new(MemoryBroker::new()),
    )
}

#[tokio::test]
async fn test_skip_policy() {
    let template = template("skip");
    let handler = handler(&template);

    let first = handler.new_workflow(&[]).unwrap().expect("nothing running");
    assert!(handler.new_workflow(&[first]).unwrap().is_none());
}

#[tokio::test]
async fn test_start_new_policy() {
    let template = template("start-new");
    let handler = handler(&template);

    let first = handler.new_workflow(&[]).unwrap().expect("nothing running");
    let second = handler.new_workflow(&[first]).unwrap();
    assert!(second.is_some());
}

#[tokio::test]
async fn test_skip_until_unlock_policy() {
    let template = template("skip-until-unlock");
    let handler = handler(&template);

    let first = handler.new_workflow(&[]).unwrap().expect("nothing running");
    // Instances under this policy start locked
    assert!(first.is_locked());
    assert!(handler.new_workflow(std::slice::from_ref(&first)).unwrap().is_none());

    first.unlock();
    assert!(handler.new_workflow(&[first]).unwrap().is_some());
}

#[tokio::test]
async fn test_abort_running_policy() {
    let template = template("abort-running");
    let handler = handler(&template);

    let first = handler.new_workflow(&[]).unwrap().expect("nothing running");
    first.run(json!({})).unwrap();

    let second = handler.new_workflow(std::slice::from_ref(&first)).unwrap();
    assert!(second.is_some());
    assert_eq!(first.wait().await, FutureState::Cancelled);
}

#[tokio::test]
async fn test_template_mismatch_is_rejected() {
    let handler = handler(&template("skip"));
    let other = Arc::new(
        WorkflowTemplate::from_dict(json!({
            "id": "other",
            "tasks": [{"id": "1", "name": "basic"}],
            "graph": {"1": []},
        }))
        .unwrap(),
    );
    let stranger = Workflow::new(other, registry(), Arc::new(MemoryBroker::new()));
    assert!(matches!(
        handler.new_workflow(&[stranger]),
        Err(overrun::Error::TemplateMismatch { .. })
    ));
}

#[tokio::test]
async fn test_new_workflow_helper() {
    let template = template("start-new");
    let workflow = overrun::new_workflow(
        template,
        &[],
        registry(),
        Arc::new(MemoryBroker::new()),
    )
    .unwrap();
    assert!(workflow.is_some());
}

/// Releases the workflow's overrun lock once this task completes.
struct UnlockerTask;

#[async_trait]
impl TaskHolder for UnlockerTask {
    async fn execute(&self, event: Event) -> tukio::task::Result<Event> {
        Workflow::current_workflow()
            .expect("task runs within a workflow")
            .unlock_when_task_done()
            .expect("called from within a task");
        Ok(event)
    }
}

#[tokio::test]
async fn test_unlock_when_task_done() {
    let registry = TaskRegistry::new();
    registry.register("unlocker", |_| {
        Ok(Arc::new(UnlockerTask) as Arc<dyn TaskHolder>)
    });
    registry.register("slow", |_| {
        Ok(Arc::new(common::SleepTask::new(Duration::from_millis(300))) as Arc<dyn TaskHolder>)
    });

    let template = WorkflowTemplate::from_dict(json!({
        "policy": "skip-until-unlock",
        "tasks": [
            {"id": "unlocker", "name": "unlocker"},
            {"id": "slow", "name": "slow"},
        ],
        "graph": {"unlocker": ["slow"], "slow": []},
    }))
    .unwrap();
    let workflow = Workflow::new(
        Arc::new(template),
        Arc::new(registry),
        Arc::new(MemoryBroker::new()) as Arc<dyn EventBroker>,
    );
    assert!(workflow.is_locked());

    workflow.run(json!({})).unwrap();
    // The unlocker finishes quickly; the lock is released while the slow
    // branch still runs
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!workflow.is_locked());
    assert!(workflow.state().is_none());

    assert_eq!(workflow.wait().await, FutureState::Finished);
}
