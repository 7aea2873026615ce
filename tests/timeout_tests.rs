#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Timeout enforcement at the workflow level (timer cancels the whole
//! workflow, terminal state `timeout`) and at the task level (timer
//! cancels the task only, the workflow still finishes).

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tukio::{FutureState, MemoryBroker, Workflow, WorkflowTemplate};

use common::{init_tracing, load_fixture, registry};

fn workflow_from_fixture(name: &str) -> Workflow {
    init_tracing();
    let template = WorkflowTemplate::from_dict(load_fixture(name)).unwrap();
    Workflow::new(
        Arc::new(template),
        registry(),
        Arc::new(MemoryBroker::new()),
    )
}

#[tokio::test]
async fn test_workflow_timeout_cancels_running_tasks() {
    let workflow = workflow_from_fixture("workflow_timeout");

    let started = Instant::now();
    workflow.run(json!({})).unwrap();
    assert_eq!(workflow.wait().await, FutureState::Timeout);
    let elapsed = started.elapsed();

    // The 2s sleep task was cut short by the 0.2s workflow timer
    assert!(
        elapsed < Duration::from_secs(1),
        "workflow should time out after ~200ms, took {elapsed:?}"
    );
    let task = workflow.task_by_id("slow").expect("task was started");
    assert_eq!(task.state(), Some(FutureState::Cancelled));
}

#[tokio::test]
async fn test_task_timeout_does_not_cancel_workflow() {
    let workflow = workflow_from_fixture("task_timeout");

    let started = Instant::now();
    workflow.run(json!({})).unwrap();
    assert_eq!(workflow.wait().await, FutureState::Finished);
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(1),
        "task should time out after ~200ms, took {elapsed:?}"
    );
    let task = workflow.task_by_id("slow").expect("task was started");
    assert_eq!(task.state(), Some(FutureState::Timeout));
}

#[tokio::test]
async fn test_task_completes_within_timeout() {
    let template = WorkflowTemplate::from_dict(json!({
        "tasks": [
            {"id": "quick", "name": "sleep", "timeout": 5.0, "config": {"seconds": 0.05}},
        ],
        "graph": {"quick": []},
    }))
    .unwrap();
    let workflow = Workflow::new(
        Arc::new(template),
        registry(),
        Arc::new(MemoryBroker::new()),
    );

    workflow.run(json!({})).unwrap();
    assert_eq!(workflow.wait().await, FutureState::Finished);
    let task = workflow.task_by_id("quick").expect("task was started");
    assert_eq!(task.state(), Some(FutureState::Finished));
}

#[tokio::test]
async fn test_workflow_completes_within_timeout() {
    let template = WorkflowTemplate::from_dict(json!({
        "timeout": 5.0,
        "tasks": [
            {"id": "quick", "name": "sleep", "config": {"seconds": 0.05}},
        ],
        "graph": {"quick": []},
    }))
    .unwrap();
    let workflow = Workflow::new(
        Arc::new(template),
        registry(),
        Arc::new(MemoryBroker::new()),
    );

    workflow.run(json!({})).unwrap();
    assert_eq!(workflow.wait().await, FutureState::Finished);
}

#[tokio::test]
async fn test_pending_branches_timeout_with_the_workflow() {
    // Root finishes quickly, its successor sleeps past the workflow timer
    let template = WorkflowTemplate::from_dict(json!({
        "timeout": 0.2,
        "tasks": [
            {"id": "root", "name": "basic"},
            {"id": "slow", "name": "sleep", "config": {"seconds": 2.0}},
        ],
        "graph": {"root": ["slow"], "slow": []},
    }))
    .unwrap();
    let workflow = Workflow::new(
        Arc::new(template),
        registry(),
        Arc::new(MemoryBroker::new()),
    );

    workflow.run(json!({})).unwrap();
    assert_eq!(workflow.wait().await, FutureState::Timeout);
    let root = workflow.task_by_id("root").expect("task was started");
    assert_eq!(root.state(), Some(FutureState::Finished));
    let slow = workflow.task_by_id("slow").expect("task was started");
    assert_eq!(slow.state(), Some(FutureState::Cancelled));
}
