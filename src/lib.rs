//! # Tukio - Event-Driven Workflow Execution Engine
//!
//! Tukio drives directed acyclic graphs (DAGs) of asynchronous tasks to
//! completion, routes runtime data between tasks and the outside world,
//! and enforces lifecycle policies.
//!
//! ## Features
//!
//! - **Graph-Based Execution**: Workflows are validated DAGs of task
//!   templates with a single root; tasks are started along the edges as
//!   their predecessors complete
//! - **Join Fan-In**: A task with several predecessors is started by the
//!   first one and receives the later results through its event inbox
//! - **Runtime Branch Selection**: A task can narrow its own downstream
//!   branch set while it runs
//! - **Failure Isolation**: A failing task prunes its branch without
//!   stopping the rest of the workflow
//! - **Cancellation & Timeouts**: Cooperative workflow cancellation,
//!   per-task and per-workflow timers
//! - **Overrun Policies**: Rules deciding whether a new instance of a
//!   template may start while prior instances are live
//! - **Event Broker**: A narrow publish/subscribe facade connecting tasks
//!   and workflows to topics, with an in-memory implementation
//!
//! ## Core Modules
//!
//! - [`workflow`] - The execution engine and the ambient current-workflow
//!   context
//! - [`template`] - Declarative workflow templates compiled into
//!   validated DAGs
//! - [`task`] - Task-logic trait, name registry, task templates and
//!   running task handles
//! - [`dag`] - The underlying graph model
//! - [`broker`] - The publish/subscribe interface and its in-memory
//!   implementation
//! - [`overrun`] - Overrun policies and their handler
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use tukio::{Event, MemoryBroker, TaskHolder, TaskRegistry, Workflow, WorkflowTemplate};
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl TaskHolder for Hello {
//!     async fn execute(&self, event: Event) -> tukio::task::Result<Event> {
//!         println!("hello {}", event.data);
//!         Ok(event)
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(TaskRegistry::new());
//! registry.register("hello", |_config| Ok(Arc::new(Hello) as Arc<dyn TaskHolder>));
//!
//! let template = WorkflowTemplate::from_dict(json!({
//!     "tasks": [{"id": "greet", "name": "hello"}],
//!     "graph": {"greet": []},
//! }))?;
//! template.validate(&registry)?;
//!
//! let workflow = Workflow::new(Arc::new(template), registry, Arc::new(MemoryBroker::new()));
//! workflow.run(json!({"initial": "data"}))?;
//! let state = workflow.wait().await;
//! println!("workflow ended as {state}");
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod dag;
pub mod event;
pub mod overrun;
pub mod state;
pub mod task;
pub mod template;
pub mod workflow;

pub use broker::{EXEC_TOPIC, EventBroker, MemoryBroker, RegistrationKey};
pub use event::{Event, EventSource};
pub use overrun::{OverrunPolicy, OverrunPolicyHandler, new_workflow};
pub use state::FutureState;
pub use task::{Listen, TaskHolder, TaskRegistry, TaskTemplate, TukioTask, current_task};
pub use template::WorkflowTemplate;
pub use workflow::{Workflow, WorkflowExecState};
