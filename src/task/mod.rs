//! Task-side building blocks: the task-logic trait, the name registry,
//! declarative task templates and the running task handle.

mod holder;
mod registry;
mod task;
pub(crate) mod template;

use snafu::prelude::*;

pub use holder::TaskHolder;
pub use registry::{TaskFactory, TaskRegistry};
pub use task::{TaskOutcome, TukioTask, current_task};
pub use template::{Listen, TaskTemplate};

pub(crate) use task::CURRENT_TASK;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unknown task name: {name}"))]
    UnknownTaskName { name: String },

    #[snafu(display("invalid task config: {message}"))]
    Config { message: String },

    #[snafu(display("task execution error: {message}"))]
    Execution { message: String },

    #[snafu(display("malformed task template: {source}"))]
    Malformed { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
