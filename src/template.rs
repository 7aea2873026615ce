//! Workflow templates: a validated DAG of task templates plus the
//! policies that govern triggering and concurrent instances.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Value, json};
use snafu::prelude::*;

use crate::dag::{self, Dag};
use crate::overrun::OverrunPolicy;
use crate::task::template::duration_secs;
use crate::task::{Listen, TaskRegistry, TaskTemplate};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("graph error on task id: {task_id}"))]
    TemplateGraph { task_id: String },

    #[snafu(display("expected one root task, found {found}"))]
    RootTask { found: usize },

    #[snafu(display("unknown task name: {name}"))]
    UnknownTaskName { name: String },

    #[snafu(display("invalid workflow graph: {source}"))]
    Graph { source: dag::Error },

    #[snafu(display("malformed workflow template: {source}"))]
    Malformed { source: serde_json::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Raw declarative form, as parsed from JSON or YAML.
#[derive(Debug, Deserialize)]
struct TemplateDef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    schema: Option<i64>,
    #[serde(default)]
    policy: Option<OverrunPolicy>,
    #[serde(default)]
    topics: Option<Vec<String>>,
    #[serde(default, deserialize_with = "duration_secs::deserialize")]
    timeout: Option<Duration>,
    #[serde(default)]
    tasks: Vec<TaskTemplate>,
    #[serde(default)]
    graph: IndexMap<String, Vec<String>>,
}

/// A workflow template is a DAG of [`TaskTemplate`] nodes. This type is
/// not an execution engine: it provides an API to build and update a
/// consistent workflow description, which [`Workflow`](crate::Workflow)
/// instances then execute.
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub uid: String,
    /// Opaque schema version tag, passed through untouched.
    pub schema: Option<i64>,
    /// Tri-state trigger filter: `None` = trigger on any topic, `[]` =
    /// never trigger on received data, a list = trigger on those topics
    /// only. Independent from per-task subscriptions.
    pub topics: Option<Vec<String>>,
    pub policy: OverrunPolicy,
    /// Workflow-level timeout, enforced by a timer armed when the
    /// workflow starts.
    pub timeout: Option<Duration>,
    tasks: IndexMap<String, Arc<TaskTemplate>>,
    dag: Dag,
}

impl Default for WorkflowTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowTemplate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            schema: None,
            topics: None,
            policy: OverrunPolicy::default(),
            timeout: None,
            tasks: IndexMap::new(),
            dag: Dag::new(),
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: OverrunPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// When the workflow should be triggered by received data.
    #[must_use]
    pub fn listen(&self) -> Listen {
        Listen::from_topics(self.topics.as_deref())
    }

    #[must_use]
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Task templates in insertion order.
    #[must_use]
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskTemplate>> {
        self.tasks.values()
    }

    #[must_use]
    pub fn task(&self, uid: &str) -> Option<&Arc<TaskTemplate>> {
        self.tasks.get(uid)
    }

    /// Add a task template to the workflow. The task remains orphan until
    /// linked to upstream/downstream tasks.
    pub fn add(&mut self, template: TaskTemplate) -> Result<()> {
        self.dag.add_node(&template.uid).context(GraphSnafu)?;
        self.tasks
            .insert(template.uid.clone(), Arc::new(template));
        Ok(())
    }

    /// Remove a task template and its links to upstream/downstream tasks.
    pub fn delete(&mut self, uid: &str) -> Result<()> {
        self.dag.delete_node(uid).context(GraphSnafu)?;
        self.tasks.shift_remove(uid);
        Ok(())
    }

    /// Create a directed link from an upstream to a downstream task.
    pub fn link(&mut self, up_uid: &str, down_uid: &str) -> Result<()> {
        self.dag.add_edge(up_uid, down_uid).context(GraphSnafu)
    }

    /// Remove the link between two tasks, whichever way it points.
    pub fn unlink(&mut self, uid_a: &str, uid_b: &str) -> Result<()> {
        match self.dag.delete_edge(uid_a, uid_b) {
            Ok(()) => Ok(()),
            Err(dag::Error::EdgeNotFound { .. }) => {
                self.dag.delete_edge(uid_b, uid_a).context(GraphSnafu)
            }
            Err(err) => Err(Error::Graph { source: err }),
        }
    }

    /// The single root task of the workflow.
    pub fn root(&self) -> Result<Arc<TaskTemplate>> {
        let roots = match self.dag.roots() {
            Ok(roots) => roots,
            Err(dag::Error::NoRoot) => Vec::new(),
            Err(err) => return Err(Error::Graph { source: err }),
        };
        if let [uid] = roots.as_slice() {
            if let Some(template) = self.tasks.get(uid) {
                return Ok(Arc::clone(template));
            }
        }
        RootTaskSnafu { found: roots.len() }.fail()
    }

    /// Build a workflow template from its declarative form:
    ///
    /// ```json
    /// {
    ///     "id": "<workflow-uid>",
    ///     "policy": "skip-until-unlock",
    ///     "topics": ["blob", "foo"],
    ///     "tasks": [
    ///         {"id": "<task-uid>", "name": "<name>", "config": {}},
    ///     ],
    ///     "graph": {"<t1-uid>": ["<t2-uid>"], "<t2-uid>": []}
    /// }
    /// ```
    ///
    /// `topics` gates when received data may trigger the workflow: absent
    /// means always, an empty list never, a list on those topics only.
    pub fn from_dict(value: Value) -> Result<Self> {
        let def: TemplateDef = serde_json::from_value(value).context(MalformedSnafu)?;
        let mut template = Self::new();
        if let Some(uid) = def.id {
            template.uid = uid;
        }
        template.schema = def.schema;
        template.topics = def.topics;
        template.policy = def.policy.unwrap_or_default();
        template.timeout = def.timeout;

        for task in def.tasks {
            template.add(task)?;
        }
        for (up_uid, down_uids) in &def.graph {
            ensure!(
                template.tasks.contains_key(up_uid),
                TemplateGraphSnafu { task_id: up_uid }
            );
            for down_uid in down_uids {
                ensure!(
                    template.tasks.contains_key(down_uid),
                    TemplateGraphSnafu { task_id: down_uid }
                );
                template.link(up_uid, down_uid)?;
            }
        }
        Ok(template)
    }

    /// Render the template back to its declarative form. Tasks keep their
    /// insertion order, the graph maps each task id to its successor ids.
    #[must_use]
    pub fn as_dict(&self) -> Value {
        let tasks: Vec<Value> = self.tasks.values().map(|task| task.as_dict()).collect();
        let graph: IndexMap<String, Vec<String>> = self.dag.as_dict();
        let mut dict = json!({
            "id": self.uid,
            "policy": self.policy.as_str(),
            "topics": self.topics,
            "tasks": tasks,
            "graph": graph,
        });
        if let Some(object) = dict.as_object_mut() {
            if let Some(schema) = self.schema {
                object.insert("schema".to_owned(), json!(schema));
            }
            if let Some(timeout) = self.timeout {
                object.insert("timeout".to_owned(), json!(timeout.as_secs_f64()));
            }
        }
        dict
    }

    /// Validate the template beyond DAG consistency: a single root task
    /// and every task name registered.
    pub fn validate(&self, registry: &TaskRegistry) -> Result<()> {
        let found = match self.dag.roots() {
            Ok(roots) => roots.len(),
            Err(dag::Error::NoRoot) => 0,
            Err(err) => return Err(Error::Graph { source: err }),
        };
        ensure!(found == 1, RootTaskSnafu { found });
        for task in self.tasks.values() {
            ensure!(
                registry.contains(&task.name),
                UnknownTaskNameSnafu {
                    name: task.name.clone()
                }
            );
        }
        Ok(())
    }
}
