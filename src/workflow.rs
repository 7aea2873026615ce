//! Workflow execution engine.
//!
//! A [`Workflow`] executes one instance of a
//! [`WorkflowTemplate`](crate::template::WorkflowTemplate): it starts the
//! template's root task, walks the DAG edges as tasks complete, fans out
//! to downstream tasks, joins fan-in tasks by feeding their inbox, and
//! settles on exactly one terminal [`FutureState`]. Execution milestones
//! are published on the reserved [`EXEC_TOPIC`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use snafu::prelude::*;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::broker::{EXEC_TOPIC, EventBroker, EventHandler, RegistrationKey};
use crate::event::{Event, EventSource};
use crate::overrun::OverrunPolicy;
use crate::state::FutureState;
use crate::task::{
    self, CURRENT_TASK, Listen, TaskHolder, TaskOutcome, TaskRegistry, TaskTemplate, TukioTask,
    current_task,
};
use crate::template::{self, WorkflowTemplate};

tokio::task_local! {
    static CURRENT_WORKFLOW: Workflow;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("a workflow can be run only once"))]
    AlreadyRun,

    #[snafu(display("task is not executed by this workflow"))]
    NotATask,

    #[snafu(display("workflow template error: {source}"))]
    Template { source: template::Error },

    #[snafu(display("failed to create task: {source}"))]
    TaskCreation { source: task::Error },

    #[snafu(display("event broker error: {source}"))]
    Broker { source: crate::broker::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Execution milestones published on [`EXEC_TOPIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowExecState {
    Begin,
    End,
    Error,
    Progress,
}

impl WorkflowExecState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowExecState::Begin => "workflow-begin",
            WorkflowExecState::End => "workflow-end",
            WorkflowExecState::Error => "workflow-error",
            WorkflowExecState::Progress => "workflow-progress",
        }
    }
}

/// Mutable execution state, owned by the workflow and touched only with
/// its lock held. Completion handlers never suspend while holding it.
#[derive(Default)]
struct ExecState {
    started: bool,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    /// Every task ever started by this execution.
    tasks: Vec<Arc<TukioTask>>,
    /// Task template id -> running task. Tasks that were never started
    /// have no entry.
    tasks_by_id: HashMap<String, Arc<TukioTask>>,
    /// Exec uids of tasks whose completion handler already ran.
    done_tasks: HashSet<String>,
    /// Runtime branch pruning: task exec uid -> selected successor
    /// template ids.
    next_overrides: HashMap<String, Vec<String>>,
    /// Tasks whose completion releases the overrun lock.
    unlock_on_done: HashSet<String>,
    internal_exc: Option<Arc<Error>>,
    must_cancel: bool,
    timed_out: bool,
    terminal: Option<FutureState>,
}

/// Result of trying to start a downstream task.
enum StartOutcome {
    Started,
    /// Creation failed in a way that only disables this branch.
    Pruned,
    /// Creation failed in a way that aborts the whole workflow.
    Failed,
}

struct Inner {
    uid: String,
    template: Arc<WorkflowTemplate>,
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn EventBroker>,
    source: EventSource,
    /// Overrun lock: blocks new sibling instances under the
    /// `skip-until-unlock` policy until released.
    locked: AtomicBool,
    state: Mutex<ExecState>,
    terminal_tx: watch::Sender<Option<FutureState>>,
}

/// One execution of a workflow template. Cheap to clone; all clones share
/// the same execution state.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<Inner>,
}

/// Non-owning handle to a workflow, held by tasks to break the ownership
/// cycle between a workflow and its tasks.
#[derive(Clone)]
pub struct WeakWorkflow(Weak<Inner>);

impl WeakWorkflow {
    #[must_use]
    pub fn upgrade(&self) -> Option<Workflow> {
        self.0.upgrade().map(|inner| Workflow { inner })
    }
}

impl Workflow {
    /// Bind a new execution instance to `template`. The instance starts
    /// locked when the template's overrun policy is `skip-until-unlock`.
    #[must_use]
    pub fn new(
        template: Arc<WorkflowTemplate>,
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn EventBroker>,
    ) -> Self {
        let uid = uuid::Uuid::new_v4().to_string();
        let source = EventSource::workflow(&template.uid, &uid);
        let locked = template.policy == OverrunPolicy::SkipUntilUnlock;
        let (terminal_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                uid,
                template,
                registry,
                broker,
                source,
                locked: AtomicBool::new(locked),
                state: Mutex::new(ExecState::default()),
                terminal_tx,
            }),
        }
    }

    /// The workflow owning the currently executing task, or `None` when
    /// called outside of a task. The ambient task-local context is
    /// consulted first, the calling task's back-reference second.
    #[must_use]
    pub fn current_workflow() -> Option<Workflow> {
        CURRENT_WORKFLOW
            .try_with(Workflow::clone)
            .ok()
            .or_else(|| current_task().and_then(|task| task.workflow()))
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    #[must_use]
    pub fn template(&self) -> &Arc<WorkflowTemplate> {
        &self.inner.template
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakWorkflow {
        WeakWorkflow(Arc::downgrade(&self.inner))
    }

    fn lock_state(&self) -> MutexGuard<'_, ExecState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminal state, or `None` while the workflow is still running.
    #[must_use]
    pub fn state(&self) -> Option<FutureState> {
        self.lock_state().terminal
    }

    #[must_use]
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.lock_state().start
    }

    #[must_use]
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.lock_state().end
    }

    /// The internal error that aborted the execution, if any.
    #[must_use]
    pub fn exception(&self) -> Option<Arc<Error>> {
        self.lock_state().internal_exc.clone()
    }

    /// The task started from template `uid`, or `None` if it was never
    /// started.
    #[must_use]
    pub fn task_by_id(&self, uid: &str) -> Option<Arc<TukioTask>> {
        self.lock_state().tasks_by_id.get(uid).cloned()
    }

    /// Every task started so far, in start order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Arc<TukioTask>> {
        self.lock_state().tasks.clone()
    }

    /// Whether this instance still blocks new sibling instances under the
    /// `skip-until-unlock` overrun policy.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::SeqCst)
    }

    /// Release the overrun lock, allowing a new execution of the same
    /// template to be triggered.
    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::SeqCst);
    }

    /// Release the overrun lock once the calling task is done. Must be
    /// called from within one of this workflow's tasks.
    pub fn unlock_when_task_done(&self) -> Result<()> {
        let task = self.calling_task()?;
        self.lock_state()
            .unlock_on_done
            .insert(task.uid().to_owned());
        Ok(())
    }

    /// Select the downstream tasks actually started once the calling task
    /// is done; template successors not listed are disabled (unless they
    /// are already running). Ids that are not successors of the calling
    /// task are ignored. Must be called from within one of this workflow's
    /// tasks.
    pub fn set_next_tasks(&self, template_ids: Vec<String>) -> Result<()> {
        let task = self.calling_task()?;
        self.lock_state()
            .next_overrides
            .insert(task.uid().to_owned(), template_ids);
        Ok(())
    }

    /// Publish task progress on the reserved execution topic.
    pub fn dispatch_progress(&self, data: Value) {
        let source = current_task()
            .map(|task| task.source().clone())
            .unwrap_or_else(|| self.inner.source.clone());
        self.inner.broker.dispatch(
            json!({"type": WorkflowExecState::Progress.as_str(), "content": data}),
            EXEC_TOPIC,
            Some(source),
        );
    }

    fn calling_task(&self) -> Result<Arc<TukioTask>> {
        let task = current_task().context(NotATaskSnafu)?;
        let owned = self
            .lock_state()
            .tasks
            .iter()
            .any(|other| Arc::ptr_eq(other, &task));
        ensure!(owned, NotATaskSnafu);
        Ok(task)
    }

    /// Start the execution with `data` as the root task's seed. The data
    /// is wrapped into an [`Event`] if it is not one already.
    ///
    /// Returns the root task, or `None` when startup failed (the workflow
    /// then settles on an `exception` terminal state). Fails when called a
    /// second time. Must be called within a tokio runtime.
    pub fn run(&self, data: impl Into<Event>) -> Result<Option<Arc<TukioTask>>> {
        let event = data.into();
        let mut state = self.lock_state();
        ensure!(!state.started && state.terminal.is_none(), AlreadyRunSnafu);
        state.started = true;

        let root = match self.inner.template.root() {
            Ok(root) => root,
            Err(err) => {
                state.internal_exc = Some(Arc::new(Error::Template { source: err }));
                self.try_mark_done(&mut state);
                return Ok(None);
            }
        };

        self.dispatch_exec(WorkflowExecState::Begin, event.data.clone());
        state.start = Some(Utc::now());
        // The workflow may fail to start at once
        let task = match self.spawn_task(&root, event) {
            Ok(task) => {
                self.record_task(&mut state, &root, &task);
                Some(task)
            }
            Err(err) => {
                error!(task = %root.uid, name = %root.name, %err,
                    "failed to create root task from template");
                state.internal_exc = Some(Arc::new(err));
                self.try_mark_done(&mut state);
                None
            }
        };
        drop(state);

        if let Some(timeout) = self.inner.template.timeout {
            let workflow = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => workflow.cancel_on_timeout(),
                    _ = workflow.wait() => {}
                }
            });
        }
        Ok(task)
    }

    /// Best-effort cancellation: every started-but-not-done task is asked
    /// to cancel; the workflow turns `cancelled` once every completion
    /// handler has run. Supported from within a task of this workflow.
    pub fn cancel(&self) {
        let mut state = self.lock_state();
        if state.terminal.is_some() {
            return;
        }
        self.cancel_pending_locked(&mut state);
        self.try_mark_done(&mut state);
    }

    fn cancel_on_timeout(&self) {
        let mut state = self.lock_state();
        if state.terminal.is_some() {
            return;
        }
        state.timed_out = true;
        self.cancel_pending_locked(&mut state);
        self.try_mark_done(&mut state);
    }

    /// Await the terminal state.
    pub async fn wait(&self) -> FutureState {
        let mut terminal_rx = self.inner.terminal_tx.subscribe();
        loop {
            if let Some(state) = *terminal_rx.borrow_and_update() {
                return state;
            }
            if terminal_rx.changed().await.is_err() {
                // The sender lives in the shared inner, so this only
                // happens once the terminal state is set.
                if let Some(state) = self.state() {
                    return state;
                }
            }
        }
    }

    /// Serializable execution report: the template in declarative form,
    /// augmented with workflow and per-task execution details.
    #[must_use]
    pub fn report(&self) -> Value {
        let mut report = self.inner.template.as_dict();
        let state = self.lock_state();
        if let Some(object) = report.as_object_mut() {
            object.insert(
                "exec".to_owned(),
                json!({
                    "id": self.inner.uid,
                    "start": state.start.map(|start| start.to_rfc3339()),
                    "end": state.end.map(|end| end.to_rfc3339()),
                    "state": state.terminal,
                }),
            );
        }
        if let Some(tasks) = report.get_mut("tasks").and_then(Value::as_array_mut) {
            for task_dict in tasks {
                let Some(object) = task_dict.as_object_mut() else {
                    continue;
                };
                let task = object
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|uid| state.tasks_by_id.get(uid));
                let exec = match task {
                    None => Value::Null,
                    Some(task) => {
                        let mut exec = task.as_dict();
                        // Let the task logic augment its own report
                        if let Some(extra) = task.holder().report() {
                            if let (Some(exec_obj), Some(extra_obj)) =
                                (exec.as_object_mut(), extra.as_object())
                            {
                                for (key, value) in extra_obj {
                                    exec_obj.insert(key.clone(), value.clone());
                                }
                            }
                        }
                        exec
                    }
                };
                object.insert("exec".to_owned(), exec);
            }
        }
        report
    }

    fn dispatch_exec(&self, exec_state: WorkflowExecState, content: Value) {
        self.inner.broker.dispatch(
            json!({"type": exec_state.as_str(), "content": content}),
            EXEC_TOPIC,
            Some(self.inner.source.clone()),
        );
    }

    fn record_task(&self, state: &mut ExecState, template: &TaskTemplate, task: &Arc<TukioTask>) {
        debug!(task = %template.uid, name = %template.name, "new task created");
        state.tasks.push(Arc::clone(task));
        state
            .tasks_by_id
            .insert(template.uid.clone(), Arc::clone(task));
    }

    /// Create and start a new downstream task from `template`, seeded with
    /// `event`. An unknown task name means a broken workflow config: the
    /// internal error is recorded and every pending task is cancelled. Any
    /// other creation failure prunes this branch only, leaving sibling
    /// branches running.
    fn start_next_task(
        &self,
        state: &mut ExecState,
        template: &Arc<TaskTemplate>,
        event: Event,
    ) -> StartOutcome {
        match self.spawn_task(template, event) {
            Ok(task) => {
                self.record_task(state, template, &task);
                StartOutcome::Started
            }
            Err(
                err @ Error::TaskCreation {
                    source: task::Error::UnknownTaskName { .. },
                },
            ) => {
                error!(task = %template.uid, name = %template.name, %err,
                    "failed to create task from template");
                state.internal_exc.get_or_insert(Arc::new(err));
                self.cancel_pending_locked(state);
                StartOutcome::Failed
            }
            Err(err) => {
                warn!(task = %template.uid, name = %template.name, %err,
                    "task constructor failed, pruning its branch");
                StartOutcome::Pruned
            }
        }
    }

    fn spawn_task(&self, template: &Arc<TaskTemplate>, seed: Event) -> Result<Arc<TukioTask>> {
        let holder = self
            .inner
            .registry
            .new_holder(&template.name, template.config.as_ref())
            .context(TaskCreationSnafu)?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        // Subscribe the task's inbox per the template's listen mode; the
        // registrations are torn down in the completion path.
        let mut registrations = Vec::new();
        match template.listen() {
            Listen::Nothing => {}
            Listen::Everything => {
                let key = RegistrationKey::new();
                self.inner
                    .broker
                    .register(key.clone(), inbox_handler(&inbox_tx), None);
                registrations.push((key, None));
            }
            Listen::Topics(topics) => {
                for topic in topics {
                    let key = RegistrationKey::new();
                    self.inner
                        .broker
                        .register(key.clone(), inbox_handler(&inbox_tx), Some(&topic));
                    registrations.push((key, Some(topic)));
                }
            }
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let source = EventSource::task(
            &self.inner.template.uid,
            &self.inner.uid,
            &template.uid,
            &uid,
        );
        let task = Arc::new(TukioTask::new(
            uid,
            Arc::clone(template),
            Arc::clone(&holder),
            self.downgrade(),
            source,
            inbox_tx,
            registrations,
        ));

        let body = CURRENT_WORKFLOW.scope(
            self.clone(),
            CURRENT_TASK.scope(Arc::clone(&task), run_holder(holder, seed, inbox_rx)),
        );
        let execution = tokio::spawn(body);
        task.set_abort(execution.abort_handle());
        tokio::spawn(watch_task(self.clone(), Arc::clone(&task), execution));
        Ok(task)
    }

    /// Completion handler, invoked exactly once per started task: select
    /// and start downstream tasks, then attempt terminal finalization.
    fn run_next_tasks(&self, task: &Arc<TukioTask>) {
        let mut state = self.lock_state();
        state.done_tasks.insert(task.uid().to_owned());
        if state.unlock_on_done.remove(task.uid()) {
            self.unlock();
        }
        if state.must_cancel {
            self.try_mark_done(&mut state);
            return;
        }
        match task.outcome() {
            Some(TaskOutcome::Finished(result)) => {
                // Keep the result's own source when it carries one, else
                // stamp the producing task's descriptor.
                let event = if result.source.is_some() {
                    result.clone()
                } else {
                    Event::with_source(result.data.clone(), task.source().clone())
                };
                for template in self.next_templates(&state, task) {
                    if let Some(next) = state.tasks_by_id.get(&template.uid).cloned() {
                        // Ignore done tasks: an event that arrives after a
                        // task ended is dropped.
                        if next.is_done() {
                            continue;
                        }
                        // Downstream task already running, join it!
                        debug!(task = %template.uid, "delivering join event");
                        next.deliver(event.clone());
                    } else {
                        match self.start_next_task(&mut state, &template, event.clone()) {
                            StartOutcome::Started | StartOutcome::Pruned => {}
                            StartOutcome::Failed => break,
                        }
                    }
                }
            }
            Some(TaskOutcome::Exception(_) | TaskOutcome::Cancelled | TaskOutcome::Timeout) => {
                // Don't run downstream tasks when the task failed or was
                // cancelled, but don't stop the other branches either.
                warn!(task = %task.template().uid, state = ?task.state(),
                    "task ended on exception, pruning its branch");
            }
            None => {
                error!(task = %task.uid(), "completion handler ran before the task settled");
            }
        }
        self.try_mark_done(&mut state);
    }

    /// Downstream templates of `task`, filtered by the ids the task may
    /// have selected at runtime.
    fn next_templates(&self, state: &ExecState, task: &Arc<TukioTask>) -> Vec<Arc<TaskTemplate>> {
        let successors: Vec<Arc<TaskTemplate>> = self
            .inner
            .template
            .dag()
            .successors(&task.template().uid)
            .unwrap_or_default()
            .iter()
            .filter_map(|uid| self.inner.template.task(uid).cloned())
            .collect();
        let Some(selected) = state.next_overrides.get(task.uid()) else {
            return successors;
        };
        let mut filtered = Vec::with_capacity(selected.len());
        for uid in selected {
            match successors.iter().find(|template| template.uid == *uid) {
                Some(template) => filtered.push(Arc::clone(template)),
                // A misconfiguration from the task: ignore it so the other
                // selected tasks still run.
                None => error!(id = %uid, task = %task.uid(), "id not in downstream tasks"),
            }
        }
        debug!(
            task = %task.uid(),
            filtered = ?filtered.iter().map(|t| t.uid.as_str()).collect::<Vec<_>>(),
            "filtered next tasks",
        );
        filtered
    }

    /// Tear down the broker registrations made for `task`. A failed
    /// unregister is an internal error and aborts the workflow.
    fn unregister_task(&self, task: &Arc<TukioTask>) {
        let mut failure = None;
        for (key, topic) in task.registrations() {
            if let Err(err) = self.inner.broker.unregister(key, topic.as_deref()) {
                error!(%err, "failed to unregister callback");
                failure = Some(err);
            }
        }
        if let Some(err) = failure {
            let mut state = self.lock_state();
            state
                .internal_exc
                .get_or_insert(Arc::new(Error::Broker { source: err }));
            self.cancel_pending_locked(&mut state);
        }
    }

    fn cancel_pending_locked(&self, state: &mut ExecState) {
        state.must_cancel = true;
        for task in &state.tasks {
            if !state.done_tasks.contains(task.uid()) {
                task.abort();
            }
        }
    }

    /// If nothing is left to execute, settle the terminal state and
    /// publish the matching execution event. The workflow is terminal iff
    /// every started task has had its completion handler run.
    fn try_mark_done(&self, state: &mut ExecState) {
        if state.terminal.is_some() || state.tasks.len() != state.done_tasks.len() {
            return;
        }
        let (terminal, exec_state, content) = if let Some(err) = &state.internal_exc {
            (
                FutureState::Exception,
                WorkflowExecState::Error,
                json!(err.to_string()),
            )
        } else if state.must_cancel {
            let terminal = if state.timed_out {
                FutureState::Timeout
            } else {
                FutureState::Cancelled
            };
            (terminal, WorkflowExecState::End, json!({"cancel": true}))
        } else {
            (FutureState::Finished, WorkflowExecState::End, Value::Null)
        };
        state.terminal = Some(terminal);
        state.end = Some(Utc::now());
        self.inner.terminal_tx.send_replace(Some(terminal));
        self.dispatch_exec(exec_state, content);
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("uid", &self.inner.uid)
            .field("template", &self.inner.template.uid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn inbox_handler(inbox: &mpsc::UnboundedSender<Event>) -> EventHandler {
    let inbox = inbox.clone();
    Arc::new(move |event| {
        let _ = inbox.send(event);
    })
}

/// Drive a task body to completion while draining its inbox. Inbox events
/// are handed to the holder one at a time, interleaved with the body at
/// its suspension points, so the seed is always observed first and join
/// events keep their arrival order.
async fn run_holder(
    holder: Arc<dyn TaskHolder>,
    seed: Event,
    mut inbox: mpsc::UnboundedReceiver<Event>,
) -> task::Result<Event> {
    let execution = holder.execute(seed);
    tokio::pin!(execution);
    let mut inbox_open = true;
    loop {
        tokio::select! {
            biased;
            result = &mut execution => break result,
            received = inbox.recv(), if inbox_open => match received {
                Some(event) => holder.data_received(event).await,
                None => inbox_open = false,
            },
        }
    }
}

/// Watch a task execution until it settles, stamp its outcome, tear down
/// its broker registrations and run the workflow's completion handler.
async fn watch_task(
    workflow: Workflow,
    task: Arc<TukioTask>,
    mut execution: JoinHandle<task::Result<Event>>,
) {
    let outcome = match task.template().timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut execution).await {
            Ok(settled) => classify(settled),
            Err(_elapsed) => {
                execution.abort();
                let _ = (&mut execution).await;
                TaskOutcome::Timeout
            }
        },
        None => classify((&mut execution).await),
    };
    task.finalize(outcome);
    workflow.unregister_task(&task);
    workflow.run_next_tasks(&task);
}

fn classify(settled: std::result::Result<task::Result<Event>, JoinError>) -> TaskOutcome {
    match settled {
        Ok(Ok(event)) => TaskOutcome::Finished(event),
        Ok(Err(err)) => TaskOutcome::Exception(Arc::new(err)),
        Err(join_err) if join_err.is_cancelled() => TaskOutcome::Cancelled,
        Err(join_err) => TaskOutcome::Exception(Arc::new(task::Error::Execution {
            message: join_err.to_string(),
        })),
    }
}
