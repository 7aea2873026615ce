#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use snafu::prelude::*;
use tukio::broker::{EventHandler, RegistrationKey};
use tukio::task::{ConfigSnafu, ExecutionSnafu};
use tukio::{EXEC_TOPIC, Event, EventBroker, MemoryBroker, TaskHolder, TaskRegistry, Workflow};

static TRACING: Once = Once::new();

/// Route engine logs through the test harness, once per binary. Tune with
/// `RUST_LOG`, e.g. `RUST_LOG=tukio=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Completes immediately, passing its seed event through.
pub struct BasicTask;

#[async_trait]
impl TaskHolder for BasicTask {
    async fn execute(&self, event: Event) -> tukio::task::Result<Event> {
        Ok(event)
    }
}

/// Fails inside its body.
pub struct FailingTask;

#[async_trait]
impl TaskHolder for FailingTask {
    async fn execute(&self, _event: Event) -> tukio::task::Result<Event> {
        ExecutionSnafu { message: "boom" }.fail()
    }
}

/// Cancels its own workflow, then lingers until the cancellation lands.
pub struct CancelTask;

#[async_trait]
impl TaskHolder for CancelTask {
    async fn execute(&self, event: Event) -> tukio::task::Result<Event> {
        Workflow::current_workflow()
            .expect("task runs within a workflow")
            .cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(event)
    }
}

/// Sleeps for the configured number of seconds.
pub struct SleepTask {
    duration: Duration,
}

impl SleepTask {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl TaskHolder for SleepTask {
    async fn execute(&self, event: Event) -> tukio::task::Result<Event> {
        tokio::time::sleep(self.duration).await;
        Ok(event)
    }
}

/// Emits a fresh (sourceless) event after an optional delay, so the
/// engine stamps it with the producing task's own descriptor.
pub struct ProducerTask {
    pub delay: Duration,
    pub data: Value,
}

#[async_trait]
impl TaskHolder for ProducerTask {
    async fn execute(&self, _event: Event) -> tukio::task::Result<Event> {
        tokio::time::sleep(self.delay).await;
        Ok(Event::new(self.data.clone()))
    }
}

/// Register a [`ProducerTask`] factory under `name`.
pub fn producer(registry: &TaskRegistry, name: &str, delay: Duration, data: Value) {
    registry.register(name, move |_config| {
        Ok(Arc::new(ProducerTask {
            delay,
            data: data.clone(),
        }) as Arc<dyn TaskHolder>)
    });
}

/// Lingers while recording its seed and every event pushed into its inbox.
pub struct RecorderTask {
    linger: Duration,
    seeds: Arc<Mutex<Vec<Event>>>,
    received: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl TaskHolder for RecorderTask {
    async fn execute(&self, event: Event) -> tukio::task::Result<Event> {
        self.seeds.lock().unwrap().push(event.clone());
        tokio::time::sleep(self.linger).await;
        Ok(event)
    }

    async fn data_received(&self, event: Event) {
        self.received.lock().unwrap().push(event);
    }
}

/// Shared view on the events a [`RecorderTask`] observed.
pub struct Recorder {
    pub seeds: Arc<Mutex<Vec<Event>>>,
    pub received: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            seeds: Arc::new(Mutex::new(Vec::new())),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn register(&self, registry: &TaskRegistry, name: &str, linger: Duration) {
        let seeds = Arc::clone(&self.seeds);
        let received = Arc::clone(&self.received);
        registry.register(name, move |_config| {
            Ok(Arc::new(RecorderTask {
                linger,
                seeds: Arc::clone(&seeds),
                received: Arc::clone(&received),
            }) as Arc<dyn TaskHolder>)
        });
    }
}

/// A registry with every task name the test templates use.
pub fn registry() -> Arc<TaskRegistry> {
    let registry = TaskRegistry::new();
    registry.register("basic", |_config| {
        Ok(Arc::new(BasicTask) as Arc<dyn TaskHolder>)
    });
    // Constructor that rejects any config without a "data" key
    registry.register("crash", |config| {
        let configured = config.and_then(|config| config.get("data")).is_some();
        ensure!(
            configured,
            ConfigSnafu {
                message: "missing required key: data"
            }
        );
        Ok(Arc::new(BasicTask) as Arc<dyn TaskHolder>)
    });
    registry.register("failing", |_config| {
        Ok(Arc::new(FailingTask) as Arc<dyn TaskHolder>)
    });
    registry.register("cancel", |_config| {
        Ok(Arc::new(CancelTask) as Arc<dyn TaskHolder>)
    });
    registry.register("sleep", |config| {
        let seconds = config
            .and_then(|config| config.get("seconds"))
            .and_then(Value::as_f64)
            .context(ConfigSnafu {
                message: "missing required key: seconds",
            })?;
        Ok(Arc::new(SleepTask {
            duration: Duration::from_secs_f64(seconds),
        }) as Arc<dyn TaskHolder>)
    });
    Arc::new(registry)
}

/// Load a workflow template fixture from `tests/fixtures/`.
pub fn load_fixture(name: &str) -> Value {
    let path = format!("tests/fixtures/{name}.yaml");
    let raw = std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read {path}: {err}"));
    serde_yaml::from_str(&raw).unwrap_or_else(|err| panic!("parse {path}: {err}"))
}

/// Record every message published on the reserved execution topic.
pub fn exec_collector(broker: &MemoryBroker) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: EventHandler = Arc::new(move |event: Event| {
        sink.lock().unwrap().push(event.data);
    });
    broker.register(RegistrationKey::new(), handler, Some(EXEC_TOPIC));
    seen
}

/// The `type` fields of the collected execution messages.
pub fn exec_types(messages: &Arc<Mutex<Vec<Value>>>) -> Vec<String> {
    messages
        .lock()
        .unwrap()
        .iter()
        .filter_map(|message| message.get("type"))
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect()
}
