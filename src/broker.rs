//! Publish/subscribe facade between workflows, tasks and the outside world.
//!
//! The engine depends only on the narrow [`EventBroker`] trait so it can be
//! exercised against an in-memory double. [`MemoryBroker`] is that double
//! and also the default in-process implementation; durable transports and
//! subscription storage live outside this crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use snafu::prelude::*;
use uuid::Uuid;

use crate::event::{Event, EventSource};

/// Reserved topic on which workflows publish their execution events
/// (`workflow-begin`, `workflow-end`, `workflow-error`,
/// `workflow-progress`). Wildcard subscriptions do not cover this topic;
/// it must be subscribed to explicitly.
pub const EXEC_TOPIC: &str = "tukio-exec";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("callback '{key}' is not registered on topic {topic:?}"))]
    NotRegistered { key: String, topic: Option<String> },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Synchronous event sink. Handlers must not block: the engine's handlers
/// only enqueue events into task inboxes.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Opaque identity of a registered handler. Closures cannot be compared,
/// so registrations are keyed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationKey(String);

impl RegistrationKey {
    #[allow(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The publish/subscribe interface consumed by the workflow engine.
///
/// Implementations must be safe for concurrent register/unregister/dispatch
/// from multiple workflows.
pub trait EventBroker: Send + Sync {
    /// Register a handler under `key`. A `None` topic subscribes the
    /// handler to every topic except [`EXEC_TOPIC`].
    fn register(&self, key: RegistrationKey, handler: EventHandler, topic: Option<&str>);

    /// Remove the registration made under `key` for `topic`. Fails when no
    /// such registration exists.
    fn unregister(&self, key: &RegistrationKey, topic: Option<&str>) -> Result<()>;

    /// Publish `data` on `topic`, invoking every matching handler.
    fn dispatch(&self, data: serde_json::Value, topic: &str, source: Option<EventSource>);
}

#[derive(Default)]
struct Subscriptions {
    // None key = wildcard bucket
    buckets: HashMap<Option<String>, HashMap<RegistrationKey, EventHandler>>,
}

/// In-process broker: a topic map behind a mutex, handlers invoked inline
/// on dispatch.
#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: Mutex<Subscriptions>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions = self.lock();
        f.debug_struct("MemoryBroker")
            .field("topics", &subscriptions.buckets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl EventBroker for MemoryBroker {
    fn register(&self, key: RegistrationKey, handler: EventHandler, topic: Option<&str>) {
        self.lock()
            .buckets
            .entry(topic.map(str::to_owned))
            .or_default()
            .insert(key, handler);
    }

    fn unregister(&self, key: &RegistrationKey, topic: Option<&str>) -> Result<()> {
        let mut subscriptions = self.lock();
        let bucket = topic.map(str::to_owned);
        let removed = subscriptions
            .buckets
            .get_mut(&bucket)
            .and_then(|handlers| handlers.remove(key));
        removed.map(|_| ()).context(NotRegisteredSnafu {
            key: key.to_string(),
            topic: bucket,
        })
    }

    fn dispatch(&self, data: serde_json::Value, topic: &str, source: Option<EventSource>) {
        // Collect matching handlers first so none of them runs under the lock.
        let handlers: Vec<EventHandler> = {
            let subscriptions = self.lock();
            let mut handlers: Vec<EventHandler> = subscriptions
                .buckets
                .get(&Some(topic.to_owned()))
                .map(|bucket| bucket.values().cloned().collect())
                .unwrap_or_default();
            if topic != EXEC_TOPIC {
                if let Some(bucket) = subscriptions.buckets.get(&None) {
                    handlers.extend(bucket.values().cloned());
                }
            }
            handlers
        };
        let event = Event {
            data,
            source,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }
}
