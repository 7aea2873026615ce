use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{Result, TaskHolder, UnknownTaskNameSnafu};

/// Builds a task-logic instance from an optional config mapping. The
/// factory may fail (bad config, missing resources); the engine treats
/// that as a task-creation failure.
pub type TaskFactory =
    Arc<dyn Fn(Option<&serde_json::Value>) -> Result<Arc<dyn TaskHolder>> + Send + Sync>;

/// Maps task names to factories. A registry instance is shared by the
/// workflows that execute against it.
#[derive(Default)]
pub struct TaskRegistry {
    factories: RwLock<HashMap<String, TaskFactory>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(Option<&serde_json::Value>) -> Result<Arc<dyn TaskHolder>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::new(factory));
    }

    /// Look up the factory registered under `name`.
    pub fn factory(&self, name: &str) -> Result<TaskFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownTaskNameSnafu { name }.build())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Look up `name` and invoke its factory with `config`.
    pub fn new_holder(
        &self,
        name: &str,
        config: Option<&serde_json::Value>,
    ) -> Result<Arc<dyn TaskHolder>> {
        let factory = self.factory(name)?;
        factory(config)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TaskRegistry")
            .field("names", &factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
