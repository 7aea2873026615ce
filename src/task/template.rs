use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use snafu::ResultExt;
use uuid::Uuid;

use super::{MalformedSnafu, Result};

/// What a template subscribes to on the event broker while it runs.
///
/// Derived from the tri-state `topics` field: absent means everything,
/// an empty list means nothing, a non-empty list is a whitelist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Nothing,
    Everything,
    Topics(Vec<String>),
}

impl Listen {
    #[must_use]
    pub fn from_topics(topics: Option<&[String]>) -> Self {
        match topics {
            None => Listen::Everything,
            Some([]) => Listen::Nothing,
            Some(topics) => Listen::Topics(topics.to_vec()),
        }
    }
}

/// Declarative description of a single task node. Immutable once built.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTemplate {
    #[serde(rename = "id", default = "new_uid")]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default, deserialize_with = "duration_secs::deserialize")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub topics: Option<Vec<String>>,
}

fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

impl TaskTemplate {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uid: new_uid(),
            name: name.into(),
            config: None,
            timeout: None,
            topics: None,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// The broker subscription mode of tasks spawned from this template.
    #[must_use]
    pub fn listen(&self) -> Listen {
        Listen::from_topics(self.topics.as_deref())
    }

    /// Parse a template from its declarative form.
    pub fn from_dict(value: Value) -> Result<Self> {
        serde_json::from_value(value).context(MalformedSnafu)
    }

    /// The declarative form of this template. Optional fields are omitted
    /// when absent so parsing and rendering round-trip.
    #[must_use]
    pub fn as_dict(&self) -> Value {
        let mut dict = json!({
            "id": self.uid,
            "name": self.name,
        });
        if let Some(object) = dict.as_object_mut() {
            if let Some(config) = &self.config {
                object.insert("config".to_owned(), config.clone());
            }
            if let Some(timeout) = self.timeout {
                object.insert("timeout".to_owned(), json!(timeout.as_secs_f64()));
            }
            if let Some(topics) = &self.topics {
                object.insert("topics".to_owned(), json!(topics));
            }
        }
        dict
    }
}

/// (De)serialize an optional duration as a number of seconds.
pub(crate) mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, de};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Some(secs) => Err(de::Error::custom(format!(
                "timeout must be a non-negative number of seconds, got {secs}"
            ))),
        }
    }
}
