//! Configuration for the ElOyente service.
//!
//! # Example TOML configuration:
//! ```toml
//! connect_timeout_ms = 30000
//! create_missing_nodes = true
//! batch_policy = "first_item"
//!
//! [xmpp]
//! server = "xmpp.example.org"
//! user = "jenkins"
//! password = "secret"
//! resource = "eloyente"
//!
//! [retry]
//! initial_delay_ms = 1000
//! multiplier = 2
//! max_retries = 4
//! max_total_ms = 16000
//!
//! [build_queue]
//! workers = 2
//! capacity = 1024
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError};
use crate::scheduler::BackoffPolicy;

/// Resource used when none is configured.
pub const DEFAULT_RESOURCE: &str = "eloyente";

/// Identity of the shared XMPP session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmppSettings {
    pub server: String,
    pub user: String,
    pub password: String,
    pub resource: String,
}

impl Default for XmppSettings {
    fn default() -> Self {
        Self {
            server: String::new(),
            user: String::new(),
            password: String::new(),
            resource: DEFAULT_RESOURCE.to_string(),
        }
    }
}

impl XmppSettings {
    #[must_use]
    pub fn new(server: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            user: user.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Settings are usable only when server, user and password are all set.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    /// # Errors
    ///
    /// Returns [`ValidationError::IncompleteSettings`] naming the first empty
    /// field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [("server", &self.server), ("user", &self.user), ("password", &self.password)] {
            if value.trim().is_empty() {
                return Err(ValidationError::IncompleteSettings {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The resource to bind, falling back to [`DEFAULT_RESOURCE`].
    #[must_use]
    pub fn resource(&self) -> &str {
        if self.resource.trim().is_empty() {
            DEFAULT_RESOURCE
        } else {
            &self.resource
        }
    }
}

impl fmt::Debug for XmppSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmppSettings")
            .field("server", &self.server)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("resource", &self.resource)
            .finish()
    }
}

/// Which items of a published batch are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Only the first item of each batch.
    #[default]
    FirstItem,
    AllItems,
}

/// Retry schedule for builds rejected while the job is already queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub multiplier: u32,
    pub max_retries: u32,
    pub max_total_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2,
            max_retries: 4,
            max_total_ms: 16_000,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn to_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_retries: self.max_retries,
            max_total: Duration::from_millis(self.max_total_ms),
        }
    }
}

/// Worker pool running scheduling requests off the dispatch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildQueueSettings {
    pub workers: usize,
    pub capacity: usize,
}

impl Default for BuildQueueSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: 1024,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElOyenteConfig {
    pub xmpp: XmppSettings,
    /// Timeout handed to the transport when connecting.
    pub connect_timeout_ms: u64,
    /// Create absent nodes when subscribing instead of skipping them.
    pub create_missing_nodes: bool,
    pub batch_policy: BatchPolicy,
    pub retry: RetrySettings,
    pub build_queue: BuildQueueSettings,
}

impl Default for ElOyenteConfig {
    fn default() -> Self {
        Self {
            xmpp: XmppSettings::default(),
            connect_timeout_ms: 30_000,
            create_missing_nodes: true,
            batch_policy: BatchPolicy::default(),
            retry: RetrySettings::default(),
            build_queue: BuildQueueSettings::default(),
        }
    }
}

impl ElOyenteConfig {
    /// Loads a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it is not valid.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when `content` is not valid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse { message: e.to_string() })
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
