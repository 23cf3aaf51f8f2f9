//! Replication settings loaded once at startup
//!
//! Defaults, then an optional TOML file, then environment overrides
//! `REPLICA_MAX_MESSAGES_PER_POLL_HOST` and `REPLICA_MAX_MESSAGES_PER_POLL_CLIENT`.
//!
//! ```toml
//! max_messages_per_poll_host = 256
//! max_messages_per_poll_client = 1024
//!
//! [bulk.CellUpdate]
//! max_batch_size = 32
//! interval_ms = 50
//! ```

use crate::batching::BulkPolicy;
use crate::catalog::{CatalogBuilder, MessageCatalog};
use crate::error::ConfigurationError;
use crate::session::SessionRole;
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const ENV_MAX_PER_POLL_HOST: &str = "REPLICA_MAX_MESSAGES_PER_POLL_HOST";
pub const ENV_MAX_PER_POLL_CLIENT: &str = "REPLICA_MAX_MESSAGES_PER_POLL_CLIENT";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Inbound messages the host processes per tick (default 256)
    #[serde(default = "default_max_messages_per_poll_host")]
    pub max_messages_per_poll_host: usize,
    /// Inbound messages a client processes per tick (default 1024)
    #[serde(default = "default_max_messages_per_poll_client")]
    pub max_messages_per_poll_client: usize,
    /// Bulk policy overrides keyed by message kind name
    #[serde(default)]
    pub bulk: BTreeMap<String, BulkPolicy>,
}

fn default_max_messages_per_poll_host() -> usize {
    256
}
fn default_max_messages_per_poll_client() -> usize {
    1024
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_messages_per_poll_host: default_max_messages_per_poll_host(),
            max_messages_per_poll_client: default_max_messages_per_poll_client(),
            bulk: BTreeMap::new(),
        }
    }
}

impl ReplicationConfig {
    /// Load from `path` if given, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConfigurationError::Unreadable {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Apply overrides from a key lookup such as the process environment.
    /// Values that do not parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_PER_POLL_HOST) {
            match value.parse() {
                Ok(n) => self.max_messages_per_poll_host = n,
                Err(_) => warn!("Ignoring {}={:?}: not a number", ENV_MAX_PER_POLL_HOST, value),
            }
        }
        if let Some(value) = lookup(ENV_MAX_PER_POLL_CLIENT) {
            match value.parse() {
                Ok(n) => self.max_messages_per_poll_client = n,
                Err(_) => warn!("Ignoring {}={:?}: not a number", ENV_MAX_PER_POLL_CLIENT, value),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_messages_per_poll_host == 0 {
            return Err(ConfigurationError::ZeroLimit("max_messages_per_poll_host"));
        }
        if self.max_messages_per_poll_client == 0 {
            return Err(ConfigurationError::ZeroLimit("max_messages_per_poll_client"));
        }
        self.catalog().map(|_| ())
    }

    /// Per-tick processing cap for `role`
    pub fn max_messages_per_poll(&self, role: SessionRole) -> usize {
        match role {
            SessionRole::Client => self.max_messages_per_poll_client,
            _ => self.max_messages_per_poll_host,
        }
    }

    /// The standard catalog with this configuration's bulk overrides
    pub fn catalog(&self) -> Result<MessageCatalog, ConfigurationError> {
        Ok(CatalogBuilder::standard()
            .with_bulk_overrides(&self.bulk)?
            .build())
    }
}
