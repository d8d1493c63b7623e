//! Configuration loading with priority: hardcoded defaults, then an optional
//! config file, then environment variables (highest priority, prefixed with
//! `KV_MIRROR`, nested fields separated by `__`).

mod retry;
pub use retry::*;


use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;

use crate::constants::ENV_PREFIX;
use crate::Result;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Session namespacing parameters
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Retry policy for transient connection failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectionConfig {
    /// Path prefix every key is resolved under. Either empty or absolute
    /// without a trailing slash, e.g. `/app/v1`.
    #[serde(default)]
    pub root: String,
}

impl Settings {
    /// Load configuration, merging an optional file over the defaults and
    /// environment variables over both.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
