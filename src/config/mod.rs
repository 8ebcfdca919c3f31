//! Configuration management for the change feed processor.
//!
//! Provides layered settings loading and validation with:
//! - Default values as code base
//! - An optional configuration file
//! - Environment variable overrides (`CFP__` prefix, highest priority)
mod processor;
mod retry;
pub use processor::*;
pub use retry::*;

use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::ConnectionPolicy;
use crate::Result;

/// Top level settings of a processor host
///
/// Combines the subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file passed to [`Settings::load`]
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Settings {
    /// Lease timing and pump behaviour
    #[serde(default)]
    pub processor: ChangeFeedProcessorOptions,
    /// Retry policies for lease container operations
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Transport settings handed to the client that backs the containers
    #[serde(default)]
    pub connection: ConnectionPolicy,
}

impl Debug for Settings {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("processor", &self.processor)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Settings {
    /// Loads settings from hierarchical sources without validation.
    ///
    /// Sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file at `path` (if given)
    /// 3. Environment variables with `CFP__` prefix (highest priority)
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CFP__PROCESSOR__FEED_POLL_DELAY_MS", "500");
    /// let settings = Settings::load(Some("config/cfp.toml"))?.validate()?;
    /// ```
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(env_source());

        let settings: Self = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Applies additional overrides from file without validation.
    ///
    /// Current values are the base, then the file, then the environment.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.processor.validate()?;
        self.retry.validate()?;
        self.connection.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix("CFP")
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
