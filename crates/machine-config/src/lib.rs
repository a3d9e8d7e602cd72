//! Shared configuration for the machine controller and its driver plugins.
//!
//! Configuration is layered by `ortho_config`: built-in defaults, then a TOML
//! file named by `--config-path` or `MACHINE_CONFIG_PATH`, then `MACHINE_*`
//! environment variables, then command-line flags.

use std::collections::BTreeSet;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

mod defaults;
mod logging;

pub use defaults::{
    BUILTIN_CORE_DRIVERS, DEFAULT_ADDRESS_TIMEOUT_MS, DEFAULT_DRIVER_PREFIX, DEFAULT_LOG_FILTER,
    default_address_timeout_ms, default_driver_prefix, default_log_filter,
    default_log_filter_string, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Runtime configuration shared by the controller and plugin-serving mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "MACHINE")]
pub struct Config {
    /// Tracing filter expression, for example `info` or `machine_plugin=debug`.
    #[ortho_config(default = default_log_filter_string())]
    #[serde(default = "default_log_filter_string")]
    pub log_filter: String,
    /// Output format for log records.
    #[ortho_config(default = default_log_format())]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Prefix used to build external plugin binary names.
    #[ortho_config(default = default_driver_prefix())]
    #[serde(default = "default_driver_prefix")]
    pub driver_prefix: String,
    /// Driver names served by the controller binary in addition to the
    /// built-in set.
    #[serde(default)]
    pub extra_core_drivers: Vec<String>,
    /// Milliseconds to wait for a plugin to announce its address.
    #[ortho_config(default = default_address_timeout_ms())]
    #[serde(default = "default_address_timeout_ms")]
    pub address_timeout_ms: u64,
    /// Grace period in milliseconds before a plugin that ignored pipe closure
    /// is killed. Unset means shutdown stays cooperative.
    #[serde(default)]
    pub kill_grace_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            driver_prefix: default_driver_prefix(),
            extra_core_drivers: Vec::new(),
            address_timeout_ms: default_address_timeout_ms(),
            kill_grace_ms: None,
        }
    }
}

impl Config {
    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Prefix prepended to external driver names.
    #[must_use]
    pub fn driver_prefix(&self) -> &str {
        &self.driver_prefix
    }

    /// Sorted, de-duplicated set of drivers served by the controller binary.
    #[must_use]
    pub fn core_drivers(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = BUILTIN_CORE_DRIVERS
            .iter()
            .map(|name| (*name).to_owned())
            .collect();
        names.extend(
            self.extra_core_drivers
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
        );
        names.into_iter().collect()
    }

    /// Bound on the address handshake wait.
    #[must_use]
    pub const fn address_timeout(&self) -> Duration {
        Duration::from_millis(self.address_timeout_ms)
    }

    /// Optional forced-termination grace period.
    #[must_use]
    pub fn kill_grace(&self) -> Option<Duration> {
        self.kill_grace_ms.map(Duration::from_millis)
    }
}
