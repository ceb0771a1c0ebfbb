// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process group configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/opt/dynamo/etc/process_group.toml`
//! 3. TOML file from the `DYN_PG_CONFIG_PATH` environment variable
//! 4. Environment variables (`DYN_PG_*` prefixed)
//!
//! Example:
//! ```toml
//! blocking_wait = false
//! async_error_handling = "tear_down"
//! heartbeat_timeout_ms = 300000
//! trace_buffer_size = 2000
//! ```
//!
//! Several options interact. [`ProcessGroupConfig::resolve`] applies those rules and must be
//! called before a config is handed to a process group (the group does this itself).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV used to point at a TOML configuration file
const CONFIG_PATH_ENV: &str = "DYN_PG_CONFIG_PATH";

/// Prefix for all process group environment variables
const ENV_PREFIX: &str = "DYN_PG_";

/// Default collective timeout (10 minutes).
pub const DEFAULT_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// What the watchdog does once a work handle reports an error or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlingMode {
    /// Log only.
    NoHandling,
    /// Abort communicators, then re-raise inside the watchdog.
    TearDown,
    /// Abort communicators without re-raising.
    CleanUpOnly,
    /// Re-raise inside the watchdog without aborting communicators first.
    SkipCleanUp,
}

impl ErrorHandlingMode {
    pub fn should_clean_up(&self) -> bool {
        matches!(self, ErrorHandlingMode::TearDown | ErrorHandlingMode::CleanUpOnly)
    }

    pub fn should_tear_down(&self) -> bool {
        matches!(self, ErrorHandlingMode::TearDown | ErrorHandlingMode::SkipCleanUp)
    }
}

impl FromStr for ErrorHandlingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no_handling" | "0" => Ok(ErrorHandlingMode::NoHandling),
            "tear_down" | "1" => Ok(ErrorHandlingMode::TearDown),
            "clean_up_only" | "2" => Ok(ErrorHandlingMode::CleanUpOnly),
            "skip_clean_up" | "3" => Ok(ErrorHandlingMode::SkipCleanUp),
            _ => Err(anyhow::anyhow!(
                "Invalid error handling mode: '{}'. Valid options are: 'no_handling', 'tear_down', 'clean_up_only', 'skip_clean_up'",
                s
            )),
        }
    }
}

impl fmt::Display for ErrorHandlingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorHandlingMode::NoHandling => write!(f, "no_handling"),
            ErrorHandlingMode::TearDown => write!(f, "tear_down"),
            ErrorHandlingMode::CleanUpOnly => write!(f, "clean_up_only"),
            ErrorHandlingMode::SkipCleanUp => write!(f, "skip_clean_up"),
        }
    }
}

/// Distributed debug verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    #[default]
    Off,
    Info,
    /// Turns on desync debugging and dump-on-timeout.
    Detail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProcessGroupConfig {
    /// `wait()` busy-polls the work until completion or timeout.
    pub blocking_wait: bool,

    /// Abort communicators when the group is dropped without an explicit shutdown.
    pub abort_in_destroy_pg: bool,

    pub async_error_handling: ErrorHandlingMode,

    /// Publish per-collective start/end traces to the store and produce a desync
    /// report on timeout.
    pub desync_debug: bool,

    pub dump_on_timeout: bool,

    /// Record start events so work durations can be measured.
    pub enable_timing: bool,

    /// When false, the heartbeat monitor logs instead of terminating the process.
    pub enable_monitoring: bool,

    #[validate(range(min = 1))]
    pub heartbeat_timeout_ms: u64,

    #[validate(range(min = 1))]
    pub wait_timeout_dump_ms: u64,

    #[validate(range(min = 1))]
    pub coord_check_interval_ms: u64,

    #[validate(range(min = 1))]
    pub watchdog_interval_ms: u64,

    /// Flight recorder capacity. Zero disables recording.
    pub trace_buffer_size: usize,

    /// Stash inputs on the work instead of calling `record_stream`.
    pub avoid_record_streams: bool,

    pub high_priority_stream: bool,

    /// Register allocator segments with every new communicator.
    pub use_tensor_register_allocator_hook: bool,

    /// Initialize communicators in non-blocking mode.
    pub use_comm_nonblocking: bool,

    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    pub debug_level: DebugLevel,

    #[validate(length(min = 1))]
    pub debug_info_temp_file: String,

    /// Stem of the named pipe used to trigger dumps, `<stem><rank>.pipe`.
    pub debug_info_pipe_file: Option<String>,
}

impl Default for ProcessGroupConfig {
    fn default() -> Self {
        Self {
            blocking_wait: false,
            abort_in_destroy_pg: false,
            async_error_handling: ErrorHandlingMode::SkipCleanUp,
            desync_debug: false,
            dump_on_timeout: false,
            enable_timing: false,
            enable_monitoring: true,
            heartbeat_timeout_ms: 10 * 60 * 1000,
            wait_timeout_dump_ms: 60 * 1000,
            coord_check_interval_ms: 1000,
            watchdog_interval_ms: 100,
            trace_buffer_size: 0,
            avoid_record_streams: false,
            high_priority_stream: false,
            use_tensor_register_allocator_hook: false,
            use_comm_nonblocking: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            debug_level: DebugLevel::Off,
            debug_info_temp_file: "/tmp/nccl_trace_rank_".to_string(),
            debug_info_pipe_file: None,
        }
    }
}

impl ProcessGroupConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(ProcessGroupConfig::default()))
            .merge(Toml::file("/opt/dynamo/etc/process_group.toml"))
            .merge(Toml::file(&config_path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["CONFIG_PATH"])
                    .map(|k| k.as_str().to_lowercase().into()),
            )
    }

    /// Load configuration from defaults, files and environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from a Figment instance.
    pub fn extract_from(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a Figment with additional overrides merged on top.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }

    /// Applies the interactions between options and returns the effective config.
    ///
    /// - `debug_level = detail` turns on desync debugging and dump-on-timeout.
    /// - Desync debugging needs start events, so it turns on timing.
    /// - Blocking wait forces `no_handling` and disables desync debugging.
    /// - Desync debugging never runs with `no_handling`; it is upgraded to `skip_clean_up`.
    pub fn resolve(mut self) -> Self {
        if self.debug_level == DebugLevel::Detail {
            self.desync_debug = true;
            self.dump_on_timeout = true;
        }

        if self.blocking_wait {
            if self.async_error_handling != ErrorHandlingMode::NoHandling || self.desync_debug {
                tracing::info!(
                    "blocking_wait is enabled; async error handling and desync debugging are disabled"
                );
            }
            self.async_error_handling = ErrorHandlingMode::NoHandling;
            self.desync_debug = false;
        } else if self.desync_debug
            && self.async_error_handling == ErrorHandlingMode::NoHandling
        {
            tracing::info!(
                "desync_debug is enabled; overriding async_error_handling to skip_clean_up"
            );
            self.async_error_handling = ErrorHandlingMode::SkipCleanUp;
        }

        if self.desync_debug {
            self.enable_timing = true;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn wait_timeout_dump(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_dump_ms)
    }

    pub fn coord_check_interval(&self) -> Duration {
        Duration::from_millis(self.coord_check_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

impl Provider for ProcessGroupConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("ProcessGroupConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ENV_VARS: &[&str] = &[
        "DYN_PG_CONFIG_PATH",
        "DYN_PG_BLOCKING_WAIT",
        "DYN_PG_ASYNC_ERROR_HANDLING",
        "DYN_PG_DESYNC_DEBUG",
        "DYN_PG_TRACE_BUFFER_SIZE",
        "DYN_PG_HEARTBEAT_TIMEOUT_MS",
        "DYN_PG_DEBUG_LEVEL",
    ];

    #[test]
    fn test_figment_defaults() {
        temp_env::with_vars_unset(ENV_VARS, || {
            let config = ProcessGroupConfig::from_env().unwrap();
            assert_eq!(config, ProcessGroupConfig::default());
            assert_eq!(config.async_error_handling, ErrorHandlingMode::SkipCleanUp);
            assert!(config.enable_monitoring);
            assert_eq!(config.timeout(), Duration::from_secs(600));
            assert_eq!(config.watchdog_interval(), Duration::from_millis(100));
        });
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("DYN_PG_CONFIG_PATH", None),
                ("DYN_PG_ASYNC_ERROR_HANDLING", Some("tear_down")),
                ("DYN_PG_TRACE_BUFFER_SIZE", Some("2000")),
                ("DYN_PG_HEARTBEAT_TIMEOUT_MS", Some("1500")),
                ("DYN_PG_DEBUG_INFO_PIPE_FILE", Some("/tmp/pg_pipe_")),
            ],
            || {
                let config = ProcessGroupConfig::from_env().unwrap();
                assert_eq!(config.async_error_handling, ErrorHandlingMode::TearDown);
                assert_eq!(config.trace_buffer_size, 2000);
                assert_eq!(config.heartbeat_timeout(), Duration::from_millis(1500));
                assert_eq!(config.debug_info_pipe_file.as_deref(), Some("/tmp/pg_pipe_"));
            },
        );
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        temp_env::with_vars(
            [
                ("DYN_PG_CONFIG_PATH", None),
                ("DYN_PG_WATCHDOG_INTERVAL_MS", Some("0")),
            ],
            || {
                let err = ProcessGroupConfig::from_env().unwrap_err();
                assert!(matches!(err, ConfigError::Validation(_)));
            },
        );
    }

    #[test]
    fn test_blocking_wait_disables_async_handling() {
        let config = ProcessGroupConfig {
            blocking_wait: true,
            desync_debug: true,
            async_error_handling: ErrorHandlingMode::TearDown,
            ..Default::default()
        }
        .resolve();
        assert_eq!(config.async_error_handling, ErrorHandlingMode::NoHandling);
        assert!(!config.desync_debug);
        assert!(!config.enable_timing);
    }

    #[test]
    fn test_desync_upgrades_no_handling() {
        let config = ProcessGroupConfig {
            desync_debug: true,
            async_error_handling: ErrorHandlingMode::NoHandling,
            ..Default::default()
        }
        .resolve();
        assert_eq!(config.async_error_handling, ErrorHandlingMode::SkipCleanUp);
        assert!(config.enable_timing);
    }

    #[test]
    fn test_detail_debug_level() {
        let config = ProcessGroupConfig {
            debug_level: DebugLevel::Detail,
            ..Default::default()
        }
        .resolve();
        assert!(config.desync_debug);
        assert!(config.dump_on_timeout);
        assert!(config.enable_timing);
    }

    #[rstest]
    #[case::no_handling(ErrorHandlingMode::NoHandling, false, false)]
    #[case::tear_down(ErrorHandlingMode::TearDown, true, true)]
    #[case::clean_up_only(ErrorHandlingMode::CleanUpOnly, true, false)]
    #[case::skip_clean_up(ErrorHandlingMode::SkipCleanUp, false, true)]
    fn test_error_handling_mode_predicates(
        #[case] mode: ErrorHandlingMode,
        #[case] clean_up: bool,
        #[case] tear_down: bool,
    ) {
        assert_eq!(mode.should_clean_up(), clean_up);
        assert_eq!(mode.should_tear_down(), tear_down);
        assert_eq!(mode.to_string().parse::<ErrorHandlingMode>().unwrap(), mode);
    }

    #[test]
    fn test_error_handling_mode_from_legacy_number() {
        assert_eq!(
            "2".parse::<ErrorHandlingMode>().unwrap(),
            ErrorHandlingMode::CleanUpOnly
        );
        assert!("sometimes".parse::<ErrorHandlingMode>().is_err());
    }
}
