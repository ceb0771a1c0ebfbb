// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for binaries and tests that drive a process group.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `DYN_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/opt/dynamo/etc/logging.toml`.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `DYN_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters use the `DYN_LOG` environment variable or the `log_filters` table in the TOML file.
//! Background threads of a process group run inside spans carrying `pg` and `rank` fields, so
//! `DYN_LOG=dynamo_process_group::watchdog=debug` narrows output to one subsystem.
//!
//! Library code only emits `tracing` events; it never installs a subscriber on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Directive, fmt as tfmt};

/// ENV used to set the log level
const FILTER_ENV: &str = "DYN_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "DYN_LOGGING_CONFIG_PATH";

const JSONL_ENV: &str = "DYN_LOGGING_JSONL";

const LOCAL_TZ_ENV: &str = "DYN_LOG_USE_LOCAL_TZ";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

/// Initialize the logger
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // The generics mean we have to repeat everything. Each builder method returns a
    // specialized type.
    if env_is_truthy(JSONL_ENV) {
        let l = tfmt::layer()
            .json()
            .with_current_span(true)
            .with_timer(TimeFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = tfmt::layer()
            .event_format(tfmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| Directive::from(LevelFilter::INFO));

    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config files
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file("/opt/dynamo/etc/logging.toml"))
        .merge(Toml::file(config_path));

    match figment.extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed loading logging config, using defaults: {e}");
            LoggingConfig::default()
        }
    }
}

fn env_is_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: env_is_truthy(LOCAL_TZ_ENV),
        }
    }

    fn format_now(&self) -> String {
        if self.use_local_tz {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut tfmt::format::Writer<'_>) -> fmt::Result {
        write!(w, "{}", self.format_now())
    }
}

/// Prefix used in log lines and error messages of one process group, `[PG 0 Rank 1] `.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPrefix {
    uid: usize,
    rank: usize,
}

impl LogPrefix {
    pub fn new(uid: usize, rank: usize) -> Self {
        Self { uid, rank }
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[PG {} Rank {}] ", self.uid, self.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_prefix_format() {
        assert_eq!(LogPrefix::new(2, 7).to_string(), "[PG 2 Rank 7] ");
    }

    #[test]
    fn test_filters_from_config() {
        let config = LoggingConfig {
            log_level: "warn".to_string(),
            log_filters: HashMap::from([(
                "dynamo_process_group::watchdog".to_string(),
                "debug".to_string(),
            )]),
        };
        temp_env::with_var_unset(FILTER_ENV, || {
            let filter = filters(config);
            let rendered = filter.to_string();
            assert!(rendered.contains("dynamo_process_group::watchdog=debug"));
            assert!(rendered.contains("warn"));
        });
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialized twice without panicking");
    }

    #[test]
    fn test_time_formatter_utc_suffix() {
        let formatter = TimeFormatter {
            use_local_tz: false,
        };
        assert!(formatter.format_now().ends_with('Z'));
    }
}
