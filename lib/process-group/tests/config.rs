// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::recording_handler;
use dynamo_process_group::transport::sim::SimFabric;
use dynamo_process_group::{
    ErrorHandlingMode, InMemoryStore, ProcessGroup, ProcessGroupConfig, ProcessGroupOptions,
};

fn group_from_env() -> ProcessGroup {
    let (handler, _rx) = recording_handler();
    let options = ProcessGroupOptions::builder()
        .config(ProcessGroupConfig::from_env().unwrap())
        .terminate_handler(handler)
        .build()
        .unwrap();
    ProcessGroup::new(
        Arc::new(InMemoryStore::new()),
        0,
        1,
        Arc::new(SimFabric::new().transport()),
        options,
    )
    .unwrap()
}

#[test]
fn test_env_timeout_reaches_group() {
    temp_env::with_vars(
        [
            ("DYN_PG_CONFIG_PATH", None),
            ("DYN_PG_TIMEOUT_MS", Some("1234")),
            ("DYN_PG_DEBUG_LEVEL", None),
        ],
        || {
            let pg = group_from_env();
            assert_eq!(pg.timeout(), Duration::from_millis(1234));
            assert!(!pg.config().desync_debug);
        },
    );
}

#[test]
fn test_detail_debug_level_enables_desync_checks() {
    temp_env::with_vars(
        [
            ("DYN_PG_CONFIG_PATH", None),
            ("DYN_PG_TIMEOUT_MS", None),
            ("DYN_PG_DEBUG_LEVEL", Some("detail")),
            ("DYN_PG_ASYNC_ERROR_HANDLING", Some("no_handling")),
        ],
        || {
            let pg = group_from_env();
            let config = pg.config();
            assert!(config.desync_debug);
            assert!(config.dump_on_timeout);
            assert!(config.enable_timing);
            assert_eq!(config.async_error_handling, ErrorHandlingMode::SkipCleanUp);
        },
    );
}

#[test]
fn test_explicit_timeout_overrides_config() {
    temp_env::with_vars([("DYN_PG_TIMEOUT_MS", Some("1234"))], || {
        let (handler, _rx) = recording_handler();
        let options = ProcessGroupOptions::builder()
            .config(ProcessGroupConfig::from_env().unwrap())
            .timeout(Duration::from_secs(3))
            .terminate_handler(handler)
            .build()
            .unwrap();
        let pg = ProcessGroup::new(
            Arc::new(InMemoryStore::new()),
            0,
            1,
            Arc::new(SimFabric::new().transport()),
            options,
        )
        .unwrap();
        assert_eq!(pg.timeout(), Duration::from_secs(3));
    });
}

#[test]
fn test_zero_timeout_rejected() {
    let err = ProcessGroupOptions::builder()
        .timeout(Duration::ZERO)
        .build()
        .err()
        .unwrap();
    assert_eq!(err.kind(), dynamo_process_group::ErrorKind::InvalidArgument);
}
