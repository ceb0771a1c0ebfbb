// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Watchdog, heartbeat monitor, completion hooks and shutdown.

mod common;

use std::slice;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{eventually, fast_config, recording_handler, run_ranks, run_ranks_with};
use dynamo_process_group::{
    AllreduceOptions, ErrorHandlingMode, ErrorKind, ProcessGroupConfig, ProcessGroupOptions,
};

const SHORT: Duration = Duration::from_millis(50);

#[test]
fn test_missing_peer_times_out_and_aborts_group() {
    let (handler, terminated) = recording_handler();
    let done = Barrier::new(2);
    let results = run_ranks_with(
        2,
        |_| {
            ProcessGroupOptions::builder()
                .config(ProcessGroupConfig {
                    async_error_handling: ErrorHandlingMode::CleanUpOnly,
                    ..fast_config()
                })
                .terminate_handler(handler.clone())
        },
        |r| {
            let t = r.float(vec![1.0; 2]);
            r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap()
                .wait(None)
                .unwrap();
            assert_eq!(t.to_vec(), vec![2.0; 2]);

            if r.rank == 1 {
                done.wait();
                return None;
            }

            let opts = AllreduceOptions {
                timeout: Some(SHORT),
                ..Default::default()
            };
            let work = r.pg.allreduce(slice::from_ref(&t), &opts).unwrap();
            assert!(eventually(|| work.exception().is_some()));
            assert!(eventually(|| r.pg.comm_cache().is_aborted()));
            let timeout_kind = work.exception().map(|e| e.kind());

            // existing and new keys are both rejected
            let existing = r
                .pg
                .allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap_err();
            let fresh = r.pg.send(slice::from_ref(&t), 1).unwrap_err();
            done.wait();
            Some((timeout_kind, existing.kind(), fresh.kind()))
        },
    );
    assert_eq!(
        results[0],
        Some((Some(ErrorKind::Timeout), ErrorKind::Aborted, ErrorKind::Aborted))
    );
    assert!(terminated.try_recv().is_err());
}

#[test]
fn test_group_abort_fails_sibling_work() {
    let done = Barrier::new(2);
    let config = ProcessGroupConfig {
        async_error_handling: ErrorHandlingMode::CleanUpOnly,
        ..fast_config()
    };
    let results = run_ranks(2, config, |r| {
        let t = r.float(vec![1.0; 2]);
        r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap()
            .wait(None)
            .unwrap();
        t.to_vec();
        if r.rank == 1 {
            done.wait();
            return None;
        }

        let short = AllreduceOptions {
            timeout: Some(SHORT),
            ..Default::default()
        };
        let first = r.pg.allreduce(slice::from_ref(&t), &short).unwrap();
        let second = r
            .pg
            .allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        assert!(Arc::ptr_eq(first.comm(), second.comm()));
        assert!(eventually(|| r.pg.comm_cache().is_aborted()));
        assert!(eventually(|| second.exception().is_some()));

        let first_kind = first.exception().map(|e| e.kind());
        let second_err = second.exception().unwrap();
        let future_failed = matches!(second.future().value(), Some(Err(_)));
        done.wait();
        Some((first_kind, second_err.to_string(), future_failed))
    });
    let (first_kind, second_err, future_failed) = results[0].clone().unwrap();
    assert_eq!(first_kind, Some(ErrorKind::Timeout));
    assert!(second_err.contains("aborted"));
    assert!(future_failed);
}

#[test]
fn test_blocking_wait_errors_after_communicator_abort() {
    let done = Barrier::new(2);
    let config = ProcessGroupConfig {
        blocking_wait: true,
        ..fast_config()
    };
    let results = run_ranks(2, config, |r| {
        let t = r.float(vec![1.0; 2]);
        r.pg.eager_connect_single_device(r.device()).unwrap();
        if r.rank == 1 {
            done.wait();
            return None;
        }
        let short = AllreduceOptions {
            timeout: Some(SHORT),
            ..Default::default()
        };
        let first = r.pg.allreduce(slice::from_ref(&t), &short).unwrap();
        let second = r
            .pg
            .allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        let first_err = first.wait(None).unwrap_err();
        assert!(first.comm().is_aborted());
        let second_err = second.wait(None).unwrap_err();
        done.wait();
        Some((first_err.kind(), second_err.to_string()))
    });
    let (first_kind, second_err) = results[0].clone().unwrap();
    assert_eq!(first_kind, ErrorKind::Timeout);
    assert!(second_err.contains("aborted"));
}

#[test]
fn test_tear_down_on_async_error_invokes_terminate_handler() {
    let (handler, terminated) = recording_handler();
    let done = Barrier::new(2);
    let results = run_ranks_with(
        2,
        |_| {
            ProcessGroupOptions::builder()
                .config(ProcessGroupConfig {
                    async_error_handling: ErrorHandlingMode::TearDown,
                    ..fast_config()
                })
                .terminate_handler(handler.clone())
        },
        |r| {
            let t = r.float(vec![1.0; 2]);
            r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap()
                .wait(None)
                .unwrap();
            t.to_vec();
            if r.rank == 1 {
                done.wait();
                return None;
            }

            r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap();
            r.transport.inject_async_error("NET/Socket: peer closed");
            let msg = terminated.recv_timeout(Duration::from_secs(10)).unwrap();
            let latched = r.pg.watchdog_error().map(|e| e.kind());
            done.wait();
            Some((msg, latched))
        },
    );
    let (msg, latched) = results[0].clone().unwrap();
    assert!(msg.contains("watchdog thread terminated with exception"));
    assert!(msg.contains("peer closed"));
    assert_eq!(latched, Some(ErrorKind::Transport));
}

#[test]
fn test_blocking_wait_times_out() {
    let done = Barrier::new(2);
    let config = ProcessGroupConfig {
        blocking_wait: true,
        ..fast_config()
    };
    let results = run_ranks(2, config, |r| {
        let t = r.float(vec![1.0; 2]);
        r.pg.eager_connect_single_device(r.device()).unwrap();
        if r.rank == 1 {
            done.wait();
            return None;
        }
        let opts = AllreduceOptions {
            timeout: Some(SHORT),
            ..Default::default()
        };
        let work = r.pg.allreduce(slice::from_ref(&t), &opts).unwrap();
        let err = work.wait(None).unwrap_err();
        done.wait();
        Some(err.kind())
    });
    assert_eq!(results[0], Some(ErrorKind::Timeout));
}

#[test]
fn test_heartbeat_stall_terminates() {
    let (handler, terminated) = recording_handler();
    let results = run_ranks_with(
        1,
        |_| {
            ProcessGroupOptions::builder()
                .config(ProcessGroupConfig {
                    heartbeat_timeout_ms: 50,
                    ..fast_config()
                })
                .terminate_handler(handler.clone())
        },
        |r| {
            let t = r.float(vec![1.0]);
            r.pg.eager_connect_single_device(r.device()).unwrap();
            r.transport.hang_error_checks();
            r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap();
            let msg = terminated.recv_timeout(Duration::from_secs(10));
            r.transport.release_error_checks();
            msg.unwrap()
        },
    );
    assert!(results[0].contains("watchdog got stuck"));
}

#[test]
fn test_disabled_monitoring_only_logs() {
    let (handler, terminated) = recording_handler();
    run_ranks_with(
        1,
        |_| {
            ProcessGroupOptions::builder()
                .config(ProcessGroupConfig {
                    heartbeat_timeout_ms: 30,
                    enable_monitoring: false,
                    ..fast_config()
                })
                .terminate_handler(handler.clone())
        },
        |r| {
            let t = r.float(vec![1.0]);
            r.pg.eager_connect_single_device(r.device()).unwrap();
            r.transport.hang_error_checks();
            r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap();
            std::thread::sleep(Duration::from_millis(300));
            r.transport.release_error_checks();
        },
    );
    assert!(terminated.try_recv().is_err());
}

#[test]
fn test_completion_hook_sees_every_work_in_order() {
    let (tx, rx) = flume::unbounded();
    let config = ProcessGroupConfig {
        enable_timing: true,
        ..fast_config()
    };
    run_ranks(2, config, |r| {
        if r.rank == 0 {
            let tx = tx.clone();
            r.pg.register_on_completion_hook(move |info| {
                tx.send(info.seq)?;
                Ok(())
            })
            .unwrap();
        }
        let t = r.float(vec![1.0; 2]);
        for _ in 0..3 {
            r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                .unwrap();
        }
        r.pg.wait_for_pending_works();
        assert_eq!(r.pg.pending_works(), 0);
        assert_eq!(r.pg.last_completed_seq(), 3);
    });
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn test_hook_registration_rules() {
    run_ranks(1, fast_config(), |r| {
        let err = r.pg.register_on_completion_hook(|_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        r.pg.enable_collectives_timing();
        r.pg.register_on_completion_hook(|_| Ok(())).unwrap();
        let err = r.pg.register_on_completion_hook(|_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    });
}

#[test]
fn test_failing_hook_aborts_communicators() {
    run_ranks(1, fast_config(), |r| {
        r.pg.enable_collectives_timing();
        r.pg.register_on_completion_hook(|_| anyhow::bail!("hook failed"))
            .unwrap();
        let t = r.float(vec![1.0]);
        r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        assert!(eventually(|| r.pg.comm_cache().is_aborted()));
    });
}

#[test]
fn test_abort_and_shutdown_are_idempotent() {
    run_ranks(1, fast_config(), |r| {
        let t = r.float(vec![1.0]);
        r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap()
            .wait(None)
            .unwrap();
        r.pg.abort(None);
        r.pg.abort(Some("again"));
        assert!(r.pg.comm_cache().is_aborted());
        r.pg.shutdown().unwrap();
        r.pg.shutdown().unwrap();
        assert!(r.pg.is_terminated());

        let err = r
            .pg
            .allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
    });
}

#[test]
fn test_flight_recorder_dump_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("trace_rank_").display().to_string();
    let config = ProcessGroupConfig {
        trace_buffer_size: 64,
        debug_info_temp_file: prefix.clone(),
        ..fast_config()
    };
    run_ranks(1, config, |r| {
        let t = r.float(vec![1.0]);
        r.pg.allreduce(slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap()
            .wait(None)
            .unwrap();
        r.pg.wait_for_pending_works();
        assert!(r.pg.dump_debugging_info());
    });

    let blob = std::fs::read(format!("{prefix}0")).unwrap();
    let dump: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    let entries = dump["entries"].as_array().unwrap();
    assert!(
        entries
            .iter()
            .any(|e| e["profiling_name"] == "nccl:all_reduce")
    );
    assert!(dump["comm_state"].is_object());
}
