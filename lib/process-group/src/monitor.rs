// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Heartbeat monitor.
//!
//! Watches the watchdog's heartbeat and, for the group with local id 0, the global
//! `timeout_dump` flag. When either fires it dumps debug info and takes the process down
//! through the terminate handler.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::process_group::{Shared, TIMEOUT_DUMP_KEY};
use crate::utils::run_with_timeout;

const LOCK_CHECK_TIMEOUT: Duration = Duration::from_millis(300);

struct Trigger {
    error: String,
    exit: String,
}

/// Entry point of the `pg-monitor-<uid>` thread.
pub(crate) fn run(shared: Arc<Shared>) {
    let Some(trigger) = watch(&shared) else {
        tracing::debug!("{}heartbeat monitor stopped", shared.prefix);
        return;
    };
    tracing::error!("{}", trigger.error);

    if let Some(dumper) = &shared.stack_dumper {
        tracing::info!("{}Dumping native stack traces", shared.prefix);
        dumper();
    }

    shared.dump_with_timeout(shared.config.wait_timeout_dump());

    match &shared.lock_check {
        Some(check) => {
            let check = check.clone();
            let name = format!("pg-lock-check-{}", shared.uid);
            match run_with_timeout(&name, LOCK_CHECK_TIMEOUT, move || check()) {
                Some(true) => tracing::info!("{}Could acquire GIL on exit", shared.prefix),
                _ => tracing::error!(
                    "{}Could not acquire GIL within 300 ms on exit, possible GIL induced hang",
                    shared.prefix
                ),
            }
        }
        None => tracing::info!(
            "{}GIL checker was not registered, perhaps this is a no-python build?",
            shared.prefix
        ),
    }

    // Leave time for the desync report or the group teardown to finish first.
    if shared.is_terminating() || shared.collective_debug_info_mode.load(Ordering::Acquire) {
        let deadline = Instant::now() + shared.config.heartbeat_timeout();
        let mut stopped = shared.monitor_stop.lock();
        while !*stopped {
            if shared.monitor_cv.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
    }

    if shared.monitor_stopped() {
        return;
    }
    let exit_msg = format!("{}{}", shared.prefix, trigger.exit);
    if shared.config.enable_monitoring {
        shared.terminate_process(&exit_msg);
    } else {
        tracing::error!(
            "PGNCCL Monitor Thread is disabled, but would have killed this job:\n{exit_msg}"
        );
    }
}

/// Polls until a trigger fires. Returns `None` when the monitor is stopped first.
fn watch(shared: &Shared) -> Option<Trigger> {
    let config = &shared.config;
    let heartbeat_timeout = config.heartbeat_timeout();
    let coord_interval = config.coord_check_interval();
    let check_timeout_signal = config.dump_on_timeout && shared.local_id == 0;
    let poll_interval = if check_timeout_signal {
        coord_interval
    } else {
        heartbeat_timeout
    };

    let mut last_heartbeat = 0;
    let mut last_store_poll = Instant::now();
    let mut last_heartbeat_check = Instant::now();
    loop {
        {
            let mut stopped = shared.monitor_stop.lock();
            if !*stopped {
                shared.monitor_cv.wait_for(&mut stopped, poll_interval);
            }
            if *stopped {
                return None;
            }
        }
        let now = Instant::now();

        if check_timeout_signal
            && now.duration_since(*shared.last_work_list_update.lock()) >= config.watchdog_interval()
            && now.duration_since(last_store_poll) >= coord_interval
        {
            last_store_poll = now;
            match shared.global_store.check(&[TIMEOUT_DUMP_KEY]) {
                Ok(true) => return Some(global_timeout(shared)),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    "{}failed to poll the global timeout flag: {e}",
                    shared.prefix
                ),
            }
        }

        if now.duration_since(last_heartbeat_check) >= heartbeat_timeout {
            last_heartbeat_check = now;
            let heartbeat = shared.heartbeat.load(Ordering::Acquire);
            if heartbeat != last_heartbeat {
                last_heartbeat = heartbeat;
            } else {
                return Some(stalled(shared));
            }
        }
    }
}

fn global_timeout(shared: &Shared) -> Trigger {
    Trigger {
        error: format!(
            "{}Received a global timeout from another rank and will start to dump the debug info. \
             Last enqueued NCCL work: {}, last completed NCCL work: {}.",
            shared.prefix,
            shared.last_enqueued_seq.load(Ordering::Acquire),
            shared.last_completed_seq.load(Ordering::Acquire),
        ),
        exit: "ProcessGroupNCCL's watchdog detected a collective timeout and notified current \
               rank. This is most likely caused by incorrect usages of collectives, e.g., wrong \
               sizes used across ranks, the order of collectives is not same for all ranks or the \
               scheduled collective, for some reason, didn't run. We tried our best to dump the \
               debug info into the storage to help you debug the issue."
            .to_string(),
    }
}

fn stalled(shared: &Shared) -> Trigger {
    // The watchdog may be stuck while holding the list lock.
    let pending = match shared.work_list.try_lock() {
        Some(works) => works.len().to_string(),
        None => "unknown".to_string(),
    };
    let timeout_secs = shared.config.heartbeat_timeout().as_secs_f64();
    Trigger {
        error: format!(
            "{}Heartbeat monitor timed out! Process will be terminated after dumping debug info. \
             pending works: {pending}",
            shared.prefix
        ),
        exit: format!(
            "ProcessGroupNCCL's watchdog got stuck for {timeout_secs} seconds without making \
             progress in monitoring enqueued collectives. This typically indicates a NCCL/CUDA \
             API hang blocking the watchdog. If you suspect the watchdog is not actually stuck \
             and a longer timeout would help, increase DYN_PG_HEARTBEAT_TIMEOUT_MS or disable \
             the heartbeat monitor with DYN_PG_ENABLE_MONITORING=false. pending works: {pending}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessGroupConfig;
    use crate::process_group::{ProcessGroup, ProcessGroupOptions, TerminateHandler};
    use crate::store::{InMemoryStore, Store};
    use crate::transport::sim::SimFabric;

    fn recording_handler() -> (TerminateHandler, flume::Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        let handler: TerminateHandler = Arc::new(move |msg: &str| {
            let _ = tx.send(msg.to_string());
        });
        (handler, rx)
    }

    #[test]
    fn test_global_timeout_flag_terminates() {
        let store = Arc::new(InMemoryStore::new());
        store.set(TIMEOUT_DUMP_KEY, &[1]).unwrap();
        let (handler, rx) = recording_handler();
        let options = ProcessGroupOptions::builder()
            .config(ProcessGroupConfig {
                dump_on_timeout: true,
                coord_check_interval_ms: 5,
                watchdog_interval_ms: 5,
                wait_timeout_dump_ms: 50,
                ..Default::default()
            })
            .local_id(0)
            .terminate_handler(handler)
            .build()
            .unwrap();
        let _pg = ProcessGroup::new(store, 0, 1, Arc::new(SimFabric::new().transport()), options)
            .unwrap();

        let msg = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(msg.contains("detected a collective timeout and notified current rank"));
    }

    #[test]
    fn test_monitor_stops_quietly_on_shutdown() {
        let (handler, rx) = recording_handler();
        let options = ProcessGroupOptions::builder()
            .config(ProcessGroupConfig {
                heartbeat_timeout_ms: 20,
                watchdog_interval_ms: 5,
                ..Default::default()
            })
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
        std::thread::sleep(Duration::from_millis(100));
        pg.shutdown().unwrap();
        drop(pg);
        assert!(rx.try_recv().is_err());
    }
}
