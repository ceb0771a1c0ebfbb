// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Watchdog and completion-hook threads.
//!
//! The watchdog polls every enqueued [`Work`] for asynchronous errors, timeouts and
//! completion, bumping the heartbeat the monitor watches. Completed works are handed to the
//! hook thread when a completion hook is registered and dropped otherwise.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::desync;
use crate::error::Result;
use crate::process_group::{Shared, TIMEOUT_DUMP_KEY};
use crate::trace::FlightRecorder;
use crate::work::Work;

/// Period of the "work update" progress log.
const WORK_STATUS_UPDATE_PERIOD: Duration = Duration::from_secs(30);

/// Entry point of the `pg-watchdog-<uid>` thread.
pub(crate) fn run(shared: Arc<Shared>) {
    tracing::info!(
        "{}ProcessGroupNCCL watchdog thread started with interval {} ms",
        shared.prefix,
        shared.config.watchdog_interval_ms
    );
    match watchdog_loop(&shared) {
        Ok(()) => {
            tracing::info!(
                "{}Process group watchdog thread terminated normally",
                shared.prefix
            );
        }
        Err(err) => {
            let msg = format!(
                "{}Process group watchdog thread terminated with exception: {err}",
                shared.prefix
            );
            tracing::error!("{msg}");
            *shared.watchdog_error.lock() = Some(err.clone());
            if shared.config.async_error_handling.should_tear_down() || err.is_fatal() {
                shared.terminate_process(&msg);
            }
        }
    }
}

fn watchdog_loop(shared: &Arc<Shared>) -> Result<()> {
    let interval = shared.config.watchdog_interval();
    let mut dump_pipe = DumpPipe::open(shared);
    let mut last_status_log = Instant::now();
    let mut dumped_on_timeout = false;
    let mut done = false;

    let mut works = shared.work_list.lock();
    while !done || !shared.is_terminating() {
        if !shared.is_terminating() {
            shared.work_cv.wait_for(&mut works, interval);
        }
        shared.heartbeat.fetch_add(1, Ordering::AcqRel);

        let now = Instant::now();
        if now.duration_since(last_status_log) >= WORK_STATUS_UPDATE_PERIOD
            && now.duration_since(*shared.last_work_list_update.lock()) >= WORK_STATUS_UPDATE_PERIOD
        {
            tracing::info!(
                "{}NCCL Work update periodically: last enqueued NCCL work: {}, last completed NCCL work: {}.",
                shared.prefix,
                shared.last_enqueued_seq.load(Ordering::Acquire),
                shared.last_completed_seq.load(Ordering::Acquire),
            );
            last_status_log = now;
        }

        if dump_pipe.should_dump() {
            let dumper = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("pg-pipe-dump-{}", shared.uid))
                .spawn(move || {
                    dumper.dump_debugging_info();
                });
            if let Err(e) = spawned {
                tracing::warn!("{}failed to start pipe-triggered dump: {e}", shared.prefix);
            }
        }

        let mut i = 0;
        while i < works.len() {
            let work = works[i].clone();
            if !shared.is_terminating() {
                work.check_and_set_exception();
            }
            let timed_out = work.check_timeout(None);
            // shutdown aborts every communicator; those errors are expected
            if work.exception().is_some() && !shared.is_terminating() {
                handle_failed_work(shared, &mut works, &work, timed_out, &mut dumped_on_timeout)?;
            }

            if shared.config.desync_debug {
                update_desync_traces(shared, &work);
            }

            if work.is_completed() {
                FlightRecorder::global().retire_id(work.trace_id(), true);
                shared.last_completed_seq.store(work.seq(), Ordering::Release);
                if let Some(work) = works.remove(i) {
                    if shared.hook.lock().is_some() {
                        shared.completed.lock().push_back(work);
                        shared.completed_cv.notify_one();
                    }
                }
            } else {
                i += 1;
            }
            shared.heartbeat.fetch_add(1, Ordering::AcqRel);
        }
        done = works.is_empty();
    }
    Ok(())
}

fn handle_failed_work(
    shared: &Arc<Shared>,
    works: &mut MutexGuard<'_, std::collections::VecDeque<Arc<Work>>>,
    work: &Work,
    timed_out: bool,
    dumped_on_timeout: &mut bool,
) -> Result<()> {
    let mode = shared.config.async_error_handling;
    if mode.should_clean_up() {
        work.abort();
        shared.abort(Some("Watchdog detected a failed collective"));
    }

    if timed_out {
        tracing::info!(
            "{}Timeout at NCCL work: {}, last enqueued NCCL work: {}, last completed NCCL work: {}.",
            shared.prefix,
            work.seq(),
            shared.last_enqueued_seq.load(Ordering::Acquire),
            shared.last_completed_seq.load(Ordering::Acquire),
        );
        let config = &shared.config;
        if config.desync_debug || config.dump_on_timeout {
            shared.collective_debug_info_mode.store(true, Ordering::Release);
            if let Err(e) = shared.global_store.set(TIMEOUT_DUMP_KEY, &[1]) {
                tracing::warn!(
                    "{}failed to publish the timeout dump flag: {e}",
                    shared.prefix
                );
            }
        }
        if config.dump_on_timeout && !*dumped_on_timeout {
            *dumped_on_timeout = true;
            MutexGuard::unlocked(works, || {
                shared.dump_with_timeout(config.wait_timeout_dump());
                std::thread::sleep(config.heartbeat_timeout());
            });
        }
        if config.desync_debug {
            match desync::retrieve_desync_report(
                shared.store.as_ref(),
                shared.transport.name(),
                shared.rank,
                shared.size,
            ) {
                Ok(report) => tracing::error!("{}{report}", shared.prefix),
                Err(e) => tracing::error!(
                    "{}Failed to retrieve TORCH_NCCL_DESYNC_DEBUG report: {e}",
                    shared.prefix
                ),
            }
        }
    }

    work.handle_exception(mode)
}

/// Publishes the start and end traces of `work` once each.
fn update_desync_traces(shared: &Shared, work: &Work) {
    if shared.desync_store_error.load(Ordering::Acquire) {
        return;
    }
    let name = work.op_type().profiling_name();
    let publish = |key: &str| {
        if let Err(e) = desync::trace_update(shared.store.as_ref(), key, work.seq(), &name) {
            tracing::warn!(
                "{}desync trace update failed, disabling further updates: {e}",
                shared.prefix
            );
            shared.desync_store_error.store(true, Ordering::Release);
        }
    };
    if !work.start_trace_updated() && work.is_started() && work.mark_start_trace_updated() {
        publish(&shared.trace_key_start);
    }
    if work.is_completed() && work.start_trace_updated() {
        publish(&shared.trace_key_end);
    }
}

/// Entry point of the `pg-hook-<uid>` thread.
pub(crate) fn run_hook_loop(shared: Arc<Shared>) {
    let Some(hook) = shared.hook.lock().clone() else {
        return;
    };
    let interval = shared.config.watchdog_interval();
    let mut completed = shared.completed.lock();
    loop {
        let Some(work) = completed.front().cloned() else {
            if shared.is_terminating() {
                break;
            }
            shared.completed_cv.wait_for(&mut completed, interval);
            continue;
        };

        let outcome = MutexGuard::unlocked(&mut completed, || hook(work.info()));
        if let Err(e) = outcome {
            tracing::error!(
                "{}Caught exception in onCompletion hook for {work}: {e:#}. Aborting all communicators.",
                shared.prefix
            );
            shared.abort(Some("onCompletion hook failed"));
        }
        completed.pop_front();
    }
    tracing::debug!("{}completion hook thread exited", shared.prefix);
}

/// Triggers a dump whenever anything is written to `<stem><rank>.pipe`.
#[cfg(unix)]
struct DumpPipe {
    file: Option<std::fs::File>,
    path: Option<std::path::PathBuf>,
}

#[cfg(unix)]
impl DumpPipe {
    fn open(shared: &Shared) -> Self {
        let disabled = Self {
            file: None,
            path: None,
        };
        if shared.local_id != 0 || shared.config.trace_buffer_size == 0 {
            return disabled;
        }
        let Some(stem) = shared.config.debug_info_pipe_file.as_deref() else {
            return disabled;
        };
        let path = std::path::PathBuf::from(format!("{stem}{}.pipe", shared.rank));
        match Self::create(&path) {
            Ok(file) => {
                tracing::info!("{}dump pipe created at {}", shared.prefix, path.display());
                Self {
                    file: Some(file),
                    path: Some(path),
                }
            }
            Err(e) => {
                tracing::warn!("{}dump pipe disabled: {e:#}", shared.prefix);
                disabled
            }
        }
    }

    fn create(path: &std::path::Path) -> anyhow::Result<std::fs::File> {
        use anyhow::Context;
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;
        use std::os::unix::fs::OpenOptionsExt;

        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("error removing existing named pipe {}", path.display()))?;
        }
        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
            .with_context(|| format!("error creating named pipe {}", path.display()))?;
        std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
            .with_context(|| format!("error opening named pipe {}", path.display()))
    }

    fn should_dump(&mut self) -> bool {
        use std::io::Read;

        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let mut buf = [0u8; 128];
        matches!(file.read(&mut buf), Ok(n) if n > 0)
    }
}

#[cfg(unix)]
impl Drop for DumpPipe {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(not(unix))]
struct DumpPipe;

#[cfg(not(unix))]
impl DumpPipe {
    fn open(_shared: &Shared) -> Self {
        Self
    }

    fn should_dump(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessGroupConfig;
    use crate::device::Device;
    use crate::process_group::{ProcessGroup, ProcessGroupOptions};
    use crate::store::InMemoryStore;
    use crate::tensor::{ScalarType, Tensor};
    use crate::transport::sim::SimFabric;
    use crate::types::AllreduceOptions;

    fn fast_config() -> ProcessGroupConfig {
        ProcessGroupConfig {
            watchdog_interval_ms: 5,
            ..Default::default()
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_watchdog_retires_completed_work() {
        let options = ProcessGroupOptions::builder()
            .config(fast_config())
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
        let t = Tensor::full(Device::cuda(0), &[2], ScalarType::Float, 1.0);
        let work = pg
            .allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        work.wait(None).unwrap();

        assert!(wait_until(|| pg.pending_works() == 0));
        assert_eq!(pg.last_completed_seq(), 1);
        assert!(pg.heartbeat() > 1);
    }

    #[test]
    fn test_hook_receives_completed_work() {
        let options = ProcessGroupOptions::builder()
            .config(ProcessGroupConfig {
                enable_timing: true,
                ..fast_config()
            })
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
        let (tx, rx) = flume::unbounded();
        pg.register_on_completion_hook(move |info| {
            tx.send(info)?;
            Ok(())
        })
        .unwrap();

        let t = Tensor::full(Device::cuda(0), &[2], ScalarType::Float, 1.0);
        pg.allreduce(std::slice::from_ref(&t), &AllreduceOptions::default())
            .unwrap();
        let info = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(info.seq, 1);
        assert!(info.time_finished >= info.time_started);
        pg.wait_for_pending_works();
    }

    #[cfg(unix)]
    #[test]
    fn test_dump_pipe_triggers_on_write() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("pg_pipe_").display().to_string();
        let trace_prefix = dir.path().join("trace_").display().to_string();
        let options = ProcessGroupOptions::builder()
            .config(ProcessGroupConfig {
                trace_buffer_size: 8,
                debug_info_pipe_file: Some(stem.clone()),
                debug_info_temp_file: trace_prefix.clone(),
                ..fast_config()
            })
            .local_id(0)
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
        let path = std::path::PathBuf::from(format!("{stem}0.pipe"));
        assert!(wait_until(|| path.exists()));

        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"1").unwrap();
        drop(writer);

        let dump = std::path::PathBuf::from(format!("{trace_prefix}0"));
        let parsed = || {
            std::fs::read(&dump)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        };
        assert!(wait_until(|| parsed().is_some()));
        assert!(parsed().unwrap()["entries"].is_array());

        drop(pg);
        assert!(!path.exists());
    }
}
