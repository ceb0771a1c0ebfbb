// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process group facade.
//!
//! A [`ProcessGroup`] owns one rank's view of a collective group: the communicator cache, the
//! dispatch state, the work-tracking lists and the background threads that supervise them.
//!
//! ```text
//!   caller ──► ops ──► dispatch ──► CommCache ──► Transport
//!                          │
//!                          └──► work list ──► watchdog ──► completed list ──► hook thread
//!                                                 │
//!                                            heartbeat ◄── monitor
//! ```
//!
//! The state the threads share lives in [`Shared`]; the facade itself only holds the thread
//! handles so that dropping it can shut everything down and join.

mod checks;
mod dispatch;
mod ops;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use derive_builder::Builder;
use parking_lot::{Condvar, Mutex};

use crate::comm_cache::{CommCache, CommCacheOptions};
use crate::config::ProcessGroupConfig;
use crate::desync;
use crate::device::{self, Device};
use crate::error::{ProcessGroupError, Result};
use crate::logging::LogPrefix;
use crate::store::Store;
use crate::trace::{self, FlightRecorder};
use crate::transport::Transport;
use crate::utils::run_with_timeout;
use crate::work::{Work, WorkInfo};
use crate::{monitor, watchdog};

use dispatch::DispatchState;

/// Called with a final message when the process has to be taken down.
pub type TerminateHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Called with every completed work when timing is enabled.
pub type CompletionHook = Arc<dyn Fn(WorkInfo) -> anyhow::Result<()> + Send + Sync>;

/// Dumps native stack traces before the monitor terminates the process.
pub type StackDumper = Arc<dyn Fn() + Send + Sync>;

/// Reports whether a host-level lock (for example an embedding interpreter's) can be taken.
pub type LockCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Key of the flag a timed-out rank writes to the root store to ask every rank to dump.
pub const TIMEOUT_DUMP_KEY: &str = "timeout_dump";

static PROCESS_GROUP_ID: AtomicUsize = AtomicUsize::new(0);

/// Serializes debug dumps across every group in the process.
static DUMP_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Clone, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"), public)]
pub struct ProcessGroupOptions {
    /// Resolved again by the group, so an unresolved config is fine here.
    #[builder(default)]
    config: ProcessGroupConfig,

    /// Overrides `config.timeout_ms`.
    #[builder(default, setter(strip_option))]
    timeout: Option<Duration>,

    /// Parent group whose communicators are split instead of initializing new ones.
    #[builder(default, setter(strip_option))]
    split_from: Option<Arc<ProcessGroup>>,

    #[builder(default)]
    split_color: i32,

    /// Global ranks of the members, used by the flight recorder.
    #[builder(default)]
    global_ranks_in_group: Vec<usize>,

    #[builder(default, setter(strip_option))]
    bound_device: Option<Device>,

    /// Process-local group index. Defaults to the global group id.
    #[builder(default, setter(strip_option))]
    local_id: Option<usize>,

    #[builder(default, setter(strip_option))]
    terminate_handler: Option<TerminateHandler>,

    #[builder(default, setter(strip_option))]
    stack_dumper: Option<StackDumper>,

    #[builder(default, setter(strip_option))]
    lock_check: Option<LockCheck>,
}

impl ProcessGroupOptions {
    pub fn builder() -> ProcessGroupOptionsBuilder {
        ProcessGroupOptionsBuilder::default()
    }

    pub fn config(&self) -> &ProcessGroupConfig {
        &self.config
    }
}

impl Default for ProcessGroupOptions {
    fn default() -> Self {
        Self {
            config: ProcessGroupConfig::default(),
            timeout: None,
            split_from: None,
            split_color: 0,
            global_ranks_in_group: Vec::new(),
            bound_device: None,
            local_id: None,
            terminate_handler: None,
            stack_dumper: None,
            lock_check: None,
        }
    }
}

impl ProcessGroupOptionsBuilder {
    pub fn build(self) -> Result<ProcessGroupOptions> {
        let options = self
            .build_internal()
            .map_err(|e| ProcessGroupError::invalid_argument(e.to_string()))?;
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ProcessGroupError::invalid_argument(
                "process group timeout must be positive",
            ));
        }
        if options.split_from.is_some() && options.split_color == 0 {
            return Err(ProcessGroupError::invalid_argument(
                "Must specify a non-zero color when splitting",
            ));
        }
        Ok(options)
    }
}

fn default_terminate_handler() -> TerminateHandler {
    Arc::new(|msg: &str| {
        tracing::error!("{msg}");
        std::process::abort();
    })
}

/// State shared between the facade and its background threads.
pub(crate) struct Shared {
    pub(crate) uid: usize,
    pub(crate) local_id: usize,
    pub(crate) rank: usize,
    pub(crate) size: usize,
    pub(crate) name: String,
    pub(crate) prefix: LogPrefix,
    pub(crate) config: ProcessGroupConfig,
    pub(crate) timeout: Duration,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) global_store: Arc<dyn Store>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cache: Arc<CommCache>,
    pub(crate) bound_device: Option<Device>,
    pub(crate) trace_key_start: String,
    pub(crate) trace_key_end: String,

    pub(crate) enable_timing: AtomicBool,
    pub(crate) dispatch: Mutex<DispatchState>,

    pub(crate) work_list: Mutex<VecDeque<Arc<Work>>>,
    pub(crate) work_cv: Condvar,
    pub(crate) completed: Mutex<VecDeque<Arc<Work>>>,
    pub(crate) completed_cv: Condvar,
    pub(crate) last_work_list_update: Mutex<Instant>,

    pub(crate) terminate: AtomicBool,
    pub(crate) heartbeat: AtomicU64,
    pub(crate) last_enqueued_seq: AtomicU64,
    pub(crate) last_completed_seq: AtomicU64,
    pub(crate) collective_debug_info_mode: AtomicBool,
    pub(crate) desync_store_error: AtomicBool,
    pub(crate) watchdog_error: Mutex<Option<ProcessGroupError>>,

    pub(crate) hook: Mutex<Option<CompletionHook>>,

    pub(crate) monitor_stop: Mutex<bool>,
    pub(crate) monitor_cv: Condvar,

    pub(crate) terminate_handler: TerminateHandler,
    pub(crate) stack_dumper: Option<StackDumper>,
    pub(crate) lock_check: Option<LockCheck>,
}

impl Shared {
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Aborts every communicator of this group.
    pub(crate) fn abort(&self, reason: Option<&str>) {
        self.cache.abort_all(reason);
    }

    pub(crate) fn terminate_process(&self, msg: &str) {
        (self.terminate_handler)(msg);
    }

    /// Writes the flight recorder dump through the registered writer. Returns false when
    /// recording is disabled.
    pub(crate) fn dump_debugging_info(&self) -> bool {
        let _guard = DUMP_MUTEX.lock();
        if self.config.trace_buffer_size == 0 {
            return false;
        }
        tracing::info!("{}ProcessGroupNCCL preparing to dump debug info.", self.prefix);
        let blob = match FlightRecorder::global().dump_json(self.cache.dump_comm_state()) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!("{}failed to serialize debug info: {e:#}", self.prefix);
                return false;
            }
        };
        let writer = trace::debug_info_writer(&self.config.debug_info_temp_file, self.rank);
        if let Err(e) = writer.write(&blob) {
            tracing::error!("{}failed to write debug info: {e:#}", self.prefix);
            return false;
        }
        true
    }

    /// Dumps on a helper thread and gives up after `timeout`.
    pub(crate) fn dump_with_timeout(self: &Arc<Self>, timeout: Duration) -> bool {
        let shared = self.clone();
        let name = format!("pg-dump-{}", self.uid);
        match run_with_timeout(&name, timeout, move || shared.dump_debugging_info()) {
            Some(dumped) => dumped,
            None => {
                tracing::error!(
                    "{}debug info dump did not finish within {} ms",
                    self.prefix,
                    timeout.as_millis()
                );
                false
            }
        }
    }

    /// Device used when an operation carries no tensor, such as a barrier.
    pub(crate) fn guess_device_for_rank(&self) -> Device {
        if let Some(device) = self.bound_device {
            return device;
        }
        let count = device::device_count().max(1);
        Device::cuda((self.rank % count) as i16)
    }

    pub(crate) fn stop_monitor(&self) {
        *self.monitor_stop.lock() = true;
        self.monitor_cv.notify_all();
    }

    pub(crate) fn monitor_stopped(&self) -> bool {
        *self.monitor_stop.lock()
    }
}

/// One rank's handle on a collective group.
pub struct ProcessGroup {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessGroup {
    /// Creates the group and starts its watchdog and heartbeat monitor.
    ///
    /// Communicators are created lazily by the first operation on each device or peer.
    pub fn new(
        store: Arc<dyn Store>,
        rank: usize,
        size: usize,
        transport: Arc<dyn Transport>,
        options: ProcessGroupOptions,
    ) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(ProcessGroupError::invalid_argument(format!(
                "invalid rank {rank} for a process group of size {size}"
            )));
        }
        let config = options.config.clone().resolve();
        let uid = PROCESS_GROUP_ID.fetch_add(1, Ordering::AcqRel);
        let local_id = options.local_id.unwrap_or(uid);
        let prefix = LogPrefix::new(uid, rank);
        let timeout = options.timeout.unwrap_or_else(|| config.timeout());
        let global_store = store.root().unwrap_or_else(|| store.clone());

        let cache = Arc::new(CommCache::new(
            prefix.clone(),
            CommCacheOptions {
                rank,
                size,
                nonblocking: config.use_comm_nonblocking,
                high_priority_stream: config.high_priority_stream,
                register_segments: config.use_tensor_register_allocator_hook,
                split_from: options.split_from.as_ref().map(|p| p.shared.cache.clone()),
                split_color: options.split_color,
                bound_device: options.bound_device,
                timeout,
            },
            transport.clone(),
            store.clone(),
        ));

        let recorder = FlightRecorder::global();
        recorder.ensure_capacity(config.trace_buffer_size);
        let group_ranks = if options.global_ranks_in_group.is_empty() && uid == 0 {
            (0..size).collect()
        } else {
            options.global_ranks_in_group.clone()
        };
        recorder.record_pg_ranks(uid, group_ranks);

        tracing::info!(
            "{prefix}ProcessGroupNCCL initialization options: size: {size}, global rank: {rank}, \
             timeout(ms): {}, transport: {} {}, split_from: {}, split_color: {}, local id: {local_id}",
            timeout.as_millis(),
            transport.name(),
            transport.version(),
            options.split_from.is_some(),
            options.split_color,
        );
        tracing::info!(
            "{prefix}ProcessGroupNCCL environments: async_error_handling: {}, dump_on_timeout: {}, \
             desync_debug: {}, enable_timing: {}, blocking_wait: {}, heartbeat_timeout(ms): {}, \
             trace_buffer_size: {}, enable_monitoring: {}, use_comm_nonblocking: {}",
            config.async_error_handling,
            config.dump_on_timeout,
            config.desync_debug,
            config.enable_timing,
            config.blocking_wait,
            config.heartbeat_timeout_ms,
            config.trace_buffer_size,
            config.enable_monitoring,
            config.use_comm_nonblocking,
        );

        let backend = transport.name();
        let shared = Arc::new(Shared {
            uid,
            local_id,
            rank,
            size,
            name: uid.to_string(),
            prefix,
            timeout,
            store,
            global_store,
            cache,
            bound_device: options.bound_device,
            trace_key_start: desync::trace_key_start(backend, rank),
            trace_key_end: desync::trace_key_end(backend, rank),
            transport,
            enable_timing: AtomicBool::new(config.enable_timing),
            dispatch: Mutex::new(DispatchState::default()),
            work_list: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            completed: Mutex::new(VecDeque::new()),
            completed_cv: Condvar::new(),
            last_work_list_update: Mutex::new(Instant::now()),
            terminate: AtomicBool::new(false),
            heartbeat: AtomicU64::new(1),
            last_enqueued_seq: AtomicU64::new(0),
            last_completed_seq: AtomicU64::new(0),
            collective_debug_info_mode: AtomicBool::new(false),
            desync_store_error: AtomicBool::new(false),
            watchdog_error: Mutex::new(None),
            hook: Mutex::new(None),
            monitor_stop: Mutex::new(false),
            monitor_cv: Condvar::new(),
            terminate_handler: options
                .terminate_handler
                .clone()
                .unwrap_or_else(default_terminate_handler),
            stack_dumper: options.stack_dumper.clone(),
            lock_check: options.lock_check.clone(),
            config,
        });

        let group = Self {
            shared,
            threads: Mutex::new(Vec::new()),
        };
        let watchdog_shared = group.shared.clone();
        group.spawn(format!("pg-watchdog-{uid}"), move || {
            watchdog::run(watchdog_shared)
        })?;
        let monitor_shared = group.shared.clone();
        group.spawn(format!("pg-monitor-{uid}"), move || {
            monitor::run(monitor_shared)
        })?;
        Ok(group)
    }

    fn spawn<F>(&self, name: String, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let span = tracing::info_span!("process_group", pg = self.shared.uid, rank = self.shared.rank);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _entered = span.enter();
                f()
            })
            .map_err(|e| ProcessGroupError::internal(format!("failed to spawn {name}: {e}")))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.shared.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Process-wide id of this group.
    pub fn uid(&self) -> usize {
        self.shared.uid
    }

    pub fn local_id(&self) -> usize {
        self.shared.local_id
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.transport.name()
    }

    /// Effective configuration after [`ProcessGroupConfig::resolve`].
    pub fn config(&self) -> &ProcessGroupConfig {
        &self.shared.config
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Sequence number of the last collective issued by this rank.
    pub fn sequence_number(&self) -> u64 {
        self.shared.dispatch.lock().seq
    }

    pub fn last_enqueued_seq(&self) -> u64 {
        self.shared.last_enqueued_seq.load(Ordering::Acquire)
    }

    pub fn last_completed_seq(&self) -> u64 {
        self.shared.last_completed_seq.load(Ordering::Acquire)
    }

    /// Watchdog liveness counter.
    pub fn heartbeat(&self) -> u64 {
        self.shared.heartbeat.load(Ordering::Acquire)
    }

    pub fn pending_works(&self) -> usize {
        self.shared.work_list.lock().len()
    }

    /// The error that stopped the watchdog thread, if any.
    pub fn watchdog_error(&self) -> Option<ProcessGroupError> {
        self.shared.watchdog_error.lock().clone()
    }

    pub fn comm_cache(&self) -> &Arc<CommCache> {
        &self.shared.cache
    }

    pub fn comm_split_count(&self) -> u64 {
        self.shared.cache.comm_split_counter()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminating()
    }

    /// Records start events for every later operation.
    pub fn enable_collectives_timing(&self) {
        self.shared.enable_timing.store(true, Ordering::Release);
    }

    /// Creates the device communicator ahead of the first collective.
    pub fn eager_connect_single_device(&self, device: Device) -> Result<()> {
        tracing::info!("{}Eagerly connecting nccl backend with device {device}", self.shared.prefix);
        self.shared.cache.get_or_create(
            &crate::comm_cache::device_key(device),
            device,
            crate::types::OpType::Allreduce,
            0,
            false,
        )?;
        Ok(())
    }

    /// Installs the completion hook and starts the thread that runs it.
    pub fn register_on_completion_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(WorkInfo) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        {
            let mut slot = self.shared.hook.lock();
            if slot.is_some() {
                return Err(ProcessGroupError::invalid_argument(
                    "ProcessGroupNCCL OnCompletion hook already registered",
                ));
            }
            if !self.shared.enable_timing.load(Ordering::Acquire) {
                return Err(ProcessGroupError::invalid_argument(
                    "ProcessGroupNCCL OnCompletion hook requires recording start and end events \
                     which require enable_timing. Enable it or call enable_collectives_timing() \
                     before registering the hook.",
                ));
            }
            *slot = Some(Arc::new(hook));
        }
        let shared = self.shared.clone();
        self.spawn(format!("pg-hook-{}", self.shared.uid), move || {
            watchdog::run_hook_loop(shared)
        })
    }

    /// Blocks until the watchdog and the hook thread have drained every work.
    pub fn wait_for_pending_works(&self) {
        let interval = self.shared.config.watchdog_interval();
        loop {
            {
                let works = self.shared.work_list.lock();
                let completed = self.shared.completed.lock();
                if works.is_empty() && completed.is_empty() {
                    return;
                }
            }
            std::thread::sleep(interval);
        }
    }

    /// Writes the flight recorder dump. Returns false when recording is disabled or fails.
    pub fn dump_debugging_info(&self) -> bool {
        self.shared.dump_debugging_info()
    }

    /// Aborts every communicator of this group. Idempotent.
    pub fn abort(&self, reason: Option<&str>) {
        self.shared.abort(reason);
    }

    /// Stops the background threads and aborts every communicator.
    ///
    /// The abort runs on a helper thread bounded by the group timeout. Calling this more than
    /// once is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.terminate.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        shared.work_cv.notify_all();
        shared.completed_cv.notify_all();

        tracing::info!("{}Launching ProcessGroupNCCL abort asynchronously.", shared.prefix);
        let cache = shared.cache.clone();
        let reason = format!("Process Group shutdown on rank {}", shared.rank);
        let aborted = run_with_timeout(&format!("pg-abort-{}", shared.uid), shared.timeout, move || {
            cache.abort_all(Some(&reason))
        });
        shared.stop_monitor();

        match aborted {
            Some(()) => {
                tracing::info!("{}ProcessGroupNCCL aborts successfully.", shared.prefix);
                Ok(())
            }
            None => Err(ProcessGroupError::Timeout(format!(
                "{}Future for ProcessGroup abort timed out after {} ms",
                shared.prefix,
                shared.timeout.as_millis()
            ))),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let prefix = self.shared.prefix.clone();
        if !self.shared.is_terminating() {
            if self.shared.config.abort_in_destroy_pg {
                tracing::warn!(
                    "{prefix}WARNING: process group has NOT been destroyed before it is being \
                     destructed. Call shutdown() before dropping the group to release \
                     communicator resources deterministically."
                );
            }
            if let Err(e) = self.shutdown() {
                tracing::error!("{prefix}{e}");
            }
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("{prefix}process group background thread panicked");
            }
        }
        tracing::debug!("{prefix}process group destroyed");
    }
}
