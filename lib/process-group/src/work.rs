// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Work handles.
//!
//! A [`Work`] tracks one enqueued operation from submission to device completion. It is shared
//! between the caller and the watchdog; the first error either side observes is latched and
//! every later inspection sees that same error.
//!
//! Completion has two phases. The [`WorkFuture`] is marked ready as soon as the operation has
//! been submitted to the transport stream; [`Work::is_completed`] reports whether the device
//! has actually finished it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::comm_registry::CommDeviceIndex;
use crate::config::ErrorHandlingMode;
use crate::device::{self, Device, Event};
use crate::error::{ProcessGroupError, Result};
use crate::logging::LogPrefix;
use crate::tensor::Tensor;
use crate::transport::{Communicator, TransportStatus};
use crate::types::{OpType, WorkOutputs};

/// Poll interval of a blocking wait.
pub const SYNCHRONIZE_BUSY_WAIT: Duration = Duration::from_millis(10);

/// Information passed to completion hooks.
#[derive(Debug, Clone, Serialize)]
pub struct WorkInfo {
    pub op_type: OpType,
    pub seq: u64,
    pub time_started: DateTime<Utc>,
    pub time_finished: DateTime<Utc>,
    pub active_duration: Duration,
}

#[derive(Default)]
struct FutureState {
    value: Option<Result<WorkOutputs>>,
}

/// Submission result of a [`Work`].
#[derive(Clone, Default)]
pub struct WorkFuture {
    inner: Arc<(Mutex<FutureState>, Condvar)>,
}

impl WorkFuture {
    pub(crate) fn mark_completed(&self, outputs: WorkOutputs) {
        self.set(Ok(outputs));
    }

    /// Replaces a successful submission result with `err`. A stored error is kept.
    pub(crate) fn set_error(&self, err: ProcessGroupError) {
        let (state, cv) = &*self.inner;
        let mut state = state.lock();
        if !matches!(state.value, Some(Err(_))) {
            state.value = Some(Err(err));
            cv.notify_all();
        }
    }

    fn set(&self, value: Result<WorkOutputs>) {
        let (state, cv) = &*self.inner;
        let mut state = state.lock();
        if state.value.is_none() {
            state.value = Some(value);
            cv.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.0.lock().value.is_some()
    }

    /// Blocks until the future is ready.
    pub fn wait(&self) -> Result<WorkOutputs> {
        let (state, cv) = &*self.inner;
        let mut state = state.lock();
        loop {
            if let Some(value) = &state.value {
                return value.clone();
            }
            cv.wait(&mut state);
        }
    }

    pub fn value(&self) -> Option<Result<WorkOutputs>> {
        self.inner.0.lock().value.clone()
    }
}

/// Per-group settings every work inherits.
#[derive(Debug, Clone)]
pub(crate) struct WorkSettings {
    pub prefix: LogPrefix,
    pub enable_timing: bool,
    pub blocking_wait: bool,
    pub avoid_record_streams: bool,
    pub timeout: Duration,
}

pub struct Work {
    prefix: LogPrefix,
    device: Device,
    rank: usize,
    seq: u64,
    op_id: u64,
    op_type: OpType,
    profiling_name: String,
    comm: Arc<dyn Communicator>,
    start_event: Option<Event>,
    end_event: Event,
    blocking_wait: bool,
    avoid_record_streams: bool,
    timeout: Duration,
    created_at: Instant,
    created_at_wall: DateTime<Utc>,
    numel_in: usize,
    numel_out: usize,
    exception: Mutex<Option<ProcessGroupError>>,
    trace_id: Mutex<Option<u64>>,
    start_trace_updated: AtomicBool,
    stashed: Mutex<Vec<Tensor>>,
    barrier_tensor: Mutex<Option<Tensor>>,
    outputs: Mutex<Option<WorkOutputs>>,
    future: WorkFuture,
}

impl Work {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: &WorkSettings,
        device: Device,
        rank: usize,
        op_type: OpType,
        seq: u64,
        op_id: u64,
        comm: Arc<dyn Communicator>,
        numel_in: usize,
        numel_out: usize,
    ) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            device,
            rank,
            seq,
            op_id,
            op_type,
            profiling_name: op_type.profiling_name(),
            comm,
            start_event: settings.enable_timing.then(|| Event::new(true)),
            end_event: Event::new(settings.enable_timing),
            blocking_wait: settings.blocking_wait,
            avoid_record_streams: settings.avoid_record_streams,
            timeout: settings.timeout,
            created_at: Instant::now(),
            created_at_wall: Utc::now(),
            numel_in,
            numel_out,
            exception: Mutex::new(None),
            trace_id: Mutex::new(None),
            start_trace_updated: AtomicBool::new(false),
            stashed: Mutex::new(Vec::new()),
            barrier_tensor: Mutex::new(None),
            outputs: Mutex::new(None),
            future: WorkFuture::default(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn profiling_name(&self) -> &str {
        &self.profiling_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn start_event(&self) -> Option<&Event> {
        self.start_event.as_ref()
    }

    pub fn end_event(&self) -> &Event {
        &self.end_event
    }

    pub fn future(&self) -> WorkFuture {
        self.future.clone()
    }

    /// Output tensors of the operation.
    pub fn result(&self) -> WorkOutputs {
        self.outputs.lock().clone().unwrap_or_default()
    }

    pub(crate) fn set_outputs(&self, outputs: WorkOutputs) {
        *self.outputs.lock() = Some(outputs);
    }

    pub(crate) fn trace_id(&self) -> Option<u64> {
        *self.trace_id.lock()
    }

    pub(crate) fn set_trace_id(&self, id: Option<u64>) {
        *self.trace_id.lock() = id;
    }

    /// True the first time it is called.
    pub(crate) fn mark_start_trace_updated(&self) -> bool {
        !self.start_trace_updated.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn start_trace_updated(&self) -> bool {
        self.start_trace_updated.load(Ordering::Acquire)
    }

    /// Keeps `tensors` alive until the work is synchronized.
    pub(crate) fn stash(&self, tensors: &[Tensor]) {
        self.stashed.lock().extend(tensors.iter().cloned());
    }

    pub(crate) fn set_barrier_tensor(&self, tensor: Tensor) {
        *self.barrier_tensor.lock() = Some(tensor);
    }

    pub(crate) fn future_handle(&self) -> &WorkFuture {
        &self.future
    }

    pub fn is_completed(&self) -> bool {
        self.check_and_set_exception();
        self.exception().is_some() || self.end_event.query()
    }

    /// False when timing is disabled, since no start event exists.
    pub fn is_started(&self) -> bool {
        self.check_and_set_exception();
        self.exception().is_some()
            || self
                .start_event
                .as_ref()
                .is_some_and(|e| e.is_recorded() && e.query())
    }

    /// Device finished the work, ignoring any latched error.
    pub fn finished_gpu_execution(&self) -> bool {
        self.check_and_set_exception();
        self.end_event.query()
    }

    pub fn exception(&self) -> Option<ProcessGroupError> {
        self.exception.lock().clone()
    }

    /// Latches `err` unless an error is already latched, and fails the future with it.
    /// Returns whether it was stored.
    pub fn set_exception(&self, err: ProcessGroupError) -> bool {
        {
            let mut slot = self.exception.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(err.clone());
        }
        self.future.set_error(err);
        true
    }

    /// Latches the communicator's asynchronous error, if any.
    pub fn check_and_set_exception(&self) {
        if self.exception().is_some() {
            return;
        }
        let err = match self.comm.check_for_error() {
            TransportStatus::Error(e) => {
                ProcessGroupError::transport(&e, self.comm.failure_reason())
            }
            TransportStatus::Success | TransportStatus::InProgress if self.comm.is_aborted() => {
                ProcessGroupError::Aborted(format!(
                    "{}communicator was aborted before {self} finished",
                    self.prefix
                ))
            }
            TransportStatus::Success | TransportStatus::InProgress => return,
        };
        tracing::info!(
            "{}found async exception when checking for NCCL errors: {err}",
            self.prefix
        );
        self.set_exception(err);
    }

    /// Latches a timeout error once the work has run longer than `timeout` (or its own
    /// timeout). An existing error is never overwritten. Returns whether the deadline passed.
    pub fn check_timeout(&self, timeout: Option<Duration>) -> bool {
        let elapsed = self.created_at.elapsed();
        let limit = timeout.unwrap_or(self.timeout);
        if elapsed < limit {
            return false;
        }
        if self.exception().is_some() {
            return true;
        }
        let msg = format!(
            "{}Watchdog caught collective operation timeout: {self} ran for {} milliseconds before timing out.",
            self.prefix,
            elapsed.as_millis()
        );
        tracing::error!("{msg}");
        self.set_exception(ProcessGroupError::Timeout(msg));
        true
    }

    /// Surfaces the latched error when `mode` tears the process down.
    pub fn handle_exception(&self, mode: ErrorHandlingMode) -> Result<()> {
        let Some(err) = self.exception() else {
            return Ok(());
        };
        tracing::error!(
            "{}Some NCCL operations have failed or timed out. Due to the asynchronous nature of \
             CUDA kernels, subsequent GPU operations might run on corrupted/incomplete data.",
            self.prefix
        );
        if mode.should_tear_down() {
            tracing::error!(
                "{}To avoid data inconsistency, we are taking the entire process down.",
                self.prefix
            );
            return Err(err);
        }
        Ok(())
    }

    /// Makes the calling thread's current stream wait for this work.
    pub fn synchronize_stream(&self) {
        let current = device::current_stream(self.device);
        self.end_event.block(&current);
        if self.avoid_record_streams {
            self.stashed.lock().clear();
        }
    }

    /// Waits for the work.
    ///
    /// Non-blocking mode only orders the current stream after the work. Blocking mode polls
    /// until completion or timeout, aborting the communicator on failure.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.synchronize_stream();

        if self.blocking_wait {
            while !self.is_completed() {
                if self.check_timeout(timeout) {
                    tracing::error!(
                        "{}Work {self} timed out in blocking wait (blocking_wait=true).",
                        self.prefix
                    );
                    break;
                }
                std::thread::sleep(SYNCHRONIZE_BUSY_WAIT);
            }
            if self.exception().is_some() {
                self.abort();
                self.handle_exception(ErrorHandlingMode::TearDown)?;
            }
        }

        if self.barrier_tensor.lock().is_some() {
            device::current_stream(self.device).synchronize();
        }
        Ok(())
    }

    /// Aborts the work's communicator and drops it from the device index.
    pub fn abort(&self) {
        CommDeviceIndex::remove(self.comm.as_ref());
        self.comm.abort(None);
    }

    /// Device time between the start and end events.
    pub fn duration(&self) -> Result<Duration> {
        let start = self.start_event.as_ref().ok_or_else(|| {
            ProcessGroupError::invalid_argument("getDuration only works if timing was enabled")
        })?;
        start.elapsed_time(&self.end_event).ok_or_else(|| {
            ProcessGroupError::invalid_argument("getDuration requires the work to have completed")
        })
    }

    pub(crate) fn info(&self) -> WorkInfo {
        WorkInfo {
            op_type: self.op_type,
            seq: self.seq,
            time_started: self.created_at_wall,
            time_finished: Utc::now(),
            active_duration: self.duration().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkNCCL(SeqNum={}, OpType={}, NumelIn={}, NumelOut={}, Timeout(ms)={})",
            self.seq,
            self.op_type,
            self.numel_in,
            self.numel_out,
            self.timeout.as_millis()
        )
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("seq", &self.seq)
            .field("op_type", &self.op_type)
            .field("device", &self.device)
            .field("exception", &self.exception())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Completion, stream_from_pool};
    use crate::transport::sim::{SimFabric, SimTransport};
    use crate::transport::{CommConfig, Transport, UniqueId};

    fn settings(timeout: Duration, blocking_wait: bool, enable_timing: bool) -> WorkSettings {
        WorkSettings {
            prefix: LogPrefix::new(0, 0),
            enable_timing,
            blocking_wait,
            avoid_record_streams: false,
            timeout,
        }
    }

    fn comm() -> (SimTransport, Arc<dyn Communicator>) {
        let transport = SimFabric::new().transport();
        let comm = transport
            .init_rank(1, 0, &UniqueId::random(), &CommConfig::default())
            .unwrap();
        (transport, comm)
    }

    fn pending_work(settings: &WorkSettings) -> (SimTransport, Work, Arc<Completion>) {
        let (transport, comm) = comm();
        let work = Work::new(settings, Device::cuda(0), 0, OpType::Allreduce, 7, 7, comm, 4, 4);
        let stream = stream_from_pool(Device::cuda(0), false);
        if let Some(start) = work.start_event() {
            start.record(&stream);
        }
        let op = Completion::new();
        stream.enqueue(op.clone());
        work.end_event().record(&stream);
        (transport, work, op)
    }

    #[test]
    fn test_display() {
        let (_t, work, _op) = pending_work(&settings(Duration::from_millis(1500), false, false));
        assert_eq!(
            work.to_string(),
            "WorkNCCL(SeqNum=7, OpType=ALLREDUCE, NumelIn=4, NumelOut=4, Timeout(ms)=1500)"
        );
    }

    #[test]
    fn test_completion_follows_end_event() {
        let (_t, work, op) = pending_work(&settings(Duration::from_secs(60), false, false));
        assert!(!work.is_completed());
        assert!(!work.is_started(), "no start event without timing");
        op.complete();
        assert!(work.is_completed());
        assert!(work.exception().is_none());
    }

    #[test]
    fn test_async_error_is_latched_once() {
        let (transport, work, _op) = pending_work(&settings(Duration::from_secs(60), false, false));
        transport.inject_async_error("peer went away");
        assert!(work.is_completed());
        let err = work.exception().unwrap();
        assert!(err.to_string().contains("peer went away"));
        assert!(!work.set_exception(ProcessGroupError::internal("second")));
        assert_eq!(work.exception(), Some(err));
    }

    #[test]
    fn test_timeout_boundary() {
        let (_t, work, _op) = pending_work(&settings(Duration::from_millis(30), false, false));
        assert!(!work.check_timeout(None));
        std::thread::sleep(Duration::from_millis(40));
        assert!(work.check_timeout(None));
        let err = work.exception().unwrap();
        assert!(matches!(err, ProcessGroupError::Timeout(_)));
        assert!(err.to_string().contains("Watchdog caught collective operation timeout"));
        // an explicit longer override does not fire
        assert!(!work.check_timeout(Some(Duration::from_secs(60))));
    }

    #[test]
    fn test_timeout_never_overwrites_error() {
        let (_t, work, _op) = pending_work(&settings(Duration::ZERO, false, false));
        work.set_exception(ProcessGroupError::Transport("first".to_string()));
        assert!(work.check_timeout(None));
        assert_eq!(work.exception().unwrap().kind(), crate::ErrorKind::Transport);
    }

    #[test]
    fn test_handle_exception_by_mode() {
        let (_t, work, _op) = pending_work(&settings(Duration::ZERO, false, false));
        assert!(work.handle_exception(ErrorHandlingMode::TearDown).is_ok());
        work.check_timeout(None);
        assert!(work.handle_exception(ErrorHandlingMode::CleanUpOnly).is_ok());
        assert!(work.handle_exception(ErrorHandlingMode::NoHandling).is_ok());
        assert!(work.handle_exception(ErrorHandlingMode::SkipCleanUp).is_err());
        assert!(work.handle_exception(ErrorHandlingMode::TearDown).is_err());
    }

    #[test]
    fn test_blocking_wait_times_out_and_aborts() {
        let (_t, work, _op) = pending_work(&settings(Duration::from_millis(30), true, false));
        let err = work.wait(None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
        assert!(work.comm().is_aborted());
    }

    #[test]
    fn test_non_blocking_wait_orders_current_stream() {
        let (_t, work, op) = pending_work(&settings(Duration::from_secs(60), false, false));
        work.wait(None).unwrap();
        let current = device::current_stream(Device::cuda(0));
        assert!(!current.query());
        op.complete();
        assert!(current.query());
    }

    #[test]
    fn test_duration_requires_timing() {
        let (_t, work, op) = pending_work(&settings(Duration::from_secs(60), false, false));
        op.complete();
        assert!(work.duration().is_err());

        let (_t, timed, op) = pending_work(&settings(Duration::from_secs(60), false, true));
        assert!(timed.duration().is_err());
        op.complete();
        assert!(timed.duration().is_ok());
        assert!(timed.is_started());
    }

    #[test]
    fn test_future_keeps_first_error() {
        let future = WorkFuture::default();
        assert!(!future.is_ready());
        future.mark_completed(Vec::new());
        future.mark_completed(Vec::new());
        assert!(future.wait().unwrap().is_empty());

        future.set_error(ProcessGroupError::internal("first"));
        future.set_error(ProcessGroupError::internal("second"));
        assert!(future.wait().unwrap_err().to_string().contains("first"));
    }

    #[test]
    fn test_latched_error_fails_future() {
        let (transport, work, _op) = pending_work(&settings(Duration::from_secs(60), false, false));
        work.future_handle().mark_completed(Vec::new());
        transport.inject_async_error("peer went away");
        work.check_and_set_exception();
        let err = work.future().value().unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
    }

    #[test]
    fn test_aborted_comm_fails_pending_work() {
        let (_t, work, _op) = pending_work(&settings(Duration::from_secs(60), false, false));
        work.comm().abort(Some("group abort"));
        assert!(work.is_completed());
        let err = work.exception().unwrap();
        assert!(err.to_string().contains("group abort"));
    }
}
