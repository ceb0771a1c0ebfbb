// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accelerator runtime primitives: devices, streams, events and graph-capture status.
//!
//! Device-side work is modelled by [`Completion`] tokens. A transport enqueues a token on the
//! stream it was issued on and completes it once the operation has actually finished. A
//! [`Stream`] tracks the tokens it still has outstanding, and an [`Event`] recorded on a stream
//! captures that frontier so it can be queried or waited on later from any thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_COMPLETION_ID: AtomicU64 = AtomicU64::new(1);
static DEVICE_COUNT: AtomicUsize = AtomicUsize::new(8);

/// Number of visible accelerator devices.
pub fn device_count() -> usize {
    DEVICE_COUNT.load(Ordering::Relaxed)
}

/// Overrides the number of visible devices.
pub fn set_device_count(count: usize) {
    DEVICE_COUNT.store(count.max(1), Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    index: i16,
}

impl Device {
    pub const fn cuda(index: i16) -> Self {
        Self { index }
    }

    pub fn index(&self) -> i16 {
        self.index
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.index)
    }
}

/// Completion token for one unit of device-side work.
pub struct Completion {
    id: u64,
    done_at: Mutex<Option<Instant>>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_COMPLETION_ID.fetch_add(1, Ordering::Relaxed),
            done_at: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks the work finished. Completing twice keeps the first timestamp.
    pub fn complete(&self) {
        let mut done_at = self.done_at.lock();
        if done_at.is_none() {
            *done_at = Some(Instant::now());
            self.cv.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done_at.lock().is_some()
    }

    pub fn completed_at(&self) -> Option<Instant> {
        *self.done_at.lock()
    }

    pub fn wait(&self) {
        let mut done_at = self.done_at.lock();
        while done_at.is_none() {
            self.cv.wait(&mut done_at);
        }
    }

    /// Returns true if the work completed within `timeout`.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done_at = self.done_at.lock();
        while done_at.is_none() {
            if self.cv.wait_until(&mut done_at, deadline).timed_out() {
                return done_at.is_some();
            }
        }
        true
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("id", &self.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPriority {
    #[default]
    Normal,
    High,
}

struct StreamInner {
    id: u64,
    device: Device,
    priority: StreamPriority,
    pending: Mutex<Vec<Arc<Completion>>>,
}

/// An ordered queue of device work.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    fn new(device: Device, priority: StreamPriority) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                device,
                priority,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn priority(&self) -> StreamPriority {
        self.inner.priority
    }

    /// Appends device work to the stream.
    pub fn enqueue(&self, completion: Arc<Completion>) {
        let mut pending = self.inner.pending.lock();
        pending.retain(|c| !c.is_complete());
        pending.push(completion);
    }

    /// Outstanding work on this stream.
    pub fn frontier(&self) -> Vec<Arc<Completion>> {
        let mut pending = self.inner.pending.lock();
        pending.retain(|c| !c.is_complete());
        pending.clone()
    }

    /// Makes all future work on this stream wait for `event`.
    pub fn wait_event(&self, event: &Event) {
        let deps = event.dependencies();
        if deps.is_empty() {
            return;
        }
        let mut pending = self.inner.pending.lock();
        pending.retain(|c| !c.is_complete());
        for dep in deps {
            if !pending.iter().any(|c| c.id() == dep.id()) {
                pending.push(dep);
            }
        }
    }

    /// True when all work enqueued so far has finished.
    pub fn query(&self) -> bool {
        self.frontier().is_empty()
    }

    /// Blocks the calling thread until all work enqueued so far has finished.
    pub fn synchronize(&self) {
        for completion in self.frontier() {
            completion.wait();
        }
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("device", &self.device())
            .field("priority", &self.priority())
            .finish()
    }
}

struct Recorded {
    deps: Vec<Arc<Completion>>,
    recorded_at: Instant,
}

struct EventInner {
    timing: bool,
    state: Mutex<Option<Recorded>>,
}

/// Marker in a stream. Querying it reports whether all work before the marker has finished.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new(enable_timing: bool) -> Self {
        Self {
            inner: Arc::new(EventInner {
                timing: enable_timing,
                state: Mutex::new(None),
            }),
        }
    }

    pub fn timing_enabled(&self) -> bool {
        self.inner.timing
    }

    /// Captures the current frontier of `stream`. Re-recording replaces the marker.
    pub fn record(&self, stream: &Stream) {
        *self.inner.state.lock() = Some(Recorded {
            deps: stream.frontier(),
            recorded_at: Instant::now(),
        });
    }

    pub fn is_recorded(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// An event that was never recorded reports complete.
    pub fn query(&self) -> bool {
        match &*self.inner.state.lock() {
            Some(recorded) => recorded.deps.iter().all(|c| c.is_complete()),
            None => true,
        }
    }

    /// Makes future work on `stream` wait for this event.
    pub fn block(&self, stream: &Stream) {
        stream.wait_event(self);
    }

    pub fn synchronize(&self) {
        for dep in self.dependencies() {
            dep.wait();
        }
    }

    fn dependencies(&self) -> Vec<Arc<Completion>> {
        match &*self.inner.state.lock() {
            Some(recorded) => recorded
                .deps
                .iter()
                .filter(|c| !c.is_complete())
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Point in time at which the marker was passed, once it has been.
    fn completed_at(&self) -> Option<Instant> {
        let state = self.inner.state.lock();
        let recorded = state.as_ref()?;
        let mut at = recorded.recorded_at;
        for dep in &recorded.deps {
            at = at.max(dep.completed_at()?);
        }
        Some(at)
    }

    /// Device time between this event and `end`. Both events must have timing enabled and
    /// must have completed.
    pub fn elapsed_time(&self, end: &Event) -> Option<Duration> {
        if !self.inner.timing || !end.inner.timing {
            return None;
        }
        let start = self.completed_at()?;
        let end = end.completed_at()?;
        Some(end.saturating_duration_since(start))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("timing", &self.inner.timing)
            .field("recorded", &self.is_recorded())
            .finish()
    }
}

/// Runs `f` once the work currently outstanding on `stream` has finished, as one more unit of
/// work on that stream. Runs inline when the stream is idle.
pub fn launch<F>(stream: &Stream, f: F) -> Arc<Completion>
where
    F: FnOnce() + Send + 'static,
{
    let deps = stream.frontier();
    let done = Completion::new();
    stream.enqueue(done.clone());
    run_after(deps, done.clone(), f);
    done
}

/// Runs `f` after every completion in `deps`, then completes `done`.
pub(crate) fn run_after<F>(deps: Vec<Arc<Completion>>, done: Arc<Completion>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    if deps.iter().all(|c| c.is_complete()) {
        f();
        done.complete();
        return;
    }
    let spawned = std::thread::Builder::new()
        .name("device-launch".to_string())
        .spawn({
            let done = done.clone();
            move || {
                for dep in deps {
                    dep.wait();
                }
                f();
                done.complete();
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn device launch thread");
        done.complete();
    }
}

/// Graph-capture status of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureStatus {
    #[default]
    None,
    Active,
}

thread_local! {
    static CURRENT_STREAMS: RefCell<HashMap<Device, Stream>> = RefCell::new(HashMap::new());
    static CAPTURE_STATUS: Cell<CaptureStatus> = const { Cell::new(CaptureStatus::None) };
}

/// The stream that work issued by the calling thread on `device` lands on.
pub fn current_stream(device: Device) -> Stream {
    CURRENT_STREAMS.with(|streams| {
        streams
            .borrow_mut()
            .entry(device)
            .or_insert_with(|| Stream::new(device, StreamPriority::Normal))
            .clone()
    })
}

/// Replaces the calling thread's current stream for the stream's device.
pub fn set_current_stream(stream: &Stream) -> Option<Stream> {
    CURRENT_STREAMS.with(|streams| streams.borrow_mut().insert(stream.device(), stream.clone()))
}

/// Fresh stream from the pool.
pub fn stream_from_pool(device: Device, high_priority: bool) -> Stream {
    let priority = if high_priority {
        StreamPriority::High
    } else {
        StreamPriority::Normal
    };
    Stream::new(device, priority)
}

pub fn capture_status() -> CaptureStatus {
    CAPTURE_STATUS.with(|s| s.get())
}

/// Marks the calling thread as recording a device graph until dropped.
pub struct CaptureGuard {
    previous: CaptureStatus,
}

impl CaptureGuard {
    pub fn begin() -> Self {
        let previous = CAPTURE_STATUS.with(|s| s.replace(CaptureStatus::Active));
        Self { previous }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURE_STATUS.with(|s| s.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tracks_stream_frontier() {
        let device = Device::cuda(0);
        let stream = stream_from_pool(device, false);
        let op = Completion::new();
        stream.enqueue(op.clone());

        let event = Event::new(false);
        assert!(event.query(), "unrecorded events report complete");
        event.record(&stream);
        assert!(!event.query());

        // work enqueued after the record is not part of the marker
        let later = Completion::new();
        stream.enqueue(later.clone());

        op.complete();
        assert!(event.query());
        assert!(!stream.query());
        later.complete();
        assert!(stream.query());
    }

    #[test]
    fn test_cross_stream_wait() {
        let device = Device::cuda(1);
        let producer = stream_from_pool(device, false);
        let consumer = stream_from_pool(device, true);
        assert_eq!(consumer.priority(), StreamPriority::High);

        let op = Completion::new();
        producer.enqueue(op.clone());
        let event = Event::new(false);
        event.record(&producer);
        event.block(&consumer);
        assert!(!consumer.query());

        op.complete();
        consumer.synchronize();
        assert!(consumer.query());
    }

    #[test]
    fn test_elapsed_time_requires_timing() {
        let device = Device::cuda(0);
        let stream = stream_from_pool(device, false);
        let start = Event::new(true);
        let end = Event::new(true);
        start.record(&stream);
        let op = Completion::new();
        stream.enqueue(op.clone());
        end.record(&stream);
        assert!(start.elapsed_time(&end).is_none(), "end not reached yet");
        std::thread::sleep(Duration::from_millis(5));
        op.complete();
        let elapsed = start.elapsed_time(&end).unwrap();
        assert!(elapsed >= Duration::from_millis(5));

        let untimed = Event::new(false);
        untimed.record(&stream);
        assert!(untimed.elapsed_time(&end).is_none());
    }

    #[test]
    fn test_completion_wait_for() {
        let op = Completion::new();
        assert!(!op.wait_for(Duration::from_millis(10)));
        let waiter = {
            let op = op.clone();
            std::thread::spawn(move || op.wait_for(Duration::from_secs(5)))
        };
        op.complete();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_current_stream_is_per_thread() {
        let device = Device::cuda(2);
        let main = current_stream(device);
        assert_eq!(main, current_stream(device));
        let other = std::thread::spawn(move || current_stream(device).id())
            .join()
            .unwrap();
        assert_ne!(main.id(), other);

        let pooled = stream_from_pool(device, false);
        let previous = set_current_stream(&pooled);
        assert_eq!(previous, Some(main));
        assert_eq!(current_stream(device), pooled);
    }

    #[test]
    fn test_launch_runs_in_stream_order() {
        let device = Device::cuda(0);
        let stream = stream_from_pool(device, false);
        let log = Arc::new(Mutex::new(Vec::new()));

        let idle = launch(&stream, {
            let log = log.clone();
            move || log.lock().push("inline")
        });
        assert!(idle.is_complete());

        let gate = Completion::new();
        stream.enqueue(gate.clone());
        let deferred = launch(&stream, {
            let log = log.clone();
            move || log.lock().push("after-gate")
        });
        assert!(!deferred.is_complete());
        log.lock().push("gate");
        gate.complete();
        assert!(deferred.wait_for(Duration::from_secs(5)));
        assert_eq!(*log.lock(), vec!["inline", "gate", "after-gate"]);
    }

    #[test]
    fn test_capture_guard_restores_status() {
        assert_eq!(capture_status(), CaptureStatus::None);
        {
            let _guard = CaptureGuard::begin();
            assert_eq!(capture_status(), CaptureStatus::Active);
        }
        assert_eq!(capture_status(), CaptureStatus::None);
    }
}
