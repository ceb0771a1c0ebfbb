// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide caching allocator for device memory segments.
//!
//! Every tensor storage owns one segment. Freeing a storage that was used on other streams is
//! deferred until the work those streams had outstanding at free time has finished, which is
//! the guarantee `record_stream` provides. Trace trackers observe segment allocation and
//! release; the communicator registry uses them to keep segment registration current.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::device::{Completion, Device, Stream};

const SEGMENT_ALIGNMENT: u64 = 512;
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;

static ALLOCATOR: Lazy<CachingAllocator> = Lazy::new(CachingAllocator::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAction {
    SegmentAlloc,
    SegmentFree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub action: TraceAction,
    pub device: i16,
    pub addr: u64,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub device: i16,
    pub address: u64,
    pub total_size: usize,
}

pub type TraceTracker = Arc<dyn Fn(&TraceEntry) + Send + Sync>;

struct DeferredFree {
    addr: u64,
    waits: Vec<Arc<Completion>>,
}

pub struct CachingAllocator {
    next_addr: AtomicU64,
    segments: Mutex<BTreeMap<u64, SegmentInfo>>,
    deferred: Mutex<Vec<DeferredFree>>,
    trackers: RwLock<Vec<TraceTracker>>,
    expandable_segments: AtomicBool,
}

impl CachingAllocator {
    fn new() -> Self {
        Self {
            next_addr: AtomicU64::new(BASE_ADDRESS),
            segments: Mutex::new(BTreeMap::new()),
            deferred: Mutex::new(Vec::new()),
            trackers: RwLock::new(Vec::new()),
            expandable_segments: AtomicBool::new(false),
        }
    }

    pub fn global() -> &'static CachingAllocator {
        &ALLOCATOR
    }

    /// Reserves a segment of `size` bytes on `device` and returns its address.
    pub fn allocate(&self, device: Device, size: usize) -> u64 {
        self.process_deferred_frees();

        let rounded = (size as u64).max(1).div_ceil(SEGMENT_ALIGNMENT) * SEGMENT_ALIGNMENT;
        let addr = self.next_addr.fetch_add(rounded, Ordering::Relaxed);
        let info = SegmentInfo {
            device: device.index(),
            address: addr,
            total_size: size,
        };
        self.segments.lock().insert(addr, info);
        self.notify(&TraceEntry {
            action: TraceAction::SegmentAlloc,
            device: device.index(),
            addr,
            size,
        });
        addr
    }

    /// Releases the segment at `addr` once the work outstanding on `used_on` has finished.
    pub fn free(&self, addr: u64, used_on: &[Stream]) {
        let waits: Vec<Arc<Completion>> = used_on.iter().flat_map(|s| s.frontier()).collect();
        if waits.is_empty() {
            self.release(addr);
        } else {
            tracing::trace!(addr, pending = waits.len(), "deferring segment free");
            self.deferred.lock().push(DeferredFree { addr, waits });
        }
        self.process_deferred_frees();
    }

    /// Releases deferred segments whose streams have caught up.
    pub fn process_deferred_frees(&self) {
        let ready: Vec<u64> = {
            let mut deferred = self.deferred.lock();
            let mut ready = Vec::new();
            deferred.retain(|d| {
                if d.waits.iter().all(|c| c.is_complete()) {
                    ready.push(d.addr);
                    false
                } else {
                    true
                }
            });
            ready
        };
        for addr in ready {
            self.release(addr);
        }
    }

    fn release(&self, addr: u64) {
        let removed = self.segments.lock().remove(&addr);
        if let Some(info) = removed {
            self.notify(&TraceEntry {
                action: TraceAction::SegmentFree,
                device: info.device,
                addr: info.address,
                size: info.total_size,
            });
        }
    }

    /// Number of frees waiting on stream work.
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn is_allocated(&self, addr: u64) -> bool {
        self.segments.lock().contains_key(&addr)
    }

    pub fn snapshot(&self) -> Vec<SegmentInfo> {
        self.segments.lock().values().cloned().collect()
    }

    pub fn attach_trace_tracker(&self, tracker: TraceTracker) {
        self.trackers.write().push(tracker);
    }

    pub fn expandable_segments(&self) -> bool {
        self.expandable_segments.load(Ordering::Relaxed)
    }

    pub fn set_expandable_segments(&self, enabled: bool) {
        self.expandable_segments.store(enabled, Ordering::Relaxed);
    }

    // Trackers run without any allocator lock held.
    fn notify(&self, entry: &TraceEntry) {
        let trackers: Vec<TraceTracker> = self.trackers.read().clone();
        for tracker in trackers {
            tracker(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stream_from_pool;

    #[test]
    fn test_free_waits_for_recorded_stream() {
        let allocator = CachingAllocator::new();
        let device = Device::cuda(0);
        let addr = allocator.allocate(device, 64);
        assert!(allocator.is_allocated(addr));

        let stream = stream_from_pool(device, false);
        let op = Completion::new();
        stream.enqueue(op.clone());

        allocator.free(addr, std::slice::from_ref(&stream));
        assert!(allocator.is_allocated(addr));
        assert_eq!(allocator.deferred_len(), 1);

        op.complete();
        allocator.process_deferred_frees();
        assert!(!allocator.is_allocated(addr));
        assert_eq!(allocator.deferred_len(), 0);
    }

    #[test]
    fn test_trackers_observe_segments() {
        let allocator = CachingAllocator::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        allocator.attach_trace_tracker(Arc::new(move |entry: &TraceEntry| {
            sink.lock().push(entry.action);
        }));

        let addr = allocator.allocate(Device::cuda(3), 10);
        allocator.free(addr, &[]);
        assert_eq!(
            *seen.lock(),
            vec![TraceAction::SegmentAlloc, TraceAction::SegmentFree]
        );
    }

    #[test]
    fn test_segments_are_aligned_and_disjoint() {
        let allocator = CachingAllocator::new();
        let a = allocator.allocate(Device::cuda(0), 1);
        let b = allocator.allocate(Device::cuda(0), 1000);
        let c = allocator.allocate(Device::cuda(1), 8);
        assert_eq!(a % SEGMENT_ALIGNMENT, 0);
        assert!(b >= a + SEGMENT_ALIGNMENT);
        assert!(c >= b + 1000);
        let snapshot = allocator.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[2].device, 1);
    }
}
