// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide index of live communicators by device.
//!
//! The caching allocator reports segment allocations and frees through a trace hook; the hook
//! looks up every communicator on the segment's device here and registers or deregisters the
//! segment with it. Entries are purged before a communicator is aborted.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::allocator::{CachingAllocator, TraceAction, TraceEntry};
use crate::device::Device;
use crate::transport::Communicator;

static INDEX: Lazy<Mutex<HashMap<u64, (Arc<dyn Communicator>, Device)>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static ALLOCATOR_HOOKS: Once = Once::new();

pub struct CommDeviceIndex;

impl CommDeviceIndex {
    pub fn insert(comm: &Arc<dyn Communicator>, device: Device) {
        INDEX.lock().insert(comm.handle_id(), (comm.clone(), device));
    }

    /// Returns true if the communicator was indexed.
    pub fn remove(comm: &dyn Communicator) -> bool {
        INDEX.lock().remove(&comm.handle_id()).is_some()
    }

    pub fn contains(comm: &dyn Communicator) -> bool {
        INDEX.lock().contains_key(&comm.handle_id())
    }

    pub fn for_device(device: Device) -> Vec<Arc<dyn Communicator>> {
        INDEX
            .lock()
            .values()
            .filter(|(_, d)| *d == device)
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn len() -> usize {
        INDEX.lock().len()
    }
}

/// Installs the allocator trace hook. Only the first call has an effect.
pub fn attach_allocator_hooks() {
    ALLOCATOR_HOOKS.call_once(|| {
        CachingAllocator::global().attach_trace_tracker(Arc::new(on_segment_event));
    });
}

fn on_segment_event(entry: &TraceEntry) {
    let device = Device::cuda(entry.device);
    // Communicators are collected first so no transport call runs under the index lock.
    let comms = CommDeviceIndex::for_device(device);
    match entry.action {
        TraceAction::SegmentAlloc => {
            for comm in comms {
                if let Err(e) = comm.register_segment(entry.addr, entry.size) {
                    tracing::warn!(
                        error = %e,
                        addr = entry.addr,
                        %device,
                        "failed to register allocator segment with communicator"
                    );
                }
            }
        }
        TraceAction::SegmentFree => {
            for comm in comms {
                if let Err(e) = comm.deregister_segment(entry.addr) {
                    tracing::warn!(
                        error = %e,
                        addr = entry.addr,
                        %device,
                        "failed to deregister allocator segment from communicator"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimComm, SimFabric};
    use crate::transport::{CommConfig, Transport, UniqueId};

    #[test]
    fn test_segments_follow_indexed_communicators() {
        attach_allocator_hooks();
        let transport = SimFabric::new().transport();
        let comm = transport
            .init_rank(1, 0, &UniqueId::random(), &CommConfig::default())
            .unwrap();
        let device = Device::cuda(6);
        CommDeviceIndex::insert(&comm, device);
        assert!(CommDeviceIndex::contains(comm.as_ref()));

        let sim: Vec<Arc<SimComm>> = transport.live_comms();
        let addr = CachingAllocator::global().allocate(device, 1024);
        assert_eq!(sim[0].registered_segments(), 1);

        CachingAllocator::global().free(addr, &[]);
        assert_eq!(sim[0].registered_segments(), 0);

        assert!(CommDeviceIndex::remove(comm.as_ref()));
        assert!(!CommDeviceIndex::remove(comm.as_ref()));
        let other = CachingAllocator::global().allocate(device, 1024);
        assert_eq!(sim[0].registered_segments(), 0);
        CachingAllocator::global().free(other, &[]);
    }
}
