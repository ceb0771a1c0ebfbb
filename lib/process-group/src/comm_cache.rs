// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Communicator cache.
//!
//! One communicator per key, created lazily on first use:
//!
//! - collectives and batched point-to-point use the device index (`"0"`) and span the whole
//!   group;
//! - a single point-to-point op uses the ordered pair `"low:high"` and a 2-rank communicator
//!   (1-rank when a process sends to itself).
//!
//! Creation is itself a collective: the lowest participant generates the bootstrap id and
//! publishes it through the store; the others read it back. Aborted communicators stay cached
//! so later lookups fail fast instead of creating a replacement that would hang.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::allocator::CachingAllocator;
use crate::comm_registry::{self, CommDeviceIndex};
use crate::device::{self, Device, Stream};
use crate::error::{ProcessGroupError, Result};
use crate::logging::LogPrefix;
use crate::store::Store;
use crate::transport::group::with_groups_drained;
use crate::transport::{
    CommConfig, Communicator, GroupTicket, Transport, TransportStatus, UniqueId,
    active_group_depth,
};
use crate::types::OpType;

/// Cache key for collectives and batched point-to-point on `device`.
pub fn device_key(device: Device) -> String {
    device.index().to_string()
}

/// Cache key for a single point-to-point op. Order-independent.
pub fn send_recv_key(rank: usize, peer: usize) -> String {
    let (low, high) = if rank < peer { (rank, peer) } else { (peer, rank) };
    format!("{low}:{high}")
}

/// Rank inside a 2-rank point-to-point communicator.
pub fn p2p_rank(rank: usize, peer: usize) -> usize {
    if rank <= peer { 0 } else { 1 }
}

/// A cached communicator with its dedicated stream.
#[derive(Debug, Clone)]
pub struct CommEntry {
    pub key: String,
    pub device: Device,
    pub comm: Arc<dyn Communicator>,
    pub stream: Stream,
}

#[derive(Clone)]
pub struct CommCacheOptions {
    pub rank: usize,
    pub size: usize,
    pub nonblocking: bool,
    pub high_priority_stream: bool,
    pub register_segments: bool,
    pub split_from: Option<Arc<CommCache>>,
    pub split_color: i32,
    pub bound_device: Option<Device>,
    /// Bounds non-blocking initialization.
    pub timeout: Duration,
}

#[derive(Default)]
struct CacheState {
    comms: HashMap<String, CommEntry>,
    initializing: HashMap<String, Arc<dyn Communicator>>,
    by_unique_id: HashMap<String, Arc<dyn Communicator>>,
    used_devices: BTreeSet<i16>,
    aborted: bool,
}

pub struct CommCache {
    prefix: LogPrefix,
    options: CommCacheOptions,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    comm_counter: AtomicU64,
    state: Mutex<CacheState>,
}

impl CommCache {
    pub fn new(
        prefix: LogPrefix,
        mut options: CommCacheOptions,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
    ) -> Self {
        if options.register_segments {
            if CachingAllocator::global().expandable_segments() {
                tracing::info!(
                    "{prefix}disabling tensor registration: not supported with expandable segments"
                );
                options.register_segments = false;
            } else {
                comm_registry::attach_allocator_hooks();
            }
        }
        Self {
            prefix,
            options,
            transport,
            store,
            comm_counter: AtomicU64::new(0),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn rank(&self) -> usize {
        self.options.rank
    }

    pub fn size(&self) -> usize {
        self.options.size
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registers_segments(&self) -> bool {
        self.options.register_segments
    }

    /// Returns the cached communicator for `key`, creating it on first use.
    ///
    /// `p2p_rank` is this process's rank inside a 2-rank point-to-point communicator and is
    /// ignored for collectives.
    pub fn get_or_create(
        &self,
        key: &str,
        device: Device,
        op_type: OpType,
        p2p_rank: usize,
        is_send_recv_self: bool,
    ) -> Result<CommEntry> {
        if key.is_empty() {
            return Err(ProcessGroupError::Transport(
                "Not able to create/get the NCCL Communicator since the GPU devices are not known"
                    .to_string(),
            ));
        }
        if let Some(bound) = self.options.bound_device {
            if bound != device {
                tracing::error!(
                    "{}Tensor found on device {device} but backend constrained to {bound}",
                    self.prefix
                );
                return Err(ProcessGroupError::Transport(
                    "Attempt to perform collective on tensor not on device passed to init_process_group"
                        .to_string(),
                ));
            }
        }

        {
            let mut state = self.state.lock();
            state.used_devices.insert(device.index());
            if let Some(entry) = state.comms.get(key) {
                if entry.comm.is_aborted() {
                    return Err(ProcessGroupError::Aborted(format!(
                        "{}communicator for key '{key}' has been aborted",
                        self.prefix
                    )));
                }
                return Ok(entry.clone());
            }
            if state.aborted {
                return Err(ProcessGroupError::Aborted(format!(
                    "{}process group has been aborted; cannot create a communicator for key '{key}'",
                    self.prefix
                )));
            }
        }

        let rank = self.options.rank;
        let batch_p2p = active_group_depth() > 0;
        let single_p2p = op_type.is_p2p() && !batch_p2p;

        let generated = if rank == 0 || (single_p2p && p2p_rank == 0) {
            Some(self.transport.unique_id()?)
        } else {
            None
        };
        let id = match (is_send_recv_self, generated) {
            (true, Some(id)) => id,
            _ => self.broadcast_unique_id(generated, single_p2p, key)?,
        };

        let (num_ranks, comm_rank) = if !single_p2p {
            (self.options.size, rank)
        } else if is_send_recv_self {
            (1, 0)
        } else {
            (2, p2p_rank)
        };

        let config = CommConfig {
            blocking: !self.options.nonblocking,
        };
        let comm = with_groups_drained(self.transport.as_ref(), || -> Result<_> {
            let ticket = GroupTicket::start(self.transport.as_ref())?;
            let comm = match self.split_from_parent(key, comm_rank, &config)? {
                Some(comm) => comm,
                None => self.transport.init_rank(num_ranks, comm_rank, &id, &config)?,
            };
            self.state
                .lock()
                .initializing
                .insert(key.to_string(), comm.clone());

            if self.options.nonblocking {
                ticket.end_nonblocking(comm.as_ref(), self.options.timeout)?;
            } else if let TransportStatus::Error(e) = ticket.end()? {
                return Err(ProcessGroupError::transport(&e, comm.failure_reason()));
            }
            Ok(comm)
        })?;

        let stream = device::stream_from_pool(device, self.options.high_priority_stream);
        tracing::info!(
            "{}created communicator {} on device {device} for key '{key}' ({} ranks)",
            self.prefix,
            comm.handle_id(),
            comm.size()
        );

        let entry = CommEntry {
            key: key.to_string(),
            device,
            comm: comm.clone(),
            stream,
        };
        {
            let mut state = self.state.lock();
            state.initializing.remove(key);
            state
                .by_unique_id
                .insert(comm.unique_id().to_hex(), comm.clone());
            state.comms.insert(key.to_string(), entry.clone());
        }

        if self.options.register_segments {
            for segment in CachingAllocator::global().snapshot() {
                if segment.device != device.index() {
                    continue;
                }
                comm.register_segment(segment.address, segment.total_size)?;
            }
            CommDeviceIndex::insert(&comm, device);
        }
        Ok(entry)
    }

    /// Rank 0 (or p2p rank 0 for single point-to-point) publishes `id`, the others fetch it.
    fn broadcast_unique_id(
        &self,
        id: Option<UniqueId>,
        single_p2p: bool,
        p2p_key: &str,
    ) -> Result<UniqueId> {
        let rank = self.options.rank;
        let store_key = if single_p2p {
            p2p_key.to_string()
        } else {
            self.comm_counter.fetch_add(1, Ordering::AcqRel).to_string()
        };

        if let Some(id) = id {
            self.store
                .set(&store_key, id.as_bytes())
                .map_err(|e| ProcessGroupError::RendezvousFailure {
                    key: store_key.clone(),
                    rank,
                    message: format!("publishing the unique id failed: {e}"),
                })?;
            return Ok(id);
        }

        let fetched = self.store.get(&store_key).map_err(|e| {
            ProcessGroupError::RendezvousFailure {
                key: store_key.clone(),
                rank,
                message: format!(
                    "retrieving the unique id from rank 0 got error: {e}. This may indicate a \
                     possible application crash on rank 0 or a network set up issue."
                ),
            }
        })?;
        UniqueId::from_bytes(&fetched).ok_or_else(|| ProcessGroupError::RendezvousFailure {
            key: store_key,
            rank,
            message: format!("invalid size for the unique id: got {} bytes", fetched.len()),
        })
    }

    fn split_from_parent(
        &self,
        key: &str,
        comm_rank: usize,
        config: &CommConfig,
    ) -> Result<Option<Arc<dyn Communicator>>> {
        let Some(parent) = &self.options.split_from else {
            return Ok(None);
        };
        if self.options.split_color == 0 {
            return Err(ProcessGroupError::invalid_argument(
                "Must specify a non-zero color when splitting",
            ));
        }
        if !self.transport.supports_split() {
            return Ok(None);
        }
        let parent_state = parent.state.lock();
        let Some(parent_entry) = parent_state.comms.get(key) else {
            return Ok(None);
        };
        if parent_entry.comm.is_aborted() {
            return Ok(None);
        }
        let child = self.transport.split(
            &parent_entry.comm,
            self.options.split_color,
            comm_rank,
            config,
        )?;
        if child.is_some() {
            tracing::debug!("{}split communicator for key '{key}' from parent", self.prefix);
        }
        Ok(child)
    }

    pub fn get(&self, key: &str) -> Option<CommEntry> {
        self.state.lock().comms.get(key).cloned()
    }

    pub fn entries(&self) -> Vec<CommEntry> {
        self.state.lock().comms.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().comms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_devices(&self) -> Vec<i16> {
        self.state.lock().used_devices.iter().copied().collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn comm_counter(&self) -> u64 {
        self.comm_counter.load(Ordering::Acquire)
    }

    pub fn comm_split_counter(&self) -> u64 {
        self.state
            .lock()
            .by_unique_id
            .values()
            .map(|c| c.split_count())
            .sum()
    }

    /// Aborts every live and in-initialization communicator. Entries stay cached. Idempotent.
    pub fn abort_all(&self, reason: Option<&str>) {
        let comms: Vec<Arc<dyn Communicator>> = {
            let mut state = self.state.lock();
            state.aborted = true;
            state
                .comms
                .values()
                .map(|e| e.comm.clone())
                .chain(state.initializing.values().cloned())
                .collect()
        };
        for comm in &comms {
            CommDeviceIndex::remove(comm.as_ref());
        }
        for comm in &comms {
            comm.abort(reason);
        }
        if !comms.is_empty() {
            tracing::info!("{}aborted {} communicator(s)", self.prefix, comms.len());
        }
    }

    /// Aborts the communicator for `key` and drops it from the cache.
    pub fn destroy(&self, key: &str) -> Result<()> {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.comms.remove(key).ok_or_else(|| {
                ProcessGroupError::internal(format!(
                    "Expected to find key {key} in NCCL communicator map."
                ))
            })?;
            state.used_devices.clear();
            entry
        };
        CommDeviceIndex::remove(entry.comm.as_ref());
        entry.comm.abort(None);
        Ok(())
    }

    /// Per-communicator state keyed by unique id, for debug dumps.
    pub fn dump_comm_state(&self) -> BTreeMap<String, HashMap<String, String>> {
        self.state
            .lock()
            .by_unique_id
            .iter()
            .map(|(id, comm)| (id.clone(), comm.dump()))
            .collect()
    }
}
