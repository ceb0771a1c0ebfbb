// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collective dispatcher.
//!
//! Every public operation funnels into [`Shared::collective`], [`Shared::collective_coalesced`]
//! or [`Shared::point_to_point`]. The dispatch lock is held for the whole call so sequence
//! numbers, op ids and coalescing membership follow program order.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::comm_cache::{self, CommEntry};
use crate::device::{self, CaptureStatus, Device, Event, Stream};
use crate::error::{ProcessGroupError, Result};
use crate::tensor::Tensor;
use crate::trace::{FlightRecorder, RecordSpec};
use crate::transport::group::wait_until_ready;
use crate::transport::{
    Communicator, GroupTicket, MIN_CAPTURE_VERSION, TransportError, TransportStatus,
    active_group_depth, close_group, open_group,
};
use crate::types::OpType;
use crate::work::{Work, WorkSettings};

use super::Shared;

/// Accumulators of an open coalescing region.
#[derive(Default)]
pub(crate) struct CoalescingState {
    pub active: bool,
    pub has_collective: bool,
    pub has_p2p: bool,
    pub devices: Vec<Device>,
    pub comms: Vec<CommEntry>,
}

#[derive(Default)]
pub(crate) struct DispatchState {
    /// Incremented once per collective, per coalescing region and per single p2p op.
    pub seq: u64,
    /// Incremented once per operation, including the members of a coalescing region.
    pub op_id: u64,
    pub coalescing: CoalescingState,
}

/// Per-call metadata.
pub(crate) struct OpMeta {
    pub op_type: OpType,
    pub profiling_name: String,
    /// Overrides the group timeout.
    pub timeout: Option<Duration>,
    pub avoid_record_streams: bool,
}

impl OpMeta {
    pub(crate) fn new(op_type: OpType, profiling_name: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            op_type,
            profiling_name: profiling_name.into(),
            timeout,
            avoid_record_streams: false,
        }
    }
}

/// Orders the transport stream after everything already issued on the current stream.
fn sync_stream(device: Device, comm_stream: &Stream) {
    let event = Event::new(false);
    event.record(&device::current_stream(device));
    event.block(comm_stream);
}

fn is_capturing() -> bool {
    device::capture_status() != CaptureStatus::None
}

pub(crate) fn no_hook(_: &Stream, _: &Work) {}

impl Shared {
    /// Fails when graph capture is active and the transport cannot be captured.
    fn check_capture(&self) -> Result<bool> {
        if !is_capturing() {
            return Ok(false);
        }
        if self.transport.version() < MIN_CAPTURE_VERSION {
            return Err(ProcessGroupError::not_implemented(
                "Capturing NCCL collectives is only allowed with NCCL >= 2.9.6",
            ));
        }
        Ok(true)
    }

    fn work_settings(&self, timeout: Option<Duration>, avoid_record_streams: bool) -> WorkSettings {
        WorkSettings {
            prefix: self.prefix.clone(),
            enable_timing: self.enable_timing.load(Ordering::Acquire),
            blocking_wait: self.config.blocking_wait,
            avoid_record_streams,
            timeout: timeout.unwrap_or(self.timeout),
        }
    }

    fn record_trace(
        &self,
        (seq, op_id): (u64, u64),
        meta: &OpMeta,
        inputs: &[Tensor],
        outputs: &[Tensor],
        work: Option<&Work>,
    ) -> Option<u64> {
        let is_p2p = meta.op_type.is_p2p();
        FlightRecorder::global().record(RecordSpec {
            pg_id: self.uid,
            pg_name: &self.name,
            collective_seq_id: if is_p2p { 0 } else { seq },
            p2p_seq_id: if is_p2p { seq } else { 0 },
            op_id,
            profiling_name: meta.profiling_name.clone(),
            inputs,
            outputs,
            start: work.and_then(|w| w.start_event()),
            end: work.map(|w| w.end_event()),
            timeout: meta.timeout.unwrap_or(self.timeout),
            is_p2p,
        })
    }

    /// Interprets a group end. Non-blocking communicators may report `InProgress`, in which
    /// case we wait for `comm` to settle.
    fn settle_group(&self, status: TransportStatus, comm: Option<&dyn Communicator>) -> Result<()> {
        match status {
            TransportStatus::Success => Ok(()),
            TransportStatus::InProgress => match comm {
                Some(comm) => wait_until_ready(comm, self.timeout)
                    .map_err(|e| ProcessGroupError::transport(&e, comm.failure_reason())),
                None => Ok(()),
            },
            TransportStatus::Error(e) => Err(ProcessGroupError::transport(
                &e,
                comm.and_then(|c| c.failure_reason()),
            )),
        }
    }

    /// Adds `work` to the tracking list. Dropped silently once the group is terminating.
    pub(crate) fn work_enqueue(&self, work: &Arc<Work>) {
        if self.is_terminating() {
            return;
        }
        let mut works = self.work_list.lock();
        works.push_back(work.clone());
        self.last_enqueued_seq.store(work.seq(), Ordering::Release);
        *self.last_work_list_update.lock() = Instant::now();
    }

    /// Issues a single-tensor collective.
    pub(crate) fn collective<F, Pre, Post>(
        &self,
        input: &Tensor,
        output: &Tensor,
        meta: OpMeta,
        f: F,
        pre: Pre,
        post: Post,
    ) -> Result<Arc<Work>>
    where
        F: FnOnce(&Tensor, &Tensor, &dyn Communicator, &Stream) -> Result<(), TransportError>,
        Pre: FnOnce(&Stream, &Work),
        Post: FnOnce(&Stream, &Work),
    {
        let avoid_record_streams = meta.avoid_record_streams || self.config.avoid_record_streams;
        let capturing = self.check_capture()?;
        let device = input
            .device()
            .ok_or_else(|| ProcessGroupError::invalid_argument("Tensors must be CUDA and dense"))?;

        let mut dispatch = self.dispatch.lock();
        dispatch.seq += 1;
        dispatch.op_id += 1;
        let ids = (dispatch.seq, dispatch.op_id);

        let entry = self.cache.get_or_create(
            &comm_cache::device_key(device),
            device,
            meta.op_type,
            0,
            false,
        )?;
        let coalescing = dispatch.coalescing.active;
        if coalescing {
            let region = &mut dispatch.coalescing;
            region.has_collective = true;
            region.devices.push(device);
            region.comms.push(entry.clone());
        }
        sync_stream(device, &entry.stream);

        let enqueue = !coalescing && !capturing;
        let work = Arc::new(Work::new(
            &self.work_settings(meta.timeout, avoid_record_streams),
            device,
            self.rank,
            meta.op_type,
            ids.0,
            ids.1,
            entry.comm.clone(),
            input.numel(),
            output.numel(),
        ));
        let outputs = vec![output.clone()];
        work.set_outputs(outputs.clone());
        if enqueue {
            work.set_trace_id(self.record_trace(
                ids,
                &meta,
                std::slice::from_ref(input),
                &outputs,
                Some(&work),
            ));
        }
        if avoid_record_streams {
            work.stash(std::slice::from_ref(input));
        }

        if let Some(start) = work.start_event() {
            start.record(&entry.stream);
        }
        pre(&entry.stream, &work);

        if !avoid_record_streams {
            input.record_stream(&entry.stream);
        }
        f(input, output, entry.comm.as_ref(), &entry.stream)
            .map_err(|e| ProcessGroupError::transport(&e, entry.comm.failure_reason()))?;

        post(&entry.stream, &work);

        if !coalescing {
            work.end_event().record(&entry.stream);
        }
        work.future_handle().mark_completed(outputs);
        if enqueue {
            self.work_enqueue(&work);
        }
        Ok(work)
    }

    /// Issues one primitive per input/output pair inside a single transport group.
    pub(crate) fn collective_coalesced<F>(
        &self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        meta: OpMeta,
        mut f: F,
    ) -> Result<Arc<Work>>
    where
        F: FnMut(&Tensor, &Tensor, &dyn Communicator, &Stream) -> Result<(), TransportError>,
    {
        let avoid_record_streams = meta.avoid_record_streams || self.config.avoid_record_streams;
        let capturing = self.check_capture()?;
        let (Some(first_in), Some(first_out)) = (inputs.first(), outputs.first()) else {
            return Err(ProcessGroupError::invalid_argument("Tensor list must be nonempty"));
        };
        let device = first_in
            .device()
            .ok_or_else(|| ProcessGroupError::invalid_argument("Tensors must be CUDA and dense"))?;

        let mut dispatch = self.dispatch.lock();
        dispatch.seq += 1;
        dispatch.op_id += 1;
        let ids = (dispatch.seq, dispatch.op_id);

        let entry = self.cache.get_or_create(
            &comm_cache::device_key(device),
            device,
            meta.op_type,
            0,
            false,
        )?;
        let coalescing = dispatch.coalescing.active;
        if coalescing {
            let region = &mut dispatch.coalescing;
            region.has_collective = true;
            region.devices.push(device);
            region.comms.push(entry.clone());
        }
        sync_stream(device, &entry.stream);

        let work = Arc::new(Work::new(
            &self.work_settings(meta.timeout, avoid_record_streams),
            device,
            self.rank,
            meta.op_type,
            ids.0,
            ids.1,
            entry.comm.clone(),
            first_in.numel(),
            first_out.numel(),
        ));
        work.set_outputs(outputs.to_vec());
        work.set_trace_id(self.record_trace(ids, &meta, inputs, outputs, Some(&work)));
        if avoid_record_streams {
            work.stash(inputs);
        }
        if let Some(start) = work.start_event() {
            start.record(&entry.stream);
        }

        {
            let ticket = GroupTicket::start(self.transport.as_ref())?;
            for (input, output) in inputs.iter().zip(outputs) {
                if !avoid_record_streams {
                    input.record_stream(&entry.stream);
                }
                f(input, output, entry.comm.as_ref(), &entry.stream)
                    .map_err(|e| ProcessGroupError::transport(&e, entry.comm.failure_reason()))?;
            }
            let status = if self.config.use_comm_nonblocking {
                ticket.end_nonblocking(entry.comm.as_ref(), self.timeout)?;
                TransportStatus::Success
            } else {
                ticket.end()?
            };
            self.settle_group(status, Some(entry.comm.as_ref()))?;
        }

        if !coalescing {
            work.end_event().record(&entry.stream);
        }
        work.future_handle().mark_completed(outputs.to_vec());
        if !coalescing && !capturing {
            self.work_enqueue(&work);
        }
        Ok(work)
    }

    /// Issues a send or receive with `peer`.
    ///
    /// Returns `None` inside a coalescing region; the region's aggregate work covers the op.
    pub(crate) fn point_to_point<F>(
        &self,
        tensor: &Tensor,
        peer: usize,
        meta: OpMeta,
        f: F,
    ) -> Result<Option<Arc<Work>>>
    where
        F: FnOnce(&Tensor, &dyn Communicator, &Stream, usize) -> Result<(), TransportError>,
    {
        if self.config.avoid_record_streams {
            static WARNED: std::sync::Once = std::sync::Once::new();
            WARNED.call_once(|| {
                tracing::warn!("avoid_record_streams has no effect for point-to-point collectives.");
            });
        }
        let device = tensor
            .device()
            .ok_or_else(|| ProcessGroupError::invalid_argument("Tensors must be CUDA and dense"))?;

        let mut dispatch = self.dispatch.lock();
        let batch_p2p = active_group_depth() > 0;
        let (key, p2p_rank, target, is_self) = if batch_p2p {
            (comm_cache::device_key(device), self.rank, peer, false)
        } else {
            let p2p_rank = comm_cache::p2p_rank(self.rank, peer);
            let is_self = self.rank == peer;
            let target = if is_self { 0 } else { 1 - p2p_rank };
            if !dispatch.coalescing.active {
                dispatch.seq += 1;
            }
            (comm_cache::send_recv_key(self.rank, peer), p2p_rank, target, is_self)
        };
        dispatch.op_id += 1;
        let ids = (dispatch.seq, dispatch.op_id);

        let entry = self
            .cache
            .get_or_create(&key, device, meta.op_type, p2p_rank, is_self)?;
        let coalescing = dispatch.coalescing.active;
        if coalescing {
            let region = &mut dispatch.coalescing;
            region.has_p2p = true;
            region.devices.push(device);
            region.comms.push(entry.clone());
        }
        sync_stream(device, &entry.stream);

        let tensors = vec![tensor.clone()];
        let work = if coalescing {
            self.record_trace(ids, &meta, &tensors, &tensors, None);
            None
        } else {
            let work = Arc::new(Work::new(
                &self.work_settings(meta.timeout, false),
                device,
                self.rank,
                meta.op_type,
                ids.0,
                ids.1,
                entry.comm.clone(),
                tensor.numel(),
                tensor.numel(),
            ));
            work.set_outputs(tensors.clone());
            work.set_trace_id(self.record_trace(ids, &meta, &tensors, &tensors, Some(&work)));
            if let Some(start) = work.start_event() {
                start.record(&entry.stream);
            }
            Some(work)
        };

        tensor.record_stream(&entry.stream);
        f(tensor, entry.comm.as_ref(), &entry.stream, target)
            .map_err(|e| ProcessGroupError::transport(&e, entry.comm.failure_reason()))?;

        let Some(work) = work else {
            return Ok(None);
        };
        work.end_event().record(&entry.stream);
        work.future_handle().mark_completed(tensors);
        if !is_capturing() {
            self.work_enqueue(&work);
        }
        Ok(Some(work))
    }

    /// Opens a coalescing region. Operations issued until [`Shared::end_coalescing`] share one
    /// sequence number and one transport group.
    pub(crate) fn start_coalescing(&self) -> Result<()> {
        let mut dispatch = self.dispatch.lock();
        if dispatch.coalescing.active {
            return Err(ProcessGroupError::invalid_argument(
                "start_coalescing called while a coalescing region is already open",
            ));
        }
        open_group(self.transport.as_ref())?;
        dispatch.coalescing = CoalescingState {
            active: true,
            ..CoalescingState::default()
        };
        dispatch.seq += 1;
        Ok(())
    }

    /// Closes the region and returns its aggregate work, or `None` when nothing was issued.
    pub(crate) fn end_coalescing(&self, op_type: OpType) -> Result<Option<Arc<Work>>> {
        let mut dispatch = self.dispatch.lock();
        if !dispatch.coalescing.active {
            return Err(ProcessGroupError::invalid_argument(
                "end_coalescing called without a matching start_coalescing",
            ));
        }
        let region = std::mem::take(&mut dispatch.coalescing);
        let (Some(entry), Some(&device)) = (region.comms.first().cloned(), region.devices.first())
        else {
            let status = close_group(self.transport.as_ref())?;
            self.settle_group(status, None)?;
            return Ok(None);
        };
        tracing::debug!(
            "{}closing coalescing region of {} op(s), collectives: {}, p2p: {}",
            self.prefix,
            region.comms.len(),
            region.has_collective,
            region.has_p2p
        );

        let enqueue = !is_capturing();
        let meta = OpMeta::new(op_type, "nccl:coalesced", None);
        let ids = (dispatch.seq, dispatch.op_id);
        let work = Arc::new(Work::new(
            &self.work_settings(None, self.config.avoid_record_streams),
            device,
            self.rank,
            op_type,
            ids.0,
            ids.1,
            entry.comm.clone(),
            0,
            0,
        ));
        if enqueue {
            work.set_trace_id(self.record_trace(ids, &meta, &[], &[], Some(&work)));
        }
        if let Some(start) = work.start_event() {
            start.record(&entry.stream);
        }

        let status = close_group(self.transport.as_ref())?;
        self.settle_group(status, Some(entry.comm.as_ref()))?;

        work.end_event().record(&entry.stream);
        work.future_handle().mark_completed(Vec::new());
        if enqueue {
            self.work_enqueue(&work);
        }
        Ok(Some(work))
    }

    /// Closes an open region after a member failed, discarding its accumulators.
    fn abandon_coalescing(&self) {
        let mut dispatch = self.dispatch.lock();
        if !dispatch.coalescing.active {
            return;
        }
        dispatch.coalescing = CoalescingState::default();
        if let Err(e) = close_group(self.transport.as_ref()) {
            tracing::warn!("{}failed to close an abandoned coalescing group: {e}", self.prefix);
        }
    }

    /// Runs `body` inside a coalescing region and returns the aggregate work.
    pub(crate) fn coalesced<B>(&self, op_type: OpType, body: B) -> Result<Arc<Work>>
    where
        B: FnOnce() -> Result<()>,
    {
        self.start_coalescing()?;
        if let Err(e) = body() {
            self.abandon_coalescing();
            return Err(e);
        }
        self.end_coalescing(op_type)?.ok_or_else(|| {
            ProcessGroupError::internal(format!("coalesced {op_type} issued no operations"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_group::{ProcessGroup, ProcessGroupOptions};
    use crate::store::InMemoryStore;
    use crate::tensor::ScalarType;
    use crate::transport::RedOp;
    use crate::transport::sim::SimFabric;
    use crate::transport::{DataType, Primitive};

    fn solo() -> (ProcessGroup, SimFabric) {
        let fabric = SimFabric::new();
        let pg = ProcessGroup::new(
            Arc::new(InMemoryStore::new()),
            0,
            1,
            Arc::new(fabric.transport()),
            ProcessGroupOptions::default(),
        )
        .unwrap();
        (pg, fabric)
    }

    fn allreduce(
        input: &Tensor,
        output: &Tensor,
        comm: &dyn Communicator,
        stream: &Stream,
    ) -> Result<(), TransportError> {
        comm.issue(
            Primitive::AllReduce {
                input,
                output,
                dtype: DataType::Float32,
                op: RedOp::Sum,
            },
            stream,
        )
    }

    #[test]
    fn test_collective_bumps_seq_and_enqueues() {
        let (pg, _fabric) = solo();
        let t = Tensor::full(Device::cuda(0), &[4], ScalarType::Float, 2.0);
        let work = pg
            .shared
            .collective(
                &t,
                &t,
                OpMeta::new(OpType::Allreduce, "nccl:all_reduce", None),
                allreduce,
                no_hook,
                no_hook,
            )
            .unwrap();
        assert_eq!(work.seq(), 1);
        assert_eq!(work.op_id(), 1);
        assert_eq!(pg.last_enqueued_seq(), 1);
        work.wait(None).unwrap();
        assert_eq!(t.to_vec(), vec![2.0; 4]);
        pg.shutdown().unwrap();
    }

    #[test]
    fn test_empty_coalescing_region() {
        let (pg, fabric) = solo();
        pg.shared.start_coalescing().unwrap();
        assert_eq!(fabric.transport().open_groups(), 1);
        assert!(pg.shared.end_coalescing(OpType::Coalesced).unwrap().is_none());
        assert_eq!(fabric.transport().open_groups(), 0);

        let dispatch = pg.shared.dispatch.lock();
        assert!(!dispatch.coalescing.active);
        assert!(dispatch.coalescing.comms.is_empty());
        assert!(dispatch.coalescing.devices.is_empty());
        assert_eq!(dispatch.seq, 1);
    }

    #[test]
    fn test_coalesced_ops_share_one_work() {
        let (pg, _fabric) = solo();
        let a = Tensor::full(Device::cuda(0), &[2], ScalarType::Float, 1.0);
        let b = Tensor::full(Device::cuda(0), &[3], ScalarType::Float, 1.0);
        let work = pg
            .shared
            .coalesced(OpType::Coalesced, || {
                for t in [&a, &b] {
                    pg.shared.collective(
                        t,
                        t,
                        OpMeta::new(OpType::Allreduce, "nccl:all_reduce", None),
                        allreduce,
                        no_hook,
                        no_hook,
                    )?;
                }
                Ok(())
            })
            .unwrap();
        // One bump for the region plus one per member.
        assert_eq!(work.seq(), 3);
        assert_eq!(work.op_id(), 2);
        work.wait(None).unwrap();
    }

    #[test]
    fn test_end_without_start_is_rejected() {
        let (pg, _fabric) = solo();
        assert!(pg.shared.end_coalescing(OpType::Coalesced).is_err());
        pg.shared.start_coalescing().unwrap();
        assert!(pg.shared.start_coalescing().is_err());
        pg.shared.abandon_coalescing();
        assert!(!pg.shared.dispatch.lock().coalescing.active);
    }

    #[test]
    fn test_capture_skips_enqueue() {
        let (pg, _fabric) = solo();
        let t = Tensor::full(Device::cuda(0), &[1], ScalarType::Float, 1.0);
        let work = {
            let _capture = device::CaptureGuard::begin();
            pg.shared
                .collective(
                    &t,
                    &t,
                    OpMeta::new(OpType::Allreduce, "nccl:all_reduce", None),
                    allreduce,
                    no_hook,
                    no_hook,
                )
                .unwrap()
        };
        assert_eq!(pg.last_enqueued_seq(), 0);
        assert!(work.future().is_ready());
    }
}
