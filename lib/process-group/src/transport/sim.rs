// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! A [`SimFabric`] plays the role of the network: every simulated rank gets its own
//! [`SimTransport`] from the same fabric and communicators created with the same
//! [`UniqueId`] join the same group.
//!
//! Collectives are matched by the per-communicator issue index, sends and receives through a
//! FIFO per (src, dst) pair. When the last participant arrives the result is computed once the
//! stream work each participant had outstanding at issue time has finished, outputs are
//! written and every participant's completion token fires. Nothing blocks the issuing thread.
//!
//! Fault injection (`inject_async_error`, `hang_error_checks`) lets tests drive the watchdog
//! and heartbeat monitor through their failure paths.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use super::{
    CommConfig, Communicator, DataType, NO_COLOR, Primitive, RedOp, Transport, TransportError,
    TransportStatus, TransportVersion, UniqueId,
};
use crate::device::{self, Completion, Stream};
use crate::tensor::Tensor;

const DEFAULT_VERSION: TransportVersion = TransportVersion::new(2, 21, 5);
const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(30);

thread_local! {
    static OPEN_GROUPS: Cell<usize> = const { Cell::new(0) };
    static PENDING_NONBLOCKING_INIT: Cell<bool> = const { Cell::new(false) };
    /// Completions issued inside the currently open group. Grouped operations run
    /// concurrently, so they never wait on each other.
    static GROUP_ISSUED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Shared medium connecting simulated ranks.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    id: Uuid,
    version: TransportVersion,
    rendezvous_timeout: Duration,
    sparse_reduce: bool,
    next_handle: AtomicU64,
    groups: Mutex<HashMap<UniqueId, Arc<SimGroup>>>,
    splits: Mutex<HashMap<(UniqueId, u64), SplitRound>>,
    splits_cv: Condvar,
}

#[derive(Default)]
struct SplitRound {
    requests: HashMap<usize, (i32, usize)>,
    consumed: usize,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_VERSION, DEFAULT_RENDEZVOUS_TIMEOUT, false)
    }

    pub fn with_options(
        version: TransportVersion,
        rendezvous_timeout: Duration,
        sparse_reduce: bool,
    ) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                id: Uuid::new_v4(),
                version,
                rendezvous_timeout,
                sparse_reduce,
                next_handle: AtomicU64::new(1),
                groups: Mutex::new(HashMap::new()),
                splits: Mutex::new(HashMap::new()),
                splits_cv: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// A transport endpoint for one simulated rank.
    pub fn transport(&self) -> SimTransport {
        SimTransport {
            fabric: self.inner.clone(),
            comms: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Number of distinct communicator groups created on this fabric.
    pub fn group_count(&self) -> usize {
        self.inner.groups.lock().len()
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Faults {
    hang_checks: Mutex<bool>,
    cv: Condvar,
}

/// One rank's endpoint on a [`SimFabric`].
#[derive(Clone)]
pub struct SimTransport {
    fabric: Arc<FabricInner>,
    comms: Arc<Mutex<Vec<Weak<SimComm>>>>,
    faults: Arc<Faults>,
}

impl SimTransport {
    /// Latches an asynchronous error on every live communicator of this endpoint.
    pub fn inject_async_error(&self, reason: &str) {
        for comm in self.live_comms() {
            comm.latch_error(TransportError::RemoteError(reason.to_string()));
        }
    }

    /// Makes `check_for_error` block, as a native call stuck inside the library would.
    pub fn hang_error_checks(&self) {
        *self.faults.hang_checks.lock() = true;
    }

    pub fn release_error_checks(&self) {
        *self.faults.hang_checks.lock() = false;
        self.faults.cv.notify_all();
    }

    /// Groups opened on the calling thread.
    pub fn open_groups(&self) -> usize {
        OPEN_GROUPS.with(|c| c.get())
    }

    /// Communicators created by this endpoint that are still alive.
    pub fn live_comms(&self) -> Vec<Arc<SimComm>> {
        let mut comms = self.comms.lock();
        comms.retain(|w| w.strong_count() > 0);
        comms.iter().filter_map(Weak::upgrade).collect()
    }

    fn group(&self, id: &UniqueId, size: usize) -> Result<Arc<SimGroup>, TransportError> {
        let mut groups = self.fabric.groups.lock();
        let group = groups
            .entry(*id)
            .or_insert_with(|| Arc::new(SimGroup::new(*id, size)))
            .clone();
        if group.size != size {
            return Err(TransportError::InvalidArgument(format!(
                "communicator {id:?} was created with {} ranks, joining with {size}",
                group.size
            )));
        }
        Ok(group)
    }

    fn child_id(parent: &UniqueId, round: u64, color: i32) -> UniqueId {
        let mut bytes = [0u8; super::UNIQUE_ID_BYTES];
        bytes.copy_from_slice(parent.as_bytes());
        for (b, r) in bytes.iter_mut().zip(round.to_le_bytes()) {
            *b ^= r;
        }
        for (b, c) in bytes[8..].iter_mut().zip(color.to_le_bytes()) {
            *b ^= c;
        }
        bytes[12] ^= 0x5a;
        UniqueId(bytes)
    }
}

impl Transport for SimTransport {
    fn version(&self) -> TransportVersion {
        self.fabric.version
    }

    fn unique_id(&self) -> Result<UniqueId, TransportError> {
        Ok(UniqueId::random())
    }

    fn init_rank(
        &self,
        size: usize,
        rank: usize,
        id: &UniqueId,
        config: &CommConfig,
    ) -> Result<Arc<dyn Communicator>, TransportError> {
        if rank >= size {
            return Err(TransportError::InvalidArgument(format!(
                "rank {rank} is out of range for a communicator of size {size}"
            )));
        }
        let group = self.group(id, size)?;
        let comm = Arc::new(SimComm {
            handle_id: self.fabric.next_handle.fetch_add(1, Ordering::Relaxed),
            rank,
            group: group.clone(),
            next_op: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            async_error: Mutex::new(None),
            init_pending: AtomicBool::new(!config.blocking),
            outstanding: Mutex::new(Vec::new()),
            segments: Mutex::new(HashMap::new()),
            splits: AtomicU64::new(0),
            faults: self.faults.clone(),
        });
        group.join(rank, &comm)?;
        if !config.blocking && OPEN_GROUPS.with(|c| c.get()) > 0 {
            PENDING_NONBLOCKING_INIT.with(|c| c.set(true));
        }
        self.comms.lock().push(Arc::downgrade(&comm));
        tracing::debug!(rank, size, handle = comm.handle_id, "sim communicator initialized");
        Ok(comm)
    }

    fn split(
        &self,
        parent: &Arc<dyn Communicator>,
        color: i32,
        key: usize,
        config: &CommConfig,
    ) -> Result<Option<Arc<dyn Communicator>>, TransportError> {
        if parent.is_aborted() {
            return Err(TransportError::InvalidUsage(
                "cannot split an aborted communicator".to_string(),
            ));
        }
        let parent_id = parent.unique_id();
        let parent_size = parent.size();
        let round = {
            let group = self.group(&parent_id, parent_size)?;
            let member = group.member(parent.rank()).ok_or_else(|| {
                TransportError::InternalError("split parent is not a group member".to_string())
            })?;
            member.splits.fetch_add(1, Ordering::AcqRel)
        };

        let round_key = (parent_id, round);
        let deadline = Instant::now() + self.fabric.rendezvous_timeout;
        let requests = {
            let mut splits = self.fabric.splits.lock();
            splits
                .entry(round_key)
                .or_default()
                .requests
                .insert(parent.rank(), (color, key));
            self.fabric.splits_cv.notify_all();

            loop {
                let arrived = splits.get(&round_key).map(|r| r.requests.len()).unwrap_or(0);
                if arrived == parent_size {
                    break;
                }
                if self
                    .fabric
                    .splits_cv
                    .wait_until(&mut splits, deadline)
                    .timed_out()
                {
                    return Err(TransportError::SystemError(format!(
                        "split round {round} timed out with {arrived} of {parent_size} ranks"
                    )));
                }
            }

            let entry = splits.entry(round_key).or_default();
            let requests = entry.requests.clone();
            entry.consumed += 1;
            if entry.consumed == parent_size {
                splits.remove(&round_key);
            }
            requests
        };

        if color == NO_COLOR {
            return Ok(None);
        }

        let mut members: Vec<(usize, usize)> = requests
            .iter()
            .filter(|(_, (c, _))| *c == color)
            .map(|(rank, (_, k))| (*k, *rank))
            .collect();
        members.sort();
        let new_rank = members
            .iter()
            .position(|(_, r)| *r == parent.rank())
            .ok_or_else(|| TransportError::InternalError("split member missing".to_string()))?;
        let child = Self::child_id(&parent_id, round, color);
        self.init_rank(members.len(), new_rank, &child, config).map(Some)
    }

    fn group_start(&self) -> Result<(), TransportError> {
        OPEN_GROUPS.with(|c| c.set(c.get() + 1));
        Ok(())
    }

    fn group_end(&self) -> Result<TransportStatus, TransportError> {
        let open = OPEN_GROUPS.with(|c| c.get());
        if open == 0 {
            return Err(TransportError::InvalidUsage(
                "group end without matching group start".to_string(),
            ));
        }
        OPEN_GROUPS.with(|c| c.set(open - 1));
        if open == 1 {
            GROUP_ISSUED.with(|ids| ids.borrow_mut().clear());
        }
        if PENDING_NONBLOCKING_INIT.with(|c| c.replace(false)) {
            return Ok(TransportStatus::InProgress);
        }
        Ok(TransportStatus::Success)
    }

    fn supports_sparse_reduce(&self) -> bool {
        self.fabric.sparse_reduce
    }
}

/// Collective operation with owned tensor handles.
#[derive(Debug, Clone)]
enum SimOp {
    AllReduce { input: Tensor, output: Tensor, dtype: DataType, op: RedOp },
    Broadcast { input: Tensor, output: Tensor, dtype: DataType, root: usize },
    Reduce { input: Tensor, output: Tensor, dtype: DataType, op: RedOp, root: usize },
    AllGather { input: Tensor, output: Tensor, dtype: DataType },
    ReduceScatter { input: Tensor, output: Tensor, dtype: DataType, op: RedOp },
    AllToAll {
        input: Tensor,
        output: Tensor,
        dtype: DataType,
        send_counts: Vec<usize>,
        recv_counts: Vec<usize>,
    },
    SparseReduce {
        values: Tensor,
        indices: Vec<usize>,
        output: Tensor,
        dtype: DataType,
        op: RedOp,
    },
}

impl SimOp {
    fn name(&self) -> &'static str {
        match self {
            SimOp::AllReduce { .. } => "allreduce",
            SimOp::Broadcast { .. } => "broadcast",
            SimOp::Reduce { .. } => "reduce",
            SimOp::AllGather { .. } => "allgather",
            SimOp::ReduceScatter { .. } => "reducescatter",
            SimOp::AllToAll { .. } => "alltoall",
            SimOp::SparseReduce { .. } => "sparse_reduce",
        }
    }

    fn dtype(&self) -> DataType {
        match self {
            SimOp::AllReduce { dtype, .. }
            | SimOp::Broadcast { dtype, .. }
            | SimOp::Reduce { dtype, .. }
            | SimOp::AllGather { dtype, .. }
            | SimOp::ReduceScatter { dtype, .. }
            | SimOp::AllToAll { dtype, .. }
            | SimOp::SparseReduce { dtype, .. } => *dtype,
        }
    }

    fn red_op(&self) -> Option<RedOp> {
        match self {
            SimOp::AllReduce { op, .. }
            | SimOp::Reduce { op, .. }
            | SimOp::ReduceScatter { op, .. }
            | SimOp::SparseReduce { op, .. } => Some(*op),
            _ => None,
        }
    }

    fn root(&self) -> Option<usize> {
        match self {
            SimOp::Broadcast { root, .. } | SimOp::Reduce { root, .. } => Some(*root),
            _ => None,
        }
    }

    fn input_numel(&self) -> usize {
        match self {
            SimOp::AllReduce { input, .. }
            | SimOp::Broadcast { input, .. }
            | SimOp::Reduce { input, .. }
            | SimOp::AllGather { input, .. }
            | SimOp::ReduceScatter { input, .. }
            | SimOp::AllToAll { input, .. } => input.numel(),
            SimOp::SparseReduce { output, .. } => output.numel(),
        }
    }

    fn output(&self) -> &Tensor {
        match self {
            SimOp::AllReduce { output, .. }
            | SimOp::Broadcast { output, .. }
            | SimOp::Reduce { output, .. }
            | SimOp::AllGather { output, .. }
            | SimOp::ReduceScatter { output, .. }
            | SimOp::AllToAll { output, .. }
            | SimOp::SparseReduce { output, .. } => output,
        }
    }
}

struct Contribution {
    op: SimOp,
    deps: Vec<Arc<Completion>>,
    done: Arc<Completion>,
}

struct PostedBuffer {
    tensor: Tensor,
    deps: Vec<Arc<Completion>>,
    done: Arc<Completion>,
}

#[derive(Default)]
struct Channel {
    sends: VecDeque<PostedBuffer>,
    recvs: VecDeque<PostedBuffer>,
}

#[derive(Default)]
struct GroupState {
    members: HashMap<usize, Weak<SimComm>>,
    collectives: HashMap<u64, Vec<Option<Contribution>>>,
    channels: HashMap<(usize, usize), Channel>,
}

struct SimGroup {
    id: UniqueId,
    size: usize,
    state: Mutex<GroupState>,
}

impl SimGroup {
    fn new(id: UniqueId, size: usize) -> Self {
        Self {
            id,
            size,
            state: Mutex::new(GroupState::default()),
        }
    }

    fn join(&self, rank: usize, comm: &Arc<SimComm>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.members.get(&rank).and_then(Weak::upgrade) {
            if !existing.is_aborted() {
                return Err(TransportError::InvalidUsage(format!(
                    "rank {rank} already joined communicator {:?}",
                    self.id
                )));
            }
        }
        state.members.insert(rank, Arc::downgrade(comm));
        Ok(())
    }

    fn member(&self, rank: usize) -> Option<Arc<SimComm>> {
        self.state.lock().members.get(&rank).and_then(Weak::upgrade)
    }

    fn fail(&self, err: TransportError) {
        let members: Vec<Arc<SimComm>> = self
            .state
            .lock()
            .members
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for member in members {
            member.latch_error(err.clone());
        }
    }

    fn contribute(&self, index: u64, rank: usize, contribution: Contribution) {
        let ready = {
            let mut state = self.state.lock();
            let slots = state
                .collectives
                .entry(index)
                .or_insert_with(|| (0..self.size).map(|_| None).collect());
            slots[rank] = Some(contribution);
            if slots.iter().all(Option::is_some) {
                state.collectives.remove(&index)
            } else {
                None
            }
        };

        let Some(slots) = ready else {
            return;
        };
        let contributions: Vec<Contribution> = slots.into_iter().flatten().collect();
        if let Err(e) = check_matching(&contributions) {
            tracing::error!(error = %e, index, "mismatched collective on sim communicator");
            self.fail(e);
            return;
        }

        let deps: Vec<Arc<Completion>> = contributions
            .iter()
            .flat_map(|c| c.deps.iter().cloned())
            .collect();
        let dones: Vec<Arc<Completion>> = contributions.iter().map(|c| c.done.clone()).collect();
        let ops: Vec<SimOp> = contributions.into_iter().map(|c| c.op).collect();
        device::run_after(deps, Completion::new(), move || {
            execute(&ops);
            for done in dones {
                done.complete();
            }
        });
    }

    fn post(&self, src: usize, dst: usize, buffer: PostedBuffer, is_send: bool) {
        let matched = {
            let mut state = self.state.lock();
            let channel = state.channels.entry((src, dst)).or_default();
            if is_send {
                channel.sends.push_back(buffer);
            } else {
                channel.recvs.push_back(buffer);
            }
            if !channel.sends.is_empty() && !channel.recvs.is_empty() {
                channel.sends.pop_front().zip(channel.recvs.pop_front())
            } else {
                None
            }
        };

        let Some((send, recv)) = matched else {
            return;
        };
        if send.tensor.numel() != recv.tensor.numel() {
            self.fail(TransportError::InvalidUsage(format!(
                "send of {} elements from rank {src} matched a receive of {} elements on rank {dst}",
                send.tensor.numel(),
                recv.tensor.numel()
            )));
            return;
        }
        let mut deps = send.deps;
        deps.extend(recv.deps);
        let (send_done, recv_done) = (send.done, recv.done);
        let (src_tensor, dst_tensor) = (send.tensor, recv.tensor);
        device::run_after(deps, Completion::new(), move || {
            dst_tensor.write(&src_tensor.read());
            send_done.complete();
            recv_done.complete();
        });
    }
}

fn check_matching(contributions: &[Contribution]) -> Result<(), TransportError> {
    let first = &contributions[0].op;
    for c in &contributions[1..] {
        let op = &c.op;
        let same = op.name() == first.name()
            && op.dtype() == first.dtype()
            && op.root() == first.root()
            && op.red_op() == first.red_op();
        let sized = matches!(op, SimOp::AllToAll { .. }) || op.input_numel() == first.input_numel();
        if !same || !sized {
            return Err(TransportError::InvalidUsage(format!(
                "mismatched collectives: {}({:?}, {} elements) vs {}({:?}, {} elements)",
                first.name(),
                first.dtype(),
                first.input_numel(),
                op.name(),
                op.dtype(),
                op.input_numel()
            )));
        }
    }
    if let SimOp::AllToAll { .. } = first {
        for (dst, c) in contributions.iter().enumerate() {
            let SimOp::AllToAll { recv_counts, .. } = &c.op else {
                continue;
            };
            for (src, s) in contributions.iter().enumerate() {
                let SimOp::AllToAll { send_counts, .. } = &s.op else {
                    continue;
                };
                if send_counts.get(dst) != recv_counts.get(src) {
                    return Err(TransportError::InvalidUsage(format!(
                        "alltoall: rank {src} sends {:?} elements to rank {dst}, which expects {:?}",
                        send_counts.get(dst),
                        recv_counts.get(src)
                    )));
                }
            }
        }
    }
    Ok(())
}

// Inputs are all read before any output is written, so in-place ops are safe.
fn execute(ops: &[SimOp]) {
    match &ops[0] {
        SimOp::AllReduce { op, .. } => {
            let inputs = read_inputs(ops);
            let result = op.reduce(&inputs);
            ops.iter().for_each(|o| o.output().write(&result));
        }
        SimOp::Broadcast { root, .. } => {
            let SimOp::Broadcast { input, .. } = &ops[*root] else {
                return;
            };
            let data = input.read();
            ops.iter().for_each(|o| o.output().write(&data));
        }
        SimOp::Reduce { op, root, .. } => {
            let inputs = read_inputs(ops);
            let result = op.reduce(&inputs);
            ops[*root].output().write(&result);
        }
        SimOp::AllGather { .. } => {
            let gathered: Vec<f64> = read_inputs(ops).into_iter().flatten().collect();
            ops.iter().for_each(|o| o.output().write(&gathered));
        }
        SimOp::ReduceScatter { op, .. } => {
            let inputs = read_inputs(ops);
            let result = op.reduce(&inputs);
            for (rank, o) in ops.iter().enumerate() {
                let chunk = o.output().numel();
                let start = (rank * chunk).min(result.len());
                let end = (start + chunk).min(result.len());
                o.output().write(&result[start..end]);
            }
        }
        SimOp::AllToAll { .. } => {
            let inputs = read_inputs(ops);
            for (dst, o) in ops.iter().enumerate() {
                let mut received = Vec::new();
                for (src, s) in ops.iter().enumerate() {
                    let SimOp::AllToAll { send_counts, .. } = s else {
                        continue;
                    };
                    let offset: usize = send_counts[..dst].iter().sum();
                    let count = send_counts[dst];
                    received.extend_from_slice(&inputs[src][offset..offset + count]);
                }
                o.output().write(&received);
            }
        }
        SimOp::SparseReduce { op, output, .. } => {
            let numel = output.numel();
            let row_len = output.shape().iter().skip(1).product::<usize>().max(1);
            let mut dense: Vec<Option<f64>> = vec![None; numel];
            for o in ops {
                let SimOp::SparseReduce {
                    values, indices, ..
                } = o
                else {
                    continue;
                };
                let data = values.read();
                for (i, row) in indices.iter().enumerate() {
                    for j in 0..row_len {
                        let (at, value) = (row * row_len + j, data[i * row_len + j]);
                        if at < numel {
                            dense[at] = Some(match dense[at] {
                                Some(acc) => op.combine(acc, value),
                                None => value,
                            });
                        }
                    }
                }
            }
            let scale = if let RedOp::Avg = op { ops.len() as f64 } else { 1.0 };
            let result: Vec<f64> = dense.into_iter().map(|v| v.unwrap_or(0.0) / scale).collect();
            ops.iter().for_each(|o| o.output().write(&result));
        }
    }
}

fn read_inputs(ops: &[SimOp]) -> Vec<Vec<f64>> {
    ops.iter()
        .map(|o| match o {
            SimOp::AllReduce { input, .. }
            | SimOp::Broadcast { input, .. }
            | SimOp::Reduce { input, .. }
            | SimOp::AllGather { input, .. }
            | SimOp::ReduceScatter { input, .. }
            | SimOp::AllToAll { input, .. } => input.read(),
            SimOp::SparseReduce { values, .. } => values.read(),
        })
        .collect()
}

/// Communicator on a [`SimFabric`].
pub struct SimComm {
    handle_id: u64,
    rank: usize,
    group: Arc<SimGroup>,
    next_op: AtomicU64,
    issued: AtomicU64,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    async_error: Mutex<Option<TransportError>>,
    init_pending: AtomicBool,
    outstanding: Mutex<Vec<Arc<Completion>>>,
    segments: Mutex<HashMap<u64, usize>>,
    splits: AtomicU64,
    faults: Arc<Faults>,
}

impl SimComm {
    fn latch_error(&self, err: TransportError) {
        let mut slot = self.async_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn registered_segments(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    fn track(&self, stream: &Stream) -> (Vec<Arc<Completion>>, Arc<Completion>) {
        let mut deps = stream.frontier();
        let done = Completion::new();
        if OPEN_GROUPS.with(|c| c.get()) > 0 {
            GROUP_ISSUED.with(|ids| {
                let mut ids = ids.borrow_mut();
                deps.retain(|c| !ids.contains(&c.id()));
                ids.push(done.id());
            });
        }
        stream.enqueue(done.clone());
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|c| !c.is_complete());
        outstanding.push(done.clone());
        (deps, done)
    }
}

impl fmt::Debug for SimComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimComm")
            .field("handle_id", &self.handle_id)
            .field("rank", &self.rank)
            .field("size", &self.group.size)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl Communicator for SimComm {
    fn handle_id(&self) -> u64 {
        self.handle_id
    }

    fn unique_id(&self) -> UniqueId {
        self.group.id
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn issue(&self, primitive: Primitive<'_>, stream: &Stream) -> Result<(), TransportError> {
        if self.is_aborted() {
            return Err(TransportError::Aborted(format!(
                "{} issued on an aborted communicator",
                primitive.name()
            )));
        }
        if let Some(err) = self.async_error.lock().clone() {
            return Err(err);
        }
        self.issued.fetch_add(1, Ordering::Relaxed);

        let size = self.group.size;
        let check_peer = |peer: usize| {
            if peer >= size {
                Err(TransportError::InvalidArgument(format!(
                    "peer {peer} is out of range for a communicator of size {size}"
                )))
            } else {
                Ok(())
            }
        };

        let op = match primitive {
            Primitive::Send { tensor, peer, .. } => {
                check_peer(peer)?;
                let (deps, done) = self.track(stream);
                let buffer = PostedBuffer {
                    tensor: tensor.clone(),
                    deps,
                    done,
                };
                self.group.post(self.rank, peer, buffer, true);
                return Ok(());
            }
            Primitive::Recv { tensor, peer, .. } => {
                check_peer(peer)?;
                let (deps, done) = self.track(stream);
                let buffer = PostedBuffer {
                    tensor: tensor.clone(),
                    deps,
                    done,
                };
                self.group.post(peer, self.rank, buffer, false);
                return Ok(());
            }
            Primitive::AllReduce { input, output, dtype, op } => SimOp::AllReduce {
                input: input.clone(),
                output: output.clone(),
                dtype,
                op,
            },
            Primitive::Broadcast { input, output, dtype, root } => {
                check_peer(root)?;
                SimOp::Broadcast {
                    input: input.clone(),
                    output: output.clone(),
                    dtype,
                    root,
                }
            }
            Primitive::Reduce { input, output, dtype, op, root } => {
                check_peer(root)?;
                SimOp::Reduce {
                    input: input.clone(),
                    output: output.clone(),
                    dtype,
                    op,
                    root,
                }
            }
            Primitive::AllGather { input, output, dtype } => SimOp::AllGather {
                input: input.clone(),
                output: output.clone(),
                dtype,
            },
            Primitive::ReduceScatter { input, output, dtype, op } => SimOp::ReduceScatter {
                input: input.clone(),
                output: output.clone(),
                dtype,
                op,
            },
            Primitive::AllToAll { input, output, dtype, send_counts, recv_counts } => {
                if send_counts.len() != size || recv_counts.len() != size {
                    return Err(TransportError::InvalidArgument(format!(
                        "alltoall needs {size} send and receive counts"
                    )));
                }
                SimOp::AllToAll {
                    input: input.clone(),
                    output: output.clone(),
                    dtype,
                    send_counts,
                    recv_counts,
                }
            }
            Primitive::SparseReduce { values, indices, output, dtype, op } => SimOp::SparseReduce {
                values: values.clone(),
                indices: indices.to_vec(),
                output: output.clone(),
                dtype,
                op,
            },
        };

        let index = self.next_op.fetch_add(1, Ordering::AcqRel);
        let (deps, done) = self.track(stream);
        self.group
            .contribute(index, self.rank, Contribution { op, deps, done });
        Ok(())
    }

    fn abort(&self, reason: Option<&str>) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.abort_reason.lock() = reason.map(str::to_string);
        // must be visible before the completions fire
        self.latch_error(TransportError::Aborted(
            reason.unwrap_or("communicator aborted").to_string(),
        ));
        let outstanding = std::mem::take(&mut *self.outstanding.lock());
        for completion in outstanding {
            completion.complete();
        }
        tracing::debug!(
            rank = self.rank,
            handle = self.handle_id,
            reason = reason.unwrap_or(""),
            "sim communicator aborted"
        );
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn check_for_error(&self) -> TransportStatus {
        {
            let mut hang = self.faults.hang_checks.lock();
            while *hang {
                self.faults.cv.wait(&mut hang);
            }
        }
        if let Some(err) = self.async_error.lock().clone() {
            return TransportStatus::Error(err);
        }
        if self.init_pending.swap(false, Ordering::AcqRel) {
            return TransportStatus::InProgress;
        }
        TransportStatus::Success
    }

    fn failure_reason(&self) -> Option<String> {
        self.async_error.lock().as_ref().map(|e| e.to_string())
    }

    fn register_segment(&self, addr: u64, size: usize) -> Result<(), TransportError> {
        if self.is_aborted() {
            return Err(TransportError::Aborted(
                "segment registration on an aborted communicator".to_string(),
            ));
        }
        self.segments.lock().insert(addr, size);
        Ok(())
    }

    fn deregister_segment(&self, addr: u64) -> Result<(), TransportError> {
        match self.segments.lock().remove(&addr) {
            Some(_) => Ok(()),
            None => Err(TransportError::InvalidArgument(format!(
                "segment {addr:#x} is not registered"
            ))),
        }
    }

    fn split_count(&self) -> u64 {
        self.splits.load(Ordering::Acquire)
    }

    fn dump(&self) -> HashMap<String, String> {
        HashMap::from([
            ("rank".to_string(), self.rank.to_string()),
            ("size".to_string(), self.group.size.to_string()),
            ("aborted".to_string(), self.is_aborted().to_string()),
            ("ops_issued".to_string(), self.issued().to_string()),
            (
                "registered_segments".to_string(),
                self.registered_segments().to_string(),
            ),
            (
                "abort_reason".to_string(),
                self.abort_reason.lock().clone().unwrap_or_default(),
            ),
        ])
    }
}
