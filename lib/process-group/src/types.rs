// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Operation kinds, reduce ops and per-operation options.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Broadcast,
    Allreduce,
    AllreduceCoalesced,
    Reduce,
    Allgather,
    AllgatherBase,
    AllgatherCoalesced,
    Gather,
    Scatter,
    ReduceScatter,
    AlltoallBase,
    Alltoall,
    Send,
    Recv,
    RecvAnysource,
    Barrier,
    ReduceScatterBase,
    Coalesced,
    AllreduceSparse,
    Unknown,
}

impl OpType {
    pub fn is_p2p(&self) -> bool {
        matches!(self, OpType::Send | OpType::Recv | OpType::RecvAnysource)
    }

    /// Name used in profiling and the flight recorder.
    pub fn profiling_name(&self) -> String {
        format!("nccl:{}", self.to_string().to_lowercase())
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Broadcast => "BROADCAST",
            OpType::Allreduce => "ALLREDUCE",
            OpType::AllreduceCoalesced => "ALLREDUCE_COALESCED",
            OpType::Reduce => "REDUCE",
            OpType::Allgather => "ALLGATHER",
            OpType::AllgatherBase => "_ALLGATHER_BASE",
            OpType::AllgatherCoalesced => "ALLGATHER_COALESCED",
            OpType::Gather => "GATHER",
            OpType::Scatter => "SCATTER",
            OpType::ReduceScatter => "REDUCE_SCATTER",
            OpType::AlltoallBase => "ALLTOALL_BASE",
            OpType::Alltoall => "ALLTOALL",
            OpType::Send => "SEND",
            OpType::Recv => "RECV",
            OpType::RecvAnysource => "RECVANYSOURCE",
            OpType::Barrier => "BARRIER",
            OpType::ReduceScatterBase => "_REDUCE_SCATTER_BASE",
            OpType::Coalesced => "COALESCED",
            OpType::AllreduceSparse => "_ALLREDUCE_SPARSE",
            OpType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Caller-facing reduction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ReduceOp {
    #[default]
    Sum,
    Avg,
    Product,
    Min,
    Max,
    BAnd,
    BOr,
    BXor,
    /// Sum after scaling every input by the factor.
    PremulSum(f64),
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("SUM"),
            ReduceOp::Avg => f.write_str("AVG"),
            ReduceOp::Product => f.write_str("PRODUCT"),
            ReduceOp::Min => f.write_str("MIN"),
            ReduceOp::Max => f.write_str("MAX"),
            ReduceOp::BAnd => f.write_str("BAND"),
            ReduceOp::BOr => f.write_str("BOR"),
            ReduceOp::BXor => f.write_str("BXOR"),
            ReduceOp::PremulSum(_) => f.write_str("PREMUL_SUM"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllreduceOptions {
    pub reduce_op: ReduceOp,
    /// Overrides the group timeout for this operation.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct AllreduceCoalescedOptions {
    pub reduce_op: ReduceOp,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub root_rank: usize,
    /// Index of the root tensor in the input list.
    pub root_tensor: usize,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceOptions {
    pub reduce_op: ReduceOp,
    pub root_rank: usize,
    pub root_tensor: usize,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct AllgatherOptions {
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceScatterOptions {
    pub reduce_op: ReduceOp,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct AllToAllOptions {
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct GatherOptions {
    pub root_rank: usize,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ScatterOptions {
    pub root_rank: usize,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct BarrierOptions {
    /// Devices to run the barrier on. Empty means guess from the group's usage.
    pub device_ids: Vec<i16>,
    pub timeout: Option<Duration>,
}

/// Output of a completed submission, handed to [`crate::WorkFuture`] waiters.
pub type WorkOutputs = Vec<Tensor>;
