// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collective transport abstraction.
//!
//! A [`Transport`] creates and splits [`Communicator`]s and owns the group markers. A
//! communicator is bound to one device and one rank set; it issues [`Primitive`]s on a stream
//! and reports asynchronous failures through [`Communicator::check_for_error`].
//!
//! [`sim`] provides an in-process implementation used by tests and single-host runs.

pub mod group;
pub mod sim;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use serde::Serialize;
use thiserror::Error;

use crate::device::Stream;
use crate::tensor::Tensor;

pub use group::{GroupTicket, active_group_depth, close_group, open_group};

/// Size of the opaque bootstrap identifier exchanged through the store.
pub const UNIQUE_ID_BYTES: usize = 128;

/// Colour passed to `split` by ranks that do not join the child communicator.
pub const NO_COLOR: i32 = -1;

/// Oldest version that can be used while recording a device graph.
pub const MIN_CAPTURE_VERSION: TransportVersion = TransportVersion::new(2, 9, 6);

/// Oldest version with a native average reduction.
pub const MIN_AVG_VERSION: TransportVersion = TransportVersion::new(2, 10, 0);

/// Oldest version with pre-multiplied sum.
pub const MIN_PREMUL_SUM_VERSION: TransportVersion = TransportVersion::new(2, 11, 1);

/// Opaque identifier that lets ranks join the same communicator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    pub fn random() -> Self {
        let mut bytes = [0u8; UNIQUE_ID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// `None` when `bytes` does not have the exact identifier size.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; UNIQUE_ID_BYTES] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "UniqueId({}..)", &hex[..16])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransportVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl TransportVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for TransportVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Corresponds to the transport library's result codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("a call to a CUDA function failed: {0}")]
    UnhandledDeviceError(String),

    #[error("a call to the system failed: {0}")]
    SystemError(String),

    #[error("an internal check failed; either bug in the transport or memory corruption: {0}")]
    InternalError(String),

    #[error("an argument has an invalid value: {0}")]
    InvalidArgument(String),

    #[error("a call to the transport is incorrect, usually a programming error: {0}")]
    InvalidUsage(String),

    #[error(
        "a call failed possibly due to a network error or a remote process exiting prematurely: {0}"
    )]
    RemoteError(String),

    #[error("the communicator was aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// Function succeeded.
    Success,
    /// An operation on the communicator is being progressed in the background.
    InProgress,
    Error(TransportError),
}

/// Element type tags understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataType {
    Int8,
    Uint8,
    Int32,
    Int64,
    Float16,
    Float32,
    Float64,
    Bfloat16,
}

/// Reduction tags understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RedOp {
    Sum,
    Prod,
    Max,
    Min,
    Avg,
    /// Sum after multiplying every input by the factor.
    PreMulSum(f64),
}

impl RedOp {
    /// Folds one contribution into an accumulator.
    pub fn combine(&self, acc: f64, value: f64) -> f64 {
        match self {
            RedOp::Sum | RedOp::Avg => acc + value,
            RedOp::PreMulSum(factor) => acc + value * factor,
            RedOp::Prod => acc * value,
            RedOp::Max => acc.max(value),
            RedOp::Min => acc.min(value),
        }
    }

    /// Reduces per-rank vectors element-wise.
    pub fn reduce(&self, contributions: &[Vec<f64>]) -> Vec<f64> {
        let Some(first) = contributions.first() else {
            return Vec::new();
        };
        let mut acc: Vec<f64> = match self {
            RedOp::PreMulSum(factor) => first.iter().map(|v| v * factor).collect(),
            _ => first.clone(),
        };
        for contribution in &contributions[1..] {
            for (a, v) in acc.iter_mut().zip(contribution) {
                *a = self.combine(*a, *v);
            }
        }
        if let RedOp::Avg = self {
            let n = contributions.len() as f64;
            acc.iter_mut().for_each(|a| *a /= n);
        }
        acc
    }
}

/// Communicator creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommConfig {
    /// When false, init and group end may report `InProgress`.
    pub blocking: bool,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self { blocking: true }
    }
}

/// One transport operation. Counts are in elements.
#[derive(Debug)]
pub enum Primitive<'a> {
    AllReduce {
        input: &'a Tensor,
        output: &'a Tensor,
        dtype: DataType,
        op: RedOp,
    },
    Broadcast {
        input: &'a Tensor,
        output: &'a Tensor,
        dtype: DataType,
        root: usize,
    },
    Reduce {
        input: &'a Tensor,
        output: &'a Tensor,
        dtype: DataType,
        op: RedOp,
        root: usize,
    },
    AllGather {
        input: &'a Tensor,
        output: &'a Tensor,
        dtype: DataType,
    },
    ReduceScatter {
        input: &'a Tensor,
        output: &'a Tensor,
        dtype: DataType,
        op: RedOp,
    },
    AllToAll {
        input: &'a Tensor,
        output: &'a Tensor,
        dtype: DataType,
        send_counts: Vec<usize>,
        recv_counts: Vec<usize>,
    },
    Send {
        tensor: &'a Tensor,
        dtype: DataType,
        peer: usize,
    },
    Recv {
        tensor: &'a Tensor,
        dtype: DataType,
        peer: usize,
    },
    /// Row-sparse reduction into a dense output.
    SparseReduce {
        values: &'a Tensor,
        indices: &'a [usize],
        output: &'a Tensor,
        dtype: DataType,
        op: RedOp,
    },
}

impl Primitive<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::AllReduce { .. } => "allreduce",
            Primitive::Broadcast { .. } => "broadcast",
            Primitive::Reduce { .. } => "reduce",
            Primitive::AllGather { .. } => "allgather",
            Primitive::ReduceScatter { .. } => "reducescatter",
            Primitive::AllToAll { .. } => "alltoall",
            Primitive::Send { .. } => "send",
            Primitive::Recv { .. } => "recv",
            Primitive::SparseReduce { .. } => "sparse_reduce",
        }
    }
}

pub trait Communicator: Send + Sync + fmt::Debug {
    /// Process-unique handle identifier.
    fn handle_id(&self) -> u64;

    fn unique_id(&self) -> UniqueId;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Enqueues `primitive` on `stream`. Returns once the work is enqueued, not completed.
    fn issue(&self, primitive: Primitive<'_>, stream: &Stream) -> Result<(), TransportError>;

    /// Tears the communicator down. Outstanding work is released. Idempotent.
    fn abort(&self, reason: Option<&str>);

    fn is_aborted(&self) -> bool;

    /// Asynchronous error state, including an in-progress non-blocking init.
    fn check_for_error(&self) -> TransportStatus;

    fn failure_reason(&self) -> Option<String>;

    fn register_segment(&self, addr: u64, size: usize) -> Result<(), TransportError>;

    fn deregister_segment(&self, addr: u64) -> Result<(), TransportError>;

    /// Number of children split from this communicator.
    fn split_count(&self) -> u64;

    fn dump(&self) -> HashMap<String, String>;
}

pub trait Transport: Send + Sync {
    /// Backend name used in store keys and diagnostics.
    fn name(&self) -> &'static str {
        "NCCL"
    }

    fn version(&self) -> TransportVersion;

    fn unique_id(&self) -> Result<UniqueId, TransportError>;

    fn init_rank(
        &self,
        size: usize,
        rank: usize,
        id: &UniqueId,
        config: &CommConfig,
    ) -> Result<Arc<dyn Communicator>, TransportError>;

    /// Collective over `parent`. Ranks passing [`NO_COLOR`] get `None`.
    fn split(
        &self,
        parent: &Arc<dyn Communicator>,
        color: i32,
        key: usize,
        config: &CommConfig,
    ) -> Result<Option<Arc<dyn Communicator>>, TransportError>;

    fn group_start(&self) -> Result<(), TransportError>;

    fn group_end(&self) -> Result<TransportStatus, TransportError>;

    fn supports_split(&self) -> bool {
        true
    }

    fn supports_sparse_reduce(&self) -> bool {
        false
    }

    fn supports_bfloat16(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_unique_id_bytes_round_trip() {
        let id = UniqueId::random();
        let restored = UniqueId::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, restored);
        assert_eq!(id.to_hex().len(), UNIQUE_ID_BYTES * 2);
        assert!(UniqueId::from_bytes(&id.as_bytes()[..64]).is_none());
    }

    #[test]
    fn test_version_ordering() {
        assert!(TransportVersion::new(2, 18, 1) >= MIN_CAPTURE_VERSION);
        assert!(TransportVersion::new(2, 9, 5) < MIN_CAPTURE_VERSION);
        assert!(TransportVersion::new(2, 11, 0) < MIN_PREMUL_SUM_VERSION);
        assert_eq!(TransportVersion::new(2, 21, 5).to_string(), "2.21.5");
    }

    #[rstest]
    #[case::sum(RedOp::Sum, vec![4.0, 6.0])]
    #[case::prod(RedOp::Prod, vec![3.0, 8.0])]
    #[case::max(RedOp::Max, vec![3.0, 4.0])]
    #[case::min(RedOp::Min, vec![1.0, 2.0])]
    #[case::avg(RedOp::Avg, vec![2.0, 3.0])]
    #[case::premul(RedOp::PreMulSum(0.5), vec![2.0, 3.0])]
    fn test_reduce(#[case] op: RedOp, #[case] expected: Vec<f64>) {
        let contributions = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        assert_eq!(op.reduce(&contributions), expected);
    }
}
