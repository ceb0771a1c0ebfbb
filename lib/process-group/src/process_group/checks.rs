// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Argument validation and dtype / reduce-op translation.
//!
//! Everything here runs before an operation reaches the dispatcher, so a rejected call never
//! consumes a sequence number.

use std::sync::Once;

use crate::device::Device;
use crate::error::{ProcessGroupError, Result};
use crate::tensor::{ScalarType, Tensor};
use crate::transport::{
    DataType, MIN_AVG_VERSION, MIN_PREMUL_SUM_VERSION, RedOp, Transport, TransportVersion,
};
use crate::types::ReduceOp;

pub(crate) const MULTI_DEVICE_ERROR_MSG: &str = "Expecting one tensor only but got multiple. \
     You are probably using multiple GPUs under the same process. This is no longer supported.";

static P2P_CONTIGUITY_WARNING: Once = Once::new();

/// The only tensor of a single-device list.
pub(crate) fn single(tensors: &[Tensor]) -> Result<&Tensor> {
    match tensors {
        [tensor] => Ok(tensor),
        _ => Err(ProcessGroupError::invalid_argument(MULTI_DEVICE_ERROR_MSG)),
    }
}

/// Requires a dense device tensor. Point-to-point ops tolerate non-contiguous tensors.
pub(crate) fn check_single_tensor(tensor: &Tensor, p2p: bool) -> Result<Device> {
    let device = match tensor.device() {
        Some(device) if !tensor.is_sparse() => device,
        _ => {
            return Err(ProcessGroupError::invalid_argument(
                "Tensors must be CUDA and dense",
            ));
        }
    };
    if !tensor.is_contiguous() {
        if !p2p {
            return Err(ProcessGroupError::invalid_argument(
                "Tensors must be contiguous",
            ));
        }
        P2P_CONTIGUITY_WARNING.call_once(|| {
            tracing::warn!(
                "Detected non-contiguous tensor in P2P operations. It is user responsibility to \
                 guarantee that source and destination tensors have the same contiguity format."
            );
        });
    }
    Ok(device)
}

/// Validates a non-empty list of dense tensors sharing dtype and device. Returns the total
/// element count.
pub(crate) fn check_tensors_same_device(tensors: &[Tensor]) -> Result<usize> {
    let first = tensors
        .first()
        .ok_or_else(|| ProcessGroupError::invalid_argument("Tensor list must be nonempty"))?;
    let first_device = first.device();
    let mut total = 0;
    for tensor in tensors {
        if !tensor.is_cuda() || tensor.is_sparse() {
            return Err(ProcessGroupError::invalid_argument(
                "Tensors must be CUDA and dense",
            ));
        }
        if tensor.dtype() != first.dtype() {
            return Err(ProcessGroupError::type_mismatch(
                "Tensors must have identical type",
            ));
        }
        if !tensor.is_contiguous() {
            return Err(ProcessGroupError::invalid_argument(
                "Tensors must be non-overlapping and dense",
            ));
        }
        if tensor.device() != first_device {
            return Err(ProcessGroupError::invalid_argument(
                "Expected list of tensors on the same device",
            ));
        }
        total += tensor.numel();
    }
    Ok(total)
}

pub(crate) fn check_same_size(tensors: &[Tensor]) -> bool {
    match tensors.split_first() {
        Some((first, rest)) => rest.iter().all(|t| t.same_size(first)),
        None => true,
    }
}

/// Validates dim-0 split sizes for an all-to-all. An empty list means an even split.
pub(crate) fn check_split_sizes(split_sizes: &[usize], tensor: &Tensor, group_size: usize) -> Result<()> {
    let rows = tensor.shape().first().copied().unwrap_or(0);
    if split_sizes.is_empty() {
        if group_size == 0 || rows % group_size != 0 {
            return Err(ProcessGroupError::invalid_argument(
                "Tensor's dim 0 does not divide equally across group size",
            ));
        }
        return Ok(());
    }
    if split_sizes.len() != group_size {
        return Err(ProcessGroupError::invalid_argument(
            "Number of tensor splits not equal to group size",
        ));
    }
    if split_sizes.iter().sum::<usize>() != rows {
        return Err(ProcessGroupError::invalid_argument(
            "Split sizes doesn't match total dim 0 size",
        ));
    }
    Ok(())
}

/// Per-peer element counts of an all-to-all.
pub(crate) fn split_counts(split_sizes: &[usize], tensor: &Tensor, group_size: usize) -> Vec<usize> {
    let rows = tensor.shape().first().copied().unwrap_or(0);
    let row_len = if rows == 0 { 0 } else { tensor.numel() / rows };
    if split_sizes.is_empty() {
        return vec![tensor.numel() / group_size.max(1); group_size];
    }
    split_sizes.iter().map(|s| s * row_len).collect()
}

pub(crate) fn check_root_rank(op: &str, root: usize, group_size: usize) -> Result<()> {
    if root >= group_size {
        return Err(ProcessGroupError::invalid_argument(format!(
            "ProcessGroupNCCL::{op}: invalid root rank: {root}"
        )));
    }
    Ok(())
}

/// Every tensor must match `dtype` and `shape`.
pub(crate) fn check_type_and_sizes_match(
    op: &str,
    tensors: &[Tensor],
    dtype: ScalarType,
    shape: &[usize],
) -> Result<()> {
    for (i, tensor) in tensors.iter().enumerate() {
        if tensor.dtype() != dtype {
            return Err(ProcessGroupError::invalid_argument(format!(
                "ProcessGroupNCCL::{op}: invalid tensor type at index {i} (expected {dtype}, got {})",
                tensor.dtype()
            )));
        }
        if tensor.shape() != shape {
            return Err(ProcessGroupError::invalid_argument(format!(
                "ProcessGroupNCCL::{op}: invalid tensor size at index {i} (expected {shape:?}, got {:?})",
                tensor.shape()
            )));
        }
    }
    Ok(())
}

pub(crate) fn to_data_type(dtype: ScalarType, transport: &dyn Transport) -> Result<DataType> {
    let data_type = match dtype {
        ScalarType::Char => DataType::Int8,
        ScalarType::Byte | ScalarType::Bool => DataType::Uint8,
        ScalarType::Int => DataType::Int32,
        ScalarType::Long => DataType::Int64,
        ScalarType::Half => DataType::Float16,
        ScalarType::Float => DataType::Float32,
        ScalarType::Double => DataType::Float64,
        ScalarType::BFloat16 if transport.supports_bfloat16() => DataType::Bfloat16,
        ScalarType::BFloat16 | ScalarType::ComplexFloat | ScalarType::Float8E4M3 => {
            return Err(ProcessGroupError::type_mismatch(format!(
                "Input tensor data type is not supported for NCCL process group: {dtype}"
            )));
        }
    };
    Ok(data_type)
}

pub(crate) fn to_red_op(op: ReduceOp, dtype: ScalarType, version: TransportVersion) -> Result<RedOp> {
    if dtype == ScalarType::Bool {
        match op {
            // Boolean sum is a logical or.
            ReduceOp::Sum => return Ok(RedOp::Max),
            ReduceOp::Avg => {
                return Err(ProcessGroupError::type_mismatch(
                    "Cannot use ReduceOp.AVG with boolean inputs",
                ));
            }
            _ => {}
        }
    }
    match op {
        ReduceOp::Sum => Ok(RedOp::Sum),
        ReduceOp::Product => Ok(RedOp::Prod),
        ReduceOp::Min => Ok(RedOp::Min),
        ReduceOp::Max => Ok(RedOp::Max),
        ReduceOp::Avg => {
            if version < MIN_AVG_VERSION {
                return Err(ProcessGroupError::invalid_argument(format!(
                    "AVG requires NCCL 2.10+. The current version is {}.{}",
                    version.major, version.minor
                )));
            }
            Ok(RedOp::Avg)
        }
        ReduceOp::PremulSum(factor) => {
            if version < MIN_PREMUL_SUM_VERSION {
                return Err(ProcessGroupError::invalid_argument(
                    "PreMulSum requires NCCL>=2.11.1",
                ));
            }
            match dtype {
                ScalarType::Half | ScalarType::Float | ScalarType::Double => {
                    Ok(RedOp::PreMulSum(factor))
                }
                _ => Err(ProcessGroupError::type_mismatch(
                    "PreMulSum Data type must be half, float, or double",
                )),
            }
        }
        ReduceOp::BAnd | ReduceOp::BOr | ReduceOp::BXor => Err(
            ProcessGroupError::invalid_argument(format!("Cannot use ReduceOp.{op} with NCCL")),
        ),
    }
}
