// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device tensor handle consumed by the collectives.
//!
//! A [`Tensor`] is a view (offset, shape, layout flags) over a reference-counted storage. Device
//! storages own one allocator segment each and remember the streams they were used on, so the
//! segment is not recycled while transport work still reads it. Element values are kept as
//! `f64` regardless of dtype.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::allocator::CachingAllocator;
use crate::device::{self, Device, Stream};
use crate::error::{ProcessGroupError, Result};

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Byte,
    Char,
    Int,
    Long,
    Half,
    Float,
    Double,
    BFloat16,
    Bool,
    ComplexFloat,
    Float8E4M3,
}

impl ScalarType {
    pub fn element_size(&self) -> usize {
        match self {
            ScalarType::Byte | ScalarType::Char | ScalarType::Bool | ScalarType::Float8E4M3 => 1,
            ScalarType::Half | ScalarType::BFloat16 => 2,
            ScalarType::Int | ScalarType::Float => 4,
            ScalarType::Long | ScalarType::Double | ScalarType::ComplexFloat => 8,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            ScalarType::Half
                | ScalarType::Float
                | ScalarType::Double
                | ScalarType::BFloat16
                | ScalarType::Float8E4M3
        )
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Strided,
    Sparse,
}

struct Storage {
    id: u64,
    device: Option<Device>,
    addr: Option<u64>,
    data: RwLock<Vec<f64>>,
    stream_uses: Mutex<Vec<Stream>>,
}

impl Storage {
    fn new(device: Option<Device>, dtype: ScalarType, data: Vec<f64>) -> Arc<Self> {
        let addr = device.map(|d| CachingAllocator::global().allocate(d, data.len() * dtype.element_size()));
        Arc::new(Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            device,
            addr,
            data: RwLock::new(data),
            stream_uses: Mutex::new(Vec::new()),
        })
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(addr) = self.addr {
            let uses = std::mem::take(&mut *self.stream_uses.lock());
            CachingAllocator::global().free(addr, &uses);
        }
    }
}

#[derive(Clone)]
pub struct Tensor {
    storage: Arc<Storage>,
    offset: usize,
    shape: Vec<usize>,
    dtype: ScalarType,
    layout: Layout,
    contiguous: bool,
    sparse_rows: Option<Arc<Vec<usize>>>,
}

impl Tensor {
    /// Dense device tensor from values.
    pub fn from_vec(device: Device, shape: &[usize], dtype: ScalarType, data: Vec<f64>) -> Result<Self> {
        Self::build(Some(device), shape, dtype, data)
    }

    /// Dense host tensor. Collectives reject these.
    pub fn host(shape: &[usize], dtype: ScalarType, data: Vec<f64>) -> Result<Self> {
        Self::build(None, shape, dtype, data)
    }

    fn build(device: Option<Device>, shape: &[usize], dtype: ScalarType, data: Vec<f64>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(ProcessGroupError::invalid_argument(format!(
                "shape {shape:?} holds {numel} elements but {} values were given",
                data.len()
            )));
        }
        Ok(Self {
            storage: Storage::new(device, dtype, data),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
            layout: Layout::Strided,
            contiguous: true,
            sparse_rows: None,
        })
    }

    pub fn full(device: Device, shape: &[usize], dtype: ScalarType, value: f64) -> Self {
        let numel = shape.iter().product();
        Self {
            storage: Storage::new(Some(device), dtype, vec![value; numel]),
            offset: 0,
            shape: shape.to_vec(),
            dtype,
            layout: Layout::Strided,
            contiguous: true,
            sparse_rows: None,
        }
    }

    pub fn zeros(device: Device, shape: &[usize], dtype: ScalarType) -> Self {
        Self::full(device, shape, dtype, 0.0)
    }

    /// Row-sparse tensor with `dense_shape`: only `rows` are present, `values` holds them in order.
    pub fn sparse_rows(
        device: Device,
        dense_shape: &[usize],
        dtype: ScalarType,
        rows: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let row_len: usize = dense_shape.iter().skip(1).product();
        let num_rows = dense_shape.first().copied().unwrap_or(0);
        if rows.len() * row_len != values.len() || rows.iter().any(|r| *r >= num_rows) {
            return Err(ProcessGroupError::invalid_argument(format!(
                "sparse rows {rows:?} do not match dense shape {dense_shape:?} with {} values",
                values.len()
            )));
        }
        Ok(Self {
            storage: Storage::new(Some(device), dtype, values),
            offset: 0,
            shape: dense_shape.to_vec(),
            dtype,
            layout: Layout::Sparse,
            contiguous: true,
            sparse_rows: Some(Arc::new(rows)),
        })
    }

    /// Uninitialized-equivalent tensor with the same metadata.
    pub fn empty_like(&self) -> Result<Self> {
        let device = self.device_or_err()?;
        Ok(Self::zeros(device, &self.shape, self.dtype))
    }

    /// `[tensors.len(), ...shape]` buffer on the first tensor's device.
    pub fn new_like_flat(tensors: &[Tensor]) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| ProcessGroupError::invalid_argument("Received an empty list"))?;
        let device = first.device_or_err()?;
        let mut shape = vec![tensors.len()];
        shape.extend_from_slice(&first.shape);
        Ok(Self::zeros(device, &shape, first.dtype))
    }

    fn device_or_err(&self) -> Result<Device> {
        self.device()
            .ok_or_else(|| ProcessGroupError::invalid_argument("Tensors must be CUDA and dense"))
    }

    /// View of `self[index]` along dim 0.
    pub fn select(&self, index: usize) -> Result<Self> {
        let rows = self.shape.first().copied().unwrap_or(0);
        if index >= rows {
            return Err(ProcessGroupError::invalid_argument(format!(
                "index {index} is out of bounds for dimension 0 with size {rows}"
            )));
        }
        let inner: usize = self.shape.iter().skip(1).product();
        Ok(Self {
            storage: self.storage.clone(),
            offset: self.offset + index * inner,
            shape: self.shape[1..].to_vec(),
            dtype: self.dtype,
            layout: self.layout,
            contiguous: self.contiguous,
            sparse_rows: None,
        })
    }

    /// Transposed view of a 2-D tensor.
    pub fn transpose(&self) -> Self {
        let mut shape = self.shape.clone();
        shape.reverse();
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            shape,
            dtype: self.dtype,
            layout: self.layout,
            contiguous: self.shape.len() < 2 || self.shape.iter().filter(|d| **d > 1).count() < 2,
            sparse_rows: None,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> ScalarType {
        self.dtype
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn device(&self) -> Option<Device> {
        self.storage.device
    }

    pub fn is_cuda(&self) -> bool {
        self.storage.device.is_some()
    }

    pub fn is_sparse(&self) -> bool {
        self.layout == Layout::Sparse
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn storage_id(&self) -> u64 {
        self.storage.id
    }

    pub fn data_ptr(&self) -> u64 {
        self.storage.addr.unwrap_or(0) + (self.offset * self.dtype.element_size()) as u64
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.element_size()
    }

    pub fn same_size(&self, other: &Tensor) -> bool {
        self.shape == other.shape
    }

    /// Row indices of a sparse tensor.
    pub fn sparse_indices(&self) -> Option<&[usize]> {
        self.sparse_rows.as_deref().map(|r| r.as_slice())
    }

    /// Row length of a sparse tensor (elements per present row).
    pub fn sparse_row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Tells the allocator this storage is in use on `stream`.
    pub fn record_stream(&self, stream: &Stream) {
        let mut uses = self.storage.stream_uses.lock();
        if !uses.iter().any(|s| s == stream) {
            uses.push(stream.clone());
        }
    }

    /// Copies `src` into `self` as work on `stream`.
    pub fn copy_from_on(&self, src: &Tensor, stream: &Stream) {
        let dst = self.clone();
        let src = src.clone();
        device::launch(stream, move || dst.write(&src.read()));
    }

    /// Values as seen by the host after the calling thread's current stream has drained.
    pub fn to_vec(&self) -> Vec<f64> {
        if let Some(device) = self.device() {
            device::current_stream(device).synchronize();
        }
        self.read()
    }

    /// Raw read without stream ordering.
    pub(crate) fn read(&self) -> Vec<f64> {
        let data = self.storage.data.read();
        let len = match self.layout {
            Layout::Strided => self.numel(),
            Layout::Sparse => data.len(),
        };
        data[self.offset..self.offset + len].to_vec()
    }

    /// Raw write without stream ordering. Extra values are ignored, missing ones leave the
    /// tail untouched.
    pub(crate) fn write(&self, values: &[f64]) {
        let mut data = self.storage.data.write();
        let len = self.numel().min(values.len());
        data[self.offset..self.offset + len].copy_from_slice(&values[..len]);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device())
            .field("layout", &self.layout)
            .field("contiguous", &self.contiguous)
            .finish()
    }
}
