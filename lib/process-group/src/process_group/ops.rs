// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Public collective and point-to-point operations.
//!
//! Each operation validates its arguments, translates dtype and reduce op, and hands a
//! primitive closure to the dispatcher. Validation happens first so a rejected call leaves the
//! sequence number untouched.

use std::sync::Arc;

use crate::device::{Device, Stream};
use crate::error::{ProcessGroupError, Result};
use crate::tensor::{ScalarType, Tensor};
use crate::transport::{
    GroupTicket, Primitive, RedOp, Transport, TransportError, TransportStatus, close_group,
    open_group,
};
use crate::types::{
    AllToAllOptions, AllgatherOptions, AllreduceCoalescedOptions, AllreduceOptions,
    BarrierOptions, BroadcastOptions, GatherOptions, OpType, ReduceOp, ReduceOptions,
    ReduceScatterOptions, ScatterOptions,
};
use crate::work::Work;

use super::ProcessGroup;
use super::checks::{self, check_single_tensor, single, to_data_type};
use super::dispatch::{OpMeta, no_hook};

/// Runs `body` between a group start and end.
fn grouped<B>(transport: &dyn Transport, body: B) -> Result<(), TransportError>
where
    B: FnOnce() -> Result<(), TransportError>,
{
    let ticket = GroupTicket::start(transport)?;
    body()?;
    match ticket.end()? {
        TransportStatus::Error(e) => Err(e),
        TransportStatus::Success | TransportStatus::InProgress => Ok(()),
    }
}

impl ProcessGroup {
    fn red_op(&self, op: ReduceOp, dtype: ScalarType) -> Result<RedOp> {
        checks::to_red_op(op, dtype, self.shared.transport.version())
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.shared.size {
            return Err(ProcessGroupError::invalid_argument(format!(
                "Invalid peer rank {peer} for a process group of size {}",
                self.shared.size
            )));
        }
        Ok(())
    }

    fn avoid_record_streams(&self) -> bool {
        self.shared.config.avoid_record_streams
    }

    fn allreduce_impl(
        &self,
        tensor: &Tensor,
        reduce_op: ReduceOp,
        meta: OpMeta,
    ) -> Result<Arc<Work>> {
        let dtype = to_data_type(tensor.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(reduce_op, tensor.dtype())?;
        self.shared.collective(
            tensor,
            tensor,
            meta,
            |input, output, comm, stream| {
                comm.issue(Primitive::AllReduce { input, output, dtype, op }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    /// In-place allreduce of a single tensor.
    pub fn allreduce(&self, tensors: &[Tensor], opts: &AllreduceOptions) -> Result<Arc<Work>> {
        let tensor = single(tensors)?;
        check_single_tensor(tensor, false)?;
        self.allreduce_impl(
            tensor,
            opts.reduce_op,
            OpMeta::new(OpType::Allreduce, "nccl:all_reduce", opts.timeout),
        )
    }

    /// Allreduce of a row-sparse tensor. The result is dense and available through
    /// [`Work::result`].
    pub fn allreduce_sparse(&self, tensors: &[Tensor], opts: &AllreduceOptions) -> Result<Arc<Work>> {
        let tensor = single(tensors)?;
        if !self.shared.transport.supports_sparse_reduce() {
            return Err(ProcessGroupError::not_implemented(
                "NCCL does not support all_reduce with sparse tensors. Please use dense tensors instead.",
            ));
        }
        let device = match tensor.device() {
            Some(device) if tensor.is_sparse() => device,
            _ => {
                return Err(ProcessGroupError::invalid_argument(
                    "allreduce_sparse expects a sparse device tensor",
                ));
            }
        };
        let dtype = to_data_type(tensor.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, tensor.dtype())?;
        let output = Tensor::zeros(device, tensor.shape(), tensor.dtype());
        self.shared.collective(
            tensor,
            &output,
            OpMeta::new(OpType::AllreduceSparse, "nccl:all_reduce_sparse", opts.timeout),
            |input, output, comm, stream| {
                let indices = input.sparse_indices().unwrap_or(&[]);
                comm.issue(
                    Primitive::SparseReduce {
                        values: input,
                        indices,
                        output,
                        dtype,
                        op,
                    },
                    stream,
                )
            },
            no_hook,
            no_hook,
        )
    }

    /// Allreduce of several same-dtype tensors in one transport group.
    pub fn allreduce_coalesced(
        &self,
        tensors: &[Tensor],
        opts: &AllreduceCoalescedOptions,
    ) -> Result<Arc<Work>> {
        checks::check_tensors_same_device(tensors)?;
        let first = &tensors[0];
        let dtype = to_data_type(first.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, first.dtype())?;
        self.shared.collective_coalesced(
            tensors,
            tensors,
            OpMeta::new(OpType::Coalesced, "nccl:allreduce_coalesced", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::AllReduce { input, output, dtype, op }, stream)
            },
        )
    }

    pub fn broadcast(&self, tensors: &[Tensor], opts: &BroadcastOptions) -> Result<Arc<Work>> {
        let tensor = single(tensors)?;
        check_single_tensor(tensor, false)?;
        let dtype = to_data_type(tensor.dtype(), self.shared.transport.as_ref())?;
        let root = opts.root_rank + opts.root_tensor;
        checks::check_root_rank("broadcast", root, self.shared.size)?;
        self.shared.collective(
            tensor,
            tensor,
            OpMeta::new(OpType::Broadcast, "nccl:broadcast", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::Broadcast { input, output, dtype, root }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    /// Out-of-place broadcast: the root sends `input`, every rank receives into `output`.
    pub fn broadcast_oop(
        &self,
        output: &Tensor,
        input: &Tensor,
        opts: &BroadcastOptions,
    ) -> Result<Arc<Work>> {
        check_single_tensor(output, false)?;
        check_single_tensor(input, false)?;
        if output.numel() != input.numel() {
            return Err(ProcessGroupError::invalid_argument(
                "Tensor input and output of _broadcast_oop must have the same number of elements ",
            ));
        }
        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let root = opts.root_rank + opts.root_tensor;
        checks::check_root_rank("_broadcast_oop", root, self.shared.size)?;
        self.shared.collective(
            input,
            output,
            OpMeta::new(OpType::Broadcast, "nccl:_broadcast_oop", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::Broadcast { input, output, dtype, root }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    pub fn reduce(&self, tensors: &[Tensor], opts: &ReduceOptions) -> Result<Arc<Work>> {
        let tensor = single(tensors)?;
        check_single_tensor(tensor, false)?;
        let dtype = to_data_type(tensor.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, tensor.dtype())?;
        let root = opts.root_rank + opts.root_tensor;
        checks::check_root_rank("reduce", root, self.shared.size)?;
        self.shared.collective(
            tensor,
            tensor,
            OpMeta::new(OpType::Reduce, "nccl:reduce", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::Reduce { input, output, dtype, op, root }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    /// Out-of-place reduce: the root receives the reduction of every rank's `input` in `output`.
    pub fn reduce_oop(&self, output: &Tensor, input: &Tensor, opts: &ReduceOptions) -> Result<Arc<Work>> {
        check_single_tensor(output, false)?;
        check_single_tensor(input, false)?;
        if output.numel() != input.numel() {
            return Err(ProcessGroupError::invalid_argument(
                "Tensor input and output of _reduce_oop must have the same number of elements ",
            ));
        }
        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, input.dtype())?;
        let root = opts.root_rank + opts.root_tensor;
        checks::check_root_rank("_reduce_oop", root, self.shared.size)?;
        self.shared.collective(
            input,
            output,
            OpMeta::new(OpType::Reduce, "nccl:_reduce_oop", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::Reduce { input, output, dtype, op, root }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    /// Gathers every rank's tensor into `output_lists[0]`.
    ///
    /// Same-size outputs go through one flattened buffer; uneven sizes fall back to a
    /// coalesced broadcast per rank.
    pub fn allgather(
        &self,
        output_lists: &[Vec<Tensor>],
        inputs: &[Tensor],
        opts: &AllgatherOptions,
    ) -> Result<Arc<Work>> {
        let input = single(inputs)?;
        check_single_tensor(input, false)?;
        let outputs = match output_lists {
            [outputs] => outputs,
            _ => return Err(ProcessGroupError::invalid_argument(checks::MULTI_DEVICE_ERROR_MSG)),
        };
        if outputs.len() != self.shared.size {
            return Err(ProcessGroupError::invalid_argument(format!(
                "allgather expects {} output tensors, got {}",
                self.shared.size,
                outputs.len()
            )));
        }
        for output in outputs {
            check_single_tensor(output, false)?;
        }

        if !checks::check_same_size(outputs) {
            return self.shared.coalesced(OpType::Allgather, || {
                for (i, output) in outputs.iter().enumerate() {
                    let source = if i == self.shared.rank { input } else { output };
                    let opts = BroadcastOptions {
                        root_rank: i,
                        root_tensor: 0,
                        timeout: opts.timeout,
                    };
                    self.broadcast_oop(output, source, &opts)?;
                }
                Ok(())
            });
        }

        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let flat = Tensor::new_like_flat(outputs)?;
        let slots = (0..outputs.len())
            .map(|j| flat.select(j))
            .collect::<Result<Vec<_>>>()?;
        let targets = outputs.clone();
        let avoid = self.avoid_record_streams();
        self.shared.collective(
            input,
            &flat,
            OpMeta::new(OpType::Allgather, "nccl:all_gather", opts.timeout),
            |input, output, comm, stream| {
                if !avoid {
                    output.record_stream(stream);
                }
                comm.issue(Primitive::AllGather { input, output, dtype }, stream)
            },
            no_hook,
            move |stream: &Stream, _work: &Work| {
                for (target, slot) in targets.iter().zip(&slots) {
                    if !avoid {
                        target.record_stream(stream);
                    }
                    target.copy_from_on(slot, stream);
                }
            },
        )
    }

    pub fn allgather_coalesced(
        &self,
        _output_lists: &[Vec<Tensor>],
        _inputs: &[Tensor],
        _opts: &AllgatherOptions,
    ) -> Result<Arc<Work>> {
        Err(ProcessGroupError::not_implemented(
            "ProcessGroupNCCL does not support allgather_coalesced",
        ))
    }

    /// One allgather per input/output pair, in a single transport group.
    pub fn allgather_into_tensor_coalesced(
        &self,
        outputs: &[Tensor],
        inputs: &[Tensor],
        opts: &AllgatherOptions,
    ) -> Result<Arc<Work>> {
        checks::check_tensors_same_device(inputs)?;
        checks::check_tensors_same_device(outputs)?;
        if inputs.len() != outputs.len() {
            return Err(ProcessGroupError::invalid_argument(
                "input and output tensor lists must have the same length",
            ));
        }
        let dtype = to_data_type(inputs[0].dtype(), self.shared.transport.as_ref())?;
        self.shared.collective_coalesced(
            inputs,
            outputs,
            OpMeta::new(OpType::Coalesced, "nccl:all_gather_into_tensor_coalesced", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::AllGather { input, output, dtype }, stream)
            },
        )
    }

    /// Allgather into one tensor whose size is `size` times the input.
    pub fn allgather_base(
        &self,
        output: &Tensor,
        input: &Tensor,
        opts: &AllgatherOptions,
    ) -> Result<Arc<Work>> {
        check_single_tensor(input, false)?;
        check_single_tensor(output, false)?;
        if input.dtype() != output.dtype() {
            return Err(ProcessGroupError::type_mismatch(
                "output tensor must have the same type as input tensor",
            ));
        }
        if input.numel() * self.shared.size != output.numel() {
            return Err(ProcessGroupError::invalid_argument(
                "output tensor size must be equal to world_size times input tensor size",
            ));
        }
        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let avoid = self.avoid_record_streams();
        self.shared.collective(
            input,
            output,
            OpMeta::new(OpType::AllgatherBase, "nccl:_all_gather_base", opts.timeout),
            |input, output, comm, stream| {
                if !avoid {
                    output.record_stream(stream);
                }
                comm.issue(Primitive::AllGather { input, output, dtype }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    /// Reduces `input_lists[0]` across ranks and scatters slot `rank` into `outputs[0]`.
    pub fn reduce_scatter(
        &self,
        outputs: &[Tensor],
        input_lists: &[Vec<Tensor>],
        opts: &ReduceScatterOptions,
    ) -> Result<Arc<Work>> {
        let output = single(outputs)?;
        check_single_tensor(output, false)?;
        let inputs = match input_lists {
            [inputs] => inputs,
            _ => return Err(ProcessGroupError::invalid_argument(checks::MULTI_DEVICE_ERROR_MSG)),
        };
        if inputs.len() != self.shared.size {
            return Err(ProcessGroupError::invalid_argument(format!(
                "reduce_scatter expects {} input tensors, got {}",
                self.shared.size,
                inputs.len()
            )));
        }
        for input in inputs {
            check_single_tensor(input, false)?;
        }

        if !checks::check_same_size(inputs) {
            return self.shared.coalesced(OpType::ReduceScatter, || {
                for (i, input) in inputs.iter().enumerate() {
                    let target = if i == self.shared.rank { output } else { input };
                    let opts = ReduceOptions {
                        reduce_op: opts.reduce_op,
                        root_rank: i,
                        root_tensor: 0,
                        timeout: opts.timeout,
                    };
                    self.reduce_oop(target, input, &opts)?;
                }
                Ok(())
            });
        }

        let dtype = to_data_type(output.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, output.dtype())?;
        let flat = Tensor::new_like_flat(inputs)?;
        let slots = (0..inputs.len())
            .map(|j| flat.select(j))
            .collect::<Result<Vec<_>>>()?;
        let sources = inputs.clone();
        let avoid = self.avoid_record_streams();
        self.shared.collective(
            &flat,
            output,
            OpMeta::new(OpType::ReduceScatter, "nccl:reduce_scatter", opts.timeout),
            |input, output, comm, stream| {
                if !avoid {
                    output.record_stream(stream);
                }
                comm.issue(Primitive::ReduceScatter { input, output, dtype, op }, stream)
            },
            move |stream: &Stream, work: &Work| {
                if avoid {
                    work.stash(&sources);
                }
                for (slot, source) in slots.iter().zip(&sources) {
                    if !avoid {
                        source.record_stream(stream);
                    }
                    slot.copy_from_on(source, stream);
                }
            },
            no_hook,
        )
    }

    /// Reduce-scatter from one tensor whose size is `size` times the output.
    pub fn reduce_scatter_base(
        &self,
        output: &Tensor,
        input: &Tensor,
        opts: &ReduceScatterOptions,
    ) -> Result<Arc<Work>> {
        check_single_tensor(input, false)?;
        check_single_tensor(output, false)?;
        if input.dtype() != output.dtype() {
            return Err(ProcessGroupError::type_mismatch(
                "input tensor must be the same type as the output tensor.",
            ));
        }
        if input.numel() != output.numel() * self.shared.size {
            return Err(ProcessGroupError::invalid_argument(
                "input tensor must be the same size as output size times world size",
            ));
        }
        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, input.dtype())?;
        let avoid = self.avoid_record_streams();
        self.shared.collective(
            input,
            output,
            OpMeta::new(OpType::ReduceScatterBase, "nccl:_reduce_scatter_base", opts.timeout),
            |input, output, comm, stream| {
                if !avoid {
                    output.record_stream(stream);
                }
                comm.issue(Primitive::ReduceScatter { input, output, dtype, op }, stream)
            },
            no_hook,
            no_hook,
        )
    }

    pub fn reduce_scatter_tensor_coalesced(
        &self,
        outputs: &[Tensor],
        inputs: &[Tensor],
        opts: &ReduceScatterOptions,
    ) -> Result<Arc<Work>> {
        checks::check_tensors_same_device(inputs)?;
        checks::check_tensors_same_device(outputs)?;
        if inputs.len() != outputs.len() {
            return Err(ProcessGroupError::invalid_argument(
                "input and output tensor lists must have the same length",
            ));
        }
        let dtype = to_data_type(inputs[0].dtype(), self.shared.transport.as_ref())?;
        let op = self.red_op(opts.reduce_op, inputs[0].dtype())?;
        self.shared.collective_coalesced(
            inputs,
            outputs,
            OpMeta::new(OpType::Coalesced, "nccl:reduce_scatter_tensor_coalesced", opts.timeout),
            |input, output, comm, stream| {
                comm.issue(Primitive::ReduceScatter { input, output, dtype, op }, stream)
            },
        )
    }

    /// One-element allreduce on the last device this group used (or a guessed one).
    ///
    /// Waiting on the returned work also synchronizes the current stream.
    pub fn barrier(&self, opts: &BarrierOptions) -> Result<Arc<Work>> {
        let device = match opts.device_ids.last() {
            Some(&index) => Device::cuda(index),
            None => match self.shared.cache.used_devices().last() {
                Some(&index) => Device::cuda(index),
                None => {
                    let device = self.shared.guess_device_for_rank();
                    tracing::info!(
                        "{}using GPU {} to perform barrier as devices used by this process are \
                         currently unknown. This can potentially cause a hang if this rank to GPU \
                         mapping is incorrect. Specify device_ids in the barrier options to force \
                         use of a particular device.",
                        self.shared.prefix,
                        device.index()
                    );
                    device
                }
            },
        };
        let tensor = Tensor::zeros(device, &[1], ScalarType::Byte);
        let work = self.allreduce_impl(
            &tensor,
            ReduceOp::Sum,
            OpMeta::new(OpType::Barrier, "nccl:all_reduce_barrier", opts.timeout),
        )?;
        work.set_barrier_tensor(tensor);
        Ok(work)
    }

    /// All-to-all over dim 0 of single tensors, evenly or with explicit split sizes.
    pub fn alltoall_base(
        &self,
        output: &Tensor,
        input: &Tensor,
        output_split_sizes: &[usize],
        input_split_sizes: &[usize],
        opts: &AllToAllOptions,
    ) -> Result<Arc<Work>> {
        check_single_tensor(output, true)?;
        check_single_tensor(input, true)?;
        let size = self.shared.size;
        checks::check_split_sizes(input_split_sizes, input, size)?;
        checks::check_split_sizes(output_split_sizes, output, size)?;
        let send_counts = checks::split_counts(input_split_sizes, input, size);
        let recv_counts = checks::split_counts(output_split_sizes, output, size);
        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let avoid = self.avoid_record_streams();
        self.shared.collective(
            input,
            output,
            OpMeta::new(OpType::AlltoallBase, "nccl:all_to_all", opts.timeout),
            |input, output, comm, stream| {
                if !avoid {
                    output.record_stream(stream);
                }
                comm.issue(
                    Primitive::AllToAll {
                        input,
                        output,
                        dtype,
                        send_counts,
                        recv_counts,
                    },
                    stream,
                )
            },
            no_hook,
            no_hook,
        )
    }

    /// All-to-all over tensor lists: `inputs[r]` goes to rank `r`, `outputs[r]` comes from it.
    pub fn alltoall(
        &self,
        outputs: &[Tensor],
        inputs: &[Tensor],
        opts: &AllToAllOptions,
    ) -> Result<Arc<Work>> {
        let size = self.shared.size;
        if outputs.len() != size || inputs.len() != size {
            return Err(ProcessGroupError::invalid_argument(format!(
                "alltoall requires {size} input and {size} output tensors"
            )));
        }
        let device = check_single_tensor(&outputs[0], true)?;
        for tensor in outputs.iter().chain(inputs) {
            if check_single_tensor(tensor, true)? != device {
                return Err(ProcessGroupError::invalid_argument(
                    "Tensors must be on the same device",
                ));
            }
        }
        let dtype = to_data_type(inputs[0].dtype(), self.shared.transport.as_ref())?;
        let avoid = self.avoid_record_streams();
        let transport = self.shared.transport.as_ref();
        self.shared.collective(
            &inputs[0],
            &outputs[0],
            OpMeta::new(OpType::Alltoall, "nccl:all_to_all", opts.timeout),
            |_, _, comm, stream| {
                grouped(transport, || {
                    for (peer, (input, output)) in inputs.iter().zip(outputs).enumerate() {
                        comm.issue(Primitive::Send { tensor: input, dtype, peer }, stream)?;
                        comm.issue(Primitive::Recv { tensor: output, dtype, peer }, stream)?;
                    }
                    Ok(())
                })
            },
            |stream: &Stream, work: &Work| {
                if avoid {
                    work.stash(inputs);
                    work.stash(outputs);
                } else {
                    for tensor in inputs.iter().chain(outputs) {
                        tensor.record_stream(stream);
                    }
                }
            },
            no_hook,
        )
    }

    /// Gathers every rank's tensor on the root into `output_lists[0]`.
    ///
    /// Non-root ranks pass an empty `output_lists`.
    pub fn gather(
        &self,
        output_lists: &[Vec<Tensor>],
        inputs: &[Tensor],
        opts: &GatherOptions,
    ) -> Result<Arc<Work>> {
        const OP: &str = "gather";
        let (rank, size, root) = (self.shared.rank, self.shared.size, opts.root_rank);
        checks::check_root_rank(OP, root, size)?;
        let input = single(inputs)?;
        check_single_tensor(input, false)?;

        let outputs: &[Tensor] = if rank == root {
            let outputs = match output_lists {
                [outputs] => outputs,
                _ => {
                    return Err(ProcessGroupError::invalid_argument(format!(
                        "ProcessGroupNCCL::{OP}: requires a single-element output list containing \
                         a list with {size} tensors."
                    )));
                }
            };
            if outputs.len() != size {
                return Err(ProcessGroupError::invalid_argument(format!(
                    "ProcessGroupNCCL::{OP}: Incorrect output list size {}. Output list size \
                     should be {size}, same as size of the process group.",
                    outputs.len()
                )));
            }
            checks::check_type_and_sizes_match(OP, outputs, input.dtype(), input.shape())?;
            outputs
        } else {
            if !output_lists.is_empty() {
                return Err(ProcessGroupError::invalid_argument(format!(
                    "ProcessGroupNCCL::{OP}: requires empty output on non-root"
                )));
            }
            &[]
        };

        let dtype = to_data_type(input.dtype(), self.shared.transport.as_ref())?;
        let avoid = self.avoid_record_streams();
        let transport = self.shared.transport.as_ref();
        let output = outputs.first().unwrap_or(input);
        self.shared.collective(
            input,
            output,
            OpMeta::new(OpType::Gather, "nccl:gather", opts.timeout),
            |input, _, comm, stream| {
                grouped(transport, || {
                    if rank != root {
                        return comm.issue(Primitive::Send { tensor: input, dtype, peer: root }, stream);
                    }
                    for (peer, output) in outputs.iter().enumerate() {
                        if !avoid {
                            output.record_stream(stream);
                        }
                        if peer == root {
                            output.copy_from_on(input, stream);
                        } else {
                            comm.issue(Primitive::Recv { tensor: output, dtype, peer }, stream)?;
                        }
                    }
                    Ok(())
                })
            },
            |_: &Stream, work: &Work| {
                if avoid {
                    work.stash(outputs);
                }
            },
            no_hook,
        )
    }

    /// Scatters `input_lists[0]` from the root, one tensor per rank, into `outputs[0]`.
    ///
    /// Non-root ranks pass an empty `input_lists`.
    pub fn scatter(
        &self,
        outputs: &[Tensor],
        input_lists: &[Vec<Tensor>],
        opts: &ScatterOptions,
    ) -> Result<Arc<Work>> {
        const OP: &str = "scatter";
        let (rank, size, root) = (self.shared.rank, self.shared.size, opts.root_rank);
        checks::check_root_rank(OP, root, size)?;
        let output = single(outputs)?;
        check_single_tensor(output, false)?;

        let inputs: &[Tensor] = if rank == root {
            let inputs = match input_lists {
                [inputs] => inputs,
                _ => {
                    return Err(ProcessGroupError::invalid_argument(format!(
                        "ProcessGroupNCCL::{OP}: requires a single-element input list containing \
                         a list with {size} tensors"
                    )));
                }
            };
            if inputs.len() != size {
                return Err(ProcessGroupError::invalid_argument(format!(
                    "ProcessGroupNCCL::{OP}: Incorrect input list size {}. Input list size should \
                     be {size}, same as size of the process group.",
                    inputs.len()
                )));
            }
            checks::check_type_and_sizes_match(OP, inputs, output.dtype(), output.shape())?;
            inputs
        } else {
            if !input_lists.is_empty() {
                return Err(ProcessGroupError::invalid_argument(format!(
                    "ProcessGroupNCCL::{OP}: requires empty input on non-root"
                )));
            }
            &[]
        };

        let dtype = to_data_type(output.dtype(), self.shared.transport.as_ref())?;
        let avoid = self.avoid_record_streams();
        let transport = self.shared.transport.as_ref();
        self.shared.collective(
            output,
            output,
            OpMeta::new(OpType::Scatter, "nccl:scatter", opts.timeout),
            |_, output, comm, stream| {
                grouped(transport, || {
                    if rank != root {
                        return comm.issue(Primitive::Recv { tensor: output, dtype, peer: root }, stream);
                    }
                    for (peer, input) in inputs.iter().enumerate() {
                        if !avoid {
                            input.record_stream(stream);
                        }
                        if peer == root {
                            output.copy_from_on(input, stream);
                        } else {
                            comm.issue(Primitive::Send { tensor: input, dtype, peer }, stream)?;
                        }
                    }
                    Ok(())
                })
            },
            |_: &Stream, work: &Work| {
                if avoid {
                    work.stash(inputs);
                }
            },
            no_hook,
        )
    }

    /// Sends to `dst_rank`. Returns `None` inside a coalescing region.
    pub fn send(&self, tensors: &[Tensor], dst_rank: usize) -> Result<Option<Arc<Work>>> {
        let tensor = single(tensors)?;
        check_single_tensor(tensor, true)?;
        self.check_peer(dst_rank)?;
        let dtype = to_data_type(tensor.dtype(), self.shared.transport.as_ref())?;
        let name = format!("nccl:send {}->{dst_rank}", self.shared.rank);
        self.shared.point_to_point(
            tensor,
            dst_rank,
            OpMeta::new(OpType::Send, name, None),
            |tensor, comm, stream, peer| comm.issue(Primitive::Send { tensor, dtype, peer }, stream),
        )
    }

    /// Receives from `src_rank`. Returns `None` inside a coalescing region.
    pub fn recv(&self, tensors: &[Tensor], src_rank: usize) -> Result<Option<Arc<Work>>> {
        let tensor = single(tensors)?;
        check_single_tensor(tensor, true)?;
        self.check_peer(src_rank)?;
        let dtype = to_data_type(tensor.dtype(), self.shared.transport.as_ref())?;
        let name = format!("nccl:recv {}<-{src_rank}", self.shared.rank);
        self.shared.point_to_point(
            tensor,
            src_rank,
            OpMeta::new(OpType::Recv, name, None),
            |tensor, comm, stream, peer| comm.issue(Primitive::Recv { tensor, dtype, peer }, stream),
        )
    }

    pub fn recv_anysource(&self, _tensors: &[Tensor]) -> Result<Option<Arc<Work>>> {
        Err(ProcessGroupError::not_implemented(
            "ProcessGroupNCCL does not support recvAnysource",
        ))
    }

    /// Opens a transport group on the calling thread. Point-to-point ops issued until
    /// [`ProcessGroup::group_end`] share the group's device communicator.
    pub fn group_start(&self) -> Result<()> {
        open_group(self.shared.transport.as_ref())?;
        Ok(())
    }

    pub fn group_end(&self) -> Result<()> {
        match close_group(self.shared.transport.as_ref())? {
            TransportStatus::Error(e) => Err(ProcessGroupError::transport(&e, None)),
            TransportStatus::Success | TransportStatus::InProgress => Ok(()),
        }
    }

    /// Opens a coalescing region on this group.
    pub fn start_coalescing(&self) -> Result<()> {
        self.shared.start_coalescing()
    }

    /// Closes the coalescing region. Returns `None` when nothing was issued inside it.
    pub fn end_coalescing(&self, op_type: OpType) -> Result<Option<Arc<Work>>> {
        self.shared.end_coalescing(op_type)
    }
}
