// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamo Process Group
//!
//! One rank's handle on a group of peers running collective and point-to-point operations
//! over a pluggable transport. The group caches one communicator per device or peer pair,
//! returns a [`Work`] handle for every submission, and supervises outstanding work from a
//! watchdog thread watched in turn by a heartbeat monitor.
//!
//! [`transport::sim`] provides an in-process transport so ranks can be run as threads.

pub mod allocator;
pub mod comm_cache;
pub mod comm_registry;
pub mod config;
pub mod desync;
pub mod device;
pub mod error;
pub mod logging;
pub mod process_group;
pub mod store;
pub mod tensor;
pub mod trace;
pub mod transport;
pub mod types;
pub mod utils;
pub mod work;

mod monitor;
mod watchdog;

pub use config::{DebugLevel, ErrorHandlingMode, ProcessGroupConfig};
pub use device::{Device, Stream};
pub use error::{ErrorKind, ProcessGroupError, Result};
pub use process_group::{
    ProcessGroup, ProcessGroupOptions, ProcessGroupOptionsBuilder, TIMEOUT_DUMP_KEY,
    TerminateHandler,
};
pub use store::{InMemoryStore, PrefixStore, Store, StoreError};
pub use tensor::{ScalarType, Tensor};
pub use types::{
    AllToAllOptions, AllgatherOptions, AllreduceCoalescedOptions, AllreduceOptions,
    BarrierOptions, BroadcastOptions, GatherOptions, OpType, ReduceOp, ReduceOptions,
    ReduceScatterOptions, ScatterOptions,
};
pub use work::{Work, WorkFuture, WorkInfo};
