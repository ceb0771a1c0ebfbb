// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::slice;
use std::sync::Arc;

use common::{fast_config, recording_handler};
use dynamo_process_group::transport::sim::SimFabric;
use dynamo_process_group::{
    AllreduceOptions, Device, InMemoryStore, PrefixStore, ProcessGroup, ProcessGroupOptions,
    ScalarType, Store, Tensor,
};

/// Builds a two-rank parent group per thread, optionally runs one collective on it, then
/// creates a child group split from it and runs an allreduce on the child.
fn parent_and_child(warm_parent: bool) -> Vec<(u64, Vec<f64>)> {
    const SIZE: usize = 2;
    let fabric = SimFabric::new();
    let store = Arc::new(InMemoryStore::new());
    let (handler, _rx) = recording_handler();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..SIZE)
            .map(|rank| {
                let transport = Arc::new(fabric.transport());
                let store = store.clone();
                let handler = handler.clone();
                s.spawn(move || {
                    let device = Device::cuda(rank as i16);
                    let parent_store: Arc<dyn Store> =
                        Arc::new(PrefixStore::new("0", store.clone()));
                    let parent = Arc::new(
                        ProcessGroup::new(
                            parent_store,
                            rank,
                            SIZE,
                            transport.clone(),
                            ProcessGroupOptions::builder()
                                .config(fast_config())
                                .terminate_handler(handler.clone())
                                .build()
                                .unwrap(),
                        )
                        .unwrap(),
                    );
                    if warm_parent {
                        let t = Tensor::full(device, &[2], ScalarType::Float, 1.0);
                        parent
                            .allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                            .unwrap()
                            .wait(None)
                            .unwrap();
                    }

                    let child_store: Arc<dyn Store> = Arc::new(PrefixStore::new("1", store));
                    let child = ProcessGroup::new(
                        child_store,
                        rank,
                        SIZE,
                        transport,
                        ProcessGroupOptions::builder()
                            .config(fast_config())
                            .split_from(parent.clone())
                            .split_color(7)
                            .terminate_handler(handler)
                            .build()
                            .unwrap(),
                    )
                    .unwrap();

                    let t = Tensor::full(device, &[2], ScalarType::Float, (rank + 1) as f64);
                    child
                        .allreduce(slice::from_ref(&t), &AllreduceOptions::default())
                        .unwrap()
                        .wait(None)
                        .unwrap();
                    let values = t.to_vec();
                    child.shutdown().unwrap();
                    (parent.comm_split_count(), values)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn test_child_splits_parent_communicator() {
    for (splits, values) in parent_and_child(true) {
        assert_eq!(splits, 1);
        assert_eq!(values, vec![3.0, 3.0]);
    }
}

#[test]
fn test_child_initializes_when_parent_has_no_communicator() {
    for (splits, values) in parent_and_child(false) {
        assert_eq!(splits, 0);
        assert_eq!(values, vec![3.0, 3.0]);
    }
}
