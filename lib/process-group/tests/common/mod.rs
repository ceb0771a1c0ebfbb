// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runs simulated ranks of one group on scoped threads.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use dynamo_process_group::transport::sim::{SimFabric, SimTransport};
use dynamo_process_group::{
    Device, InMemoryStore, ProcessGroup, ProcessGroupConfig, ProcessGroupOptions,
    ProcessGroupOptionsBuilder, ScalarType, Tensor, TerminateHandler,
};

/// Everything one rank's test body can touch.
pub struct Rank<'a> {
    pub rank: usize,
    pub size: usize,
    pub pg: &'a ProcessGroup,
    pub transport: &'a SimTransport,
    pub store: &'a Arc<InMemoryStore>,
}

impl Rank<'_> {
    pub fn device(&self) -> Device {
        Device::cuda(self.rank as i16)
    }

    pub fn float(&self, values: Vec<f64>) -> Tensor {
        let n = values.len();
        Tensor::from_vec(self.device(), &[n], ScalarType::Float, values).unwrap()
    }

    pub fn zeros(&self, n: usize) -> Tensor {
        Tensor::zeros(self.device(), &[n], ScalarType::Float)
    }
}

/// Short intervals so watchdog-driven tests finish quickly.
pub fn fast_config() -> ProcessGroupConfig {
    ProcessGroupConfig {
        watchdog_interval_ms: 5,
        ..Default::default()
    }
}

/// A terminate handler that records messages instead of aborting the test binary.
pub fn recording_handler() -> (TerminateHandler, flume::Receiver<String>) {
    let (tx, rx) = flume::unbounded();
    let handler: TerminateHandler = Arc::new(move |msg: &str| {
        let _ = tx.send(msg.to_string());
    });
    (handler, rx)
}

/// Runs `body` on `size` ranks with `config`, returning each rank's result in rank order.
pub fn run_ranks<T, F>(size: usize, config: ProcessGroupConfig, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(Rank<'_>) -> T + Sync,
{
    let (handler, _rx) = recording_handler();
    run_ranks_with(
        size,
        |_| {
            ProcessGroupOptions::builder()
                .config(config.clone())
                .terminate_handler(handler.clone())
        },
        body,
    )
}

/// Like [`run_ranks`] with per-rank options.
pub fn run_ranks_with<T, O, F>(size: usize, options: O, body: F) -> Vec<T>
where
    T: Send,
    O: Fn(usize) -> ProcessGroupOptionsBuilder + Sync,
    F: Fn(Rank<'_>) -> T + Sync,
{
    dynamo_process_group::logging::init();
    let fabric = SimFabric::new();
    let store = Arc::new(InMemoryStore::new());
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let transport = fabric.transport();
                let (store, options, body) = (&store, &options, &body);
                s.spawn(move || {
                    let pg = ProcessGroup::new(
                        store.clone(),
                        rank,
                        size,
                        Arc::new(transport.clone()),
                        options(rank).build().unwrap(),
                    )
                    .unwrap();
                    body(Rank {
                        rank,
                        size,
                        pg: &pg,
                        transport: &transport,
                        store,
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Polls `f` until it holds or ten seconds pass.
pub fn eventually(mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
