// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Runs `f` on a detached thread and waits up to `timeout` for its result.
///
/// On timeout the thread keeps running in the background and its result is dropped.
pub fn run_with_timeout<T, F>(name: &str, timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = flume::bounded(1);
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(f());
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, name, "failed to spawn helper thread");
        return None;
    }
    match rx.recv_timeout(timeout) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, ?timeout, "helper thread did not finish in time");
            None
        }
    }
}
