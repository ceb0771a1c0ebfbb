// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Desync debugging.
//!
//! With desync debugging enabled every rank publishes the sequence number and op name of the
//! last collective it started and completed under `<backend>_<rank>_trace_start` / `_end`.
//! After a timeout the watchdog reads every rank's traces back and reports which ranks are
//! missing, lagging, mismatched or stuck inside the transport.

use std::collections::BTreeMap;

use crate::store::{Store, StoreError};

pub fn trace_key_start(backend: &str, rank: usize) -> String {
    format!("{backend}_{rank}_trace_start")
}

pub fn trace_key_end(backend: &str, rank: usize) -> String {
    format!("{backend}_{rank}_trace_end")
}

/// Publishes `seq,op_name` under `key`.
pub fn trace_update(
    store: &dyn Store,
    key: &str,
    seq: u64,
    op_name: &str,
) -> Result<(), StoreError> {
    store.set(key, format!("{seq},{op_name}").as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Trace {
    seq: u64,
    op_name: String,
}

fn parse_trace(raw: &[u8]) -> Option<Trace> {
    let text = std::str::from_utf8(raw).ok()?;
    let (seq, op_name) = text.split_once(',')?;
    Some(Trace {
        seq: seq.parse().ok()?,
        op_name: op_name.to_string(),
    })
}

fn read_trace(store: &dyn Store, key: &str) -> Result<Option<Trace>, StoreError> {
    if !store.check(&[key])? {
        return Ok(None);
    }
    Ok(parse_trace(&store.get(key)?))
}

/// Builds a human-readable report from every rank's published traces.
pub fn retrieve_desync_report(
    store: &dyn Store,
    backend: &str,
    rank: usize,
    world_size: usize,
) -> Result<String, StoreError> {
    let mut starts = BTreeMap::new();
    let mut ends = BTreeMap::new();
    let mut missing = Vec::new();
    for r in 0..world_size {
        match read_trace(store, &trace_key_start(backend, r))? {
            Some(trace) => {
                starts.insert(r, trace);
            }
            None => missing.push(r),
        }
        if let Some(trace) = read_trace(store, &trace_key_end(backend, r))? {
            ends.insert(r, trace);
        }
    }

    let mut report = format!("[Rank {rank}] desync report:");
    if !missing.is_empty() {
        report.push_str(&format!(
            "\n  Ranks {missing:?} have not joined any collective."
        ));
    }
    let Some(min_seq) = starts.values().map(|t| t.seq).min() else {
        return Ok(report);
    };

    let lagging: Vec<usize> = starts
        .iter()
        .filter(|(_, t)| t.seq == min_seq)
        .map(|(r, _)| *r)
        .collect();
    if lagging.len() < starts.len() {
        let leading: Vec<usize> = starts
            .keys()
            .copied()
            .filter(|r| !lagging.contains(r))
            .collect();
        report.push_str(&format!(
            "\n  Ranks {lagging:?} are lagging behind at collective #{min_seq}, \
             ranks {leading:?} have moved past it."
        ));
        return Ok(report);
    }

    let mut op_names: Vec<&str> = starts.values().map(|t| t.op_name.as_str()).collect();
    op_names.sort_unstable();
    op_names.dedup();
    if op_names.len() > 1 {
        let per_rank: Vec<String> = starts
            .iter()
            .map(|(r, t)| format!("rank {r}: {}", t.op_name))
            .collect();
        report.push_str(&format!(
            "\n  Collective #{min_seq} does not match across ranks ({}).",
            per_rank.join(", ")
        ));
        return Ok(report);
    }

    let op_name = op_names.first().copied().unwrap_or_default();
    let stuck: Vec<usize> = starts
        .keys()
        .copied()
        .filter(|r| ends.get(r).is_none_or(|t| t.seq < min_seq))
        .collect();
    if stuck.is_empty() {
        report.push_str(&format!(
            "\n  All ranks completed collective #{min_seq} ({op_name}); the hang is likely \
             outside the process group."
        ));
    } else {
        report.push_str(&format!(
            "\n  Ranks {stuck:?} started collective #{min_seq} ({op_name}) but have not \
             completed it; the transport is likely stuck or a network issue occurred."
        ));
    }
    Ok(report)
}
