// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flight recorder and debug-info sink.
//!
//! The [`FlightRecorder`] is a process-wide ring buffer with one entry per enqueued operation.
//! Entries hold the operation's start and end events so their state can be evaluated at dump
//! time. The watchdog retires an entry once its work completes. Dumps are JSON and go to the
//! registered [`DebugInfoWriter`], or to a per-rank file by default.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

use crate::device::Event;
use crate::tensor::Tensor;

/// Dump format version.
pub const DUMP_VERSION: &str = "2.1";

static RECORDER: Lazy<FlightRecorder> = Lazy::new(FlightRecorder::default);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Scheduled,
    Started,
    Completed,
}

/// Metadata for one recorded operation.
#[derive(Debug, Clone)]
pub struct RecordSpec<'a> {
    pub pg_id: usize,
    pub pg_name: &'a str,
    pub collective_seq_id: u64,
    pub p2p_seq_id: u64,
    pub op_id: u64,
    pub profiling_name: String,
    pub inputs: &'a [Tensor],
    pub outputs: &'a [Tensor],
    pub start: Option<&'a Event>,
    pub end: Option<&'a Event>,
    pub timeout: Duration,
    pub is_p2p: bool,
}

struct Entry {
    id: u64,
    pg_id: usize,
    pg_name: String,
    collective_seq_id: u64,
    p2p_seq_id: u64,
    op_id: u64,
    profiling_name: String,
    time_created_ns: i64,
    input_sizes: Vec<Vec<usize>>,
    output_sizes: Vec<Vec<usize>>,
    input_dtypes: Vec<String>,
    output_dtypes: Vec<String>,
    start: Option<Event>,
    end: Option<Event>,
    timeout_ms: u64,
    is_p2p: bool,
    retired: bool,
    duration_ms: Option<f64>,
}

impl Entry {
    fn state(&self) -> EntryState {
        let reached = |e: &Option<Event>| e.as_ref().is_some_and(|e| e.is_recorded() && e.query());
        if reached(&self.end) {
            EntryState::Completed
        } else if reached(&self.start) {
            EntryState::Started
        } else {
            EntryState::Scheduled
        }
    }

    fn to_dump(&self) -> DumpEntry {
        DumpEntry {
            record_id: self.id,
            pg_id: self.pg_id,
            process_group: (self.pg_name.clone(), String::new()),
            collective_seq_id: self.collective_seq_id,
            p2p_seq_id: self.p2p_seq_id,
            op_id: self.op_id,
            profiling_name: self.profiling_name.clone(),
            time_created_ns: self.time_created_ns,
            input_sizes: self.input_sizes.clone(),
            output_sizes: self.output_sizes.clone(),
            input_dtypes: self.input_dtypes.clone(),
            output_dtypes: self.output_dtypes.clone(),
            state: self.state(),
            timeout_ms: self.timeout_ms,
            is_p2p: self.is_p2p,
            retired: self.retired,
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpEntry {
    pub record_id: u64,
    pub pg_id: usize,
    pub process_group: (String, String),
    pub collective_seq_id: u64,
    pub p2p_seq_id: u64,
    pub op_id: u64,
    pub profiling_name: String,
    pub time_created_ns: i64,
    pub input_sizes: Vec<Vec<usize>>,
    pub output_sizes: Vec<Vec<usize>>,
    pub input_dtypes: Vec<String>,
    pub output_dtypes: Vec<String>,
    pub state: EntryState,
    pub timeout_ms: u64,
    pub is_p2p: bool,
    pub retired: bool,
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dump {
    pub version: &'static str,
    pub pg_config: BTreeMap<String, Vec<usize>>,
    pub entries: Vec<DumpEntry>,
    pub comm_state: BTreeMap<String, HashMap<String, String>>,
}

#[derive(Default)]
struct RecorderState {
    capacity: usize,
    entries: Vec<Entry>,
    next: usize,
    id: u64,
    pg_config: BTreeMap<String, Vec<usize>>,
}

#[derive(Default)]
pub struct FlightRecorder {
    state: Mutex<RecorderState>,
}

impl FlightRecorder {
    pub fn global() -> &'static FlightRecorder {
        &RECORDER
    }

    /// Grows the ring buffer to at least `capacity` entries. Recording is disabled while the
    /// capacity is zero.
    pub fn ensure_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        if capacity > state.capacity {
            if state.entries.len() == state.capacity {
                // full ring: rotate so the oldest entry comes first before appending
                let next = state.next;
                state.entries.rotate_left(next);
                state.next = 0;
            }
            state.capacity = capacity;
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity() > 0
    }

    /// Records an operation. Returns the trace id, or `None` when recording is disabled.
    pub fn record(&self, spec: RecordSpec<'_>) -> Option<u64> {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            return None;
        }
        let id = state.id;
        state.id += 1;
        let entry = Entry {
            id,
            pg_id: spec.pg_id,
            pg_name: spec.pg_name.to_string(),
            collective_seq_id: spec.collective_seq_id,
            p2p_seq_id: spec.p2p_seq_id,
            op_id: spec.op_id,
            profiling_name: spec.profiling_name,
            time_created_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            input_sizes: spec.inputs.iter().map(|t| t.shape().to_vec()).collect(),
            output_sizes: spec.outputs.iter().map(|t| t.shape().to_vec()).collect(),
            input_dtypes: spec.inputs.iter().map(|t| t.dtype().to_string()).collect(),
            output_dtypes: spec.outputs.iter().map(|t| t.dtype().to_string()).collect(),
            start: spec.start.cloned(),
            end: spec.end.cloned(),
            timeout_ms: spec.timeout.as_millis() as u64,
            is_p2p: spec.is_p2p,
            retired: false,
            duration_ms: None,
        };
        if state.entries.len() < state.capacity {
            state.entries.push(entry);
            state.next = state.entries.len() % state.capacity;
        } else {
            let next = state.next;
            state.entries[next] = entry;
            state.next = (next + 1) % state.capacity;
        }
        Some(id)
    }

    /// Marks the entry retired. Ids that have been overwritten are ignored.
    pub fn retire_id(&self, id: Option<u64>, compute_duration: bool) {
        let Some(id) = id else {
            return;
        };
        let mut state = self.state.lock();
        let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) else {
            return;
        };
        if compute_duration {
            if let (Some(start), Some(end)) = (&entry.start, &entry.end) {
                entry.duration_ms = start
                    .elapsed_time(end)
                    .map(|d| d.as_secs_f64() * 1000.0);
            }
        }
        entry.retired = true;
        // events are no longer needed once retired
        entry.start = None;
        entry.end = None;
    }

    pub fn record_pg_ranks(&self, uid: usize, ranks: Vec<usize>) {
        self.state.lock().pg_config.insert(uid.to_string(), ranks);
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<DumpEntry> {
        let state = self.state.lock();
        let (newer, older) = state.entries.split_at(state.next.min(state.entries.len()));
        older.iter().chain(newer).map(Entry::to_dump).collect()
    }

    pub fn dump(&self, comm_state: BTreeMap<String, HashMap<String, String>>) -> Dump {
        let pg_config = self.state.lock().pg_config.clone();
        Dump {
            version: DUMP_VERSION,
            pg_config,
            entries: self.entries(),
            comm_state,
        }
    }

    pub fn dump_json(
        &self,
        comm_state: BTreeMap<String, HashMap<String, String>>,
    ) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&self.dump(comm_state)).context("serializing flight recorder dump")
    }
}

/// Destination for debug dumps.
pub trait DebugInfoWriter: Send + Sync {
    fn write(&self, blob: &[u8]) -> anyhow::Result<()>;
}

/// Writes to `<prefix><rank>`.
pub struct FileDebugInfoWriter {
    path: PathBuf,
}

impl FileDebugInfoWriter {
    pub fn new(prefix: &str, rank: usize) -> Self {
        Self {
            path: PathBuf::from(format!("{prefix}{rank}")),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl DebugInfoWriter for FileDebugInfoWriter {
    fn write(&self, blob: &[u8]) -> anyhow::Result<()> {
        std::fs::write(&self.path, blob)
            .with_context(|| format!("writing debug info to {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "finished writing debug info");
        Ok(())
    }
}

#[derive(Default)]
struct WriterSlot {
    writer: Option<Arc<dyn DebugInfoWriter>>,
    registered: bool,
}

static WRITER: Lazy<Mutex<WriterSlot>> = Lazy::new(|| Mutex::new(WriterSlot::default()));

/// Replaces the default file writer. Allowed once per process.
pub fn register_debug_info_writer(writer: Arc<dyn DebugInfoWriter>) -> anyhow::Result<()> {
    let mut slot = WRITER.lock();
    if slot.registered {
        anyhow::bail!("a debug info writer has already been registered");
    }
    slot.writer = Some(writer);
    slot.registered = true;
    Ok(())
}

/// The registered writer, or a file writer for `rank` created on first use.
pub fn debug_info_writer(prefix: &str, rank: usize) -> Arc<dyn DebugInfoWriter> {
    let mut slot = WRITER.lock();
    slot.writer
        .get_or_insert_with(|| Arc::new(FileDebugInfoWriter::new(prefix, rank)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Completion, Device, stream_from_pool};
    use crate::tensor::ScalarType;

    fn record_spec<'a>(inputs: &'a [Tensor], start: Option<&'a Event>, end: Option<&'a Event>) -> RecordSpec<'a> {
        RecordSpec {
            pg_id: 0,
            pg_name: "0",
            collective_seq_id: 1,
            p2p_seq_id: 0,
            op_id: 1,
            profiling_name: "nccl:all_reduce".to_string(),
            inputs,
            outputs: inputs,
            start,
            end,
            timeout: Duration::from_secs(1),
            is_p2p: false,
        }
    }

    #[test]
    fn test_disabled_recorder_returns_none() {
        let recorder = FlightRecorder::default();
        assert!(recorder.record(record_spec(&[], None, None)).is_none());
    }

    #[test]
    fn test_ring_keeps_newest_entries() {
        let recorder = FlightRecorder::default();
        recorder.ensure_capacity(2);
        let ids: Vec<u64> = (0..3)
            .filter_map(|_| recorder.record(record_spec(&[], None, None)))
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        let kept: Vec<u64> = recorder.entries().iter().map(|e| e.record_id).collect();
        assert_eq!(kept, vec![1, 2]);

        recorder.ensure_capacity(3);
        recorder.record(record_spec(&[], None, None));
        let kept: Vec<u64> = recorder.entries().iter().map(|e| e.record_id).collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn test_state_follows_events_and_retire() {
        let recorder = FlightRecorder::default();
        recorder.ensure_capacity(4);
        let stream = stream_from_pool(Device::cuda(0), false);
        let tensor = Tensor::zeros(Device::cuda(0), &[2, 2], ScalarType::Float);

        let start = Event::new(true);
        let end = Event::new(true);
        start.record(&stream);
        let op = Completion::new();
        stream.enqueue(op.clone());
        end.record(&stream);

        let inputs = [tensor];
        let id = recorder.record(record_spec(&inputs, Some(&start), Some(&end)));
        let entry = &recorder.entries()[0];
        assert_eq!(entry.state, EntryState::Started);
        assert_eq!(entry.input_sizes, vec![vec![2, 2]]);
        assert_eq!(entry.input_dtypes, vec!["Float".to_string()]);

        op.complete();
        assert_eq!(recorder.entries()[0].state, EntryState::Completed);

        recorder.retire_id(id, true);
        let entry = &recorder.entries()[0];
        assert!(entry.retired);
        assert!(entry.duration_ms.is_some());
        recorder.retire_id(Some(99), true);
    }

    #[test]
    fn test_dump_json_shape() {
        let recorder = FlightRecorder::default();
        recorder.ensure_capacity(1);
        recorder.record_pg_ranks(0, vec![0, 1]);
        recorder.record(record_spec(&[], None, None));
        let comm_state = BTreeMap::from([(
            "ab".to_string(),
            HashMap::from([("rank".to_string(), "0".to_string())]),
        )]);
        let blob = recorder.dump_json(comm_state).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        assert_eq!(value["version"], DUMP_VERSION);
        assert_eq!(value["pg_config"]["0"], serde_json::json!([0, 1]));
        assert_eq!(value["entries"][0]["state"], "scheduled");
        assert_eq!(value["comm_state"]["ab"]["rank"], "0");
    }

    #[test]
    fn test_file_writer_appends_rank() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/trace_", dir.path().display());
        let writer = FileDebugInfoWriter::new(&prefix, 3);
        writer.write(b"{}").unwrap();
        assert_eq!(std::fs::read(dir.path().join("trace_3")).unwrap(), b"{}");
    }
}
