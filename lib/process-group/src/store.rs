// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key-value rendezvous store used for out-of-band metadata exchange.
//!
//! The process group uses it for three things: unique-ID exchange during communicator
//! creation, desync start/end traces, and the cross-rank timeout-dump flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Default time a `get` waits for a key to appear.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("timed out after {after:?} waiting for key '{key}'")]
    Timeout { key: String, after: Duration },

    #[error("store backend error: {0}")]
    Backend(String),
}

pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Blocks until `key` exists or the store timeout elapses.
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// True when every key in `keys` exists. Never blocks.
    fn check(&self, keys: &[&str]) -> Result<bool, StoreError>;

    fn timeout(&self) -> Duration;

    /// The store below any key namespacing, if this store wraps another one.
    fn root(&self) -> Option<Arc<dyn Store>> {
        None
    }
}

struct StoreState {
    data: Mutex<HashMap<String, Vec<u8>>>,
    cv: Condvar,
}

/// Process-local store. Clones share the same data, so simulated ranks running as threads can
/// rendezvous through it.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<StoreState>,
    timeout: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Arc::new(StoreState {
                data: Mutex::new(HashMap::new()),
                cv: Condvar::new(),
            }),
            timeout,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.data.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.state.data.lock().insert(key.to_string(), value.to_vec());
        self.state.cv.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let deadline = Instant::now() + self.timeout;
        let mut data = self.state.data.lock();
        loop {
            if let Some(value) = data.get(key) {
                return Ok(value.clone());
            }
            if self.state.cv.wait_until(&mut data, deadline).timed_out() {
                return data.get(key).cloned().ok_or_else(|| StoreError::Timeout {
                    key: key.to_string(),
                    after: self.timeout,
                });
            }
        }
    }

    fn check(&self, keys: &[&str]) -> Result<bool, StoreError> {
        let data = self.state.data.lock();
        Ok(keys.iter().all(|k| data.contains_key(*k)))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Namespaces every key with `<prefix>/`.
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Store for PrefixStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.set(&self.key(key), value)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(&self.key(key))
    }

    fn check(&self, keys: &[&str]) -> Result<bool, StoreError> {
        let prefixed: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();
        self.inner.check(&refs)
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn root(&self) -> Option<Arc<dyn Store>> {
        Some(self.inner.root().unwrap_or_else(|| self.inner.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_waits_for_set() {
        let store = InMemoryStore::new();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.set("0", b"unique-id").unwrap();
        });
        assert_eq!(store.get("0").unwrap(), b"unique-id");
        handle.join().unwrap();
    }

    #[test]
    fn test_get_times_out() {
        let store = InMemoryStore::with_timeout(Duration::from_millis(20));
        let err = store.get("missing").unwrap_err();
        assert!(matches!(err, StoreError::Timeout { ref key, .. } if key == "missing"));
    }

    #[test]
    fn test_check_never_blocks() {
        let store = InMemoryStore::new();
        store.set("a", b"1").unwrap();
        assert!(store.check(&["a"]).unwrap());
        assert!(!store.check(&["a", "b"]).unwrap());
    }

    #[test]
    fn test_prefix_store_namespaces_keys() {
        let root = InMemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(root.clone());
        let pg0 = PrefixStore::new("0", shared.clone());
        let nested = PrefixStore::new("inner", Arc::new(PrefixStore::new("1", shared)));

        pg0.set("timeout_dump", b"1").unwrap();
        assert_eq!(root.keys(), vec!["0/timeout_dump".to_string()]);
        assert!(pg0.check(&["timeout_dump"]).unwrap());
        assert!(!nested.check(&["timeout_dump"]).unwrap());

        // root() skips every prefix layer
        let under = nested.root().unwrap();
        assert!(under.check(&["0/timeout_dump"]).unwrap());
    }
}
