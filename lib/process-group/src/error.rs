// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process Group Error System
//!
//! [`ProcessGroupError`] is the single error type returned by the public API. Each variant
//! maps onto an [`ErrorKind`] so callers (and the watchdog) can branch on the category
//! without string matching.
//!
//! Errors are `Clone` because a failure observed by the watchdog thread is latched on a
//! [`crate::Work`] and handed back to every caller that later inspects that work.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ProcessGroupError> = std::result::Result<T, E>;

/// Categorizes errors into a fixed set of kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// dtype or device-family mismatch.
    TypeMismatch,
    /// Shape, size or split-size contract violation.
    InvalidArgument,
    /// Store exchange failed or a peer crashed before publishing.
    RendezvousFailure,
    /// Library-reported synchronous or asynchronous failure.
    Transport,
    /// A work handle exceeded its deadline.
    Timeout,
    /// Unsupported op or configuration combination.
    NotImplemented,
    /// Cache or bookkeeping consistency was violated. Always fatal.
    InternalInvariant,
    /// The communicator or the whole group was aborted.
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::RendezvousFailure => "RendezvousFailure",
            ErrorKind::Transport => "Transport",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::InternalInvariant => "InternalInvariant",
            ErrorKind::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessGroupError {
    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("[Rank {rank}] rendezvous on key '{key}' failed: {message}")]
    RendezvousFailure {
        key: String,
        rank: usize,
        message: String,
    },

    #[error("distributed backend error: {0}")]
    Transport(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("{0}")]
    Aborted(String),
}

impl ProcessGroupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessGroupError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            ProcessGroupError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ProcessGroupError::RendezvousFailure { .. } => ErrorKind::RendezvousFailure,
            ProcessGroupError::Transport(_) => ErrorKind::Transport,
            ProcessGroupError::Timeout(_) => ErrorKind::Timeout,
            ProcessGroupError::NotImplemented(_) => ErrorKind::NotImplemented,
            ProcessGroupError::InternalInvariant(_) => ErrorKind::InternalInvariant,
            ProcessGroupError::Aborted(_) => ErrorKind::Aborted,
        }
    }

    /// True for the kinds that must take the process down regardless of the
    /// configured error-handling mode.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessGroupError::InternalInvariant(_))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ProcessGroupError::InvalidArgument(msg.into())
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        ProcessGroupError::TypeMismatch(msg.into())
    }

    pub fn not_implemented(msg: impl Into<String>) -> Self {
        ProcessGroupError::NotImplemented(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ProcessGroupError::InternalInvariant(msg.into())
    }

    /// Wraps a transport error and appends the communicator's failure reason when the
    /// library has one.
    pub fn transport(err: &TransportError, failure_reason: Option<String>) -> Self {
        match failure_reason {
            Some(reason) => ProcessGroupError::Transport(format!(
                "{err}\nProcess group communicator failure reason: {reason}"
            )),
            None => ProcessGroupError::Transport(err.to_string()),
        }
    }
}

impl From<TransportError> for ProcessGroupError {
    fn from(err: TransportError) -> Self {
        ProcessGroupError::transport(&err, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let err = ProcessGroupError::invalid_argument("bad split");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "bad split");

        let err = ProcessGroupError::RendezvousFailure {
            key: "0".into(),
            rank: 3,
            message: "store timed out".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RendezvousFailure);
        assert!(err.to_string().contains("[Rank 3]"));
        assert!(err.to_string().contains("'0'"));
    }

    #[test]
    fn test_only_internal_invariant_is_fatal() {
        assert!(ProcessGroupError::internal("missing stream").is_fatal());
        assert!(!ProcessGroupError::Timeout("late".into()).is_fatal());
        assert!(!ProcessGroupError::Aborted("gone".into()).is_fatal());
    }

    #[test]
    fn test_transport_error_carries_failure_reason() {
        let err = ProcessGroupError::transport(
            &TransportError::RemoteError("peer closed connection".into()),
            Some("NET/IB failure".into()),
        );
        assert_eq!(err.kind(), ErrorKind::Transport);
        let text = err.to_string();
        assert!(text.contains("peer closed connection"));
        assert!(text.contains("NET/IB failure"));
    }

    #[test]
    fn test_latched_error_is_cloneable() {
        let err = ProcessGroupError::Timeout("WorkNCCL(SeqNum=1) ran for 10 ms".into());
        let copy = err.clone();
        assert_eq!(err, copy);
        assert_eq!(copy.kind(), ErrorKind::Timeout);
    }
}
