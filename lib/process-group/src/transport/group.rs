// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Group markers and the per-thread nesting counter.
//!
//! Every group opened through this module bumps a thread-local depth counter. Communicator
//! creation needs the transport to be outside of any group, so it closes `depth` groups,
//! creates the communicator inside its own group, then reopens them.

use std::cell::Cell;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use super::{Communicator, Transport, TransportError, TransportStatus};

const NONBLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(1);

thread_local! {
    static ACTIVE_GROUPS: Cell<usize> = const { Cell::new(0) };
}

/// Number of groups the calling thread has open.
pub fn active_group_depth() -> usize {
    ACTIVE_GROUPS.with(|c| c.get())
}

/// Links a `group_start` to its `group_end`. Not `Send`, so both calls stay on one thread.
///
/// Prefer [`GroupTicket::end`] since closing a group can fail. Dropping an unclosed ticket
/// closes the group and logs the outcome.
pub struct GroupTicket<'a> {
    transport: &'a dyn Transport,
    closed: bool,
    _unsend_marker: PhantomData<*const ()>,
}

/// Opens a group that outlives the calling scope, as a coalescing region does. Must be paired
/// with [`close_group`] on the same thread.
pub fn open_group(transport: &dyn Transport) -> Result<(), TransportError> {
    transport.group_start()?;
    ACTIVE_GROUPS.with(|c| c.set(c.get() + 1));
    Ok(())
}

pub fn close_group(transport: &dyn Transport) -> Result<TransportStatus, TransportError> {
    ACTIVE_GROUPS.with(|c| c.set(c.get().saturating_sub(1)));
    transport.group_end()
}

impl<'a> GroupTicket<'a> {
    pub fn start(transport: &'a dyn Transport) -> Result<Self, TransportError> {
        open_group(transport)?;
        Ok(Self {
            transport,
            closed: false,
            _unsend_marker: PhantomData,
        })
    }

    /// Closes the group. `InProgress` is accepted: it only arises for non-blocking
    /// communicators, whose readiness is polled through their error state.
    pub fn end(mut self) -> Result<TransportStatus, TransportError> {
        self.closed = true;
        close_group(self.transport)
    }

    /// Closes the group and waits for `comm` to leave the in-progress state.
    pub fn end_nonblocking(
        self,
        comm: &dyn Communicator,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        match self.end()? {
            TransportStatus::Success => Ok(()),
            TransportStatus::Error(e) => Err(e),
            TransportStatus::InProgress => wait_until_ready(comm, timeout),
        }
    }
}

impl Drop for GroupTicket<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = close_group(self.transport) {
            tracing::warn!(error = %e, "failed closing abandoned transport group");
        }
    }
}

/// Polls `comm` until a non-blocking operation has finished.
pub fn wait_until_ready(comm: &dyn Communicator, timeout: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        match comm.check_for_error() {
            TransportStatus::Success => return Ok(()),
            TransportStatus::Error(e) => return Err(e),
            TransportStatus::InProgress => {
                if Instant::now() >= deadline {
                    return Err(TransportError::SystemError(format!(
                        "communicator did not finish a non-blocking operation within {timeout:?}"
                    )));
                }
                std::thread::sleep(NONBLOCKING_POLL_INTERVAL);
            }
        }
    }
}

/// Runs `f` with every group opened by the calling thread temporarily closed.
pub(crate) fn with_groups_drained<T, E>(
    transport: &dyn Transport,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E>
where
    E: From<TransportError>,
{
    let depth = active_group_depth();
    for _ in 0..depth {
        transport.group_end()?;
    }
    let result = f();
    for _ in 0..depth {
        transport.group_start()?;
    }
    result
}
