//! Transaction gate and handle.
//!
//! A transaction owns the storage gate for its whole lifetime, so writes
//! from other threads wait until it commits or rolls back. The owning thread
//! may re-enter the gate, which is how nested transactions and the writes
//! made inside a transaction get through.

use crate::store::Storage;
use parking_lot::{Condvar, Mutex};
use statekeeper_core::{CoreError, Transaction};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant, thread-owned write gate.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl Gate {
    pub(crate) fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    pub(crate) fn leave(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
    }

    /// Enters the gate for the lifetime of the returned guard.
    pub(crate) fn hold(&self) -> GateGuard<'_> {
        self.enter();
        GateGuard { gate: self }
    }

    pub(crate) fn held_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// An open storage transaction.
///
/// Dropping it without commit or rollback rolls back.
pub(crate) struct StorageTransaction {
    storage: Storage,
    finished: bool,
}

impl StorageTransaction {
    pub(crate) fn begin(storage: Storage) -> Self {
        storage.gate().enter();
        storage.push_frame();
        tracing::debug!(depth = storage.transaction_depth(), "Transaction started");
        Self {
            storage,
            finished: false,
        }
    }
}

impl Transaction for StorageTransaction {
    fn commit(mut self: Box<Self>) -> Result<(), CoreError> {
        self.finished = true;
        self.storage.commit_frame()?;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), CoreError> {
        self.finished = true;
        self.storage.rollback_frame();
        Ok(())
    }
}

impl Drop for StorageTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Transaction dropped while open, rolling back");
            self.storage.rollback_frame();
        }
        self.storage.gate().leave();
    }
}
