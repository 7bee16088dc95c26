//! Optimistic local state with rollback
//!
//! Callers that update local state before remote confirmation go through
//! [`OptimisticStore::update`]: the next value is computed functionally from
//! the state as it is at apply time (never from a stale capture), published
//! immediately, and rolled back to the captured snapshot if the remote
//! commit ultimately fails. Rapid successive updates therefore compose: the
//! second snapshot is taken from the first update's published result.

use crate::error::SyncError;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

/// A failed optimistic update
#[derive(Debug)]
pub struct OptimisticFailure<T> {
    /// The classified remote error
    pub error: SyncError,
    /// The snapshot that was restored
    pub restored: T,
}

/// Shared local state that can be optimistically updated
#[derive(Debug, Default)]
pub struct OptimisticStore<T> {
    state: Mutex<T>,
}

impl<T: Clone> OptimisticStore<T> {
    /// Create a store with the given initial state
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    /// Snapshot of the current state
    pub fn get(&self) -> T {
        self.lock().clone()
    }

    /// Replace the state outright, bypassing the optimistic protocol
    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Apply an update optimistically and commit it remotely
    ///
    /// `apply` receives the state as it is right now, under the lock, and
    /// returns the next value; the snapshot captured at the same moment is
    /// restored verbatim if `commit` fails.
    pub async fn update<A, C, Fut>(
        &self,
        apply: A,
        commit: C,
    ) -> Result<T, OptimisticFailure<T>>
    where
        A: FnOnce(&T) -> T,
        C: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let (snapshot, next) = {
            let mut state = self.lock();
            let snapshot = state.clone();
            let next = apply(&state);
            *state = next.clone();
            (snapshot, next)
        };

        match commit(next.clone()).await {
            Ok(()) => Ok(next),
            Err(error) => {
                *self.lock() = snapshot.clone();
                Err(OptimisticFailure {
                    error,
                    restored: snapshot,
                })
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
