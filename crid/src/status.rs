/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Per-entity status arbitration.
//!
//! Every sandbox and container owns a [`StatusCell`]; all state
//! transitions for that entity pass through the cell's write lock, which
//! makes it the single arbitration point between client RPCs and the
//! event monitor. Whichever side acquires the lock first wins; the other
//! observes the post-condition.

use std::future::Future;
use tokio::sync::{watch, RwLock};

/// An atomically swappable status value with transactional update hooks.
#[derive(Debug)]
pub struct StatusCell<T> {
    inner: RwLock<T>,
}

impl<T: Clone> StatusCell<T> {
    pub fn new(initial: T) -> Self {
        Self { inner: RwLock::new(initial) }
    }

    /// Returns a copy of the current status.
    pub async fn get(&self) -> T {
        self.inner.read().await.clone()
    }

    /// Applies `f` under the cell's write lock and stores the returned
    /// status even when `f` also reports an error.
    ///
    /// For paths where the mutation observed so far must be preserved
    /// regardless of side-effect failure, e.g. recording an exit code
    /// even when task cleanup errors.
    pub async fn update<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = (T, Result<(), E>)>,
    {
        let mut status = self.inner.write().await;
        let (next, res) = f(status.clone()).await;
        *status = next;
        res
    }

    /// Applies `f` under the cell's write lock and stores the new status
    /// only when `f` succeeds; on error the old status stands.
    ///
    /// For paths where the side effect and the state change must be
    /// all-or-nothing, e.g. transitioning to Running only if the task
    /// actually started.
    pub async fn update_sync<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut status = self.inner.write().await;
        let next = f(status.clone()).await?;
        *status = next;
        Ok(())
    }
}

/// A single-shot broadcast that an entity's task has exited.
///
/// The task is observed to exit once; every waiter, including waiters
/// that subscribe after the fact, resolves.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fires the signal. Idempotent.
    pub fn signal(&self) {
        let _ = self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired, immediately for late waiters.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
