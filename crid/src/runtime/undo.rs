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

//! Deferred cleanup for multi-step creation paths.
//!
//! Each completed side effect pushes its undo step; when a later step
//! fails, the stack fires in reverse order on a detached task, so
//! cleanup survives the caller's cancellation.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

#[derive(Default)]
pub(crate) struct Undo {
    steps: Vec<BoxFuture<'static, ()>>,
}

impl Undo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, step: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.steps.push(step.boxed());
    }

    /// Runs every recorded step, newest first, detached from the
    /// calling context.
    pub fn fire(self) {
        let steps = self.steps;
        let _ = tokio::spawn(async move {
            for step in steps.into_iter().rev() {
                step.await;
            }
        });
    }
}
