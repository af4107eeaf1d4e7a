// Layered stream I/O runtime: stackable filters over arbitrary transports.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::OsInner;

struct RunnerInner {
    os: Weak<OsInner>,
    scheduled: Mutex<bool>,
    handler: Box<dyn Fn() + Send + Sync>,
}

/// Deferred unit of work executed by the OS layer service loop.
///
/// Scheduling is idempotent: while a runner is queued, further calls to [`Runner::schedule`] are
/// no-ops. The handler runs once per schedule cycle, on whatever thread services the OS layer,
/// and never under the lock of the code which scheduled it.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub(super) fn new(os: Weak<OsInner>, handler: impl Fn() + Send + Sync + 'static) -> Self {
        Runner {
            inner: Arc::new(RunnerInner {
                os,
                scheduled: Mutex::new(false),
                handler: Box::new(handler),
            }),
        }
    }

    /// Queues the runner for execution and returns immediately.
    ///
    /// # Returns
    ///
    /// `true` if the runner got queued by this call; `false` if it was already queued or the OS
    /// layer it belongs to no longer exists.
    pub fn schedule(&self) -> bool {
        let Some(os) = self.inner.os.upgrade() else {
            #[cfg(feature = "log")]
            log::warn!(target: "os", "Scheduling a runner on a destroyed OS layer");
            return false;
        };
        let mut scheduled = self.inner.scheduled.lock();
        if *scheduled {
            return false;
        }
        *scheduled = true;
        drop(scheduled);

        os.enqueue(self.clone());
        true
    }

    pub fn is_scheduled(&self) -> bool { *self.inner.scheduled.lock() }

    /// Clears the scheduled flag before running the handler, so the handler may reschedule the
    /// runner.
    pub(super) fn run(&self) {
        *self.inner.scheduled.lock() = false;
        (self.inner.handler)();
    }
}
