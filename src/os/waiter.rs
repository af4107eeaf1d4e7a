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

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::OsFuncs;
use crate::Error;

/// Counting wake/wait primitive.
///
/// Wake-ups are counted: calling [`Waiter::wake`] three times before anybody waits leaves three
/// wakes pending. While waiting, the calling thread keeps servicing the OS layer, so runners,
/// timers and file descriptor handlers make progress.
#[derive(Clone)]
pub struct Waiter {
    os: OsFuncs,
    count: Arc<Mutex<usize>>,
}

impl Waiter {
    pub(super) fn new(os: OsFuncs) -> Self {
        Waiter {
            os,
            count: default!(),
        }
    }

    /// Adds one pending wake-up.
    pub fn wake(&self) {
        *self.count.lock() += 1;
        self.os.wake();
    }

    /// Waits for `count` wake-ups for up to `timeout` (forever if `None`).
    ///
    /// # Errors
    ///
    /// [`Error::TimedOut`] if the timeout elapsed; in that case none of the pending wake-ups are
    /// consumed. [`Error::Interrupted`] if servicing the OS layer got interrupted by a signal.
    pub fn wait(&self, count: usize, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            {
                let mut pending = self.count.lock();
                if *pending >= count {
                    *pending -= count;
                    return Ok(());
                }
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::TimedOut);
                    }
                    Some(deadline - now)
                }
            };
            match self.os.service(remaining) {
                Ok(()) | Err(Error::TimedOut) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Number of wake-ups not yet consumed by a wait.
    pub fn pending(&self) -> usize { *self.count.lock() }
}
