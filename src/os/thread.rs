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

use std::thread::{self, JoinHandle};

use crate::Error;

/// Thread started through the OS layer.
///
/// There is no way to cancel a thread: the code it runs must be told to stop by the application
/// (for instance by waking a [`super::Waiter`] it waits on), after which [`Thread::join`] waits for
/// it to finish.
pub struct Thread {
    handle: JoinHandle<()>,
}

impl Thread {
    /// Starts a new thread running `f`.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to spawn a thread.
    pub fn spawn(f: impl FnOnce() + Send + 'static) -> Result<Self, Error> {
        Thread::with(f, thread::Builder::new())
    }

    /// Starts a new thread with the given name running `f`.
    pub fn named(f: impl FnOnce() + Send + 'static, name: impl ToString) -> Result<Self, Error> {
        Thread::with(f, thread::Builder::new().name(name.to_string()))
    }

    /// Starts a new thread running `f`, allowing to fully customize how the thread is constructed.
    pub fn with(f: impl FnOnce() + Send + 'static, builder: thread::Builder) -> Result<Self, Error> {
        #[cfg(feature = "log")]
        log::debug!(target: "os", "Spawning a new thread");

        let handle = builder.spawn(f)?;
        Ok(Thread { handle })
    }

    /// Waits for the thread to complete.
    ///
    /// # Errors
    ///
    /// [`Error::Interrupted`] if the thread has panicked.
    pub fn join(self) -> Result<(), Error> { self.handle.join().map_err(|_| Error::Interrupted) }
}
