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

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll};

macro_rules! interest_of {
    ($io:expr) => {{
        let io: IoType = $io;
        let mut e = popol::interest::NONE;
        if io.read {
            e |= popol::interest::READ;
        }
        if io.write {
            e |= popol::interest::WRITE;
        }
        e
    }};
}

/// Manager for a set of file descriptors which are polled by the OS layer service loop by using
/// [`popol`] library.
pub struct Poller {
    sources: popol::Sources<RawFd>,
    fired: Vec<popol::Event<RawFd>>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            fired: empty!(),
            events: empty!(),
        }
    }
}

impl Poll for Poller {
    fn register(&mut self, fd: RawFd, interest: IoType) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {fd}");
        self.sources.register(fd, &fd, interest_of!(interest));
    }

    fn unregister(&mut self, fd: RawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {fd}");
        self.sources.unregister(&fd);
        self.events.retain(|(id, _)| *id != fd);
    }

    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Setting interest `{interest}` on {fd}");

        self.sources.unset(&fd, interest_of!(!interest));
        self.sources.set(&fd, interest_of!(interest))
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        #[cfg(feature = "log")]
        log::trace!(target: "popol",
            "Polling {} sources with timeout {timeout:?} (pending event queue is {len})",
            self.sources.len(),
        );

        let timeout = match timeout {
            Some(duration) => popol::Timeout::from(duration),
            None => popol::Timeout::Never,
        };

        // Blocking call
        self.fired.clear();
        match self.sources.poll(&mut self.fired, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        for event in self.fired.drain(..) {
            let res = if event.source.is_hangup() && !event.source.is_readable() {
                Err(IoFail::Connectivity(event.source.raw_events() as i16))
            } else if event.source.is_error() || event.source.is_invalid() {
                Err(IoFail::Os(event.source.raw_events() as i16))
            } else {
                Ok(IoType {
                    read: event.source.is_readable(),
                    write: event.source.is_writable(),
                })
            };
            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Got `{res:?}` for {}", event.key);
            self.events.push_back((event.key, res))
        }

        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Poll resulted in {} new event(s)", self.events.len() - len);

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> { self.events.pop_front() }
}
