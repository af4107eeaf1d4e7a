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

//! File descriptor readiness backends used by the OS layer service loop.

#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use std::ops;

/// Information about I/O events which has happened for a file descriptor.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoType {
    /// Specifies whether I/O source has data to read.
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else {
            f.write_str("write")
        }
    }
}

#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level error (POSIX events {0:#b})
    Os(i16),
}

/// Readiness polling engine.
///
/// After a successful [`Poll::poll`] the fired events are popped from the engine using its
/// [`Iterator`] interface.
pub trait Poll: Send + Iterator<Item = (RawFd, Result<IoType, IoFail>)> {
    fn register(&mut self, fd: RawFd, interest: IoType);
    fn unregister(&mut self, fd: RawFd);
    fn set_interest(&mut self, fd: RawFd, interest: IoType) -> bool;

    /// Blocks until at least one of the registered file descriptors gets ready or the timeout
    /// elapses. `None` timeout means waiting forever.
    ///
    /// # Returns
    ///
    /// Number of events generated; zero on timeout.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Self-pipe used to interrupt a blocking [`Poll::poll`] from other threads.
///
/// The reading side must be registered with the poller for read events; each call to
/// [`Waker::wake`] makes it readable until [`Waker::reset`] drains it.
#[derive(Debug)]
pub struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Waker { reader, writer })
    }

    /// Makes the reading side readable.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&[0x1]) {
            Ok(_) => Ok(()),
            // The pipe is full, which means the poller is going to wake up anyway.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Drains all pending wake-ups.
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd { self.reader.as_raw_fd() }
}
