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

use std::io;

/// Errors reported by handles, accepters, filters and the OS layer.
///
/// Errors of asynchronous operations are never returned from the call which started them: they
/// are delivered to the completion callback or as a part of a read event instead.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// out of memory.
    NoMem,

    /// operation is not valid in the current state of the object.
    NotReady,

    /// invalid argument or descriptor.
    Inval,

    /// operation is not supported by this transport or filter.
    NotSup,

    /// remote end has closed the connection.
    RemClose,

    /// operation was canceled by a local close.
    LocalClosed,

    /// operation timed out.
    TimedOut,

    /// operation was interrupted.
    Interrupted,

    /// an object with the same name is already registered.
    Exists,

    /// no transport, filter or accepter is registered under the given name.
    NotFound,

    /// operating system error (errno {0}).
    Os(i32),
}

impl Error {
    /// Maps a host `errno` value onto the error taxonomy.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOMEM => Error::NoMem,
            libc::EINVAL => Error::Inval,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::EINTR => Error::Interrupted,
            libc::EPIPE | libc::ECONNRESET => Error::RemClose,
            libc::EEXIST => Error::Exists,
            libc::ENOENT => Error::NotFound,
            #[allow(unreachable_patterns)] // ENOTSUP == EOPNOTSUPP on some platforms
            libc::ENOTSUP | libc::EOPNOTSUPP => Error::NotSup,
            other => Error::Os(other),
        }
    }

    /// Tells whether the error means the stream has reached its end (either side closed it).
    pub fn is_closed(&self) -> bool { matches!(self, Error::RemClose | Error::LocalClosed) }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Error::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::OutOfMemory => Error::NoMem,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::Inval,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::Interrupted => Error::Interrupted,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Error::RemClose,
            io::ErrorKind::Unsupported => Error::NotSup,
            io::ErrorKind::AlreadyExists => Error::Exists,
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::WouldBlock => Error::NotReady,
            _ => Error::Os(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::from_errno(libc::ENOMEM), Error::NoMem);
        assert_eq!(Error::from_errno(libc::EPIPE), Error::RemClose);
        assert_eq!(Error::from_errno(libc::EACCES), Error::Os(libc::EACCES));
        assert_eq!(Error::from(io::Error::from_raw_os_error(libc::ENOENT)), Error::NotFound);
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(Error::from(io::Error::from(io::ErrorKind::TimedOut)), Error::TimedOut);
        assert_eq!(Error::from(io::Error::from(io::ErrorKind::UnexpectedEof)), Error::RemClose);
        assert!(Error::LocalClosed.is_closed());
        assert!(!Error::Inval.is_closed());
    }
}
