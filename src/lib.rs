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


#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Layered stream I/O objects.
//!
//! A [`Gensio`] is a connected, bidirectional byte stream with a uniform non-blocking, event
//! driven interface, whatever is behind it: a leaf transport doing real I/O (like [`file`]) or a
//! protocol filter ([`Filter`]) stacked over another handle by the composition layer in [`base`].
//! An [`Accepter`] is a listening endpoint producing new handles; accepters stack the same way.
//!
//! All the handles run on an OS abstraction layer ([`OsFuncs`]) providing deferred runners,
//! timers, counting waiters, threads and file descriptor readiness handlers. Nothing happens
//! unless some thread services it with [`OsFuncs::service`] (or waits on a [`Waiter`], which
//! services it internally). Stacks can also be built out of textual descriptors like
//! `trace(dir=both),file(infile=/tmp/a)` through a [`Registry`].

#[macro_use]
extern crate amplify;

mod error;
pub mod os;
pub mod poller;

pub mod accepter;
pub mod args;
pub mod base;
pub mod file;
pub mod filter;
pub mod gensio;
pub mod ll;
pub mod registry;
pub mod timestamp;
pub mod trace;

#[cfg(test)]
mod testing;

pub use accepter::{Accepter, AccepterEvent, AccepterFlags, AccepterFunctions, WeakAccepter};
pub use base::{base_gensio_alloc, Side};
pub use error::Error;
pub use filter::{Filter, Handshake};
pub use gensio::{Gensio, GensioEvent, GensioFlags, GensioFunctions, WeakGensio};
pub use ll::{GensioLl, LowerLayer};
pub use os::{OsFuncs, Runner, Thread, Timer, Waiter};
pub use registry::Registry;
pub use timestamp::Timestamp;
