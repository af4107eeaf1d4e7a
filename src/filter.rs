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


//! Per-connection protocol transforms.
//!
//! A filter performs no I/O itself: the composition layer ([`crate::base`]) hands it bytes
//! travelling in either direction and collects the bytes it produces, which makes every filter
//! testable without any transport.

#![allow(unused_variables)]

use std::time::Duration;

use crate::gensio::GensioFlags;
use crate::Error;

/// Result of a single handshake step.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Handshake {
    /// Handshake is complete.
    Done,
    /// Handshake needs more data from the peer.
    InProgress,
    /// Step must be retried after the given delay; [`Filter::timeout`] is called first.
    Retry(Duration),
}

/// Protocol transform bound into exactly one handle.
///
/// Instances are never shared: a fresh filter is created for every handle and every accepted
/// connection. All methods are called with the owning handle lock held, so they must not call
/// into any handle.
pub trait Filter: Send {
    /// Called when the handle starts opening.
    fn setup(&mut self) -> Result<(), Error> { Ok(()) }

    /// Called after the handle got closed or failed to open. Must reset all per-connection
    /// state, since the handle may be opened again.
    fn cleanup(&mut self) {}

    /// Performs the next step of the opening handshake. Data for the peer are appended to `out`.
    fn try_connect(&mut self, out: &mut Vec<u8>) -> Result<Handshake, Error> { Ok(Handshake::Done) }

    /// Performs the next step of the closing handshake. Data for the peer are appended to `out`.
    fn try_disconnect(&mut self, out: &mut Vec<u8>) -> Result<Handshake, Error> {
        Ok(Handshake::Done)
    }

    /// Called when the delay requested with [`Handshake::Retry`] has elapsed.
    fn timeout(&mut self) -> Result<(), Error> { Ok(()) }

    /// Transforms user data going down to the lower layer.
    ///
    /// # Returns
    ///
    /// Number of bytes from `sg` consumed. The produced bytes are appended to `out`.
    fn ul_write(&mut self, sg: &[&[u8]], out: &mut Vec<u8>) -> Result<usize, Error>;

    /// Transforms data coming up from the lower layer.
    ///
    /// # Returns
    ///
    /// Number of bytes from `data` consumed. Data for the user are appended to `out`.
    fn ll_write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize, Error>;

    /// Capability flags of the handle, given the flags of the handle below.
    fn flags(&self, child: GensioFlags) -> GensioFlags { child }

    /// Gets (`get == true`) or sets a filter-specific option.
    fn control(&mut self, get: bool, option: &str, data: &mut String) -> Result<(), Error> {
        Err(Error::NotSup)
    }
}
