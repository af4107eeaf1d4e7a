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


//! Lower layers: what a filter composition sits on.

#![allow(unused_variables)]

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::gensio::{Gensio, GensioEvent};
use crate::Error;

/// Completion of [`LowerLayer::open`].
pub type LlOpenDone = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Completion of [`LowerLayer::close`].
pub type LlCloseDone = Box<dyn FnOnce() + Send>;

/// Receiver of the events generated by a lower layer.
pub trait LlHandler: Send + Sync {
    /// Data arrived or the read side failed. Returns number of bytes consumed.
    fn ll_read(&self, data: Result<&[u8], Error>) -> usize;

    /// The lower layer can take more data.
    fn ll_write_ready(&self);
}

/// Transport adapter binding a filter composition to exactly one underlying transport.
///
/// Completions and events are never reported synchronously from inside these methods.
pub trait LowerLayer: Send + Sync {
    fn set_handler(&self, handler: Weak<dyn LlHandler>);

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error>;

    fn open(&self, done: LlOpenDone) -> Result<(), Error>;

    fn close(&self, done: LlCloseDone) -> Result<(), Error>;

    fn set_read_callback_enable(&self, enabled: bool);

    fn set_write_callback_enable(&self, enabled: bool);

    fn remote_addr_string(&self) -> Result<String, Error>;

    fn remote_id(&self) -> Result<i32, Error>;

    fn disable(&self) -> Result<(), Error>;

    fn control(&self, depth: usize, get: bool, option: &str, data: &mut String) -> Result<(), Error>;
}

struct ChildEvents {
    handler: Mutex<Option<Weak<dyn LlHandler>>>,
}

impl ChildEvents {
    fn handler(&self) -> Option<Arc<dyn LlHandler>> { self.handler.lock().as_ref()?.upgrade() }
}

impl GensioEvent for ChildEvents {
    fn handle_read(&self, io: &Gensio, data: Result<&[u8], Error>) -> usize {
        match self.handler() {
            Some(handler) => handler.ll_read(data),
            None => data.map(<[u8]>::len).unwrap_or_default(),
        }
    }

    fn handle_write_ready(&self, io: &Gensio) {
        match self.handler() {
            Some(handler) => handler.ll_write_ready(),
            None => io.set_write_callback_enable(false),
        }
    }
}

/// Lower layer running on top of another handle.
///
/// The lower layer owns one reference to the child handle, taken at construction and released
/// when the lower layer is dropped.
pub struct GensioLl {
    child: Gensio,
    events: Arc<ChildEvents>,
}

impl GensioLl {
    /// Binds to `child`, adding a reference to it and taking over its event callback.
    pub fn new(child: &Gensio) -> Self {
        let events = Arc::new(ChildEvents {
            handler: Mutex::new(None),
        });
        let child = child.clone();
        child.set_callback(events.clone());
        GensioLl { child, events }
    }

    pub fn child(&self) -> &Gensio { &self.child }
}

impl LowerLayer for GensioLl {
    fn set_handler(&self, handler: Weak<dyn LlHandler>) { *self.events.handler.lock() = Some(handler) }

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error> { self.child.write_sg(sg) }

    fn open(&self, done: LlOpenDone) -> Result<(), Error> {
        self.child.open(Some(Box::new(move |_, res| done(res))))
    }

    fn close(&self, done: LlCloseDone) -> Result<(), Error> {
        self.child.close(Some(Box::new(move |_| done())))
    }

    fn set_read_callback_enable(&self, enabled: bool) { self.child.set_read_callback_enable(enabled) }

    fn set_write_callback_enable(&self, enabled: bool) {
        self.child.set_write_callback_enable(enabled)
    }

    fn remote_addr_string(&self) -> Result<String, Error> { self.child.remote_addr_string() }

    fn remote_id(&self) -> Result<i32, Error> { self.child.remote_id() }

    fn disable(&self) -> Result<(), Error> { self.child.disable() }

    fn control(&self, depth: usize, get: bool, option: &str, data: &mut String) -> Result<(), Error> {
        self.child.control(depth, get, option, data)
    }
}
