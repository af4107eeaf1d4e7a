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


//! Listening endpoints producing new handles.
//!
//! An [`Accepter`] reports each incoming connection as a new, independent [`Gensio`]. Accepters
//! stack the same way handles do: [`gensio_gensio_accepter_alloc`] wraps a child accepter, and
//! builds a filter composition (see [`crate::base`]) over every connection the child produces.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::base::{base_gensio_alloc, Side};
use crate::filter::Filter;
use crate::gensio::{Gensio, GensioEvent};
use crate::ll::GensioLl;
use crate::os::OsFuncs;
use crate::Error;

/// Completion callback of [`Accepter::shutdown`].
pub type ShutdownDone = Box<dyn FnOnce(&Accepter) + Send>;

/// User side of an accepter.
pub trait AccepterEvent: Send + Sync {
    /// A new connection got established and is open. The handle is owned by the callee.
    fn new_connection(&self, acc: &Accepter, io: Gensio);
}

/// Operations every accepter implementation provides.
pub trait AccepterFunctions: Send + Sync {
    /// Starts listening.
    fn startup(&self) -> Result<(), Error>;

    /// Stops listening; completion is reported via `done` from deferred context.
    fn shutdown(&self, done: Option<ShutdownDone>) -> Result<(), Error>;

    fn set_accept_callback_enable(&self, enabled: bool);

    /// Creates an outgoing connection from the accepter, for accepters which support it.
    fn str_to_gensio(&self, desc: &str, event: Option<Arc<dyn GensioEvent>>) -> Result<Gensio, Error> {
        Err(Error::NotSup)
    }

    /// Builds a handle of the accepter type over an already connected `child`.
    fn alloc_gensio(
        &self,
        args: &[String],
        child: &Gensio,
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error> {
        Err(Error::NotSup)
    }

    fn disable(&self) {}
}

/// Capability flags of the handles an accepter produces.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct AccepterFlags {
    pub is_reliable: bool,
    pub is_packet: bool,
    pub is_message: bool,
}

struct AccepterInner {
    type_name: &'static str,
    os: OsFuncs,
    funcs: Box<dyn AccepterFunctions>,
    child: Option<Accepter>,
    event: Mutex<Option<Arc<dyn AccepterEvent>>>,
    flags: Mutex<AccepterFlags>,
}

/// Listening endpoint.
///
/// Clones share the same accepter, which is torn down when the last clone is dropped. Handles
/// produced by the accepter live independently of it.
#[derive(Clone)]
pub struct Accepter {
    inner: Arc<AccepterInner>,
}

impl Debug for Accepter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepter").field("type", &self.inner.type_name).finish()
    }
}

/// Non-owning reference to an accepter.
#[derive(Clone)]
pub struct WeakAccepter {
    inner: Weak<AccepterInner>,
}

impl WeakAccepter {
    pub fn upgrade(&self) -> Option<Accepter> { self.inner.upgrade().map(|inner| Accepter { inner }) }
}

impl Accepter {
    /// Constructs a new accepter dispatching to the implementation built by `build`, which
    /// receives a weak reference to the accepter being constructed. Capability flags are copied
    /// from `child`, if any.
    pub fn new_cyclic<F>(
        os: &OsFuncs,
        type_name: &'static str,
        child: Option<&Accepter>,
        event: Option<Arc<dyn AccepterEvent>>,
        build: F,
    ) -> Accepter
    where
        F: FnOnce(WeakAccepter) -> Box<dyn AccepterFunctions>,
    {
        let inner = Arc::new_cyclic(|weak| AccepterInner {
            type_name,
            os: os.clone(),
            funcs: build(WeakAccepter {
                inner: weak.clone(),
            }),
            child: child.cloned(),
            event: Mutex::new(event),
            flags: Mutex::new(child.map(Accepter::flags).unwrap_or_default()),
        });

        #[cfg(feature = "log")]
        log::debug!(target: "accepter", "Allocated {type_name} accepter");

        Accepter { inner }
    }

    pub fn downgrade(&self) -> WeakAccepter {
        WeakAccepter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Accepter) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    pub fn type_name(&self) -> &'static str { self.inner.type_name }

    pub fn os(&self) -> &OsFuncs { &self.inner.os }

    /// Returns the accepter `depth` levels down the stack; `0` is this accepter itself.
    pub fn child(&self, depth: usize) -> Option<&Accepter> {
        match depth {
            0 => Some(self),
            depth => self.inner.child.as_ref()?.child(depth - 1),
        }
    }

    pub fn set_callback(&self, event: Arc<dyn AccepterEvent>) { *self.inner.event.lock() = Some(event) }

    pub fn startup(&self) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::debug!(target: "accepter", "Starting up {} accepter", self.inner.type_name);
        self.inner.funcs.startup()
    }

    pub fn shutdown(&self, done: Option<ShutdownDone>) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::debug!(target: "accepter", "Shutting down {} accepter", self.inner.type_name);
        self.inner.funcs.shutdown(done)
    }

    /// Shuts the accepter down and waits for the shutdown to complete.
    pub fn shutdown_s(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let waiter = self.inner.os.alloc_waiter();
        let w = waiter.clone();
        self.shutdown(Some(Box::new(move |_| w.wake())))?;
        waiter.wait(1, timeout)
    }

    pub fn set_accept_callback_enable(&self, enabled: bool) {
        self.inner.funcs.set_accept_callback_enable(enabled)
    }

    pub fn str_to_gensio(&self, desc: &str, event: Option<Arc<dyn GensioEvent>>) -> Result<Gensio, Error> {
        self.inner.funcs.str_to_gensio(desc, event)
    }

    pub fn alloc_gensio(
        &self,
        args: &[String],
        child: &Gensio,
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error> {
        self.inner.funcs.alloc_gensio(args, child, event)
    }

    pub fn disable(&self) { self.inner.funcs.disable() }

    /// Releases this reference to the accepter.
    pub fn free(self) {}

    pub fn flags(&self) -> AccepterFlags { *self.inner.flags.lock() }
    pub fn is_reliable(&self) -> bool { self.inner.flags.lock().is_reliable }
    pub fn is_packet(&self) -> bool { self.inner.flags.lock().is_packet }
    pub fn is_message(&self) -> bool { self.inner.flags.lock().is_message }

    pub fn set_flags(&self, flags: AccepterFlags) { *self.inner.flags.lock() = flags }
    pub fn set_is_reliable(&self, val: bool) { self.inner.flags.lock().is_reliable = val }
    pub fn set_is_packet(&self, val: bool) { self.inner.flags.lock().is_packet = val }
    pub fn set_is_message(&self, val: bool) { self.inner.flags.lock().is_message = val }

    /// Reports a new connection to the user. Without a handler the connection is dropped.
    pub fn deliver_new_connection(&self, io: Gensio) {
        let event = self.inner.event.lock().clone();
        match event {
            Some(event) => event.new_connection(self, io),
            None => {
                #[cfg(feature = "log")]
                log::warn!(target: "accepter", "Dropping connection on {} accepter without a handler", self.inner.type_name);
            }
        }
    }
}

/// Per-type behaviour of an accepter stacking a filter over the connections of a child accepter.
pub trait GensioAccepterHooks: Send + Sync {
    /// Allocates the filter for a new connection.
    fn new_child(&self) -> Result<Box<dyn Filter>, Error>;

    /// Adjusts the new, open handle before it gets reported to the user.
    fn finish_parent(&self, io: &Gensio) -> Result<(), Error> { Ok(()) }

    /// Builds a handle of this type over an already connected `child`.
    fn alloc_gensio(
        &self,
        args: &[String],
        child: &Gensio,
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error>;
}

struct GensioAccepterInner {
    me: Weak<GensioAccepterInner>,
    acc: WeakAccepter,
    os: OsFuncs,
    type_name: &'static str,
    hooks: Box<dyn GensioAccepterHooks>,
    child: Accepter,
}

struct ChildConnections {
    parent: Weak<GensioAccepterInner>,
}

impl AccepterEvent for ChildConnections {
    fn new_connection(&self, acc: &Accepter, io: Gensio) {
        match self.parent.upgrade() {
            Some(parent) => parent.new_connection(io),
            None => {
                #[cfg(feature = "log")]
                log::debug!(target: "accepter", "Dropping connection of a detached {} accepter", acc.type_name());
            }
        }
    }
}

impl GensioAccepterInner {
    fn new_connection(&self, child: Gensio) {
        let filter = match self.hooks.new_child() {
            Ok(filter) => filter,
            Err(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "accepter", "Unable to allocate {} filter for a new connection: {err}", self.type_name);
                return;
            }
        };
        let ll = GensioLl::new(&child);
        let io = base_gensio_alloc(
            &self.os,
            Box::new(ll),
            filter,
            Some(&child),
            self.type_name,
            Side::Server,
            None,
        );
        drop(child);

        let me = self.me.clone();
        let owner = io.clone();
        let res = io.open(Some(Box::new(move |_, res| match me.upgrade() {
            Some(inner) => inner.connection_ready(owner, res),
            None => {
                #[cfg(feature = "log")]
                log::debug!(target: "accepter", "Accepter is gone, dropping new connection");
            }
        })));
        if let Err(err) = res {
            #[cfg(feature = "log")]
            log::error!(target: "accepter", "Unable to start {} connection: {err}", self.type_name);
        }
    }

    fn connection_ready(&self, io: Gensio, res: Result<(), Error>) {
        if let Err(err) = res.and_then(|_| self.hooks.finish_parent(&io)) {
            #[cfg(feature = "log")]
            log::warn!(target: "accepter", "Incoming {} connection failed: {err}", self.type_name);
            return;
        }
        match self.acc.upgrade() {
            Some(acc) => acc.deliver_new_connection(io),
            None => {
                #[cfg(feature = "log")]
                log::debug!(target: "accepter", "Accepter is gone, dropping new connection");
            }
        }
    }
}

struct GensioAccepter {
    inner: Arc<GensioAccepterInner>,
}

impl AccepterFunctions for GensioAccepter {
    fn startup(&self) -> Result<(), Error> { self.inner.child.startup() }

    fn shutdown(&self, done: Option<ShutdownDone>) -> Result<(), Error> {
        let acc = self.inner.acc.clone();
        self.inner.child.shutdown(Some(Box::new(move |_| {
            if let (Some(done), Some(acc)) = (done, acc.upgrade()) {
                done(&acc)
            }
        })))
    }

    fn set_accept_callback_enable(&self, enabled: bool) {
        self.inner.child.set_accept_callback_enable(enabled)
    }

    fn str_to_gensio(&self, desc: &str, event: Option<Arc<dyn GensioEvent>>) -> Result<Gensio, Error> {
        let child = self.inner.child.str_to_gensio(desc, None)?;
        self.inner.hooks.alloc_gensio(&[], &child, event)
    }

    fn alloc_gensio(
        &self,
        args: &[String],
        child: &Gensio,
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error> {
        self.inner.hooks.alloc_gensio(args, child, event)
    }

    fn disable(&self) { self.inner.child.disable() }
}

/// Builds an accepter stacking a filter, allocated by `hooks`, over each connection of `child`.
pub fn gensio_gensio_accepter_alloc(
    child: Accepter,
    os: &OsFuncs,
    type_name: &'static str,
    event: Option<Arc<dyn AccepterEvent>>,
    hooks: Box<dyn GensioAccepterHooks>,
) -> Accepter {
    let parent = child.clone();
    Accepter::new_cyclic(os, type_name, Some(&parent), event, move |acc| {
        let inner = Arc::new_cyclic(|me| GensioAccepterInner {
            me: me.clone(),
            acc,
            os: os.clone(),
            type_name,
            hooks,
            child,
        });
        inner.child.set_callback(Arc::new(ChildConnections {
            parent: Arc::downgrade(&inner),
        }));
        Box::new(GensioAccepter { inner })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AcceptCollector, FilterTally, MockAccepter, Tally, TallyHooks};

    fn tally_stack(os: &OsFuncs, filters: &FilterTally) -> (Accepter, MockAccepter, Arc<AcceptCollector>) {
        let mock = MockAccepter::new(os);
        let collector = AcceptCollector::new(os);
        let acc = gensio_gensio_accepter_alloc(
            mock.accepter(),
            os,
            "tally",
            Some(collector.clone()),
            Box::new(TallyHooks::new(os, filters)),
        );
        (acc, mock, collector)
    }

    #[test]
    fn fan_out() {
        let os = OsFuncs::new().unwrap();
        let filters = FilterTally::default();
        let (acc, mock, collector) = tally_stack(&os, &filters);
        assert!(acc.is_reliable());
        acc.startup().unwrap();
        assert!(mock.started());

        let tallies = (0..3).map(|_| Tally::default()).collect::<Vec<_>>();
        for tally in &tallies {
            mock.connect(tally);
        }
        let handles = collector.wait_for(3, Duration::from_secs(5)).unwrap();
        assert_eq!(filters.allocated(), 3);
        assert_eq!(filters.setups(), 3);

        drop(acc);
        drop(mock);
        for (no, (io, tally)) in handles.iter().zip(&tallies).enumerate() {
            assert!(!io.is_client());
            assert_eq!(io.type_name(), "tally");
            let msg = format!("connection {no}");
            assert_eq!(io.write(msg.as_bytes()), Ok(msg.len()));
            assert_eq!(tally.written(), msg.as_bytes());
            assert_eq!(tally.finalized(), 0);
        }
        drop(handles);
        for tally in &tallies {
            assert_eq!(tally.finalized(), 1);
        }
    }

    #[test]
    fn filter_failure_drops_connection() {
        let os = OsFuncs::new().unwrap();
        let filters = FilterTally::default();
        filters.fail_allocations(true);
        let (_acc, mock, collector) = tally_stack(&os, &filters);
        let tally = Tally::default();
        mock.connect(&tally);
        assert_eq!(tally.finalized(), 1);
        assert!(collector.wait_for(1, Duration::from_millis(50)).is_err());
    }

    #[test]
    fn finish_parent_runs_before_report() {
        let os = OsFuncs::new().unwrap();
        let filters = FilterTally::default();
        let (_acc, mock, collector) = tally_stack(&os, &filters);

        let tally = Tally::default();
        mock.connect(&tally);
        let handles = collector.wait_for(1, Duration::from_secs(5)).unwrap();
        assert_eq!(filters.finishes(), 1);
        assert!(handles[0].is_packet());
        drop(handles);
        assert_eq!(tally.finalized(), 1);

        filters.fail_finish(true);
        let tally = Tally::default();
        mock.connect(&tally);
        assert!(collector.wait_for(1, Duration::from_millis(200)).is_err());
        assert_eq!(filters.finishes(), 2);
        assert_eq!(tally.finalized(), 1);
    }

    #[test]
    fn out_of_band_alloc() {
        let os = OsFuncs::new().unwrap();
        let filters = FilterTally::default();
        let (acc, _mock, _) = tally_stack(&os, &filters);
        let tally = Tally::default();
        let child = crate::testing::CountingGensio::alloc(&os, &tally);
        let io = acc.alloc_gensio(&[], &child, None).unwrap();
        assert_eq!(tally.refcount(), 2);
        drop(child);
        io.open_s(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(io.write(b"abc"), Ok(3));
        assert_eq!(tally.written(), b"abc");
        assert!(io.child(1).is_some());
        drop(io);
        assert_eq!(tally.finalized(), 1);
        assert!(acc.str_to_gensio("x", None).is_err());
    }

    #[test]
    fn shutdown_reaches_child() {
        let os = OsFuncs::new().unwrap();
        let filters = FilterTally::default();
        let (acc, mock, _) = tally_stack(&os, &filters);
        acc.startup().unwrap();
        acc.set_accept_callback_enable(false);
        assert!(!mock.accept_enabled());
        acc.shutdown_s(Some(Duration::from_secs(5))).unwrap();
        assert!(!mock.started());
        assert!(acc.child(1).unwrap().ptr_eq(&mock.accepter()));
    }
}
