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

//! Connected stream handles.
//!
//! A [`Gensio`] is a bidirectional byte stream. What is behind the handle (a leaf transport
//! performing real I/O, or a filter stacked on top of another handle) is hidden behind the
//! [`GensioFunctions`] implementation it dispatches to.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::os::OsFuncs;
use crate::Error;

/// Completion callback of [`Gensio::open`].
pub type OpenDone = Box<dyn FnOnce(&Gensio, Result<(), Error>) + Send>;

/// Completion callback of [`Gensio::close`].
pub type CloseDone = Box<dyn FnOnce(&Gensio) + Send>;

/// User side of a handle: receives events generated by the handle.
///
/// Events are never delivered concurrently for the same handle, and never before the open
/// completion callback has returned. Read and write readiness reporting is level-triggered:
/// events keep coming while they are enabled and there is data (or buffer space). A handler which
/// can't take more data must disable the corresponding callback.
pub trait GensioEvent: Send + Sync {
    /// Data arrived or the read side failed.
    ///
    /// # Returns
    ///
    /// Number of bytes consumed. Bytes which are not consumed are delivered again with the next
    /// read event.
    fn handle_read(&self, io: &Gensio, data: Result<&[u8], Error>) -> usize;

    /// The handle is able to accept more data for writing.
    fn handle_write_ready(&self, io: &Gensio) {}
}

/// Operations every handle implementation provides.
///
/// The implementation must own a lock guarding all its mutable state, and it must never call
/// back into user code while holding that lock or synchronously from inside any of these methods:
/// all callbacks are delivered from deferred context (see [`crate::os::Runner`]).
pub trait GensioFunctions: Send + Sync {
    /// Starts opening the handle. Completion is reported exactly once via `done`.
    fn open(&self, done: Option<OpenDone>) -> Result<(), Error>;

    /// Starts closing the handle. Valid while open or while an open is still in progress;
    /// completion is reported exactly once via `done`.
    fn close(&self, done: Option<CloseDone>) -> Result<(), Error>;

    /// Scatter-gather write; never blocks.
    ///
    /// # Returns
    ///
    /// Number of bytes accepted, which may be less than the total length of `sg`.
    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error>;

    fn set_read_callback_enable(&self, enabled: bool);

    fn set_write_callback_enable(&self, enabled: bool);

    /// Adds one reference to the implementation.
    fn acquire(&self);

    /// Releases one reference. The last release finalizes the implementation.
    fn release(&self);

    fn remote_addr_string(&self) -> Result<String, Error> { Err(Error::NotSup) }

    fn remote_id(&self) -> Result<i32, Error> { Err(Error::NotSup) }

    /// Forces the implementation into the closed state without running the close sequence.
    fn disable(&self) -> Result<(), Error> { Err(Error::NotSup) }

    /// Gets (`get == true`) or sets an implementation-specific option.
    fn control(&self, depth: usize, get: bool, option: &str, data: &mut String) -> Result<(), Error> {
        Err(Error::NotSup)
    }
}

/// Capability flags of a handle.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct GensioFlags {
    pub is_client: bool,
    pub is_reliable: bool,
    pub is_packet: bool,
    pub is_message: bool,
}

pub(crate) struct GensioInner {
    type_name: &'static str,
    os: OsFuncs,
    funcs: Box<dyn GensioFunctions>,
    child: Option<Gensio>,
    event: Mutex<Option<Arc<dyn GensioEvent>>>,
    flags: Mutex<GensioFlags>,
}

/// Connected stream handle.
///
/// Owned handles are reference counted by the implementation: cloning a handle adds a reference
/// and dropping it (or calling [`Gensio::free`]) releases one. Handles passed to callbacks by
/// reference are borrowed views: they give access to the object without owning a reference, and
/// cloning them produces a new owned handle.
pub struct Gensio {
    inner: Arc<GensioInner>,
    owned: bool,
}

impl Clone for Gensio {
    fn clone(&self) -> Self {
        self.inner.funcs.acquire();
        Gensio {
            inner: self.inner.clone(),
            owned: true,
        }
    }
}

impl Drop for Gensio {
    fn drop(&mut self) {
        if self.owned {
            self.inner.funcs.release();
        }
    }
}

impl Debug for Gensio {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gensio")
            .field("type", &self.inner.type_name)
            .field("owned", &self.owned)
            .finish()
    }
}

/// Non-owning reference to a handle, used by implementations to reach their own handle.
#[derive(Clone)]
pub struct WeakGensio {
    inner: Weak<GensioInner>,
}

impl WeakGensio {
    /// Returns a borrowed view of the handle if it still exists. The view does not own a
    /// reference: dropping it does not release the implementation.
    pub fn upgrade(&self) -> Option<Gensio> {
        self.inner.upgrade().map(|inner| Gensio {
            inner,
            owned: false,
        })
    }
}

impl Gensio {
    /// Constructs a new handle dispatching to the implementation built by `build`.
    ///
    /// The implementation starts with a single reference, which is owned by the returned handle.
    /// `build` receives a weak reference to the handle being constructed, so the implementation
    /// can deliver events to it later. `child` is the next handle down the stack, if any; the
    /// composition layer which created the implementation is responsible for owning a reference
    /// to it.
    pub fn new_cyclic<F>(
        os: &OsFuncs,
        type_name: &'static str,
        child: Option<&Gensio>,
        event: Option<Arc<dyn GensioEvent>>,
        build: F,
    ) -> Gensio
    where
        F: FnOnce(WeakGensio) -> Box<dyn GensioFunctions>,
    {
        let inner = Arc::new_cyclic(|weak| GensioInner {
            type_name,
            os: os.clone(),
            funcs: build(WeakGensio {
                inner: weak.clone(),
            }),
            child: child.map(Gensio::view),
            event: Mutex::new(event),
            flags: default!(),
        });

        #[cfg(feature = "log")]
        log::debug!(target: "gensio", "Allocated {type_name} handle");

        Gensio { inner, owned: true }
    }

    fn view(&self) -> Gensio {
        Gensio {
            inner: self.inner.clone(),
            owned: false,
        }
    }

    pub fn downgrade(&self) -> WeakGensio {
        WeakGensio {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Tells whether two handles refer to the same object.
    pub fn ptr_eq(&self, other: &Gensio) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }

    pub fn type_name(&self) -> &'static str { self.inner.type_name }

    pub fn os(&self) -> &OsFuncs { &self.inner.os }

    /// Returns the handle `depth` levels down the stack; `0` is this handle itself.
    pub fn child(&self, depth: usize) -> Option<&Gensio> {
        match depth {
            0 => Some(self),
            depth => self.inner.child.as_ref()?.child(depth - 1),
        }
    }

    /// Replaces the event handler.
    pub fn set_callback(&self, event: Arc<dyn GensioEvent>) { *self.inner.event.lock() = Some(event) }

    /// Starts opening the handle.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`] if the handle is not closed, or an error preventing the open from
    /// starting. Failures happening after the open has started are reported to `done`.
    pub fn open(&self, done: Option<OpenDone>) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::trace!(target: "gensio", "Opening {} handle", self.inner.type_name);
        self.inner.funcs.open(done)
    }

    /// Opens the handle and waits for the open to complete, servicing the OS layer meanwhile.
    pub fn open_s(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let waiter = self.inner.os.alloc_waiter();
        let result = Arc::new(Mutex::new(None));
        let (w, r) = (waiter.clone(), result.clone());
        self.open(Some(Box::new(move |_, res| {
            *r.lock() = Some(res);
            w.wake();
        })))?;
        waiter.wait(1, timeout)?;
        let res = result.lock().take();
        res.unwrap_or(Err(Error::NotReady))
    }

    /// Starts closing the handle.
    pub fn close(&self, done: Option<CloseDone>) -> Result<(), Error> {
        #[cfg(feature = "log")]
        log::trace!(target: "gensio", "Closing {} handle", self.inner.type_name);
        self.inner.funcs.close(done)
    }

    /// Closes the handle and waits for the close to complete, servicing the OS layer meanwhile.
    pub fn close_s(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let waiter = self.inner.os.alloc_waiter();
        let w = waiter.clone();
        self.close(Some(Box::new(move |_| w.wake())))?;
        waiter.wait(1, timeout)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, Error> { self.write_sg(&[data]) }

    pub fn write_sg(&self, sg: &[&[u8]]) -> Result<usize, Error> { self.inner.funcs.write(sg) }

    pub fn set_read_callback_enable(&self, enabled: bool) {
        self.inner.funcs.set_read_callback_enable(enabled)
    }

    pub fn set_write_callback_enable(&self, enabled: bool) {
        self.inner.funcs.set_write_callback_enable(enabled)
    }

    pub fn remote_addr_string(&self) -> Result<String, Error> { self.inner.funcs.remote_addr_string() }

    pub fn remote_id(&self) -> Result<i32, Error> { self.inner.funcs.remote_id() }

    pub fn disable(&self) -> Result<(), Error> { self.inner.funcs.disable() }

    pub fn control(&self, depth: usize, get: bool, option: &str, data: &mut String) -> Result<(), Error> {
        self.inner.funcs.control(depth, get, option, data)
    }

    /// Releases the reference owned by this handle.
    pub fn free(self) {}

    pub fn flags(&self) -> GensioFlags { *self.inner.flags.lock() }
    pub fn is_client(&self) -> bool { self.inner.flags.lock().is_client }
    pub fn is_reliable(&self) -> bool { self.inner.flags.lock().is_reliable }
    pub fn is_packet(&self) -> bool { self.inner.flags.lock().is_packet }
    pub fn is_message(&self) -> bool { self.inner.flags.lock().is_message }

    pub fn set_flags(&self, flags: GensioFlags) { *self.inner.flags.lock() = flags }
    pub fn set_is_client(&self, val: bool) { self.inner.flags.lock().is_client = val }
    pub fn set_is_reliable(&self, val: bool) { self.inner.flags.lock().is_reliable = val }
    pub fn set_is_packet(&self, val: bool) { self.inner.flags.lock().is_packet = val }
    pub fn set_is_message(&self, val: bool) { self.inner.flags.lock().is_message = val }

    /// Copies capability flags from the handle right below this one.
    pub fn set_attr_from_child(&self) {
        if let Some(child) = self.child(1) {
            self.set_flags(child.flags());
        }
    }

    /// Delivers a read event to the user. Without a handler all the data are consumed.
    pub fn deliver_read(&self, data: Result<&[u8], Error>) -> usize {
        let event = self.inner.event.lock().clone();
        match event {
            Some(event) => event.handle_read(self, data),
            None => {
                #[cfg(feature = "log")]
                log::debug!(target: "gensio", "Dropping read event on {} handle without a handler", self.inner.type_name);
                data.map(<[u8]>::len).unwrap_or_default()
            }
        }
    }

    /// Delivers a write-ready event to the user.
    pub fn deliver_write_ready(&self) {
        let event = self.inner.event.lock().clone();
        if let Some(event) = event {
            event.handle_write_ready(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingGensio, Tally};

    #[test]
    fn free_after_n_refs() {
        let os = OsFuncs::new().unwrap();
        for n in 1..5 {
            let tally = Tally::default();
            let io = CountingGensio::alloc(&os, &tally);
            let refs = (1..n).map(|_| io.clone()).collect::<Vec<_>>();
            assert_eq!(tally.refcount(), n);
            drop(io);
            for (no, r) in refs.into_iter().enumerate() {
                assert_eq!(tally.finalized(), 0, "finalized before the last reference ({no}/{n})");
                r.free();
            }
            assert_eq!(tally.finalized(), 1);
            assert_eq!(tally.refcount(), 0);
        }
    }

    #[test]
    fn views_are_not_counted() {
        let os = OsFuncs::new().unwrap();
        let tally = Tally::default();
        let io = CountingGensio::alloc(&os, &tally);
        let weak = io.downgrade();
        {
            let view = weak.upgrade().unwrap();
            assert!(view.ptr_eq(&io));
            assert_eq!(tally.refcount(), 1);
            let owned = view.clone();
            assert_eq!(tally.refcount(), 2);
            drop(owned);
        }
        assert_eq!(tally.refcount(), 1);
        drop(io);
        assert_eq!(tally.finalized(), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn flags_and_child() {
        let os = OsFuncs::new().unwrap();
        let tally = Tally::default();
        let child = CountingGensio::alloc(&os, &tally);
        child.set_is_reliable(true);
        child.set_is_packet(true);
        let parent = Gensio::new_cyclic(&os, "parent", Some(&child), None, |_| {
            Box::new(CountingGensio::detached())
        });
        assert_eq!(tally.refcount(), 1, "child view must not take a reference");
        assert!(parent.child(1).unwrap().ptr_eq(&child));
        assert!(parent.child(2).is_none());
        assert!(!parent.is_reliable());
        parent.set_attr_from_child();
        assert!(parent.is_reliable());
        assert!(parent.is_packet());
        assert!(!parent.is_message());
        assert_eq!(parent.type_name(), "parent");
    }

    #[test]
    fn read_without_handler_consumes() {
        let os = OsFuncs::new().unwrap();
        let tally = Tally::default();
        let io = CountingGensio::alloc(&os, &tally);
        assert_eq!(io.deliver_read(Ok(b"abc")), 3);
        assert_eq!(io.deliver_read(Err(Error::RemClose)), 0);
    }
}
