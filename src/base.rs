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


//! Filter over lower layer composition.
//!
//! [`base_gensio_alloc`] builds a handle out of a [`Filter`] and a [`LowerLayer`]. User writes go
//! through [`Filter::ul_write`] before reaching the lower layer; data coming from the lower layer
//! go through [`Filter::ll_write`] before being delivered to the user. Opening runs the lower
//! layer open followed by the filter handshake; closing runs the filter disconnect followed by
//! the lower layer close.
//!
//! Lock discipline: the handle lock is held while calling into the filter and the lower layer,
//! never while calling user code. Lower layers report completions and events from deferred
//! context, so they never re-enter the handle lock.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::MutexGuard;

use crate::filter::{Filter, Handshake};
use crate::gensio::{
    CloseDone, Gensio, GensioEvent, GensioFlags, GensioFunctions, OpenDone, WeakGensio,
};
use crate::ll::{LlHandler, LowerLayer};
use crate::os::{Lock, OsFuncs, Runner, Timer};
use crate::Error;

/// Side of the connection a composed handle is on.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Side {
    /// Handle opens its lower layer itself.
    Client,
    /// Handle is built over an already connected child produced by an accepter; the first open
    /// skips opening the lower layer and goes straight to the filter handshake.
    Server,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
enum State {
    Closed,
    InLlOpen,
    InFilterOpen,
    Open,
    InOpenClose,
    InFilterClose,
    InLlClose,
}

struct BaseData {
    refcount: usize,
    state: State,
    filter: Box<dyn Filter>,
    ll: Option<Box<dyn LowerLayer>>,
    ll_connected: bool,
    start_pending: bool,
    reporting_open: bool,
    read_enabled: bool,
    xmit_enabled: bool,
    in_read: bool,
    in_write_ready: bool,
    /// Filtered data waiting for the user.
    read_buf: Vec<u8>,
    read_err: Option<Error>,
    /// Filtered data the lower layer did not take yet.
    xmit_buf: Vec<u8>,
    open_done: Option<OpenDone>,
    open_err: Option<Error>,
    close_done: Option<CloseDone>,
    close_flush: bool,
    close_ready: bool,
    deferred_op_pending: bool,
    hold: Option<Gensio>,
}

impl BaseData {
    fn ll(&self) -> Result<&dyn LowerLayer, Error> { self.ll.as_deref().ok_or(Error::NotReady) }

    fn has_input(&self) -> bool { !self.read_buf.is_empty() || self.read_err.is_some() }

    /// Writes out as much of the pending filtered output as the lower layer takes.
    fn flush_xmit(&mut self) -> Result<(), Error> {
        let ll = self.ll.as_deref().ok_or(Error::NotReady)?;
        while !self.xmit_buf.is_empty() {
            let count = ll.write(&[&self.xmit_buf])?;
            if count == 0 {
                break;
            }
            self.xmit_buf.drain(..count.min(self.xmit_buf.len()));
        }
        Ok(())
    }

    /// Lower layer read is enabled only while the user takes data.
    fn sync_ll_read(&self) {
        let enabled = self.read_enabled && !self.has_input();
        if let Some(ll) = self.ll.as_deref() {
            ll.set_read_callback_enable(enabled)
        }
    }

    fn sync_ll_write(&self) {
        let enabled = self.xmit_enabled || !self.xmit_buf.is_empty();
        if let Some(ll) = self.ll.as_deref() {
            ll.set_write_callback_enable(enabled)
        }
    }

    /// Lower layer write stays enabled only to drain pending filtered output.
    fn sync_ll_flush(&self) {
        if let Some(ll) = self.ll.as_deref() {
            ll.set_write_callback_enable(!self.xmit_buf.is_empty())
        }
    }
}

struct BaseInner {
    me: Weak<BaseInner>,
    io: WeakGensio,
    runner: Runner,
    timer: Timer,
    data: Lock<BaseData>,
}

/// Handle implementation composed of a filter and a lower layer.
pub struct BaseGensio {
    inner: Arc<BaseInner>,
}

/// Builds a handle out of `filter` running over `ll`.
///
/// `child` is the handle `ll` runs on, if any; the lower layer owns the reference to it. The
/// handle capability flags are taken from the child, as adjusted by [`Filter::flags`]. Server side
/// handles never report being a client.
pub fn base_gensio_alloc(
    os: &OsFuncs,
    ll: Box<dyn LowerLayer>,
    filter: Box<dyn Filter>,
    child: Option<&Gensio>,
    type_name: &'static str,
    side: Side,
    event: Option<Arc<dyn GensioEvent>>,
) -> Gensio {
    let base = match child {
        Some(child) => child.flags(),
        None => GensioFlags {
            is_client: side == Side::Client,
            ..default!()
        },
    };
    let mut flags = filter.flags(base);
    if side == Side::Server {
        flags.is_client = false;
    }

    let io = Gensio::new_cyclic(os, type_name, child, event, |weak| {
        let inner = Arc::new_cyclic(|me: &Weak<BaseInner>| {
            let runner = os.alloc_runner({
                let me = me.clone();
                move || {
                    if let Some(inner) = me.upgrade() {
                        inner.deferred_op()
                    }
                }
            });
            let timer = os.alloc_timer({
                let me = me.clone();
                move || {
                    if let Some(inner) = me.upgrade() {
                        inner.handle_timeout()
                    }
                }
            });
            BaseInner {
                me: me.clone(),
                io: weak,
                runner,
                timer,
                data: Lock::new(BaseData {
                    refcount: 1,
                    state: State::Closed,
                    filter,
                    ll: Some(ll),
                    ll_connected: side == Side::Server,
                    start_pending: false,
                    reporting_open: false,
                    read_enabled: false,
                    xmit_enabled: false,
                    in_read: false,
                    in_write_ready: false,
                    read_buf: empty!(),
                    read_err: None,
                    xmit_buf: empty!(),
                    open_done: None,
                    open_err: None,
                    close_done: None,
                    close_flush: false,
                    close_ready: false,
                    deferred_op_pending: false,
                    hold: None,
                }),
            }
        });
        let handler: Weak<dyn LlHandler> = inner.me.clone();
        if let Ok(ll) = inner.data.lock().ll() {
            ll.set_handler(handler);
        }
        Box::new(BaseGensio { inner })
    });
    io.set_flags(flags);

    #[cfg(feature = "log")]
    log::debug!(target: "base", "Composed {type_name} handle as {side:?}");

    io
}

impl BaseInner {
    fn start_deferred_op(&self, st: &mut BaseData) {
        if st.deferred_op_pending {
            return;
        }
        let Some(io) = self.io.upgrade() else {
            return;
        };
        st.deferred_op_pending = true;
        st.refcount += 1;
        st.hold = Some(io);
        self.runner.schedule();
    }

    fn deref_and_unlock(&self, mut st: MutexGuard<BaseData>) {
        assert!(st.refcount > 0, "base handle reference count underflow");
        st.refcount -= 1;
        if st.refcount > 0 {
            return;
        }

        #[cfg(feature = "log")]
        log::debug!(target: "base", "Finalizing composed handle");

        st.state = State::Closed;
        let _ = self.timer.stop();
        let ll = st.ll.take();
        let open_done = st.open_done.take();
        let close_done = st.close_done.take();
        drop(st);
        drop(open_done);
        drop(close_done);
        drop(ll);
    }

    fn deferred_op(&self) {
        let mut st = self.data.lock();
        st.deferred_op_pending = false;
        let io = st.hold.take();
        if let Some(io) = &io {
            if mem::take(&mut st.start_pending) && st.state == State::InFilterOpen {
                self.try_connect(&mut st, io);
            }
            if mem::take(&mut st.close_ready) {
                self.finish_close(&mut st, io);
            }
            self.deliver_reads(&mut st, io);
        }
        self.deref_and_unlock(st);
    }

    fn deliver_reads(&self, st: &mut MutexGuard<BaseData>, io: &Gensio) {
        while st.state == State::Open && st.read_enabled && !st.in_read && !st.reporting_open {
            if !st.read_buf.is_empty() {
                st.in_read = true;
                let mut buf = mem::take(&mut st.read_buf);
                let consumed = MutexGuard::unlocked(st, || io.deliver_read(Ok(&buf)));

                #[cfg(feature = "log")]
                log::trace!(target: "base", "User consumed {consumed} of {} bytes", buf.len());

                buf.drain(..consumed.min(buf.len()));
                buf.extend_from_slice(&st.read_buf);
                st.read_buf = buf;
                st.in_read = false;
                if consumed == 0 {
                    // Let the rest of the loop run before trying again
                    self.start_deferred_op(st);
                    break;
                }
            } else if let Some(err) = st.read_err.clone() {
                st.in_read = true;
                st.read_enabled = false;
                MutexGuard::unlocked(st, || io.deliver_read(Err(err)));
                st.in_read = false;
                break;
            } else {
                break;
            }
        }
        if st.state == State::Open && !st.reporting_open {
            st.sync_ll_read();
        }
    }

    fn try_connect(&self, st: &mut MutexGuard<BaseData>, io: &Gensio) {
        let mut out = vec![];
        let res = st.filter.try_connect(&mut out);
        st.xmit_buf.append(&mut out);
        if let Err(err) = st.flush_xmit() {
            return self.fail_open(st, err);
        }
        if !st.xmit_buf.is_empty() {
            st.sync_ll_write();
        }
        match res {
            Err(err) => self.fail_open(st, err),
            Ok(Handshake::InProgress) => {}
            Ok(Handshake::Retry(delay)) => self.start_retry_timer(delay),
            Ok(Handshake::Done) => self.report_open(st, io),
        }
    }

    fn report_open(&self, st: &mut MutexGuard<BaseData>, io: &Gensio) {
        #[cfg(feature = "log")]
        log::trace!(target: "base", "Handshake complete, handle is open");

        st.state = State::Open;
        st.reporting_open = true;
        if let Some(done) = st.open_done.take() {
            MutexGuard::unlocked(st, || done(io, Ok(())));
        }
        st.reporting_open = false;
        if st.state != State::Open {
            return;
        }
        st.sync_ll_read();
        st.sync_ll_write();
        if st.read_enabled && st.has_input() {
            self.start_deferred_op(st);
        }
    }

    fn fail_open(&self, st: &mut MutexGuard<BaseData>, err: Error) {
        #[cfg(feature = "log")]
        log::warn!(target: "base", "Unable to open composed handle: {err}");

        st.open_err = Some(err);
        self.start_ll_close(st);
    }

    fn try_disconnect(&self, st: &mut MutexGuard<BaseData>) {
        let mut out = vec![];
        let res = st.filter.try_disconnect(&mut out);
        st.xmit_buf.append(&mut out);
        let flushed = st.flush_xmit();
        match (res, flushed) {
            (Ok(Handshake::InProgress), Ok(())) => st.sync_ll_flush(),
            (Ok(Handshake::Retry(delay)), Ok(())) => {
                st.sync_ll_flush();
                self.start_retry_timer(delay);
            }
            (Ok(Handshake::Done), Ok(())) if !st.xmit_buf.is_empty() => {
                st.close_flush = true;
                st.sync_ll_write();
            }
            _ => self.start_ll_close(st),
        }
    }

    fn start_retry_timer(&self, delay: Duration) {
        if let Err(err) = self.timer.start(delay) {
            #[cfg(feature = "log")]
            log::warn!(target: "base", "Unable to start handshake retry timer: {err}");
        }
    }

    fn start_ll_close(&self, st: &mut MutexGuard<BaseData>) {
        st.state = State::InLlClose;
        self.ll_close(st);
    }

    fn ll_close(&self, st: &mut MutexGuard<BaseData>) {
        let _ = self.timer.stop();
        let me = self.me.clone();
        let res = st.ll().and_then(|ll| {
            ll.set_read_callback_enable(false);
            ll.set_write_callback_enable(false);
            ll.close(Box::new(move || {
                if let Some(inner) = me.upgrade() {
                    inner.ll_close_done()
                }
            }))
        });
        if res.is_err() {
            // Lower layer is already down: complete from deferred context
            st.close_ready = true;
            self.start_deferred_op(st);
        }
        st.ll_connected = false;
    }

    fn finish_close(&self, st: &mut MutexGuard<BaseData>, io: &Gensio) {
        #[cfg(feature = "log")]
        log::trace!(target: "base", "Composed handle closed");

        st.state = State::Closed;
        let _ = self.timer.stop();
        st.filter.cleanup();
        st.read_buf.clear();
        st.xmit_buf.clear();
        st.read_err = None;
        st.close_flush = false;
        let open_err = st.open_err.take().unwrap_or(Error::LocalClosed);
        let open_done = st.open_done.take();
        let close_done = st.close_done.take();
        MutexGuard::unlocked(st, || {
            if let Some(done) = open_done {
                done(io, Err(open_err));
            }
            if let Some(done) = close_done {
                done(io);
            }
        });
    }

    fn ll_open_done(&self, res: Result<(), Error>) {
        let Some(io) = self.io.upgrade() else {
            return;
        };
        let mut st = self.data.lock();
        match (st.state, res) {
            (State::InLlOpen, Ok(())) => {
                st.state = State::InFilterOpen;
                st.ll_connected = true;
                if let Ok(ll) = st.ll() {
                    ll.set_read_callback_enable(true);
                }
                self.try_connect(&mut st, &io);
            }
            (State::InLlOpen, Err(err)) => {
                #[cfg(feature = "log")]
                log::warn!(target: "base", "Lower layer failed to open: {err}");

                st.state = State::Closed;
                st.filter.cleanup();
                if let Some(done) = st.open_done.take() {
                    MutexGuard::unlocked(&mut st, || done(&io, Err(err)));
                }
            }
            (State::InOpenClose, _) => {
                if let Some(done) = st.open_done.take() {
                    MutexGuard::unlocked(&mut st, || done(&io, Err(Error::LocalClosed)));
                }
            }
            _ => {}
        }
    }

    fn ll_close_done(&self) {
        let Some(io) = self.io.upgrade() else {
            return;
        };
        let mut st = self.data.lock();
        if matches!(st.state, State::InLlClose | State::InOpenClose) {
            self.finish_close(&mut st, &io);
        }
    }

    fn handle_timeout(&self) {
        let Some(io) = self.io.upgrade() else {
            return;
        };
        let mut st = self.data.lock();
        match st.state {
            State::InFilterOpen => match st.filter.timeout() {
                Ok(()) => self.try_connect(&mut st, &io),
                Err(err) => self.fail_open(&mut st, err),
            },
            State::InFilterClose => match st.filter.timeout() {
                Ok(()) => self.try_disconnect(&mut st),
                Err(_) => self.start_ll_close(&mut st),
            },
            _ => {}
        }
    }

    fn open(&self, done: Option<OpenDone>) -> Result<(), Error> {
        let mut st = self.data.lock();
        if st.state != State::Closed {
            return Err(Error::NotReady);
        }
        st.filter.setup()?;
        st.open_done = done;
        st.open_err = None;
        st.read_err = None;

        if st.ll_connected {
            st.state = State::InFilterOpen;
            st.start_pending = true;
            if let Ok(ll) = st.ll() {
                ll.set_read_callback_enable(true);
            }
            self.start_deferred_op(&mut st);
            return Ok(());
        }

        st.state = State::InLlOpen;
        let me = self.me.clone();
        let res = st.ll().and_then(|ll| {
            ll.open(Box::new(move |res| {
                if let Some(inner) = me.upgrade() {
                    inner.ll_open_done(res)
                }
            }))
        });
        if let Err(err) = res {
            st.state = State::Closed;
            st.filter.cleanup();
            let done = st.open_done.take();
            drop(st);
            drop(done);
            return Err(err);
        }
        Ok(())
    }

    fn close(&self, done: Option<CloseDone>) -> Result<(), Error> {
        let mut st = self.data.lock();
        match st.state {
            State::Open => {
                st.state = State::InFilterClose;
                st.close_done = done;
                self.try_disconnect(&mut st);
            }
            State::InLlOpen | State::InFilterOpen => {
                st.state = State::InOpenClose;
                st.close_done = done;
                st.start_pending = false;
                self.ll_close(&mut st);
            }
            _ => return Err(Error::NotReady),
        }
        Ok(())
    }

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error> {
        let mut guard = self.data.lock();
        let st = &mut *guard;
        if st.state != State::Open {
            return Err(Error::NotReady);
        }
        st.flush_xmit()?;
        if !st.xmit_buf.is_empty() {
            return Ok(0);
        }
        let count = st.filter.ul_write(sg, &mut st.xmit_buf)?;
        st.flush_xmit()?;
        if !st.xmit_buf.is_empty() {
            st.sync_ll_write();
        }
        Ok(count)
    }

    fn set_read_callback_enable(&self, enabled: bool) {
        let mut st = self.data.lock();
        st.read_enabled = enabled;
        if st.state != State::Open || st.reporting_open {
            return;
        }
        st.sync_ll_read();
        if enabled && st.has_input() && !st.in_read {
            self.start_deferred_op(&mut st);
        }
    }

    fn set_write_callback_enable(&self, enabled: bool) {
        let mut st = self.data.lock();
        st.xmit_enabled = enabled;
        if st.state == State::Open && !st.reporting_open {
            st.sync_ll_write();
        }
    }

    fn disable(&self) -> Result<(), Error> {
        let mut st = self.data.lock();
        st.state = State::Closed;
        st.ll_connected = false;
        let _ = self.timer.stop();
        st.filter.cleanup();
        st.read_buf.clear();
        st.xmit_buf.clear();
        let open_done = st.open_done.take();
        let close_done = st.close_done.take();
        let res = st.ll().and_then(|ll| ll.disable());
        drop(st);
        drop(open_done);
        drop(close_done);
        res
    }
}

impl LlHandler for BaseInner {
    fn ll_read(&self, data: Result<&[u8], Error>) -> usize {
        let len = data.as_ref().map(|data| data.len()).unwrap_or_default();
        let Some(io) = self.io.upgrade() else {
            return len;
        };
        let mut guard = self.data.lock();
        match guard.state {
            State::InFilterOpen => {
                let st = &mut *guard;
                let consumed = data.and_then(|data| st.filter.ll_write(data, &mut st.read_buf));
                match consumed {
                    Ok(count) => {
                        self.try_connect(&mut guard, &io);
                        count
                    }
                    Err(err) => {
                        self.fail_open(&mut guard, err);
                        len
                    }
                }
            }
            State::Open => {
                let st = &mut *guard;
                let consumed = match data {
                    Ok(data) => st.filter.ll_write(data, &mut st.read_buf).unwrap_or_else(|err| {
                        st.read_err = Some(err);
                        len
                    }),
                    Err(err) => {
                        #[cfg(feature = "log")]
                        log::debug!(target: "base", "Lower layer read failed: {err}");
                        st.read_err = Some(err);
                        0
                    }
                };
                self.deliver_reads(&mut guard, &io);
                if guard.reporting_open {
                    // Delivery resumes once the user got the open completion
                    if let Ok(ll) = guard.ll() {
                        ll.set_read_callback_enable(false);
                    }
                }
                consumed
            }
            State::InFilterClose => match data {
                Ok(data) => {
                    let mut discard = vec![];
                    let count = guard.filter.ll_write(data, &mut discard).unwrap_or(len);
                    self.try_disconnect(&mut guard);
                    count
                }
                Err(_) => {
                    self.start_ll_close(&mut guard);
                    0
                }
            },
            _ => len,
        }
    }

    fn ll_write_ready(&self) {
        let Some(io) = self.io.upgrade() else {
            return;
        };
        let mut guard = self.data.lock();
        let flushed = guard.flush_xmit();
        match guard.state {
            State::InFilterOpen => {
                if let Err(err) = flushed {
                    self.fail_open(&mut guard, err);
                }
            }
            State::Open => {
                if guard.xmit_buf.is_empty()
                    && guard.xmit_enabled
                    && !guard.in_write_ready
                    && !guard.reporting_open
                {
                    guard.in_write_ready = true;
                    MutexGuard::unlocked(&mut guard, || io.deliver_write_ready());
                    guard.in_write_ready = false;
                }
            }
            State::InFilterClose if guard.close_flush => {
                if flushed.is_err() || guard.xmit_buf.is_empty() {
                    self.start_ll_close(&mut guard);
                }
            }
            _ => {}
        }

        // The user may have changed the state from inside the callback
        match guard.state {
            State::Open if !guard.reporting_open => guard.sync_ll_write(),
            State::Open | State::InFilterOpen | State::InFilterClose => guard.sync_ll_flush(),
            _ => {
                if let Ok(ll) = guard.ll() {
                    ll.set_write_callback_enable(false);
                }
            }
        }
    }
}

impl GensioFunctions for BaseGensio {
    fn open(&self, done: Option<OpenDone>) -> Result<(), Error> { self.inner.open(done) }

    fn close(&self, done: Option<CloseDone>) -> Result<(), Error> { self.inner.close(done) }

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error> { self.inner.write(sg) }

    fn set_read_callback_enable(&self, enabled: bool) { self.inner.set_read_callback_enable(enabled) }

    fn set_write_callback_enable(&self, enabled: bool) {
        self.inner.set_write_callback_enable(enabled)
    }

    fn acquire(&self) {
        let mut st = self.inner.data.lock();
        assert!(st.refcount > 0, "acquiring a finalized base handle");
        st.refcount += 1;
    }

    fn release(&self) {
        let mut st = self.inner.data.lock();
        if st.refcount == 1 {
            st.state = State::Closed;
        }
        self.inner.deref_and_unlock(st);
    }

    fn remote_addr_string(&self) -> Result<String, Error> {
        self.inner.data.lock().ll()?.remote_addr_string()
    }

    fn remote_id(&self) -> Result<i32, Error> { self.inner.data.lock().ll()?.remote_id() }

    fn disable(&self) -> Result<(), Error> { self.inner.disable() }

    fn control(&self, depth: usize, get: bool, option: &str, data: &mut String) -> Result<(), Error> {
        let mut st = self.inner.data.lock();
        match depth {
            0 => st.filter.control(get, option, data),
            depth => st.ll()?.control(depth - 1, get, option, data),
        }
    }
}
