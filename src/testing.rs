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


//! Mock transports, filters and event handlers shared by the unit tests.

#![allow(unused_variables)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::accepter::{Accepter, AccepterEvent, AccepterFunctions, GensioAccepterHooks, ShutdownDone};
use crate::base::{base_gensio_alloc, Side};
use crate::filter::{Filter, Handshake};
use crate::gensio::{CloseDone, Gensio, GensioEvent, GensioFunctions, OpenDone, WeakGensio};
use crate::ll::GensioLl;
use crate::os::{OsFuncs, Runner, Waiter};
use crate::registry::Registry;
use crate::Error;

thread_local! {
    static LAST_TALLY: RefCell<Option<Tally>> = RefCell::new(None);
    static LAST_MOCK: RefCell<Option<MockAccepter>> = RefCell::new(None);
}

/// Tally of the last handle built by the `counting` factory on this thread.
pub fn last_counting_tally() -> Option<Tally> { LAST_TALLY.with(|tally| tally.borrow().clone()) }

/// Last accepter built by the `mock` factory on this thread.
pub fn last_mock_accepter() -> Option<MockAccepter> { LAST_MOCK.with(|mock| mock.borrow().clone()) }

/// Registry with the default factories plus the `counting` transport and the `mock` accepter.
pub fn registry(os: &OsFuncs) -> Registry {
    let mut registry = Registry::with_defaults(os).unwrap();
    registry.register_gensio("counting", str_to_counting).unwrap();
    registry.register_gensio_accepter("mock", str_to_mock).unwrap();
    registry
}

fn str_to_counting(
    registry: &Registry,
    rest: &str,
    args: &[String],
    event: Option<Arc<dyn GensioEvent>>,
) -> Result<Gensio, Error> {
    if !rest.is_empty() || !args.is_empty() {
        return Err(Error::Inval);
    }
    let tally = Tally::default();
    let io = CountingGensio::alloc(registry.os(), &tally);
    if let Some(event) = event {
        io.set_callback(event);
    }
    LAST_TALLY.with(|last| *last.borrow_mut() = Some(tally));
    Ok(io)
}

fn str_to_mock(
    registry: &Registry,
    rest: &str,
    args: &[String],
    event: Option<Arc<dyn AccepterEvent>>,
) -> Result<Accepter, Error> {
    if !rest.is_empty() || !args.is_empty() {
        return Err(Error::Inval);
    }
    let mock = MockAccepter::new(registry.os());
    if let Some(event) = event {
        mock.acc.set_callback(event);
    }
    let acc = mock.accepter();
    LAST_MOCK.with(|last| *last.borrow_mut() = Some(mock));
    Ok(acc)
}

#[derive(Default)]
struct TallyData {
    refcount: usize,
    finalized: usize,
    opens: usize,
    written: Vec<u8>,
    read_enabled: bool,
    disables: usize,
}

/// What happened to a [`CountingGensio`].
#[derive(Clone, Default)]
pub struct Tally(Arc<Mutex<TallyData>>);

impl Tally {
    pub fn refcount(&self) -> usize { self.0.lock().refcount }
    pub fn finalized(&self) -> usize { self.0.lock().finalized }
    pub fn opens(&self) -> usize { self.0.lock().opens }
    pub fn written(&self) -> Vec<u8> { self.0.lock().written.clone() }
    pub fn read_enabled(&self) -> bool { self.0.lock().read_enabled }
    pub fn disables(&self) -> usize { self.0.lock().disables }
}

enum Completion {
    Open(Option<OpenDone>),
    Close(Option<CloseDone>),
}

/// Leaf handle recording everything done to it.
///
/// Open and close always succeed and complete from the runner in the order they were requested.
/// Writes are taken whole in any state; reads happen only when a test calls
/// [`Gensio::deliver_read`].
pub struct CountingGensio {
    tally: Tally,
    runner: Option<Runner>,
    pending: Arc<Mutex<VecDeque<Completion>>>,
}

impl CountingGensio {
    pub fn alloc(os: &OsFuncs, tally: &Tally) -> Gensio {
        tally.0.lock().refcount += 1;
        let io = Gensio::new_cyclic(os, "counting", None, None, |weak: WeakGensio| {
            let pending = Arc::new(Mutex::new(VecDeque::<Completion>::new()));
            let queue = pending.clone();
            let runner = os.alloc_runner(move || loop {
                let next = queue.lock().pop_front();
                let Some(completion) = next else {
                    break;
                };
                let Some(io) = weak.upgrade() else {
                    continue;
                };
                match completion {
                    Completion::Open(Some(done)) => done(&io, Ok(())),
                    Completion::Close(Some(done)) => done(&io),
                    _ => {}
                }
            });
            Box::new(CountingGensio {
                tally: tally.clone(),
                runner: Some(runner),
                pending,
            })
        });
        io.set_is_client(true);
        io.set_is_reliable(true);
        io
    }

    /// Implementation not bound to any handle, with a private tally holding one reference.
    pub fn detached() -> Self {
        let tally = Tally::default();
        tally.0.lock().refcount = 1;
        CountingGensio {
            tally,
            runner: None,
            pending: default!(),
        }
    }

    fn complete(&self, completion: Completion) -> Result<(), Error> {
        let runner = self.runner.as_ref().ok_or(Error::NotSup)?;
        self.pending.lock().push_back(completion);
        runner.schedule();
        Ok(())
    }
}

impl GensioFunctions for CountingGensio {
    fn open(&self, done: Option<OpenDone>) -> Result<(), Error> {
        self.tally.0.lock().opens += 1;
        self.complete(Completion::Open(done))
    }

    fn close(&self, done: Option<CloseDone>) -> Result<(), Error> { self.complete(Completion::Close(done)) }

    fn write(&self, sg: &[&[u8]]) -> Result<usize, Error> {
        let mut tally = self.tally.0.lock();
        for buf in sg {
            tally.written.extend_from_slice(buf);
        }
        Ok(sg.iter().map(|buf| buf.len()).sum())
    }

    fn set_read_callback_enable(&self, enabled: bool) { self.tally.0.lock().read_enabled = enabled }

    fn set_write_callback_enable(&self, enabled: bool) {}

    fn acquire(&self) { self.tally.0.lock().refcount += 1 }

    fn disable(&self) -> Result<(), Error> {
        self.tally.0.lock().disables += 1;
        Ok(())
    }

    fn release(&self) {
        let mut tally = self.tally.0.lock();
        assert!(tally.refcount > 0, "counting handle released too many times");
        tally.refcount -= 1;
        if tally.refcount == 0 {
            tally.finalized += 1;
        }
    }
}

#[derive(Default)]
struct FilterCounts {
    setups: usize,
    cleanups: usize,
    timeouts: usize,
    drops: usize,
    allocated: usize,
    finishes: usize,
    fail_allocations: bool,
    fail_finish: bool,
}

/// What happened to the [`TallyFilter`]s sharing it.
#[derive(Clone, Default)]
pub struct FilterTally(Arc<Mutex<FilterCounts>>);

impl FilterTally {
    pub fn setups(&self) -> usize { self.0.lock().setups }
    pub fn cleanups(&self) -> usize { self.0.lock().cleanups }
    pub fn timeouts(&self) -> usize { self.0.lock().timeouts }
    pub fn drops(&self) -> usize { self.0.lock().drops }
    pub fn allocated(&self) -> usize { self.0.lock().allocated }
    pub fn finishes(&self) -> usize { self.0.lock().finishes }

    /// Makes [`TallyHooks`] refuse to allocate filters.
    pub fn fail_allocations(&self, fail: bool) { self.0.lock().fail_allocations = fail }

    /// Makes [`TallyHooks`] reject connections once their handshake is done.
    pub fn fail_finish(&self, fail: bool) { self.0.lock().fail_finish = fail }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum HandshakeMode {
    None,
    /// Sends `HELLO` and waits for `OK`.
    Greeting,
    /// Asks for a retry until the timer fires once.
    Retry,
}

/// Filter passing writes through and upper-casing reads.
pub struct TallyFilter {
    tally: FilterTally,
    mode: HandshakeMode,
    greeted: bool,
    reply: Vec<u8>,
    timed_out: bool,
    /// Never finishes the closing handshake.
    lingering: bool,
}

impl TallyFilter {
    fn with_mode(tally: &FilterTally, mode: HandshakeMode) -> Self {
        TallyFilter {
            tally: tally.clone(),
            mode,
            greeted: false,
            reply: empty!(),
            timed_out: false,
            lingering: false,
        }
    }

    pub fn new(tally: &FilterTally) -> Self { TallyFilter::with_mode(tally, HandshakeMode::None) }

    pub fn with_handshake(tally: &FilterTally) -> Self {
        TallyFilter::with_mode(tally, HandshakeMode::Greeting)
    }

    pub fn with_retry(tally: &FilterTally) -> Self { TallyFilter::with_mode(tally, HandshakeMode::Retry) }

    pub fn lingering(tally: &FilterTally) -> Self {
        let mut filter = TallyFilter::new(tally);
        filter.lingering = true;
        filter
    }

    fn expects_reply(&self) -> bool { self.mode == HandshakeMode::Greeting && self.reply.len() < 2 }
}

impl Drop for TallyFilter {
    fn drop(&mut self) { self.tally.0.lock().drops += 1 }
}

impl Filter for TallyFilter {
    fn setup(&mut self) -> Result<(), Error> {
        self.tally.0.lock().setups += 1;
        Ok(())
    }

    fn cleanup(&mut self) {
        self.tally.0.lock().cleanups += 1;
        self.greeted = false;
        self.reply.clear();
        self.timed_out = false;
    }

    fn try_connect(&mut self, out: &mut Vec<u8>) -> Result<Handshake, Error> {
        match self.mode {
            HandshakeMode::None => Ok(Handshake::Done),
            HandshakeMode::Retry if self.timed_out => Ok(Handshake::Done),
            HandshakeMode::Retry => Ok(Handshake::Retry(Duration::from_millis(10))),
            HandshakeMode::Greeting => {
                if !self.greeted {
                    out.extend_from_slice(b"HELLO");
                    self.greeted = true;
                }
                match self.reply.as_slice() {
                    b"OK" => Ok(Handshake::Done),
                    reply if reply.len() < 2 => Ok(Handshake::InProgress),
                    _ => Err(Error::Inval),
                }
            }
        }
    }

    fn try_disconnect(&mut self, out: &mut Vec<u8>) -> Result<Handshake, Error> {
        if self.lingering {
            return Ok(Handshake::InProgress);
        }
        Ok(Handshake::Done)
    }

    fn timeout(&mut self) -> Result<(), Error> {
        self.tally.0.lock().timeouts += 1;
        self.timed_out = true;
        Ok(())
    }

    fn ul_write(&mut self, sg: &[&[u8]], out: &mut Vec<u8>) -> Result<usize, Error> {
        let start = out.len();
        for buf in sg {
            out.extend_from_slice(buf);
        }
        Ok(out.len() - start)
    }

    fn ll_write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize, Error> {
        if self.expects_reply() {
            let count = data.len().min(2 - self.reply.len());
            self.reply.extend_from_slice(&data[..count]);
            return Ok(count);
        }
        out.extend(data.iter().map(u8::to_ascii_uppercase));
        Ok(data.len())
    }
}

/// Accepter hooks stacking a [`TallyFilter`] over every connection.
pub struct TallyHooks {
    os: OsFuncs,
    filters: FilterTally,
}

impl TallyHooks {
    pub fn new(os: &OsFuncs, filters: &FilterTally) -> Self {
        TallyHooks {
            os: os.clone(),
            filters: filters.clone(),
        }
    }
}

impl GensioAccepterHooks for TallyHooks {
    fn new_child(&self) -> Result<Box<dyn Filter>, Error> {
        let mut counts = self.filters.0.lock();
        if counts.fail_allocations {
            return Err(Error::NoMem);
        }
        counts.allocated += 1;
        drop(counts);
        Ok(Box::new(TallyFilter::new(&self.filters)))
    }

    /// Marks accepted handles as packet oriented.
    fn finish_parent(&self, io: &Gensio) -> Result<(), Error> {
        let mut counts = self.filters.0.lock();
        counts.finishes += 1;
        if counts.fail_finish {
            return Err(Error::Inval);
        }
        io.set_is_packet(true);
        Ok(())
    }

    fn alloc_gensio(
        &self,
        args: &[String],
        child: &Gensio,
        event: Option<Arc<dyn GensioEvent>>,
    ) -> Result<Gensio, Error> {
        let ll = GensioLl::new(child);
        let filter = TallyFilter::new(&self.filters);
        Ok(base_gensio_alloc(
            &self.os,
            Box::new(ll),
            Box::new(filter),
            Some(child),
            "tally",
            Side::Client,
            event,
        ))
    }
}

fn remaining(deadline: Instant) -> Result<Duration, Error> {
    deadline.checked_duration_since(Instant::now()).ok_or(Error::TimedOut)
}

#[derive(Default)]
struct Collected {
    data: Vec<u8>,
    error: Option<Error>,
}

/// Read handler collecting the data it gets, optionally taking at most `chunk` bytes per event.
pub struct Collector {
    waiter: Waiter,
    chunk: usize,
    collected: Mutex<Collected>,
}

impl Collector {
    pub fn new(os: &OsFuncs) -> Arc<Self> { Collector::with_chunk(os, usize::MAX) }

    pub fn with_chunk(os: &OsFuncs, chunk: usize) -> Arc<Self> {
        Arc::new(Collector {
            waiter: os.alloc_waiter(),
            chunk,
            collected: default!(),
        })
    }

    pub fn data(&self) -> Vec<u8> { self.collected.lock().data.clone() }

    /// Waits until at least `len` bytes got collected.
    pub fn wait_for(&self, len: usize, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        while self.collected.lock().data.len() < len {
            self.waiter.wait(1, Some(remaining(deadline)?))?;
        }
        Ok(())
    }

    /// Waits for a read error.
    pub fn wait_error(&self, timeout: Duration) -> Result<Error, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(err) = self.collected.lock().error.clone() {
                return Ok(err);
            }
            self.waiter.wait(1, Some(remaining(deadline)?))?;
        }
    }
}

impl GensioEvent for Collector {
    fn handle_read(&self, io: &Gensio, data: Result<&[u8], Error>) -> usize {
        let mut collected = self.collected.lock();
        let count = match data {
            Ok(data) => {
                let count = data.len().min(self.chunk);
                collected.data.extend_from_slice(&data[..count]);
                count
            }
            Err(err) => {
                collected.error = Some(err);
                0
            }
        };
        drop(collected);
        self.waiter.wake();
        count
    }

    fn handle_write_ready(&self, io: &Gensio) { io.set_write_callback_enable(false) }
}

/// Accepter handler keeping the connections it gets.
pub struct AcceptCollector {
    waiter: Waiter,
    handles: Mutex<Vec<Gensio>>,
}

impl AcceptCollector {
    pub fn new(os: &OsFuncs) -> Arc<Self> {
        Arc::new(AcceptCollector {
            waiter: os.alloc_waiter(),
            handles: empty!(),
        })
    }

    /// Waits for `count` connections and hands all the connections collected so far over.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Result<Vec<Gensio>, Error> {
        let deadline = Instant::now() + timeout;
        while self.handles.lock().len() < count {
            self.waiter.wait(1, Some(remaining(deadline)?))?;
        }
        Ok(mem::take(&mut *self.handles.lock()))
    }
}

impl AccepterEvent for AcceptCollector {
    fn new_connection(&self, acc: &Accepter, io: Gensio) {
        self.handles.lock().push(io);
        self.waiter.wake();
    }
}

#[derive(Default)]
struct MockState {
    started: bool,
    accept_enabled: bool,
    shutdowns: Vec<ShutdownDone>,
}

struct MockFuncs {
    state: Arc<Mutex<MockState>>,
    runner: Runner,
}

impl AccepterFunctions for MockFuncs {
    fn startup(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.started {
            return Err(Error::NotReady);
        }
        state.started = true;
        state.accept_enabled = true;
        Ok(())
    }

    fn shutdown(&self, done: Option<ShutdownDone>) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.started {
            return Err(Error::NotReady);
        }
        state.started = false;
        state.shutdowns.extend(done);
        drop(state);
        self.runner.schedule();
        Ok(())
    }

    fn set_accept_callback_enable(&self, enabled: bool) { self.state.lock().accept_enabled = enabled }
}

/// Reliable accepter whose connections are [`CountingGensio`]s created on demand.
#[derive(Clone)]
pub struct MockAccepter {
    acc: Accepter,
    state: Arc<Mutex<MockState>>,
}

impl MockAccepter {
    pub fn new(os: &OsFuncs) -> Self {
        let state = Arc::new(Mutex::new(MockState::default()));
        let acc = Accepter::new_cyclic(os, "mock", None, None, |weak| {
            let shared = state.clone();
            let runner = os.alloc_runner(move || {
                let dones = mem::take(&mut shared.lock().shutdowns);
                if let Some(acc) = weak.upgrade() {
                    for done in dones {
                        done(&acc);
                    }
                }
            });
            Box::new(MockFuncs {
                state: state.clone(),
                runner,
            })
        });
        acc.set_is_reliable(true);
        MockAccepter { acc, state }
    }

    pub fn accepter(&self) -> Accepter { self.acc.clone() }

    pub fn started(&self) -> bool { self.state.lock().started }

    pub fn accept_enabled(&self) -> bool { self.state.lock().accept_enabled }

    /// Reports a new connection backed by `tally` to the accepter handler right away.
    pub fn connect(&self, tally: &Tally) {
        let io = CountingGensio::alloc(self.acc.os(), tally);
        io.set_is_client(false);
        self.acc.deliver_new_connection(io);
    }
}
