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

//! OS abstraction layer.
//!
//! Everything else in the crate synchronizes and defers work only through this module: locks,
//! deferred [`Runner`]s, counting [`Waiter`]s, one-shot [`Timer`]s, file descriptor handlers and
//! [`Thread`]s. The OS layer does not own a thread; it makes progress whenever some thread calls
//! [`OsFuncs::service`] (directly or while blocked in [`Waiter::wait`]).

#![allow(unused_variables)] // because we need them for feature-gated logger

mod runner;
mod thread;
mod timer;
mod waiter;

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use parking_lot::Mutex;

pub use self::runner::Runner;
pub use self::thread::Thread;
pub use self::timer::Timer;
use self::timer::TimerQueue;
pub use self::waiter::Waiter;
use crate::poller::{IoFail, IoType, Poll, Waker};
use crate::Error;

/// Mutual exclusion lock used by all the objects of the crate.
///
/// The lock is not re-entrant: code holding it must never call back into user code, or into any
/// other object which may take the same lock.
pub type Lock<T> = Mutex<T>;

/// Handler for file descriptor readiness events, called from [`OsFuncs::service`] with no lock
/// held.
pub trait FdHandler: Send + Sync {
    /// The file descriptor has data to read.
    fn handle_read(&self, fd: RawFd);

    /// The file descriptor is ready to accept more data.
    fn handle_write(&self, fd: RawFd);

    /// The file descriptor got hang up or is in error state.
    fn handle_except(&self, fd: RawFd, fail: IoFail) {
        #[cfg(feature = "log")]
        log::warn!(target: "os", "Unhandled exception condition on fd {fd}: {fail}");
    }
}

struct FdEntry {
    handler: Arc<dyn FdHandler>,
    interest: IoType,
    registered: bool,
}

#[derive(Default)]
struct FdTable {
    entries: HashMap<RawFd, FdEntry>,
    removed: Vec<RawFd>,
}

pub(crate) struct OsInner {
    runq_send: chan::Sender<Runner>,
    runq_recv: chan::Receiver<Runner>,
    waker: Waker,
    poller: Mutex<Box<dyn Poll>>,
    fds: Mutex<FdTable>,
    timers: Mutex<TimerQueue>,
}

impl OsInner {
    pub(crate) fn enqueue(&self, runner: Runner) {
        // Both ends are owned by `self`, so the channel can't be disconnected here.
        let _ = self.runq_send.send(runner);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            #[cfg(feature = "log")]
            log::error!(target: "os", "Unable to wake the service loop: {err}");
        }
    }
}

/// Handle to an OS layer instance.
///
/// The handle is cheap to clone; all clones refer to the same service loop. Several independent
/// instances may exist in a single process.
#[derive(Clone)]
pub struct OsFuncs {
    inner: Arc<OsInner>,
}

impl OsFuncs {
    /// Constructs OS layer using the default poll engine.
    #[cfg(feature = "popol")]
    pub fn new() -> Result<Self, Error> {
        OsFuncs::with_poller(Box::new(crate::poller::popol::Poller::new()))
    }

    /// Constructs OS layer using the provided poll engine.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the waker.
    pub fn with_poller(mut poller: Box<dyn Poll>) -> Result<Self, Error> {
        let (runq_send, runq_recv) = chan::unbounded();
        let waker = Waker::new()?;

        #[cfg(feature = "log")]
        log::debug!(target: "os", "Registering waker (fd {})", waker.as_raw_fd());
        poller.register(waker.as_raw_fd(), IoType::read_only());

        Ok(OsFuncs {
            inner: Arc::new(OsInner {
                runq_send,
                runq_recv,
                waker,
                poller: Mutex::new(poller),
                fds: default!(),
                timers: Mutex::new(TimerQueue::new()),
            }),
        })
    }

    /// Allocates a runner executing `handler` each time it is scheduled.
    pub fn alloc_runner(&self, handler: impl Fn() + Send + Sync + 'static) -> Runner {
        Runner::new(Arc::downgrade(&self.inner), handler)
    }

    /// Allocates a stopped timer calling `handler` when it fires.
    pub fn alloc_timer(&self, handler: impl Fn() + Send + Sync + 'static) -> Timer {
        Timer::new(Arc::downgrade(&self.inner), handler)
    }

    /// Allocates a waiter with no pending wake-ups.
    pub fn alloc_waiter(&self) -> Waiter { Waiter::new(self.clone()) }

    /// Starts a new thread running `f`.
    pub fn new_thread(&self, f: impl FnOnce() + Send + 'static) -> Result<Thread, Error> {
        Thread::spawn(f)
    }

    /// Registers handler for the file descriptor. No events are reported until they are enabled
    /// with [`OsFuncs::set_read_handler`] or [`OsFuncs::set_write_handler`].
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] if the file descriptor already has handlers.
    pub fn set_fd_handlers(&self, fd: &impl AsRawFd, handler: Arc<dyn FdHandler>) -> Result<(), Error> {
        let fd = fd.as_raw_fd();
        let mut fds = self.inner.fds.lock();
        if fds.entries.contains_key(&fd) {
            return Err(Error::Exists);
        }
        #[cfg(feature = "log")]
        log::debug!(target: "os", "Setting handlers for fd {fd}");
        fds.removed.retain(|removed| *removed != fd);
        fds.entries.insert(fd, FdEntry {
            handler,
            interest: IoType::none(),
            registered: false,
        });
        Ok(())
    }

    /// Enables or disables read readiness reports for the file descriptor.
    pub fn set_read_handler(&self, fd: &impl AsRawFd, enabled: bool) {
        self.update_interest(fd.as_raw_fd(), |interest| interest.read = enabled)
    }

    /// Enables or disables write readiness reports for the file descriptor.
    pub fn set_write_handler(&self, fd: &impl AsRawFd, enabled: bool) {
        self.update_interest(fd.as_raw_fd(), |interest| interest.write = enabled)
    }

    /// Removes the handlers of the file descriptor. Once this returns, the handler will not be
    /// called for any new event; the file descriptor may be closed afterwards.
    pub fn clear_fd_handlers(&self, fd: &impl AsRawFd) {
        let fd = fd.as_raw_fd();
        let mut fds = self.inner.fds.lock();
        if let Some(entry) = fds.entries.remove(&fd) {
            #[cfg(feature = "log")]
            log::debug!(target: "os", "Clearing handlers for fd {fd}");
            if entry.registered {
                fds.removed.push(fd);
            }
        }
        drop(fds);
        self.inner.wake();
    }

    fn update_interest(&self, fd: RawFd, f: impl FnOnce(&mut IoType)) {
        let mut fds = self.inner.fds.lock();
        let Some(entry) = fds.entries.get_mut(&fd) else {
            #[cfg(feature = "log")]
            log::warn!(target: "os", "Setting interest for fd {fd} which has no handlers");
            return;
        };
        f(&mut entry.interest);
        drop(fds);
        self.inner.wake();
    }

    /// Wakes up a thread blocked inside [`OsFuncs::service`].
    pub(crate) fn wake(&self) { self.inner.wake() }

    /// Runs one iteration of runner, timer and file descriptor processing.
    ///
    /// If there is nothing to do immediately, blocks until a file descriptor becomes ready, a
    /// timer expires, a runner gets scheduled, or `timeout` elapses (`None` waits forever).
    ///
    /// # Errors
    ///
    /// - [`Error::TimedOut`] if nothing has happened before the timeout;
    /// - [`Error::Interrupted`] if the wait got interrupted by a signal;
    /// - other errors returned by the poll engine.
    pub fn service(&self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.run_pending(Instant::now()) {
            return Ok(());
        }

        let before_poll = Instant::now();
        let next_timer = self.inner.timers.lock().next_expiring_from(before_poll);
        let wait = match (timeout, next_timer) {
            (Some(t), Some(n)) => Some(t.min(n)),
            (t, n) => t.or(n),
        };

        let mut poller = match timeout {
            None => self.inner.poller.lock(),
            Some(timeout) => match self.inner.poller.try_lock_for(timeout) {
                Some(poller) => poller,
                // Another thread is polling; it will process everything which is due.
                None => return Err(Error::TimedOut),
            },
        };

        {
            let mut fds = self.inner.fds.lock();
            for fd in std::mem::take(&mut fds.removed) {
                poller.unregister(fd);
            }
            for (fd, entry) in fds.entries.iter_mut() {
                if !entry.registered {
                    poller.register(*fd, entry.interest);
                    entry.registered = true;
                } else {
                    poller.set_interest(*fd, entry.interest);
                }
            }
        }

        // Blocking
        #[cfg(feature = "log")]
        log::trace!(target: "os", "Polling with timeout {wait:?}");

        let res = poller.poll(wait);
        let events = poller.by_ref().collect::<Vec<_>>();
        drop(poller);

        let mut progress = false;
        match res {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                return Err(Error::Interrupted);
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "os", "Error during polling: {err}");
                return Err(err.into());
            }
        }

        let waker_fd = self.inner.waker.as_raw_fd();
        for (fd, res) in events {
            if fd == waker_fd {
                #[cfg(feature = "log")]
                log::trace!(target: "os", "Awoken by the waker");
                self.inner.waker.reset();
                progress = true;
                continue;
            }
            let handler = self.inner.fds.lock().entries.get(&fd).map(|e| e.handler.clone());
            let Some(handler) = handler else {
                #[cfg(feature = "log")]
                log::trace!(target: "os", "Event for fd {fd} which has no handlers anymore");
                continue;
            };
            progress = true;
            match res {
                Ok(io) => {
                    if io.read {
                        handler.handle_read(fd);
                    }
                    if io.write {
                        handler.handle_write(fd);
                    }
                }
                Err(fail) => handler.handle_except(fd, fail),
            }
        }

        progress |= self.run_pending(Instant::now());
        if progress {
            Ok(())
        } else {
            #[cfg(feature = "log")]
            log::trace!(target: "os", "Service timeout; nothing has happened");
            Err(Error::TimedOut)
        }
    }

    /// Fires expired timers and runs the runners which were queued before this call.
    ///
    /// # Returns
    ///
    /// Whether anything was run.
    fn run_pending(&self, now: Instant) -> bool {
        let expired = self.inner.timers.lock().remove_expired_by(now);
        let mut progress = !expired.is_empty();
        for (at, timer) in expired {
            #[cfg(feature = "log")]
            log::trace!(target: "os", "Timer has fired");
            timer.fire(at);
        }

        // Runners rescheduling themselves are processed on the next iteration only.
        let queued = self.inner.runq_recv.len();
        for runner in self.inner.runq_recv.try_iter().take(queued) {
            progress = true;
            runner.run();
        }
        progress
    }
}
