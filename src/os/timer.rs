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

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::OsInner;
use crate::Error;

static TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

/// Manages pending timers of one OS layer instance.
#[derive(Default)]
pub(crate) struct TimerQueue {
    /// Keyed by the deadline plus a unique timer id, so that two timers may expire at the same
    /// instant.
    timers: BTreeMap<(Instant, u64), Timer>,
}

impl TimerQueue {
    pub fn new() -> Self { Self { timers: empty!() } }

    /// Return the number of timers being tracked.
    #[cfg(test)]
    pub fn len(&self) -> usize { self.timers.len() }

    fn insert(&mut self, deadline: Instant, timer: Timer) {
        self.timers.insert((deadline, timer.inner.id), timer);
    }

    fn remove(&mut self, deadline: Instant, id: u64) -> bool {
        self.timers.remove(&(deadline, id)).is_some()
    }

    /// Get the minimum time duration we should wait for at least one timer to be expired.
    /// Returns `None` if there are no timers.
    pub fn next_expiring_from(&self, now: Instant) -> Option<Duration> {
        self.timers
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Removes and returns all the timers which have expired by the given moment.
    pub fn remove_expired_by(&mut self, now: Instant) -> Vec<(Instant, Timer)> {
        // Timers expiring exactly at `now` sort before `(now, u64::MAX)`
        let unexpired = self.timers.split_off(&(now, u64::MAX));
        let fired = std::mem::replace(&mut self.timers, unexpired);
        fired.into_iter().map(|((deadline, _), timer)| (deadline, timer)).collect()
    }
}

struct TimerInner {
    os: Weak<OsInner>,
    id: u64,
    deadline: Mutex<Option<Instant>>,
    handler: Box<dyn Fn() + Send + Sync>,
}

/// One-shot timer which calls its handler from the OS layer service loop.
///
/// Timer handlers run with no lock held. A timer may be restarted from inside its own handler.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub(super) fn new(os: Weak<OsInner>, handler: impl Fn() + Send + Sync + 'static) -> Self {
        Timer {
            inner: Arc::new(TimerInner {
                os,
                id: TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
                deadline: Mutex::new(None),
                handler: Box::new(handler),
            }),
        }
    }

    /// Starts the timer to fire `after` the current moment.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`] if the timer is already running.
    pub fn start(&self, after: Duration) -> Result<(), Error> {
        let os = self.inner.os.upgrade().ok_or(Error::NotReady)?;
        let mut deadline = self.inner.deadline.lock();
        if deadline.is_some() {
            return Err(Error::NotReady);
        }
        let at = Instant::now() + after;
        os.timers.lock().insert(at, self.clone());
        *deadline = Some(at);
        drop(deadline);

        #[cfg(feature = "log")]
        log::trace!(target: "os", "Timer {} started for {after:?}", self.inner.id);

        os.wake();
        Ok(())
    }

    /// Stops a running timer. The handler is guaranteed not to be called for the stopped run.
    ///
    /// # Errors
    ///
    /// [`Error::TimedOut`] if the timer is not running (it has already fired or was never started).
    pub fn stop(&self) -> Result<(), Error> {
        let mut deadline = self.inner.deadline.lock();
        let Some(at) = deadline.take() else {
            return Err(Error::TimedOut);
        };
        if let Some(os) = self.inner.os.upgrade() {
            os.timers.lock().remove(at, self.inner.id);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool { self.inner.deadline.lock().is_some() }

    /// Fires the timer if it is still armed for the given deadline.
    pub(super) fn fire(&self, at: Instant) {
        {
            let mut deadline = self.inner.deadline.lock();
            if *deadline != Some(at) {
                return;
            }
            *deadline = None;
        }
        (self.inner.handler)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> Timer { Timer::new(Weak::new(), || {}) }

    #[test]
    fn wake_exact() {
        let mut tq = TimerQueue::new();

        let now = Instant::now();
        tq.insert(now + Duration::from_secs(8), timer());
        tq.insert(now + Duration::from_secs(9), timer());
        tq.insert(now + Duration::from_secs(10), timer());

        assert_eq!(tq.remove_expired_by(now + Duration::from_secs(9)).len(), 2);
        assert_eq!(tq.len(), 1);
    }

    #[test]
    fn wake() {
        let mut tq = TimerQueue::new();

        let now = Instant::now();
        tq.insert(now + Duration::from_secs(8), timer());
        tq.insert(now + Duration::from_secs(16), timer());
        tq.insert(now + Duration::from_secs(64), timer());
        tq.insert(now + Duration::from_secs(72), timer());

        assert_eq!(tq.next_expiring_from(now), Some(Duration::from_secs(8)));
        assert_eq!(tq.remove_expired_by(now).len(), 0);
        assert_eq!(tq.len(), 4);

        assert_eq!(tq.remove_expired_by(now + Duration::from_secs(9)).len(), 1);
        assert_eq!(tq.len(), 3, "one timeout has expired");

        assert_eq!(tq.remove_expired_by(now + Duration::from_secs(66)).len(), 2);
        assert_eq!(tq.len(), 1, "another two timeouts have expired");

        assert_eq!(tq.remove_expired_by(now + Duration::from_secs(96)).len(), 1);
        assert_eq!(tq.len(), 0, "all timeouts have expired");
        assert_eq!(tq.next_expiring_from(now), None);
    }

    #[test]
    fn same_deadline() {
        let mut tq = TimerQueue::new();
        let at = Instant::now();
        tq.insert(at, timer());
        tq.insert(at, timer());
        assert_eq!(tq.len(), 2);
        assert_eq!(tq.remove_expired_by(at).len(), 2);
    }

    #[test]
    fn stop_unstarted() {
        assert_eq!(timer().stop(), Err(Error::TimedOut));
        assert_eq!(timer().start(Duration::from_secs(1)), Err(Error::NotReady));
    }
}
