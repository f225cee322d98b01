// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Named timers backing the loop's wait deadline.
//!
//! The list is scanned, not sorted: a handful of entries at most. Each loop
//! iteration takes [`TimerList::soonest`] as its wait deadline and, once
//! woken, fires everything due via [`TimerList::fire_due`]. One-shot timers
//! detach themselves; periodic ones advance by whole periods. Fired timers
//! enqueue their event, they never run work themselves.

use std::time::{Duration, Instant};

use super::event::Event;

/// A named one-shot or periodic timer.
#[derive(Clone, Debug)]
pub struct Timer {
    pub name: &'static str,
    pub period: Duration,
    pub deadline: Instant,
    pub event: Event,
    pub once: bool,
}

#[derive(Default)]
pub struct TimerList {
    timers: Vec<Timer>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Schedule a timer that fires once after `delay`.
    pub fn schedule_once(&mut self, name: &'static str, delay: Duration, event: Event) {
        debug!("Scheduling one-shot timer {name:?} in {delay:?}.");
        self.timers.push(Timer {
            name,
            period: delay,
            deadline: Instant::now() + delay,
            event,
            once: true,
        });
    }

    /// Schedule a timer that fires every `period`, the first time one full
    /// period from now.
    pub fn schedule_periodic(&mut self, name: &'static str, period: Duration, event: Event) {
        debug_assert!(!period.is_zero());
        debug!("Scheduling periodic timer {name:?} every {period:?}.");
        self.timers.push(Timer {
            name,
            period,
            deadline: Instant::now() + period,
            event,
            once: false,
        });
    }

    /// The next deadline to wait for, if any timer is armed.
    pub fn soonest(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.deadline).min()
    }

    /// Fire every timer due at `now`, in list order, and return their
    /// events. One-shot timers are detached; periodic ones advance past
    /// `now` by whole periods, firing once per wakeup however late we are.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Event> {
        let mut fired = Vec::new();
        let mut index = 0;
        while index < self.timers.len() {
            if self.timers[index].deadline > now {
                index += 1;
                continue;
            }

            let timer = &mut self.timers[index];
            trace!("Timer {:?} fired.", timer.name);
            fired.push(timer.event.clone());
            if timer.once {
                self.timers.remove(index);
            } else {
                while timer.deadline <= now {
                    timer.deadline += timer.period;
                }
                index += 1;
            }
        }
        fired
    }
}

/// Whether the monotonic clock resolves at millisecond granularity or
/// better. The loop refuses to start otherwise.
pub fn clock_res_is_millis() -> bool {
    let mut finest = Duration::MAX;
    for _ in 0..8 {
        let before = Instant::now();
        let mut after = Instant::now();
        while after == before {
            after = Instant::now();
        }
        finest = finest.min(after - before);
    }
    finest <= Duration::from_millis(1)
}
