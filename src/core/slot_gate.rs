//! Concurrency ceiling for engine animations.
//!
//! Replaces polling for a free slot with a `Condvar`. Waiters take a ticket and
//! proceed strictly in arrival order once `active < max`.

use log::trace;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct GateState {
    active: usize,
    max: usize,
    /// Tickets of blocked callers, oldest first.
    waiting: VecDeque<u64>,
    next_ticket: u64,
    peak: usize,
}

#[derive(Debug)]
pub struct SlotGate {
    state: Mutex<GateState>,
    freed: Condvar,
}

impl SlotGate {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                active: 0,
                max: max.max(1),
                waiting: VecDeque::new(),
                next_ticket: 0,
                peak: 0,
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot is free and every earlier waiter has been served.
    ///
    /// `timeout = None` waits indefinitely. On timeout returns the time waited.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<(), Duration> {
        let started = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.waiting.is_empty() && state.active < state.max {
            state.active += 1;
            state.peak = state.peak.max(state.active);
            return Ok(());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(ticket);
        trace!("Slot gate full ({}/{}), ticket {} waiting", state.active, state.max, ticket);

        loop {
            if state.waiting.front() == Some(&ticket) && state.active < state.max {
                state.waiting.pop_front();
                state.active += 1;
                state.peak = state.peak.max(state.active);
                // Next in line may also fit
                self.freed.notify_all();
                return Ok(());
            }

            match timeout {
                None => {
                    state = self.freed.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                Some(limit) => {
                    let waited = started.elapsed();
                    if waited >= limit {
                        state.waiting.retain(|t| *t != ticket);
                        self.freed.notify_all();
                        return Err(waited);
                    }
                    state = self
                        .freed
                        .wait_timeout(state, limit - waited)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    /// Count an animation that started outside `acquire` (e.g. a timeline).
    /// Never blocks; may temporarily exceed `max`.
    pub fn occupy(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active += 1;
        state.peak = state.peak.max(state.active);
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active = state.active.saturating_sub(1);
        self.freed.notify_all();
    }

    pub fn set_max(&self, max: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.max = max.max(1);
        self.freed.notify_all();
    }

    pub fn max(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).max
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).waiting.len()
    }

    /// Highest `active` value observed.
    pub fn peak(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).peak
    }
}
