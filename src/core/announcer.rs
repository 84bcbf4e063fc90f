//! Accessible announcement channel (screen-reader live regions).
//!
//! Messages are posted with a politeness level and expire after a short TTL.
//! Expiry is swept by `sweep()`, called from the maintenance tick.

use log::debug;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_ANNOUNCEMENT_TTL: Duration = Duration::from_secs(3);

/// Announcement severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Politeness {
    /// Informational, does not interrupt current speech.
    Polite,
    /// Urgent, interrupts current speech.
    Assertive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub message: String,
    pub politeness: Politeness,
    pub posted_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct Announcer {
    live: Mutex<VecDeque<Announcement>>,
    ttl: Duration,
}

impl Default for Announcer {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOUNCEMENT_TTL)
    }
}

impl Announcer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            live: Mutex::new(VecDeque::new()),
            ttl,
        }
    }

    pub fn announce(&self, message: impl Into<String>, politeness: Politeness) {
        let now = Instant::now();
        let announcement = Announcement {
            message: message.into(),
            politeness,
            posted_at: now,
            expires_at: now + self.ttl,
        };
        debug!("Announce ({:?}): {}", politeness, announcement.message);
        self.live.lock().unwrap_or_else(|e| e.into_inner()).push_back(announcement);
    }

    /// Messages not yet expired, oldest first.
    pub fn live(&self) -> Vec<Announcement> {
        let now = Instant::now();
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|a| a.expires_at > now)
            .cloned()
            .collect()
    }

    /// Latest live message for a politeness level (what the live region shows).
    pub fn current(&self, politeness: Politeness) -> Option<String> {
        self.live()
            .into_iter()
            .rev()
            .find(|a| a.politeness == politeness)
            .map(|a| a.message)
    }

    /// Drop expired messages. Returns how many were cleared.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let before = live.len();
        live.retain(|a| a.expires_at > now);
        before - live.len()
    }
}
