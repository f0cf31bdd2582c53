//! Anti-flood throttling.
//!
//! Deliberately simple decaying counters rather than token buckets: the goal
//! is coarse abuse deterrence, not precise rate shaping. Each category keeps
//! counting while throttled so repeated attempts cannot shorten the cooldown.

use std::collections::HashMap;
use std::net::IpAddr;

/// Saved throttle states kept across reconnects, keyed by IP.
pub const MAX_SAVED_THROTTLE_STATES: usize = 16;

/// Edge events produced by a flood-counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodEvent {
    /// Nothing to report to the client.
    None,
    /// One step away from the limit.
    Warning,
    /// This increment crossed the limit; the category is now throttled.
    Throttled,
}

/// One throttled category: a counter over a decay window plus a cooldown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FloodCategory {
    counter: u32,
    window_start_ms: u64,
    throttled_until_ms: u64,
}

impl FloodCategory {
    pub fn is_throttled(&self, now_ms: u64) -> bool {
        now_ms < self.throttled_until_ms
    }

    #[cfg(test)]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Records one qualifying action.
    ///
    /// Exactly `limit` actions enter the throttled state. While throttled,
    /// only the accounting advances. The first action after the cooldown
    /// elapses resets the category and then counts as the first of a new
    /// window.
    pub fn increment(&mut self, now_ms: u64, limit: u32, window_ms: u64, cooldown_ms: u64) -> FloodEvent {
        if self.throttled_until_ms != 0 {
            if now_ms < self.throttled_until_ms {
                self.counter += 1;
                return FloodEvent::None;
            }
            *self = FloodCategory::default();
        }

        if self.counter > 0 && now_ms.saturating_sub(self.window_start_ms) > window_ms {
            self.counter = 0;
        }
        if self.counter == 0 {
            self.window_start_ms = now_ms;
        }

        self.counter += 1;

        if self.counter >= limit {
            self.throttled_until_ms = now_ms + cooldown_ms;
            FloodEvent::Throttled
        } else if self.counter + 1 == limit {
            FloodEvent::Warning
        } else {
            FloodEvent::None
        }
    }
}

/// Per-session throttle state. Archived by IP on disconnect and restored on
/// reconnect so a disconnect cannot be used to shed an active cooldown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleState {
    pub messages: FloodCategory,
    pub screenshots: FloodCategory,
}

/// Bounded cache of archived throttle states.
///
/// On overflow the whole cache is purged before the new entry goes in. Not
/// LRU: the original policy, kept as-is.
#[derive(Debug)]
pub struct ThrottleCache {
    states: HashMap<IpAddr, ThrottleState>,
    capacity: usize,
}

impl ThrottleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            capacity,
        }
    }

    /// Removes and returns the saved state for `ip`, if any.
    pub fn take(&mut self, ip: IpAddr) -> Option<ThrottleState> {
        self.states.remove(&ip)
    }

    pub fn archive(&mut self, ip: IpAddr, state: ThrottleState) {
        if !self.states.contains_key(&ip) && self.states.len() >= self.capacity {
            self.states.clear();
        }
        self.states.insert(ip, state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
