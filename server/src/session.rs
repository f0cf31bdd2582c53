//! Client session slots and the fixed-capacity session table.
//!
//! Sessions are pre-allocated for the life of the process; a slot's index is
//! the client id used on the wire, so slots are never removed, only marked
//! reclaimed and reused. Occupancy (socket, identity, transient state) is
//! created on accept and torn down on disconnect.

use crate::activity::{ActivityLevel, ACTIVITY_RESET_DELAY_MS};
use crate::throttle::ThrottleState;
use shared::codec::{CraftPayload, Screenshot};
use std::collections::VecDeque;
use std::net::IpAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Which peer's screenshot stream this session wants pushed to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchTarget {
    pub username: String,
    pub index: i32,
}

/// Per-slot state container. One exists per slot for the process lifetime;
/// `open`/`reclaim` cycle its occupancy.
#[derive(Debug)]
pub struct ClientSession {
    pub slot: usize,
    /// Write half of the live socket; exclusively owned by this session.
    pub writer: Option<OwnedWriteHalf>,
    receive_task: Option<AbortHandle>,
    connected: bool,
    /// Cleared by the receive loop or the pump when the socket errors out;
    /// the supervisor reclaims the slot on its next pass.
    pub alive: bool,
    /// True once the slot has been fully reclaimed and may be reused.
    pub can_be_replaced: bool,
    pub ip: Option<IpAddr>,
    /// Set exactly once per connection, at successful handshake.
    pub username: String,
    pub handshake_complete: bool,
    pub activity_level: ActivityLevel,
    pub last_receive_ms: u64,
    pub connection_start_ms: u64,
    pub last_in_game_activity_ms: u64,
    pub last_in_flight_activity_ms: u64,
    pub last_udp_ack_ms: u64,
    pub throttle: ThrottleState,
    outgoing: VecDeque<Vec<u8>>,
    screenshots: VecDeque<Screenshot>,
    next_screenshot_index: i32,
    pub watch_target: WatchTarget,
    pub shared_craft: Option<CraftPayload>,
}

impl ClientSession {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            writer: None,
            receive_task: None,
            connected: false,
            alive: false,
            can_be_replaced: true,
            ip: None,
            username: String::new(),
            handshake_complete: false,
            activity_level: ActivityLevel::Inactive,
            last_receive_ms: 0,
            connection_start_ms: 0,
            last_in_game_activity_ms: 0,
            last_in_flight_activity_ms: 0,
            last_udp_ack_ms: 0,
            throttle: ThrottleState::default(),
            outgoing: VecDeque::new(),
            screenshots: VecDeque::new(),
            next_screenshot_index: 0,
            watch_target: WatchTarget::default(),
            shared_craft: None,
        }
    }

    /// Takes occupancy of the slot for a new connection, resetting all
    /// per-connection transient state.
    pub fn open(
        &mut self,
        writer: Option<OwnedWriteHalf>,
        ip: IpAddr,
        now_ms: u64,
        restored_throttle: Option<ThrottleState>,
    ) {
        self.writer = writer;
        self.receive_task = None;
        self.connected = true;
        self.alive = true;
        self.can_be_replaced = false;
        self.ip = Some(ip);
        self.username.clear();
        self.handshake_complete = false;
        self.activity_level = ActivityLevel::Inactive;
        self.last_receive_ms = now_ms;
        self.connection_start_ms = now_ms;
        self.last_in_game_activity_ms = now_ms;
        self.last_in_flight_activity_ms = now_ms;
        self.last_udp_ack_ms = 0;
        self.throttle = restored_throttle.unwrap_or_default();
        self.outgoing.clear();
        self.screenshots.clear();
        self.next_screenshot_index = 0;
        self.watch_target = WatchTarget::default();
        self.shared_craft = None;
    }

    /// Occupied means the slot holds a connection that has not errored out.
    pub fn is_occupied(&self) -> bool {
        self.connected && self.alive
    }

    /// Ready means occupied with a completed handshake; almost every dispatch
    /// path requires this.
    pub fn is_ready(&self) -> bool {
        self.is_occupied() && self.handshake_complete
    }

    /// True when the socket died but the slot has not been reclaimed yet.
    pub fn needs_reclaim(&self) -> bool {
        self.connected && !self.alive
    }

    pub fn set_receive_task(&mut self, handle: AbortHandle) {
        self.receive_task = Some(handle);
    }

    pub fn queue_frame(&mut self, frame: Vec<u8>) {
        self.outgoing.push_back(frame);
    }

    /// Hands the pending outbound frames to the pump, in enqueue order.
    pub fn take_outgoing(&mut self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut self.outgoing)
    }

    /// Applies an explicit activity signal. Signals only raise or refresh the
    /// level; demotion happens exclusively through [`demote_if_idle`].
    ///
    /// [`demote_if_idle`]: ClientSession::demote_if_idle
    pub fn raise_activity(&mut self, level: ActivityLevel, now_ms: u64) -> bool {
        match level {
            ActivityLevel::InFlight => {
                self.last_in_flight_activity_ms = now_ms;
                self.last_in_game_activity_ms = now_ms;
                let changed = self.activity_level != ActivityLevel::InFlight;
                self.activity_level = ActivityLevel::InFlight;
                changed
            }
            ActivityLevel::InGame => {
                self.last_in_game_activity_ms = now_ms;
                if self.activity_level == ActivityLevel::Inactive {
                    self.activity_level = ActivityLevel::InGame;
                    true
                } else {
                    false
                }
            }
            ActivityLevel::Inactive => false,
        }
    }

    /// Timeout-driven demotion, one level per check.
    pub fn demote_if_idle(&mut self, now_ms: u64) -> bool {
        let mut changed = false;

        if self.activity_level == ActivityLevel::InFlight
            && now_ms.saturating_sub(self.last_in_flight_activity_ms) > ACTIVITY_RESET_DELAY_MS
        {
            self.activity_level = ActivityLevel::InGame;
            changed = true;
        }

        if self.activity_level == ActivityLevel::InGame
            && now_ms.saturating_sub(self.last_in_game_activity_ms) > ACTIVITY_RESET_DELAY_MS
        {
            self.activity_level = ActivityLevel::Inactive;
            changed = true;
        }

        changed
    }

    /// Stores the session's own shared screenshot at the next index, evicting
    /// the oldest past the backlog capacity. Returns the stored screenshot.
    pub fn push_screenshot(&mut self, image: Vec<u8>, backlog: usize) -> Screenshot {
        let screenshot = Screenshot {
            index: self.next_screenshot_index,
            image,
        };
        self.next_screenshot_index += 1;

        self.screenshots.push_back(screenshot.clone());
        while self.screenshots.len() > backlog.max(1) {
            self.screenshots.pop_front();
        }

        screenshot
    }

    pub fn screenshot_at(&self, index: i32) -> Option<&Screenshot> {
        self.screenshots.iter().find(|s| s.index == index)
    }

    pub fn latest_screenshot(&self) -> Option<&Screenshot> {
        self.screenshots.back()
    }
}

/// Slot-local results of a reclaim, for the caller to apply the server-wide
/// side effects (counts, throttle archive, disconnect broadcast).
#[derive(Debug)]
pub struct ReclaimOutcome {
    pub was_ready: bool,
    pub was_active: bool,
    pub username: String,
    pub ip: Option<IpAddr>,
    pub throttle: ThrottleState,
    pub messages_were_throttled: bool,
}

/// Fixed-capacity arena of sessions. Slot allocation scans for a reclaimed
/// slot; occupied slots are never reused until explicitly reclaimed.
pub struct SessionTable {
    slots: Vec<Mutex<ClientSession>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|i| Mutex::new(ClientSession::new(i))).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<&Mutex<ClientSession>> {
        self.slots.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutex<ClientSession>> {
        self.slots.iter()
    }

    /// Finds a slot whose previous occupant has been fully reclaimed.
    ///
    /// Only the accept loop allocates, so scan-then-install is race-free.
    pub async fn free_slot(&self) -> Option<usize> {
        for (index, cell) in self.slots.iter().enumerate() {
            let session = cell.lock().await;
            if session.can_be_replaced && !session.is_occupied() {
                return Some(index);
            }
        }
        None
    }

    pub async fn install(
        &self,
        slot: usize,
        writer: Option<OwnedWriteHalf>,
        ip: IpAddr,
        now_ms: u64,
        restored_throttle: Option<ThrottleState>,
    ) {
        let mut session = self.slots[slot].lock().await;
        session.open(writer, ip, now_ms, restored_throttle);
    }

    /// Tears down a slot's occupancy. Idempotent: reclaiming an already
    /// reclaimed slot returns `None` and changes nothing (beyond a
    /// best-effort final notice on a still-open socket).
    pub async fn reclaim(&self, slot: usize, now_ms: u64, final_notice: &[u8]) -> Option<ReclaimOutcome> {
        let cell = self.slots.get(slot)?;
        let mut session = cell.lock().await;

        // Best-effort reason frame while the socket is still writable.
        if session.alive {
            if let Some(writer) = session.writer.as_mut() {
                let _ = writer.write_all(final_notice).await;
            }
        }

        if let Some(task) = session.receive_task.take() {
            task.abort();
        }
        session.writer = None;
        session.connected = false;
        session.alive = false;

        if session.can_be_replaced {
            return None;
        }
        session.can_be_replaced = true;

        let outcome = ReclaimOutcome {
            was_ready: session.handshake_complete,
            was_active: session.activity_level != ActivityLevel::Inactive,
            username: std::mem::take(&mut session.username),
            ip: session.ip,
            throttle: session.throttle,
            messages_were_throttled: session.throttle.messages.is_throttled(now_ms),
        };

        session.handshake_complete = false;
        session.activity_level = ActivityLevel::Inactive;
        session.outgoing.clear();
        session.screenshots.clear();
        session.shared_craft = None;
        session.watch_target = WatchTarget::default();

        Some(outcome)
    }

    pub async fn is_occupied(&self, slot: usize) -> bool {
        match self.slots.get(slot) {
            Some(cell) => cell.lock().await.is_occupied(),
            None => false,
        }
    }

    pub async fn is_ready(&self, slot: usize) -> bool {
        match self.slots.get(slot) {
            Some(cell) => cell.lock().await.is_ready(),
            None => false,
        }
    }

    /// Case-insensitive username lookup over ready sessions only. Usernames
    /// are not reserved before handshake completes.
    pub async fn find_by_username(&self, name: &str) -> Option<usize> {
        let lowered = name.to_lowercase();
        for (index, cell) in self.slots.iter().enumerate() {
            let session = cell.lock().await;
            if session.is_ready() && session.username.to_lowercase() == lowered {
                return Some(index);
            }
        }
        None
    }

    pub async fn count_ready(&self) -> usize {
        let mut count = 0;
        for cell in &self.slots {
            if cell.lock().await.is_ready() {
                count += 1;
            }
        }
        count
    }

    /// Snapshot of (slot, username, activity) for every ready session.
    pub async fn ready_roster(&self) -> Vec<(usize, String, ActivityLevel)> {
        let mut roster = Vec::new();
        for (index, cell) in self.slots.iter().enumerate() {
            let session = cell.lock().await;
            if session.is_ready() {
                roster.push((index, session.username.clone(), session.activity_level));
            }
        }
        roster
    }
}
