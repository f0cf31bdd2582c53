//! Server-wide shared state: the session table plus the global count pair,
//! ban set, and saved-throttle cache, each behind its own small lock.
//!
//! Every worker loop holds an `Arc<ServerState>`. Helpers here follow one
//! locking rule: never hold a session lock while taking another, and never
//! broadcast while holding one.

use crate::activity::{self, ActivityCounts, ActivityLevel};
use crate::config::ServerConfig;
use crate::session::SessionTable;
use crate::storage;
use crate::throttle::{FloodEvent, ThrottleCache, ThrottleState, MAX_SAVED_THROTTLE_STATES};
use log::info;
use shared::codec::{encode_frame, ServerSettingsPayload};
use shared::ServerMessageKind;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Read-only view for the status page and console collaborators. No mutation
/// path back into the core.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub player_count: usize,
    pub max_clients: usize,
    pub in_game: usize,
    pub in_flight: usize,
    pub update_interval_ms: u32,
    pub uptime: Duration,
    pub shared_screenshots: u64,
    pub usernames: Vec<String>,
}

pub struct ServerState {
    pub config: ServerConfig,
    start: Instant,
    pub sessions: SessionTable,
    counts: Mutex<ActivityCounts>,
    banned: Mutex<HashSet<IpAddr>>,
    throttle_cache: Mutex<ThrottleCache>,
    shared_screenshots: AtomicU64,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let banned = storage::load_ban_list(&config.ban_file);
        if !banned.is_empty() {
            info!("Loaded {} banned address(es)", banned.len());
        }

        Self {
            sessions: SessionTable::new(config.max_clients),
            start: Instant::now(),
            counts: Mutex::new(ActivityCounts::default()),
            banned: Mutex::new(banned),
            throttle_cache: Mutex::new(ThrottleCache::new(MAX_SAVED_THROTTLE_STATES)),
            shared_screenshots: AtomicU64::new(0),
            config,
        }
    }

    /// Milliseconds since server start; the monotonic clock for all session
    /// timestamps and throttle windows.
    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn counts(&self) -> ActivityCounts {
        *self.counts.lock().unwrap()
    }

    pub fn update_interval_ms(&self) -> u32 {
        activity::update_interval_ms(self.counts(), &self.config)
    }

    pub fn settings_payload(&self) -> ServerSettingsPayload {
        let counts = self.counts();
        ServerSettingsPayload {
            update_interval_ms: activity::update_interval_ms(counts, &self.config),
            screenshot_interval_ms: self.config.screenshot_interval_ms,
            screenshot_max_height: self.config.screenshot_max_height,
            inactive_ship_quota: activity::inactive_ships_per_client(counts, &self.config),
        }
    }

    // --- bans ---

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.lock().unwrap().contains(&ip)
    }

    pub fn ban_ip(&self, ip: IpAddr) {
        let inserted = self.banned.lock().unwrap().insert(ip);
        if inserted {
            info!("Banned ip: {}", ip);
            self.save_ban_list();
        } else {
            info!("IP {} was already banned", ip);
        }
    }

    fn save_ban_list(&self) {
        let banned = self.banned.lock().unwrap().clone();
        storage::save_ban_list(&self.config.ban_file, &banned);
    }

    /// Bans the session's IP and disconnects it.
    pub async fn ban_slot(&self, slot: usize, reason: &str) {
        let ip = match self.sessions.get(slot) {
            Some(cell) => cell.lock().await.ip,
            None => None,
        };
        if let Some(ip) = ip {
            self.ban_ip(ip);
        }
        self.disconnect_client(slot, reason).await;
    }

    // --- throttle cache ---

    pub fn take_saved_throttle(&self, ip: IpAddr) -> Option<ThrottleState> {
        self.throttle_cache.lock().unwrap().take(ip)
    }

    // --- outbound queueing and fan-out ---

    /// Queues a frame on one occupied session. Returns false if the slot was
    /// not occupied.
    pub async fn queue_frame_to(&self, slot: usize, frame: Vec<u8>) -> bool {
        let Some(cell) = self.sessions.get(slot) else {
            return false;
        };
        let mut session = cell.lock().await;
        if !session.is_occupied() {
            return false;
        }
        session.queue_frame(frame);
        true
    }

    pub async fn queue_message(&self, slot: usize, kind: ServerMessageKind, payload: &[u8]) -> bool {
        self.queue_frame_to(slot, encode_frame(kind as u32, payload)).await
    }

    /// Informational text from the server to one session.
    pub async fn send_server_message(&self, slot: usize, text: &str) {
        self.queue_message(slot, ServerMessageKind::ServerMessage, text.as_bytes()).await;
    }

    /// Informational text to every ready session except `exclude`.
    pub async fn send_server_message_to_all(&self, text: &str, exclude: Option<usize>) {
        let frame = encode_frame(ServerMessageKind::ServerMessage as u32, text.as_bytes());
        for (index, cell) in self.sessions.iter().enumerate() {
            if Some(index) == exclude {
                continue;
            }
            let mut session = cell.lock().await;
            if session.is_ready() {
                session.queue_frame(frame.clone());
            }
        }
    }

    /// Relayed chat text to every ready session except `exclude`.
    pub async fn send_text_message_to_all(&self, text: &str, exclude: Option<usize>) {
        let frame = encode_frame(ServerMessageKind::TextMessage as u32, text.as_bytes());
        for (index, cell) in self.sessions.iter().enumerate() {
            if Some(index) == exclude {
                continue;
            }
            let mut session = cell.lock().await;
            if session.is_ready() {
                session.queue_frame(frame.clone());
            }
        }
    }

    /// Relays a raw world-state payload to every other ready, non-inactive
    /// session; `in_flight_only` further restricts the audience.
    pub async fn broadcast_state_update(&self, payload: &[u8], in_flight_only: bool, exclude: usize) {
        let frame = encode_frame(ServerMessageKind::StateUpdate as u32, payload);
        for (index, cell) in self.sessions.iter().enumerate() {
            if index == exclude {
                continue;
            }
            let mut session = cell.lock().await;
            if session.is_ready()
                && session.activity_level != ActivityLevel::Inactive
                && (session.activity_level == ActivityLevel::InFlight || !in_flight_only)
            {
                session.queue_frame(frame.clone());
            }
        }
    }

    pub async fn send_settings(&self, slot: usize) {
        let payload = self.settings_payload().encode();
        self.queue_message(slot, ServerMessageKind::ServerSettings, &payload).await;
    }

    /// Settings go to every occupied session, handshaken or not.
    pub async fn send_settings_to_all(&self) {
        let frame = encode_frame(
            ServerMessageKind::ServerSettings as u32,
            &self.settings_payload().encode(),
        );
        for cell in self.sessions.iter() {
            let mut session = cell.lock().await;
            if session.is_occupied() {
                session.queue_frame(frame.clone());
            }
        }
    }

    // --- activity ---

    /// Recounts activity over all ready sessions and pushes fresh settings to
    /// everyone, since the adaptive interval depends on the counts.
    pub async fn activity_levels_changed(&self) {
        let mut in_game = 0;
        let mut in_flight = 0;
        for cell in self.sessions.iter() {
            let session = cell.lock().await;
            if !session.is_ready() {
                continue;
            }
            match session.activity_level {
                ActivityLevel::InGame => in_game += 1,
                ActivityLevel::InFlight => {
                    in_game += 1;
                    in_flight += 1;
                }
                ActivityLevel::Inactive => {}
            }
        }

        *self.counts.lock().unwrap() = ActivityCounts { in_game, in_flight };
        self.send_settings_to_all().await;
    }

    // --- flood control ---

    /// Counts one message-category action for the slot, notifying the client
    /// at the warning and throttled edges.
    pub async fn message_flood_increment(&self, slot: usize) {
        let Some(cell) = self.sessions.get(slot) else {
            return;
        };
        let now = self.now_ms();

        let (event, username, occupied) = {
            let mut session = cell.lock().await;
            let event = session.throttle.messages.increment(
                now,
                self.config.message_flood_limit,
                self.config.message_flood_throttle_ms,
                self.config.message_flood_throttle_ms,
            );
            (event, session.username.clone(), session.is_occupied())
        };

        if !occupied {
            return;
        }

        match event {
            FloodEvent::Warning => {
                self.send_server_message(slot, "Warning: You are sending too many messages.").await;
            }
            FloodEvent::Throttled => {
                let secs = self.config.message_flood_throttle_ms / 1000;
                self.send_server_message(
                    slot,
                    &format!("You have been restricted from sending messages for {} seconds.", secs),
                )
                .await;
                info!("{} has been restricted from sending messages for {} seconds", username, secs);
            }
            FloodEvent::None => {}
        }
    }

    /// Counts one screenshot-category action for the slot.
    pub async fn screenshot_flood_increment(&self, slot: usize) {
        let Some(cell) = self.sessions.get(slot) else {
            return;
        };
        let now = self.now_ms();

        let (event, username, occupied) = {
            let mut session = cell.lock().await;
            let event = session.throttle.screenshots.increment(
                now,
                self.config.screenshot_flood_limit,
                self.config.screenshot_flood_throttle_ms,
                self.config.screenshot_flood_throttle_ms,
            );
            (event, session.username.clone(), session.is_occupied())
        };

        if !occupied {
            return;
        }

        match event {
            FloodEvent::Warning => {
                self.send_server_message(slot, "Warning: You are sharing too many screenshots.").await;
            }
            FloodEvent::Throttled => {
                let secs = self.config.screenshot_flood_throttle_ms / 1000;
                self.send_server_message(
                    slot,
                    &format!("You have been restricted from sharing screenshots for {} seconds.", secs),
                )
                .await;
                info!("{} has been restricted from sharing screenshots for {} seconds", username, secs);
            }
            FloodEvent::None => {}
        }
    }

    // --- lifecycle ---

    /// Refuses a handshake: the reason goes straight out on the socket,
    /// bypassing the queue, because the reclaim below clears pending frames.
    pub async fn refuse_handshake(&self, slot: usize, reason: &str) {
        if let Some(cell) = self.sessions.get(slot) {
            let mut session = cell.lock().await;
            if session.is_occupied() {
                if let Some(writer) = session.writer.as_mut() {
                    let frame = encode_frame(ServerMessageKind::HandshakeRefusal as u32, reason.as_bytes());
                    let _ = writer.write_all(&frame).await;
                }
            }
        }
        self.disconnect_client(slot, reason).await;
    }

    pub async fn mark_dead(&self, slot: usize) {
        if let Some(cell) = self.sessions.get(slot) {
            cell.lock().await.alive = false;
        }
    }

    pub async fn touch_receive(&self, slot: usize) {
        if let Some(cell) = self.sessions.get(slot) {
            cell.lock().await.last_receive_ms = self.now_ms();
        }
    }

    /// Disconnects a session with a reason, reclaiming its slot. Safe to call
    /// on an already-reclaimed slot.
    pub async fn disconnect_client(&self, slot: usize, reason: &str) {
        let now = self.now_ms();
        let notice = encode_frame(ServerMessageKind::ConnectionEnd as u32, reason.as_bytes());

        let Some(mut outcome) = self.sessions.reclaim(slot, now, &notice).await else {
            return;
        };

        // The disconnect broadcast counts toward the leaver's own flood
        // accounting, landing in the archived state.
        if outcome.was_ready {
            let _ = outcome.throttle.messages.increment(
                now,
                self.config.message_flood_limit,
                self.config.message_flood_throttle_ms,
                self.config.message_flood_throttle_ms,
            );
        }

        if let Some(ip) = outcome.ip {
            self.throttle_cache.lock().unwrap().archive(ip, outcome.throttle);
        }

        if outcome.was_ready {
            info!("Client #{} {} has disconnected: {}", slot, outcome.username, reason);
            if !outcome.messages_were_throttled {
                let text = format!("User {} has disconnected : {}", outcome.username, reason);
                self.send_server_message_to_all(&text, None).await;
            }
        } else {
            info!("Client #{} disconnected before completing handshake: {}", slot, reason);
        }

        if outcome.was_active {
            self.activity_levels_changed().await;
        } else {
            self.send_settings_to_all().await;
        }
    }

    /// Best-effort farewell to every occupied slot, then reclaim them all.
    pub async fn shutdown_all(&self, reason: &str) {
        for slot in 0..self.sessions.capacity() {
            self.disconnect_client(slot, reason).await;
        }
    }

    pub fn record_shared_screenshot(&self) {
        self.shared_screenshots.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn status(&self) -> StatusSnapshot {
        let roster = self.sessions.ready_roster().await;
        let counts = self.counts();
        StatusSnapshot {
            player_count: roster.len(),
            max_clients: self.config.max_clients,
            in_game: counts.in_game,
            in_flight: counts.in_flight,
            update_interval_ms: self.update_interval_ms(),
            uptime: self.start.elapsed(),
            shared_screenshots: self.shared_screenshots.load(Ordering::Relaxed),
            usernames: roster.into_iter().map(|(_, name, _)| name).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(max_clients: usize) -> ServerState {
        ServerState::new(ServerConfig {
            max_clients,
            ban_file: std::path::PathBuf::from("/nonexistent/banned.txt"),
            ..ServerConfig::default()
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 1, 1, last])
    }

    async fn occupy_ready(state: &ServerState, slot: usize, name: &str) {
        state.sessions.install(slot, None, ip(slot as u8), 0, None).await;
        let mut session = state.sessions.get(slot).unwrap().lock().await;
        session.username = name.to_string();
        session.handshake_complete = true;
    }

    #[tokio::test]
    async fn recount_tallies_in_flight_into_both_counts() {
        let state = state_with(4);
        occupy_ready(&state, 0, "a").await;
        occupy_ready(&state, 1, "b").await;
        occupy_ready(&state, 2, "c").await;

        state.sessions.get(0).unwrap().lock().await.activity_level = ActivityLevel::InFlight;
        state.sessions.get(1).unwrap().lock().await.activity_level = ActivityLevel::InGame;

        state.activity_levels_changed().await;
        let counts = state.counts();
        assert_eq!(counts.in_game, 2);
        assert_eq!(counts.in_flight, 1);
    }

    #[tokio::test]
    async fn settings_broadcast_reaches_unhandshaken_sessions() {
        let state = state_with(2);
        occupy_ready(&state, 0, "pilot").await;
        state.sessions.install(1, None, ip(9), 0, None).await;

        state.send_settings_to_all().await;

        for slot in 0..2 {
            let mut session = state.sessions.get(slot).unwrap().lock().await;
            assert_eq!(session.take_outgoing().len(), 1, "slot {} missed settings", slot);
        }
    }

    #[tokio::test]
    async fn server_message_broadcast_skips_excluded_and_unready() {
        let state = state_with(3);
        occupy_ready(&state, 0, "a").await;
        occupy_ready(&state, 1, "b").await;
        state.sessions.install(2, None, ip(9), 0, None).await; // not ready

        state.send_server_message_to_all("hello", Some(0)).await;

        assert!(state.sessions.get(0).unwrap().lock().await.take_outgoing().is_empty());
        assert_eq!(state.sessions.get(1).unwrap().lock().await.take_outgoing().len(), 1);
        assert!(state.sessions.get(2).unwrap().lock().await.take_outgoing().is_empty());
    }

    #[tokio::test]
    async fn state_update_respects_activity_filters() {
        let state = state_with(4);
        for (slot, name) in [(0, "sender"), (1, "flying"), (2, "ingame"), (3, "idle")] {
            occupy_ready(&state, slot, name).await;
        }
        state.sessions.get(0).unwrap().lock().await.activity_level = ActivityLevel::InFlight;
        state.sessions.get(1).unwrap().lock().await.activity_level = ActivityLevel::InFlight;
        state.sessions.get(2).unwrap().lock().await.activity_level = ActivityLevel::InGame;
        // slot 3 stays inactive

        state.broadcast_state_update(b"primary", false, 0).await;
        assert_eq!(state.sessions.get(1).unwrap().lock().await.take_outgoing().len(), 1);
        assert_eq!(state.sessions.get(2).unwrap().lock().await.take_outgoing().len(), 1);
        assert!(state.sessions.get(3).unwrap().lock().await.take_outgoing().is_empty());
        // Sender never receives its own echo.
        assert!(state.sessions.get(0).unwrap().lock().await.take_outgoing().is_empty());

        state.broadcast_state_update(b"secondary", true, 0).await;
        assert_eq!(state.sessions.get(1).unwrap().lock().await.take_outgoing().len(), 1);
        assert!(state.sessions.get(2).unwrap().lock().await.take_outgoing().is_empty());
    }

    #[tokio::test]
    async fn disconnect_archives_throttle_state_for_reconnect() {
        let state = state_with(2);
        occupy_ready(&state, 0, "pilot").await;

        // Drive the session into message throttling.
        for _ in 0..state.config.message_flood_limit {
            state.message_flood_increment(0).await;
        }
        state.disconnect_client(0, "Timeout").await;

        let restored = state.take_saved_throttle(ip(0)).expect("state archived by ip");
        assert!(restored.messages.is_throttled(state.now_ms()));
        // take() removed it from the cache.
        assert!(state.take_saved_throttle(ip(0)).is_none());
    }

    #[tokio::test]
    async fn disconnect_notifies_other_clients_once() {
        let state = state_with(3);
        occupy_ready(&state, 0, "leaver").await;
        occupy_ready(&state, 1, "stays").await;

        state.disconnect_client(0, "Requested quit").await;
        state.disconnect_client(0, "Requested quit").await; // idempotent

        let frames = state.sessions.get(1).unwrap().lock().await.take_outgoing();
        // One disconnect notice plus one settings refresh.
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn ban_slot_targets_the_verified_sender() {
        let state = state_with(2);
        occupy_ready(&state, 0, "hostile").await;

        state.ban_slot(0, "Banned from the server").await;
        assert!(state.is_banned(ip(0)));
        assert!(!state.sessions.is_occupied(0).await);
    }

    #[tokio::test]
    async fn status_snapshot_reports_roster() {
        let state = state_with(4);
        occupy_ready(&state, 0, "a").await;
        occupy_ready(&state, 2, "b").await;

        let status = state.status().await;
        assert_eq!(status.player_count, 2);
        assert_eq!(status.max_clients, 4);
        assert_eq!(status.usernames, vec!["a".to_string(), "b".to_string()]);
    }
}
