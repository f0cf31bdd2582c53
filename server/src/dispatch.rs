//! Per-message protocol dispatch.
//!
//! Every decoded frame from a client lands in [`handle_message`]. Handlers
//! are guard-first: a message that arrives in the wrong session state or with
//! a malformed payload is dropped, never an error back to the peer. Only
//! frame-level violations tear a connection down, and that happens in the
//! receive loop before dispatch.

use crate::activity::ActivityLevel;
use crate::session::WatchTarget;
use crate::state::ServerState;
use crate::storage;
use log::{info, warn};
use shared::codec::{encode_frame, CraftPayload, HandshakePayload, ScreenWatchPayload};
use shared::{
    sanitize_text, ClientMessageKind, ServerMessageKind, CRAFT_TYPE_SPH, CRAFT_TYPE_VAB,
    GET_CRAFT_COMMAND, MAX_CRAFT_FILE_BYTES, MAX_TEXT_MESSAGE_LENGTH, PROGRAM_VERSION,
};

const LIST_COMMAND: &str = "!list";
const QUIT_COMMAND: &str = "!quit";
const MAX_USERNAME_LENGTH: usize = 16;

/// Compatible means the major and minor version components match; the patch
/// component is free to differ.
fn version_compatible(client_version: &str) -> bool {
    let mut ours = PROGRAM_VERSION.split('.');
    let mut theirs = client_version.split('.');
    ours.next() == theirs.next() && ours.next() == theirs.next()
}

pub async fn handle_message(state: &ServerState, slot: usize, kind: ClientMessageKind, payload: Vec<u8>) {
    match kind {
        ClientMessageKind::Handshake => handle_handshake(state, slot, &payload).await,
        ClientMessageKind::PrimaryStateUpdate => {
            if state.sessions.is_ready(slot).await {
                state.broadcast_state_update(&payload, false, slot).await;
            }
        }
        ClientMessageKind::SecondaryStateUpdate => {
            if state.sessions.is_ready(slot).await {
                state.broadcast_state_update(&payload, true, slot).await;
            }
        }
        ClientMessageKind::TextMessage => handle_text(state, slot, payload).await,
        ClientMessageKind::ScreenWatchPlayer => handle_screen_watch(state, slot, &payload).await,
        ClientMessageKind::ScreenshotShare => handle_screenshot_share(state, slot, payload).await,
        ClientMessageKind::ShareCraftFile => handle_craft_share(state, slot, &payload).await,
        ClientMessageKind::ActivityUpdateInGame => {
            handle_activity_update(state, slot, ActivityLevel::InGame).await
        }
        ClientMessageKind::ActivityUpdateInFlight => {
            handle_activity_update(state, slot, ActivityLevel::InFlight).await
        }
        ClientMessageKind::ConnectionEnd => {
            let reason = match String::from_utf8(payload) {
                Ok(text) if !text.trim().is_empty() => {
                    format!("Connection closed by client: {}", sanitize_text(text.trim()))
                }
                _ => "Connection closed by client".to_string(),
            };
            state.disconnect_client(slot, &reason).await;
        }
        ClientMessageKind::Ping => {
            state.queue_message(slot, ServerMessageKind::PingReply, &[]).await;
        }
        // Keepalives only exist to refresh the receive timestamp, which the
        // receive loop already did. Probes are answered on the UDP path.
        ClientMessageKind::Keepalive | ClientMessageKind::Null | ClientMessageKind::UdpProbe => {}
    }
}

async fn handle_handshake(state: &ServerState, slot: usize, payload: &[u8]) {
    let Some(handshake) = HandshakePayload::decode(payload) else {
        state.refuse_handshake(slot, "Malformed handshake").await;
        return;
    };

    // A second handshake on an established session is ignored.
    if state.sessions.is_ready(slot).await {
        return;
    }

    let username = handshake.username.trim().to_string();
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
        state.refuse_handshake(slot, "Invalid username").await;
        return;
    }

    if !version_compatible(&handshake.version) {
        state
            .refuse_handshake(
                slot,
                &format!(
                    "Your client version is incompatible with this server. Server version: {}",
                    PROGRAM_VERSION
                ),
            )
            .await;
        return;
    }

    if state.sessions.find_by_username(&username).await.is_some() {
        state.refuse_handshake(slot, "Your username is already in use.").await;
        return;
    }

    {
        let Some(cell) = state.sessions.get(slot) else { return };
        let mut session = cell.lock().await;
        if !session.is_occupied() {
            return;
        }
        session.username = username.clone();
        session.handshake_complete = true;
    }

    info!("{} has joined the server using client version {}", username, handshake.version);

    let roster = state.sessions.ready_roster().await;
    let others: Vec<&str> = roster
        .iter()
        .filter(|(index, _, _)| *index != slot)
        .map(|(_, name, _)| name.as_str())
        .collect();
    let welcome = match others.as_slice() {
        [] => format!("Welcome to the server, {}! You are the only user online.", username),
        [other] => format!("Welcome to the server, {}! {} is also online.", username, other),
        many => format!(
            "Welcome to the server, {}! There are {} other users online. Type {} to see them.",
            username,
            many.len(),
            LIST_COMMAND
        ),
    };
    state.send_server_message(slot, &welcome).await;
    state.send_settings(slot).await;

    // The join notice is suppressed while the restored throttle state is
    // still cooling down, but the join counts toward the flood limit
    // either way.
    let throttled = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let session = cell.lock().await;
        session.throttle.messages.is_throttled(state.now_ms())
    };
    if !throttled {
        state
            .send_server_message_to_all(&format!("User {} has joined the server.", username), Some(slot))
            .await;
    }
    state.message_flood_increment(slot).await;
}

async fn handle_text(state: &ServerState, slot: usize, payload: Vec<u8>) {
    if !state.sessions.is_ready(slot).await {
        return;
    }
    let Ok(text) = String::from_utf8(payload) else { return };
    let text = text.trim();

    // Quitting always works, throttled or not.
    if text == QUIT_COMMAND {
        state.disconnect_client(slot, "Requested quit").await;
        return;
    }

    let throttled = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let session = cell.lock().await;
        session.throttle.messages.is_throttled(state.now_ms())
    };

    if text == LIST_COMMAND {
        if !throttled {
            send_user_list(state, slot).await;
        }
        return;
    }

    if let Some(target) = text.strip_prefix(GET_CRAFT_COMMAND).map(str::trim) {
        if !target.is_empty() {
            if !throttled {
                send_craft_to(state, slot, target).await;
            }
            return;
        }
    }

    // Plain chat counts toward the flood limit; the message that crosses the
    // limit is still relayed, everything after it is dropped until cooldown.
    state.message_flood_increment(slot).await;
    if throttled {
        return;
    }

    let sanitized = sanitize_text(text);
    if sanitized.len() > MAX_TEXT_MESSAGE_LENGTH {
        let username = session_username(state, slot).await;
        warn!("{} sent an oversized chat message ({} bytes), banning", username, sanitized.len());
        state.ban_slot(slot, "Banned from the server").await;
        state
            .send_server_message_to_all(&format!("{} has been banned from the server.", username), None)
            .await;
        return;
    }
    if sanitized.is_empty() {
        return;
    }

    let username = session_username(state, slot).await;
    let line = format!("[{}] {}", username, sanitized);
    info!("{}", line);
    state.send_text_message_to_all(&line, Some(slot)).await;
}

async fn session_username(state: &ServerState, slot: usize) -> String {
    match state.sessions.get(slot) {
        Some(cell) => cell.lock().await.username.clone(),
        None => String::new(),
    }
}

async fn send_user_list(state: &ServerState, slot: usize) {
    let roster = state.sessions.ready_roster().await;
    let mut reply = format!("Connected users ({}):", roster.len());
    for (_, username, level) in roster {
        reply.push_str(&format!("\n{} - {}", username, level));
    }
    state.send_server_message(slot, &reply).await;
}

async fn send_craft_to(state: &ServerState, slot: usize, target_name: &str) {
    let Some(target_slot) = state.sessions.find_by_username(target_name).await else {
        return;
    };
    if target_slot == slot {
        return;
    }

    let (craft, owner) = {
        let Some(cell) = state.sessions.get(target_slot) else { return };
        let session = cell.lock().await;
        (session.shared_craft.clone(), session.username.clone())
    };
    let Some(craft) = craft else { return };

    state.queue_message(slot, ServerMessageKind::CraftFile, &craft.encode()).await;
    state
        .send_server_message(slot, &format!("Sent you {}'s craft: {}", owner, craft.name))
        .await;
}

async fn handle_screen_watch(state: &ServerState, slot: usize, payload: &[u8]) {
    if !state.sessions.is_ready(slot).await {
        return;
    }
    let Some(request) = ScreenWatchPayload::decode(payload) else { return };

    let changed = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let mut session = cell.lock().await;
        let target = WatchTarget {
            username: request.username.clone(),
            index: request.watch_index,
        };
        let changed = session.watch_target != target;
        session.watch_target = target;
        changed
    };

    // An immediate push only happens when the target actually changed.
    if !changed || !request.send_screenshot || request.username.is_empty() {
        return;
    }
    let Some(target_slot) = state.sessions.find_by_username(&request.username).await else {
        return;
    };
    if target_slot == slot {
        return;
    }

    let screenshot = {
        let Some(cell) = state.sessions.get(target_slot) else { return };
        let session = cell.lock().await;
        if request.watch_index < 0 {
            session.latest_screenshot().cloned()
        } else {
            session.screenshot_at(request.watch_index).cloned()
        }
    };

    // Only push if the watcher does not already hold this one.
    if let Some(screenshot) = screenshot {
        if screenshot.index != request.current_index {
            state
                .queue_message(slot, ServerMessageKind::ScreenshotShare, &screenshot.encode())
                .await;
        }
    }
}

async fn handle_screenshot_share(state: &ServerState, slot: usize, payload: Vec<u8>) {
    if !state.sessions.is_ready(slot).await {
        return;
    }
    if payload.len() > state.config.screenshot_max_bytes {
        warn!(
            "Dropping oversized screenshot from slot {} ({} bytes)",
            slot,
            payload.len()
        );
        return;
    }

    let throttled = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let session = cell.lock().await;
        session.throttle.screenshots.is_throttled(state.now_ms())
    };
    state.screenshot_flood_increment(slot).await;
    if throttled {
        return;
    }

    let (screenshot, username) = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let mut session = cell.lock().await;
        let screenshot = session.push_screenshot(payload, state.config.screenshot_backlog);
        (screenshot, session.username.clone())
    };

    state.record_shared_screenshot();
    info!("{} has shared a screenshot", username);

    if state.config.save_screenshots {
        storage::store_screenshot(&state.config.screenshot_dir, &username, &screenshot.image);
    }

    // Watchers must be engaged to get the image pushed.
    let frame = encode_frame(ServerMessageKind::ScreenshotShare as u32, &screenshot.encode());
    for (index, cell) in state.sessions.iter().enumerate() {
        if index == slot {
            continue;
        }
        let mut session = cell.lock().await;
        if session.is_ready()
            && session.activity_level != ActivityLevel::Inactive
            && session.watch_target.username.eq_ignore_ascii_case(&username)
        {
            session.queue_frame(frame.clone());
        }
    }

    state
        .send_text_message_to_all(&format!("{} has shared a screenshot.", username), None)
        .await;
}

async fn handle_craft_share(state: &ServerState, slot: usize, payload: &[u8]) {
    if !state.sessions.is_ready(slot).await {
        return;
    }
    let Some(craft) = CraftPayload::decode(payload) else { return };
    if craft.craft_type != CRAFT_TYPE_VAB && craft.craft_type != CRAFT_TYPE_SPH {
        return;
    }
    if craft.bytes.len() > MAX_CRAFT_FILE_BYTES {
        return;
    }

    let throttled = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let session = cell.lock().await;
        session.throttle.messages.is_throttled(state.now_ms())
    };
    state.message_flood_increment(slot).await;
    if throttled {
        return;
    }

    let username = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let mut session = cell.lock().await;
        let username = session.username.clone();
        session.shared_craft = Some(craft.clone());
        username
    };

    let hangar = if craft.craft_type == CRAFT_TYPE_VAB { "VAB" } else { "SPH" };
    info!("{} has shared a {} craft: {}", username, hangar, craft.name);
    state
        .send_text_message_to_all(
            &format!(
                "{} has shared a {} craft: {} (type {} {} to download it)",
                username, hangar, craft.name, GET_CRAFT_COMMAND, username
            ),
            None,
        )
        .await;
}

async fn handle_activity_update(state: &ServerState, slot: usize, level: ActivityLevel) {
    if !state.sessions.is_ready(slot).await {
        return;
    }
    let changed = {
        let Some(cell) = state.sessions.get(slot) else { return };
        let mut session = cell.lock().await;
        session.raise_activity(level, state.now_ms())
    };
    if changed {
        state.activity_levels_changed().await;
    }
}
