//! Integration tests for the relay server.
//!
//! These tests run a real server on an ephemeral port and speak the wire
//! protocol over actual TCP sockets.

use server::config::ServerConfig;
use server::network::RelayServer;
use server::state::ServerState;
use shared::codec::{
    encode_frame, read_u32, FrameDecoder, HandshakePayload, ServerSettingsPayload,
};
use shared::{ClientMessageKind, ServerMessageKind, NET_PROTOCOL_VERSION, PROGRAM_VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn test_config(max_clients: usize) -> ServerConfig {
    ServerConfig {
        port: 0,
        udp_port: Some(0),
        max_clients,
        ban_file: PathBuf::from("/nonexistent/banned.txt"),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::new(config));
    let server = RelayServer::bind(Arc::clone(&state))
        .await
        .expect("failed to bind test server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, state)
}

/// Minimal protocol-speaking client for tests.
struct TestClient {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        TestClient {
            stream,
            decoder: FrameDecoder::new(2 * 1024 * 1024),
        }
    }

    async fn send(&mut self, kind: ClientMessageKind, payload: &[u8]) {
        let frame = encode_frame(kind as u32, payload);
        self.stream.write_all(&frame).await.expect("failed to send frame");
    }

    async fn next_frame(&mut self) -> (u32, Vec<u8>) {
        let mut buffer = [0u8; 8192];
        loop {
            if let Some(frame) = self.decoder.next_frame().expect("frame error") {
                return frame;
            }
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buffer))
                .await
                .expect("timed out waiting for a frame")
                .expect("read error");
            assert!(n > 0, "connection closed while waiting for a frame");
            self.decoder.extend(&buffer[..n]);
        }
    }

    /// Reads frames until one of the wanted kind arrives, skipping others.
    async fn next_frame_of(&mut self, wanted: ServerMessageKind) -> Vec<u8> {
        for _ in 0..64 {
            let (kind, payload) = self.next_frame().await;
            if kind == wanted as u32 {
                return payload;
            }
        }
        panic!("never received a {:?} frame", wanted);
    }

    /// Completes the handshake exchange and returns the assigned client id.
    async fn handshake(&mut self, username: &str) -> u32 {
        let payload = self.next_frame_of(ServerMessageKind::Handshake).await;
        assert_eq!(read_u32(&payload, 0), Some(NET_PROTOCOL_VERSION));
        let version_len = read_u32(&payload, 4).unwrap() as usize;
        let version = std::str::from_utf8(&payload[8..8 + version_len]).unwrap();
        assert_eq!(version, PROGRAM_VERSION);
        let client_id = read_u32(&payload, 8 + version_len).unwrap();

        let handshake = HandshakePayload {
            username: username.to_string(),
            version: PROGRAM_VERSION.to_string(),
        };
        self.send(ClientMessageKind::Handshake, &handshake.encode()).await;
        self.next_frame_of(ServerMessageKind::ServerMessage).await; // welcome

        client_id
    }
}

/// HANDSHAKE AND ADMISSION
mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn client_gets_identity_settings_and_welcome() {
        let (addr, _state) = start_server(test_config(4)).await;
        let mut client = TestClient::connect(addr).await;

        let client_id = client.handshake("Jeb").await;
        assert_eq!(client_id, 0);

        let settings = client.next_frame_of(ServerMessageKind::ServerSettings).await;
        let settings = ServerSettingsPayload::decode(&settings).expect("13-byte settings payload");
        assert_eq!(settings.update_interval_ms, ServerConfig::default().min_update_interval_ms);
    }

    #[tokio::test]
    async fn slots_assign_distinct_client_ids() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut first = TestClient::connect(addr).await;
        assert_eq!(first.handshake("Jeb").await, 0);

        let mut second = TestClient::connect(addr).await;
        assert_eq!(second.handshake("Val").await, 1);

        // The first client hears about the second joining.
        let notice = first.next_frame_of(ServerMessageKind::ServerMessage).await;
        let text = String::from_utf8(notice).unwrap();
        assert!(text.contains("Val"), "{}", text);
    }

    #[tokio::test]
    async fn duplicate_username_is_refused() {
        let (addr, state) = start_server(test_config(4)).await;

        let mut first = TestClient::connect(addr).await;
        first.handshake("Kerman").await;

        let mut second = TestClient::connect(addr).await;
        second.next_frame_of(ServerMessageKind::Handshake).await;
        let handshake = HandshakePayload {
            username: "kerman".to_string(),
            version: PROGRAM_VERSION.to_string(),
        };
        second.send(ClientMessageKind::Handshake, &handshake.encode()).await;

        let refusal = second.next_frame_of(ServerMessageKind::HandshakeRefusal).await;
        assert_eq!(refusal, b"Your username is already in use.");
        assert!(state.sessions.is_ready(0).await);
    }

    #[tokio::test]
    async fn incompatible_version_is_refused() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut client = TestClient::connect(addr).await;
        client.next_frame_of(ServerMessageKind::Handshake).await;
        let handshake = HandshakePayload {
            username: "old".to_string(),
            version: "0.7.0".to_string(),
        };
        client.send(ClientMessageKind::Handshake, &handshake.encode()).await;

        let refusal = client.next_frame_of(ServerMessageKind::HandshakeRefusal).await;
        let text = String::from_utf8(refusal).unwrap();
        assert!(text.contains("incompatible"), "{}", text);
    }

    #[tokio::test]
    async fn reconnect_reuses_the_freed_slot() {
        let (addr, state) = start_server(test_config(1)).await;

        let mut first = TestClient::connect(addr).await;
        first.handshake("Jeb").await;
        first.send(ClientMessageKind::ConnectionEnd, b"bye").await;
        drop(first);

        let mut freed = false;
        for _ in 0..200 {
            if !state.sessions.is_occupied(0).await {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(freed, "slot 0 was not reclaimed");

        let mut second = TestClient::connect(addr).await;
        assert_eq!(second.handshake("Jeb").await, 0);
    }
}

/// RELAY FAN-OUT
mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn chat_reaches_the_other_client_with_sender_prefix() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut alice = TestClient::connect(addr).await;
        alice.handshake("Alice").await;
        let mut bob = TestClient::connect(addr).await;
        bob.handshake("Bob").await;

        alice.send(ClientMessageKind::TextMessage, b"hello Bob").await;

        let chat = bob.next_frame_of(ServerMessageKind::TextMessage).await;
        assert_eq!(chat, b"[Alice] hello Bob");
    }

    #[tokio::test]
    async fn state_updates_flow_to_engaged_clients() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut pilot = TestClient::connect(addr).await;
        pilot.handshake("pilot").await;
        let mut watcher = TestClient::connect(addr).await;
        watcher.handshake("watcher").await;

        // The watcher must be at least in-game to receive updates. Give the
        // activity signal time to land before the pilot shares state.
        watcher.send(ClientMessageKind::ActivityUpdateInGame, &[]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        pilot.send(ClientMessageKind::PrimaryStateUpdate, b"orbital state").await;
        let update = watcher.next_frame_of(ServerMessageKind::StateUpdate).await;
        assert_eq!(update, b"orbital state");
    }

    #[tokio::test]
    async fn craft_files_are_fetched_on_demand() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut builder = TestClient::connect(addr).await;
        builder.handshake("builder").await;
        let mut pilot = TestClient::connect(addr).await;
        pilot.handshake("pilot").await;

        let craft = shared::codec::CraftPayload {
            craft_type: shared::CRAFT_TYPE_VAB,
            name: "Kerbal X".to_string(),
            bytes: vec![7; 256],
        };
        builder.send(ClientMessageKind::ShareCraftFile, &craft.encode()).await;

        let notice = pilot.next_frame_of(ServerMessageKind::TextMessage).await;
        assert!(String::from_utf8(notice).unwrap().contains("Kerbal X"));

        pilot.send(ClientMessageKind::TextMessage, b"!getcraft builder").await;
        let delivered = pilot.next_frame_of(ServerMessageKind::CraftFile).await;
        assert_eq!(shared::codec::CraftPayload::decode(&delivered), Some(craft));
    }

    #[tokio::test]
    async fn screenshots_are_pushed_to_watchers() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut pilot = TestClient::connect(addr).await;
        pilot.handshake("pilot").await;
        let mut watcher = TestClient::connect(addr).await;
        watcher.handshake("watcher").await;

        let watch = shared::codec::ScreenWatchPayload {
            send_screenshot: false,
            watch_index: -1,
            current_index: -1,
            username: "pilot".to_string(),
        };
        // Pushes only reach engaged watchers.
        watcher.send(ClientMessageKind::ActivityUpdateInGame, &[]).await;
        watcher.send(ClientMessageKind::ScreenWatchPlayer, &watch.encode()).await;
        // Give the watch request time to land before the share.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pilot.send(ClientMessageKind::ScreenshotShare, &[0xAA; 512]).await;

        let shared_shot = watcher.next_frame_of(ServerMessageKind::ScreenshotShare).await;
        let shot = shared::codec::Screenshot::decode(&shared_shot).unwrap();
        assert_eq!(shot.index, 0);
        assert_eq!(shot.image, vec![0xAA; 512]);
    }
}

/// SESSION CONTROL
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn ping_gets_a_reply() {
        let (addr, _state) = start_server(test_config(2)).await;
        let mut client = TestClient::connect(addr).await;
        client.handshake("Jeb").await;

        client.send(ClientMessageKind::Ping, &[]).await;
        client.next_frame_of(ServerMessageKind::PingReply).await;
    }

    #[tokio::test]
    async fn quit_command_ends_the_connection() {
        let (addr, state) = start_server(test_config(2)).await;
        let mut client = TestClient::connect(addr).await;
        client.handshake("Jeb").await;

        client.send(ClientMessageKind::TextMessage, b"!quit").await;
        let reason = client.next_frame_of(ServerMessageKind::ConnectionEnd).await;
        assert_eq!(reason, b"Requested quit");

        for _ in 0..200 {
            if !state.sessions.is_occupied(0).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("slot was not reclaimed after !quit");
    }

    #[tokio::test]
    async fn list_command_reports_connected_users() {
        let (addr, _state) = start_server(test_config(4)).await;

        let mut alice = TestClient::connect(addr).await;
        alice.handshake("Alice").await;
        let mut bob = TestClient::connect(addr).await;
        bob.handshake("Bob").await;

        alice.send(ClientMessageKind::TextMessage, b"!list").await;
        // Skip unrelated notices (Bob's join broadcast) until the roster reply.
        let text = loop {
            let reply = alice.next_frame_of(ServerMessageKind::ServerMessage).await;
            let text = String::from_utf8(reply).unwrap();
            if text.contains("Connected users") {
                break text;
            }
        };
        assert!(text.contains("Alice"), "{}", text);
        assert!(text.contains("Bob"), "{}", text);
    }

    #[tokio::test]
    async fn activity_signals_update_the_advertised_settings() {
        let mut config = test_config(2);
        config.updates_per_second = 2.0;
        config.min_update_interval_ms = 100;
        let (addr, state) = start_server(config).await;

        let mut client = TestClient::connect(addr).await;
        client.handshake("pilot").await;

        client.send(ClientMessageKind::ActivityUpdateInFlight, &[]).await;

        // Skip settings frames queued before the activity change landed.
        // One in-flight pilot at 2 updates/sec: 500 ms between updates.
        let mut settings = None;
        for _ in 0..8 {
            let payload = client.next_frame_of(ServerMessageKind::ServerSettings).await;
            let decoded = ServerSettingsPayload::decode(&payload).unwrap();
            if decoded.update_interval_ms == 500 {
                settings = Some(decoded);
                break;
            }
        }
        let settings = settings.expect("settings never reflected the in-flight pilot");
        assert_eq!(settings.inactive_ship_quota, state.config.total_inactive_ships);
    }
}

/// FLOOD CONTROL
mod flood_tests {
    use super::*;

    #[tokio::test]
    async fn chat_flood_draws_a_throttle_notice_and_silence() {
        let mut config = test_config(4);
        config.message_flood_limit = 4;
        let (addr, _state) = start_server(config).await;

        let mut spammer = TestClient::connect(addr).await;
        spammer.handshake("spammer").await;
        let mut witness = TestClient::connect(addr).await;
        witness.handshake("witness").await;

        // Joining already counted once; three chats walk the counter to the
        // limit of four.
        for i in 0..3 {
            let line = format!("spam {}", i);
            spammer.send(ClientMessageKind::TextMessage, line.as_bytes()).await;
        }

        // One step before the limit draws a warning, the limit itself draws
        // the throttle notice. Skip unrelated notices (the witness joining).
        let warning = loop {
            let payload = spammer.next_frame_of(ServerMessageKind::ServerMessage).await;
            let text = String::from_utf8(payload).unwrap();
            if text.contains("Warning") {
                break text;
            }
        };
        assert!(warning.contains("too many messages"), "{}", warning);
        let notice = spammer.next_frame_of(ServerMessageKind::ServerMessage).await;
        let text = String::from_utf8(notice).unwrap();
        assert!(text.contains("restricted"), "{}", text);

        // The witness got the three messages up to and including the limit,
        // then nothing more.
        for i in 0..3 {
            let chat = witness.next_frame_of(ServerMessageKind::TextMessage).await;
            assert_eq!(chat, format!("[spammer] spam {}", i).as_bytes());
        }

        spammer.send(ClientMessageKind::TextMessage, b"past the limit").await;
        witness.send(ClientMessageKind::TextMessage, b"still here").await;
        // The next chat the spammer sees skips the throttled message.
        let chat = spammer.next_frame_of(ServerMessageKind::TextMessage).await;
        assert_eq!(chat, b"[witness] still here");
    }

    #[tokio::test]
    async fn oversized_chat_gets_the_sender_banned() {
        let (addr, state) = start_server(test_config(2)).await;

        let mut hostile = TestClient::connect(addr).await;
        hostile.handshake("hostile").await;

        let flood = "a".repeat(shared::MAX_TEXT_MESSAGE_LENGTH + 1);
        hostile.send(ClientMessageKind::TextMessage, flood.as_bytes()).await;

        let mut banned = false;
        for _ in 0..200 {
            if state.is_banned("127.0.0.1".parse().unwrap()) {
                banned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(banned, "oversized chat did not ban the sender");

        // A reconnect from the banned address is refused outright.
        let mut again = TestClient::connect(addr).await;
        let refusal = again.next_frame_of(ServerMessageKind::HandshakeRefusal).await;
        assert_eq!(refusal, b"You are banned from the server.");
    }

    #[tokio::test]
    async fn throttle_survives_a_reconnect() {
        let mut config = test_config(2);
        config.message_flood_limit = 2;
        let (addr, state) = start_server(config).await;

        let mut spammer = TestClient::connect(addr).await;
        spammer.handshake("spammer").await;
        // With a limit of two, joining drew the warning; one chat trips the
        // throttle and a second is dropped while restricted.
        spammer.send(ClientMessageKind::TextMessage, b"one").await;
        spammer.send(ClientMessageKind::TextMessage, b"two").await;
        spammer.next_frame_of(ServerMessageKind::ServerMessage).await; // warning
        spammer.next_frame_of(ServerMessageKind::ServerMessage).await; // throttle notice
        spammer.send(ClientMessageKind::ConnectionEnd, b"").await;
        drop(spammer);

        for _ in 0..200 {
            if !state.sessions.is_occupied(0).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut returned = TestClient::connect(addr).await;
        returned.handshake("spammer").await;
        let session = state.sessions.get(0).unwrap().lock().await;
        assert!(session.throttle.messages.is_throttled(state.now_ms()));
    }
}
