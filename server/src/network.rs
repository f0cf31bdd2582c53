//! Network layer: connection acceptance, per-connection receive tasks, the
//! UDP side channel, and the supervisor loop that drives dispatch, timeouts,
//! and the outgoing pump.

use crate::dispatch;
use crate::state::ServerState;
use log::{error, info, warn};
use shared::codec::{encode_frame, encode_server_handshake, parse_udp_frame, FrameDecoder};
use shared::{ClientMessageKind, ServerMessageKind, NET_PROTOCOL_VERSION, PROGRAM_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::interval;

/// A connection that sends nothing for this long is dropped.
pub const CLIENT_TIMEOUT_MS: u64 = 32_000;

/// A connection that has not completed its handshake within this long is
/// dropped.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 22_000;

/// Supervisor pass cadence: dispatch draining, timeout checks, activity
/// demotion, and the outgoing pump all run on this tick.
pub const SUPERVISOR_TICK_MS: u64 = 15;

/// Minimum spacing between UDP acknowledgements to one client.
pub const UDP_ACK_THROTTLE_MS: u64 = 1_000;

/// One decoded frame from a client, attributed to its session slot.
#[derive(Debug)]
struct InboundMessage {
    slot: usize,
    kind: ClientMessageKind,
    payload: Vec<u8>,
}

/// The relay server: owns the listening sockets and the supervisor loop.
pub struct RelayServer {
    state: Arc<ServerState>,
    listener: TcpListener,
    udp: Option<Arc<UdpSocket>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
    fault_tx: mpsc::UnboundedSender<String>,
    fault_rx: mpsc::UnboundedReceiver<String>,
}

impl RelayServer {
    /// Binds the TCP listener and, best-effort, the UDP socket. A UDP bind
    /// failure is logged and the server runs TCP-only.
    pub async fn bind(state: Arc<ServerState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", state.config.port)).await?;
        info!("Listening for TCP connections on {}", listener.local_addr()?);

        let udp = match UdpSocket::bind(("0.0.0.0", state.config.udp_port())).await {
            Ok(socket) => {
                info!("Listening for UDP messages on {}", socket.local_addr()?);
                Some(Arc::new(socket))
            }
            Err(e) => {
                warn!("Could not bind UDP socket: {}. Continuing without UDP.", e);
                None
            }
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        Ok(RelayServer {
            state,
            listener,
            udp,
            inbound_tx,
            inbound_rx,
            fault_tx,
            fault_rx,
        })
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Runs the server: spawns the accept, UDP, and pump tasks, then loops
    /// over inbound dispatch and the periodic supervisor pass.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let RelayServer {
            state,
            listener,
            udp,
            inbound_tx,
            mut inbound_rx,
            fault_tx,
            mut fault_rx,
        } = self;

        let accept_state = Arc::clone(&state);
        let accept_tx = inbound_tx.clone();
        tokio::spawn(async move {
            accept_loop(accept_state, listener, accept_tx, fault_tx).await;
        });

        if let Some(udp) = udp {
            let udp_state = Arc::clone(&state);
            let udp_tx = inbound_tx.clone();
            tokio::spawn(async move {
                udp_loop(udp_state, udp, udp_tx).await;
            });
        }

        let pump_state = Arc::clone(&state);
        tokio::spawn(async move {
            pump_loop(pump_state).await;
        });

        let mut tick = interval(Duration::from_millis(SUPERVISOR_TICK_MS));
        info!("Server started, version {}", PROGRAM_VERSION);

        loop {
            tokio::select! {
                message = inbound_rx.recv() => {
                    match message {
                        Some(msg) => {
                            dispatch::handle_message(&state, msg.slot, msg.kind, msg.payload).await;
                        }
                        // Unreachable while `inbound_tx` lives on this stack,
                        // but a closed channel means nothing can arrive.
                        None => break,
                    }
                }
                fault = fault_rx.recv() => {
                    // The first unrecoverable worker fault takes the server
                    // down rather than limping on without that worker.
                    if let Some(fault) = fault {
                        return Err(fault.into());
                    }
                }
                _ = tick.tick() => {
                    supervise(&state).await;
                }
            }
        }

        Ok(())
    }
}

/// One supervisor pass: reclaim dead connections, enforce timeouts, and
/// demote idle sessions.
async fn supervise(state: &ServerState) {
    let now = state.now_ms();
    let mut demoted = false;

    for slot in 0..state.sessions.capacity() {
        let reason = {
            let Some(cell) = state.sessions.get(slot) else { continue };
            let mut session = cell.lock().await;

            if session.needs_reclaim() {
                Some("Connection lost")
            } else if !session.is_occupied() {
                None
            } else if now.saturating_sub(session.last_receive_ms) > CLIENT_TIMEOUT_MS {
                Some("Timeout")
            } else if !session.handshake_complete
                && now.saturating_sub(session.connection_start_ms) > HANDSHAKE_TIMEOUT_MS
            {
                Some("Handshake timeout")
            } else {
                if session.is_ready() && session.demote_if_idle(now) {
                    demoted = true;
                }
                None
            }
        };

        if let Some(reason) = reason {
            state.disconnect_client(slot, reason).await;
        }
    }

    if demoted {
        state.activity_levels_changed().await;
    }
}

/// Flushes each occupied session's outgoing queue on a fixed tick. Runs as
/// its own task so a peer that stops reading only stalls its own queue, never
/// dispatch or the timeout checks.
async fn pump_loop(state: Arc<ServerState>) {
    let mut tick = interval(Duration::from_millis(SUPERVISOR_TICK_MS));

    loop {
        tick.tick().await;

        for slot in 0..state.sessions.capacity() {
            let Some(cell) = state.sessions.get(slot) else { continue };
            let mut session = cell.lock().await;
            if !session.is_occupied() {
                continue;
            }

            let frames = session.take_outgoing();
            if let Some(writer) = session.writer.as_mut() {
                for frame in frames {
                    if writer.write_all(&frame).await.is_err() {
                        session.alive = false;
                        break;
                    }
                }
            }
        }
    }
}

async fn accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    fault_tx: mpsc::UnboundedSender<String>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                admit_connection(&state, stream, addr, &inbound_tx).await;
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                let _ = fault_tx.send(format!("accept loop failed: {}", e));
                return;
            }
        }
    }
}

/// Admission control and slot installation for one accepted socket.
async fn admit_connection(
    state: &Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
    inbound_tx: &mpsc::UnboundedSender<InboundMessage>,
) {
    let ip = addr.ip();

    if state.is_banned(ip) {
        info!("Refused banned connection attempt from {}", addr);
        refuse_direct(stream, "You are banned from the server.").await;
        return;
    }

    let Some(slot) = state.sessions.free_slot().await else {
        info!("Refused connection from {}: server full", addr);
        refuse_direct(stream, "Server is currently full").await;
        return;
    };

    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let restored = state.take_saved_throttle(ip);
    state
        .sessions
        .install(slot, Some(writer), ip, state.now_ms(), restored)
        .await;

    let task = tokio::spawn(receive_loop(
        Arc::clone(state),
        slot,
        reader,
        inbound_tx.clone(),
    ));

    if let Some(cell) = state.sessions.get(slot) {
        let mut session = cell.lock().await;
        session.set_receive_task(task.abort_handle());
        session.queue_frame(encode_frame(
            ServerMessageKind::Handshake as u32,
            &encode_server_handshake(NET_PROTOCOL_VERSION, PROGRAM_VERSION, slot as u32),
        ));
        // Padding frame some clients use to confirm the stream is in sync.
        session.queue_frame(encode_frame(ServerMessageKind::Null as u32, &[]));
        if !state.config.join_message.is_empty() {
            session.queue_frame(encode_frame(
                ServerMessageKind::ServerMessage as u32,
                state.config.join_message.as_bytes(),
            ));
        }
    }

    info!("Client #{} connected from {}", slot, addr);
    state.send_settings_to_all().await;
}

/// Sends a refusal straight on the socket and closes it; the peer never gets
/// a session slot.
async fn refuse_direct(mut stream: TcpStream, reason: &str) {
    let frame = encode_frame(ServerMessageKind::HandshakeRefusal as u32, reason.as_bytes());
    let _ = stream.write_all(&frame).await;
    let _ = stream.shutdown().await;
}

/// Reads and decodes frames from one connection until the socket closes or a
/// frame-level violation occurs, handing each frame to the supervisor.
async fn receive_loop(
    state: Arc<ServerState>,
    slot: usize,
    mut reader: OwnedReadHalf,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
) {
    let mut decoder = FrameDecoder::new(state.config.max_frame_payload());
    let mut buffer = vec![0u8; 8192];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                state.touch_receive(slot).await;
                decoder.extend(&buffer[..n]);

                loop {
                    match decoder.next_frame() {
                        Ok(Some((kind, payload))) => match ClientMessageKind::from_u32(kind) {
                            Some(kind) => {
                                if inbound_tx
                                    .send(InboundMessage { slot, kind, payload })
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            None => {
                                warn!("Unknown message kind {} from client #{}", kind, slot);
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Dropping client #{}: {}", slot, e);
                            state.mark_dead(slot).await;
                            return;
                        }
                    }
                }
            }
            Err(_) => break,
        }
    }

    state.mark_dead(slot).await;
}

/// Receives UDP datagrams, attributes them to sessions by the sender-slot
/// prefix, acknowledges them (throttled), and forwards the inner frames.
async fn udp_loop(
    state: Arc<ServerState>,
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
) {
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let (len, addr) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                error!("Error receiving UDP datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let Some((sender, kind, payload)) = parse_udp_frame(&buffer[..len]) else {
            continue;
        };
        let slot = sender as usize;

        // A datagram only counts if it claims a slot whose session is
        // occupied by the same address it came from.
        {
            let Some(cell) = state.sessions.get(slot) else { continue };
            let mut session = cell.lock().await;
            if !session.is_occupied() || session.ip != Some(addr.ip()) {
                continue;
            }

            let now = state.now_ms();
            session.last_receive_ms = now;
            // The acknowledgement rides the client's TCP stream. The first
            // datagram of a connection is always acknowledged.
            if session.last_udp_ack_ms == 0
                || now.saturating_sub(session.last_udp_ack_ms) >= UDP_ACK_THROTTLE_MS
            {
                session.last_udp_ack_ms = now;
                session.queue_frame(encode_frame(ServerMessageKind::UdpAcknowledge as u32, &[]));
            }
        }

        match ClientMessageKind::from_u32(kind) {
            Some(ClientMessageKind::UdpProbe) | None => {}
            Some(kind) => {
                if inbound_tx.send(InboundMessage { slot, kind, payload }).is_err() {
                    return;
                }
            }
        }
    }
}
