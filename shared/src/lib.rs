//! Shared wire protocol definitions for the relay server and its clients.
//!
//! Everything on the wire is little-endian and framed as
//! `[u32 message kind][u32 payload length][payload bytes]`. The client and
//! server directions use distinct kind enumerations that share the framing.
//! This crate is pure data: no sockets, no async, no I/O.

pub mod codec;

/// Version string advertised in the server handshake. Clients whose minor
/// version component differs are refused.
pub const PROGRAM_VERSION: &str = "0.9.2";

/// Network protocol revision, sent in the server handshake payload.
pub const NET_PROTOCOL_VERSION: u32 = 9;

/// Fixed frame header size: u32 kind + u32 payload length.
pub const MSG_HEADER_LENGTH: usize = 8;

/// Size of the server settings payload.
pub const SERVER_SETTINGS_LENGTH: usize = 13;

/// Upper bound on the craft bytes accepted in a craft share.
pub const MAX_CRAFT_FILE_BYTES: usize = 1024 * 1024;

/// Chat command that asks the server for another player's shared craft.
pub const GET_CRAFT_COMMAND: &str = "!getcraft";

/// Sanitized chat lines longer than this indicate a hostile payload.
pub const MAX_TEXT_MESSAGE_LENGTH: usize = 270;

pub const CRAFT_TYPE_VAB: u8 = 0;
pub const CRAFT_TYPE_SPH: u8 = 1;

/// Messages a client may send to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientMessageKind {
    /// `[u32 username length][username][version string]`
    Handshake = 0,
    /// Opaque world-state payload relayed to non-inactive sessions.
    PrimaryStateUpdate = 1,
    /// Opaque world-state payload relayed to in-flight sessions only.
    SecondaryStateUpdate = 2,
    /// UTF-8 chat text (or a `!` command).
    TextMessage = 3,
    /// `[u8 send-screenshot flag][i32 watch index][i32 current index][username]`
    ScreenWatchPlayer = 4,
    /// `[i32 index][image bytes]`
    ScreenshotShare = 5,
    Keepalive = 6,
    /// Optional UTF-8 disconnect reason.
    ConnectionEnd = 7,
    UdpProbe = 8,
    Null = 9,
    /// `[u8 craft type][u32 name length][name][craft bytes]`
    ShareCraftFile = 10,
    ActivityUpdateInGame = 11,
    ActivityUpdateInFlight = 12,
    Ping = 13,
}

impl ClientMessageKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        use ClientMessageKind::*;
        Some(match value {
            0 => Handshake,
            1 => PrimaryStateUpdate,
            2 => SecondaryStateUpdate,
            3 => TextMessage,
            4 => ScreenWatchPlayer,
            5 => ScreenshotShare,
            6 => Keepalive,
            7 => ConnectionEnd,
            8 => UdpProbe,
            9 => Null,
            10 => ShareCraftFile,
            11 => ActivityUpdateInGame,
            12 => ActivityUpdateInFlight,
            13 => Ping,
            _ => return None,
        })
    }
}

/// Messages the server may send to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerMessageKind {
    /// `[u32 protocol version][u32 version length][version][u32 client id]`
    Handshake = 0,
    /// UTF-8 refusal reason; the socket is closed after sending.
    HandshakeRefusal = 1,
    /// Informational text from the server itself.
    ServerMessage = 2,
    /// Relayed chat text.
    TextMessage = 3,
    /// Relayed opaque world-state payload.
    StateUpdate = 4,
    /// See [`codec::ServerSettingsPayload`].
    ServerSettings = 5,
    /// `[i32 index][image bytes]`
    ScreenshotShare = 6,
    Keepalive = 7,
    /// UTF-8 disconnect reason; the socket is closed after sending.
    ConnectionEnd = 8,
    UdpAcknowledge = 9,
    Null = 10,
    /// Same layout as the client craft share.
    CraftFile = 11,
    PingReply = 12,
}

impl ServerMessageKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        use ServerMessageKind::*;
        Some(match value {
            0 => Handshake,
            1 => HandshakeRefusal,
            2 => ServerMessage,
            3 => TextMessage,
            4 => StateUpdate,
            5 => ServerSettings,
            6 => ScreenshotShare,
            7 => Keepalive,
            8 => ConnectionEnd,
            9 => UdpAcknowledge,
            10 => Null,
            11 => CraftFile,
            12 => PingReply,
            _ => return None,
        })
    }
}

/// Strips a chat line down to the allow-listed character set.
///
/// Anything outside digits, `A`-`z`, and a small punctuation set is dropped.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|&c| {
            c.is_ascii_digit()
                || ('A'..='z').contains(&c)
                || matches!(c, '.' | '_' | ' ' | '!' | '(' | ')' | ':' | '?' | ',' | '\'' | '/')
        })
        .collect()
}

/// Removes characters that are illegal in file names from a player name.
pub fn filtered_file_name(name: &str) -> String {
    const ILLEGAL: &str = "\\/:*?\"<>|";
    name.chars().filter(|c| !ILLEGAL.contains(*c)).collect()
}
