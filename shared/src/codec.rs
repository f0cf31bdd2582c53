//! Binary framing and payload layouts.
//!
//! A frame is `[u32 LE kind][u32 LE payload length][payload]`. UDP datagrams
//! carry one frame prefixed with the u32 slot index of the sender, used only
//! to attribute the frame to a session. The decoder never trusts a declared
//! length beyond the bytes actually available.

use crate::MSG_HEADER_LENGTH;

/// Reads a little-endian u32 at `offset`, or `None` if out of bounds.
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a little-endian i32 at `offset`, or `None` if out of bounds.
pub fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    read_u32(data, offset).map(|v| v as i32)
}

/// Builds a complete frame for the given kind and payload.
pub fn encode_frame(kind: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MSG_HEADER_LENGTH + payload.len());
    frame.extend_from_slice(&kind.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Frame-level decode failures. Either one poisons the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared payload length exceeds the decoder's configured maximum.
    PayloadTooLarge { declared: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::PayloadTooLarge { declared, max } => {
                write!(f, "declared payload of {} bytes exceeds maximum {}", declared, max)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Incremental frame decoder for a TCP byte stream.
///
/// Bytes are fed in as they arrive; a frame is only yielded once its full
/// declared payload is buffered.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one is fully buffered.
    pub fn next_frame(&mut self) -> Result<Option<(u32, Vec<u8>)>, FrameError> {
        if self.buffer.len() < MSG_HEADER_LENGTH {
            return Ok(None);
        }

        let kind = read_u32(&self.buffer, 0).unwrap();
        let length = read_u32(&self.buffer, 4).unwrap() as usize;

        if length > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                declared: length,
                max: self.max_payload,
            });
        }

        if self.buffer.len() < MSG_HEADER_LENGTH + length {
            return Ok(None);
        }

        let payload = self.buffer[MSG_HEADER_LENGTH..MSG_HEADER_LENGTH + length].to_vec();
        self.buffer.drain(..MSG_HEADER_LENGTH + length);
        Ok(Some((kind, payload)))
    }
}

/// Parses a UDP datagram: `[u32 sender slot][u32 kind][u32 length][payload]`.
///
/// Returns `None` for truncated datagrams or lengths that exceed the bytes
/// actually received.
pub fn parse_udp_frame(datagram: &[u8]) -> Option<(u32, u32, Vec<u8>)> {
    let sender = read_u32(datagram, 0)?;
    let kind = read_u32(datagram, 4)?;
    let length = read_u32(datagram, 8)? as usize;

    let start = 4 + MSG_HEADER_LENGTH;
    if length > datagram.len().saturating_sub(start) {
        return None;
    }

    Some((sender, kind, datagram[start..start + length].to_vec()))
}

/// Client handshake: `[u32 username length][username][version string]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub username: String,
    pub version: String,
}

impl HandshakePayload {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.username.as_bytes();
        let mut data = Vec::with_capacity(4 + name.len() + self.version.len());
        data.extend_from_slice(&(name.len() as u32).to_le_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(self.version.as_bytes());
        data
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let name_len = read_u32(data, 0)? as usize;
        let name_bytes = data.get(4..4 + name_len)?;
        let username = String::from_utf8(name_bytes.to_vec()).ok()?;
        let version = String::from_utf8(data[4 + name_len..].to_vec()).ok()?;
        Some(Self { username, version })
    }
}

/// Builds the server handshake payload:
/// `[u32 protocol version][u32 version length][version][u32 client id]`.
pub fn encode_server_handshake(protocol_version: u32, version: &str, client_id: u32) -> Vec<u8> {
    let version_bytes = version.as_bytes();
    let mut data = Vec::with_capacity(12 + version_bytes.len());
    data.extend_from_slice(&protocol_version.to_le_bytes());
    data.extend_from_slice(&(version_bytes.len() as u32).to_le_bytes());
    data.extend_from_slice(version_bytes);
    data.extend_from_slice(&client_id.to_le_bytes());
    data
}

/// Server settings advertised to every client whenever activity changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettingsPayload {
    pub update_interval_ms: u32,
    pub screenshot_interval_ms: u32,
    pub screenshot_max_height: u32,
    pub inactive_ship_quota: u8,
}

impl ServerSettingsPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(crate::SERVER_SETTINGS_LENGTH);
        data.extend_from_slice(&self.update_interval_ms.to_le_bytes());
        data.extend_from_slice(&self.screenshot_interval_ms.to_le_bytes());
        data.extend_from_slice(&self.screenshot_max_height.to_le_bytes());
        data.push(self.inactive_ship_quota);
        data
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != crate::SERVER_SETTINGS_LENGTH {
            return None;
        }
        Some(Self {
            update_interval_ms: read_u32(data, 0)?,
            screenshot_interval_ms: read_u32(data, 4)?,
            screenshot_max_height: read_u32(data, 8)?,
            inactive_ship_quota: data[12],
        })
    }
}

/// Screen-watch request:
/// `[u8 send-screenshot flag][i32 watch index][i32 current index][username]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenWatchPayload {
    pub send_screenshot: bool,
    pub watch_index: i32,
    pub current_index: i32,
    pub username: String,
}

impl ScreenWatchPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(9 + self.username.len());
        data.push(self.send_screenshot as u8);
        data.extend_from_slice(&self.watch_index.to_le_bytes());
        data.extend_from_slice(&self.current_index.to_le_bytes());
        data.extend_from_slice(self.username.as_bytes());
        data
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 9 {
            return None;
        }
        Some(Self {
            send_screenshot: data[0] != 0,
            watch_index: read_i32(data, 1)?,
            current_index: read_i32(data, 5)?,
            username: String::from_utf8(data[9..].to_vec()).ok()?,
        })
    }
}

/// Craft share, both directions:
/// `[u8 craft type][u32 name length][name][craft bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CraftPayload {
    pub craft_type: u8,
    pub name: String,
    pub bytes: Vec<u8>,
}

impl CraftPayload {
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut data = Vec::with_capacity(5 + name.len() + self.bytes.len());
        data.push(self.craft_type);
        data.extend_from_slice(&(name.len() as u32).to_le_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(&self.bytes);
        data
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() <= 5 {
            return None;
        }
        let name_len = read_u32(data, 1)? as usize;
        if name_len >= data.len() - 5 {
            return None;
        }
        let name = String::from_utf8(data[5..5 + name_len].to_vec()).ok()?;
        Some(Self {
            craft_type: data[0],
            name,
            bytes: data[5 + name_len..].to_vec(),
        })
    }
}

/// A shared screenshot: `[i32 index][image bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub index: i32,
    pub image: Vec<u8>,
}

impl Screenshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.image.len());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(&self.image);
        data
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        Some(Self {
            index: read_i32(data, 0)?,
            image: data.get(4..)?.to_vec(),
        })
    }
}
