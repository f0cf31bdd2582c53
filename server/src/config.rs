//! Server configuration: a single immutable settings object built from
//! defaults, an optional JSON file, and command-line overrides.

use serde::{Deserialize, Serialize};
use shared::MAX_CRAFT_FILE_BYTES;
use std::path::{Path, PathBuf};

/// All tunables consumed by the relay core.
///
/// The file representation is JSON with every field optional; missing fields
/// fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listening port.
    pub port: u16,
    /// UDP port for the auxiliary channel; `None` reuses the TCP port.
    pub udp_port: Option<u16>,
    /// Number of pre-allocated session slots.
    pub max_clients: usize,
    /// Target aggregate world-state updates per second across all clients.
    pub updates_per_second: f32,
    pub min_update_interval_ms: u32,
    pub max_update_interval_ms: u32,
    /// Total non-piloted vessels budget divided among in-flight clients.
    pub total_inactive_ships: u8,
    pub screenshot_max_bytes: usize,
    pub screenshot_interval_ms: u32,
    pub screenshot_max_height: u32,
    /// How many of a session's own screenshots are kept for watchers.
    pub screenshot_backlog: usize,
    pub message_flood_limit: u32,
    /// Decay window and throttle cooldown for chat/craft messages.
    pub message_flood_throttle_ms: u64,
    pub screenshot_flood_limit: u32,
    pub screenshot_flood_throttle_ms: u64,
    /// Text sent to every client right after a successful connection.
    pub join_message: String,
    pub save_screenshots: bool,
    pub screenshot_dir: PathBuf,
    pub ban_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 2075,
            udp_port: None,
            max_clients: 32,
            updates_per_second: 60.0,
            min_update_interval_ms: 250,
            max_update_interval_ms: 5000,
            total_inactive_ships: 20,
            screenshot_max_bytes: 80 * 1024,
            screenshot_interval_ms: 3000,
            screenshot_max_height: 600,
            screenshot_backlog: 4,
            message_flood_limit: 10,
            message_flood_throttle_ms: 60_000,
            screenshot_flood_limit: 10,
            screenshot_flood_throttle_ms: 60_000,
            join_message: String::new(),
            save_screenshots: false,
            screenshot_dir: PathBuf::from("screenshots"),
            ban_file: PathBuf::from("banned.txt"),
        }
    }
}

impl ServerConfig {
    /// Loads settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port.unwrap_or(self.port)
    }

    /// Largest frame payload a connection may declare before it is torn down.
    ///
    /// Craft shares are the biggest legitimate message; screenshots come
    /// second. Anything past this is a protocol violation, not real traffic.
    pub fn max_frame_payload(&self) -> usize {
        (MAX_CRAFT_FILE_BYTES + 1024).max(self.screenshot_max_bytes + 1024)
    }
}
