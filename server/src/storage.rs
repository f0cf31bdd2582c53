//! Flat-file persistence: the ban list and optionally saved screenshots.
//!
//! All failures here are logged and swallowed; persistence is never allowed
//! to take the relay down.

use log::warn;
use shared::filtered_file_name;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Loads the line-delimited ban list. A missing or unreadable file means an
/// empty list; unparseable lines are skipped.
pub fn load_ban_list(path: &Path) -> HashSet<IpAddr> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return HashSet::new();
    };
    text.lines().filter_map(|line| line.trim().parse().ok()).collect()
}

pub fn save_ban_list(path: &Path, banned: &HashSet<IpAddr>) {
    let mut text = String::new();
    for ip in banned {
        text.push_str(&ip.to_string());
        text.push('\n');
    }
    if let Err(e) = std::fs::write(path, text) {
        warn!("Could not save ban list to {}: {}", path.display(), e);
    }
}

/// Writes a shared screenshot under `<dir>/<username>/<millis>.png`. The
/// username is stripped of path characters before it becomes a directory.
pub fn store_screenshot(dir: &Path, username: &str, image: &[u8]) {
    let player_dir = dir.join(filtered_file_name(username));
    if let Err(e) = std::fs::create_dir_all(&player_dir) {
        warn!("Could not create screenshot directory {}: {}", player_dir.display(), e);
        return;
    }

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let file = player_dir.join(format!("{}.png", stamp));
    if let Err(e) = std::fs::write(&file, image) {
        warn!("Could not save screenshot {}: {}", file.display(), e);
    }
}
