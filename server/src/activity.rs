//! Activity levels and the adaptive broadcast policy.
//!
//! Broadcast frequency scales down as more clients actively fly (full update
//! weight each) versus merely being present (partial weight), keeping the
//! aggregate outbound bandwidth roughly constant.

use crate::config::ServerConfig;

/// Idle time after which a session drops one activity level.
pub const ACTIVITY_RESET_DELAY_MS: u64 = 10_000;

/// Update-traffic weight of a client that is in-game but not in-flight.
pub const NOT_IN_FLIGHT_UPDATE_WEIGHT: f32 = 1.0 / 4.0;

/// Coarse classification of a session's engagement.
///
/// Explicit client signals only raise or refresh the level; only idle
/// timeouts lower it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityLevel {
    #[default]
    Inactive,
    InGame,
    InFlight,
}

impl std::fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityLevel::Inactive => write!(f, "INACTIVE"),
            ActivityLevel::InGame => write!(f, "IN_GAME"),
            ActivityLevel::InFlight => write!(f, "IN_FLIGHT"),
        }
    }
}

/// Server-wide tallies over ready sessions. In-flight sessions count toward
/// both fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityCounts {
    pub in_game: usize,
    pub in_flight: usize,
}

impl ActivityCounts {
    /// Weighted count of clients contributing update traffic.
    fn relevant_players(&self) -> f32 {
        let in_game_only = self.in_game.saturating_sub(self.in_flight);
        self.in_flight as f32 + in_game_only as f32 * NOT_IN_FLIGHT_UPDATE_WEIGHT
    }
}

/// Target interval between a client's world-state updates, in milliseconds.
pub fn update_interval_ms(counts: ActivityCounts, config: &ServerConfig) -> u32 {
    let relevant = counts.relevant_players();
    if relevant <= 0.0 {
        return config.min_update_interval_ms;
    }

    let interval = (1.0 / (config.updates_per_second / relevant) * 1000.0).round() as u32;
    interval.clamp(config.min_update_interval_ms, config.max_update_interval_ms)
}

/// How many non-piloted vessels each client may simulate and report.
pub fn inactive_ships_per_client(counts: ActivityCounts, config: &ServerConfig) -> u8 {
    let in_flight = counts.in_flight;
    if in_flight == 0 {
        return config.total_inactive_ships;
    }
    if in_flight > config.total_inactive_ships as usize {
        return 0;
    }
    config.total_inactive_ships / in_flight as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig {
            updates_per_second: 60.0,
            min_update_interval_ms: 250,
            max_update_interval_ms: 5000,
            total_inactive_ships: 20,
            ..ServerConfig::default()
        }
    }

    fn counts(in_game: usize, in_flight: usize) -> ActivityCounts {
        ActivityCounts { in_game, in_flight }
    }

    #[test]
    fn empty_server_uses_minimum_interval() {
        let config = config();
        assert_eq!(update_interval_ms(counts(0, 0), &config), 250);
    }

    #[test]
    fn interval_is_monotone_in_player_weight() {
        let config = config();
        let mut previous = 0;
        for in_flight in 0..100 {
            let interval = update_interval_ms(counts(in_flight, in_flight), &config);
            assert!(interval >= previous, "interval dipped at {} players", in_flight);
            assert!((250..=5000).contains(&interval));
            previous = interval;
        }
    }

    #[test]
    fn in_game_players_cost_a_quarter_of_in_flight() {
        let config = config();
        // 4 idle in-game players weigh the same as 1 in-flight player.
        assert_eq!(
            update_interval_ms(counts(4, 0), &config),
            update_interval_ms(counts(1, 1), &config)
        );
    }

    #[test]
    fn interval_clamps_at_maximum() {
        let config = config();
        assert_eq!(update_interval_ms(counts(1000, 1000), &config), 5000);
    }

    #[test]
    fn interval_matches_updates_per_second_target() {
        let config = config();
        // 30 in-flight players at 60 updates/sec -> 500 ms between updates each.
        assert_eq!(update_interval_ms(counts(30, 30), &config), 500);
    }

    #[test]
    fn ship_quota_divides_budget_among_pilots() {
        let config = config();
        assert_eq!(inactive_ships_per_client(counts(0, 0), &config), 20);
        assert_eq!(inactive_ships_per_client(counts(4, 4), &config), 5);
        assert_eq!(inactive_ships_per_client(counts(7, 7), &config), 2);
        assert_eq!(inactive_ships_per_client(counts(21, 21), &config), 0);
    }

    #[test]
    fn activity_levels_order_by_engagement() {
        assert!(ActivityLevel::Inactive < ActivityLevel::InGame);
        assert!(ActivityLevel::InGame < ActivityLevel::InFlight);
        assert_eq!(ActivityLevel::default(), ActivityLevel::Inactive);
    }
}
