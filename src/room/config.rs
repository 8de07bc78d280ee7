//! Tunables for a room session.
//!
//! The numeric defaults are the values the web client shipped with. None of
//! them are load-bearing; every window can be overridden per deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::RoomError;

/// Per-room timing and sizing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomConfig {
    /// How often the local presence record is re-announced, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Quiescence window after which a remote typing latch clears itself.
    #[serde(default = "default_typing_expiry")]
    pub typing_expiry_ms: u64,
    /// Silence after the last local keystroke before `false` is broadcast.
    #[serde(default = "default_local_typing_pause")]
    pub local_typing_pause_ms: u64,
    /// Minimum spacing between two remote mark-read calls.
    #[serde(default = "default_mark_read_cooldown")]
    pub mark_read_cooldown_ms: u64,
    /// Distance from the bottom of the list, in pixels, still counted as "at bottom".
    #[serde(default = "default_bottom_threshold")]
    pub bottom_threshold_px: f64,
    /// Number of most recent room watermarks fetched for the seen-by list.
    #[serde(default = "default_seen_by_limit")]
    pub seen_by_limit: usize,
    /// Number of readers shown before the rest collapse into an overflow count.
    #[serde(default = "default_seen_by_faces")]
    pub seen_by_faces: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            typing_expiry_ms: default_typing_expiry(),
            local_typing_pause_ms: default_local_typing_pause(),
            mark_read_cooldown_ms: default_mark_read_cooldown(),
            bottom_threshold_px: default_bottom_threshold(),
            seen_by_limit: default_seen_by_limit(),
            seen_by_faces: default_seen_by_faces(),
        }
    }
}

impl RoomConfig {
    /// Parse a (possibly partial) JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, RoomError> {
        let config: RoomConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RoomError> {
        let windows = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("typing_expiry_ms", self.typing_expiry_ms),
            ("local_typing_pause_ms", self.local_typing_pause_ms),
        ];
        for (name, value) in windows {
            if value == 0 {
                return Err(RoomError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if !self.bottom_threshold_px.is_finite() || self.bottom_threshold_px < 0.0 {
            return Err(RoomError::InvalidConfig(
                "bottom_threshold_px must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn local_typing_pause(&self) -> Duration {
        Duration::from_millis(self.local_typing_pause_ms)
    }

    pub fn mark_read_cooldown(&self) -> Duration {
        Duration::from_millis(self.mark_read_cooldown_ms)
    }
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_typing_expiry() -> u64 {
    3_000
}

fn default_local_typing_pause() -> u64 {
    3_000
}

fn default_mark_read_cooldown() -> u64 {
    3_000
}

fn default_bottom_threshold() -> f64 {
    72.0
}

fn default_seen_by_limit() -> usize {
    20
}

fn default_seen_by_faces() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = RoomConfig::from_json_str(r#"{ "mark_read_cooldown_ms": 250 }"#).unwrap();
        assert_eq!(config.mark_read_cooldown(), Duration::from_millis(250));
        assert_eq!(config.typing_expiry(), Duration::from_millis(3_000));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.bottom_threshold_px, 72.0);
    }

    #[test]
    fn zero_typing_expiry_is_rejected() {
        let err = RoomConfig::from_json_str(r#"{ "typing_expiry_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, RoomError::InvalidConfig(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = RoomConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, RoomError::ConfigParse(_)));
    }

    #[test]
    fn zero_cooldown_is_allowed() {
        let config = RoomConfig {
            mark_read_cooldown_ms: 0,
            ..RoomConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
