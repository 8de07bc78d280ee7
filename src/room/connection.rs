use serde::{Deserialize, Serialize};
use ts_rs::TS;

// --- FSM Types ---

/// Subscription state of a room's presence channel, as seen by the UI.
///
/// A failed subscription parks the channel in `Errored`; the caller retries by
/// calling `connect` again. Nothing derived from the channel is reset by a
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Subscribing { attempt: u32 },
    Subscribed,
    Errored { retries: u32 },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Subscribe,
    Success,
    Failure,
    Close,
}

// --- FSM Implementation ---

impl ConnectionState {
    pub fn on_event(self, event: ConnectionEvent) -> ConnectionState {
        match (self, event) {
            (ConnectionState::Closed, _) => ConnectionState::Closed,
            (_, ConnectionEvent::Close) => ConnectionState::Closed,

            (ConnectionState::Idle, ConnectionEvent::Subscribe) => {
                ConnectionState::Subscribing { attempt: 1 }
            }
            (ConnectionState::Errored { retries }, ConnectionEvent::Subscribe) => {
                ConnectionState::Subscribing {
                    attempt: retries + 1,
                }
            }

            (ConnectionState::Subscribing { .. }, ConnectionEvent::Success) => {
                ConnectionState::Subscribed
            }
            (ConnectionState::Subscribing { attempt }, ConnectionEvent::Failure) => {
                ConnectionState::Errored { retries: attempt }
            }

            // A subscribed channel that reports a failure (e.g. transport drop)
            // becomes eligible for a retry.
            (ConnectionState::Subscribed, ConnectionEvent::Failure) => {
                ConnectionState::Errored { retries: 0 }
            }

            // Default: remain in current state
            (state, _) => state,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self, ConnectionState::Subscribed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Whether `connect` would start a new attempt from this state.
    pub fn can_subscribe(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Errored { .. })
    }
}
