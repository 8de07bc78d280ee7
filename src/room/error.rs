use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(thiserror::Error, Debug)]
pub enum RoomError {
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Failed to send '{event}' on topic '{topic}': {reason}")]
    SendFailed {
        topic: String,
        event: String,
        reason: String,
    },
    #[error("Presence tracking failed: {0}")]
    TrackFailed(String),
    #[error("Remote call '{procedure}' failed: {reason}")]
    RpcFailed { procedure: String, reason: String },
    #[error("Channel for room '{0}' is closed")]
    ChannelClosed(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl RoomError {
    pub fn rpc(procedure: &str, reason: impl ToString) -> Self {
        RoomError::RpcFailed {
            procedure: procedure.to_string(),
            reason: reason.to_string(),
        }
    }
}

// State guarded here is plain data with no cross-field invariants that a
// panicking writer could break, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
