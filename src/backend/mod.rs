//! Collaborators the presence engine talks to.
//!
//! Everything remote is injected: a session is built from a [`Transport`] and a
//! [`ReadReceiptStore`] handed in by the caller, never from a process-wide
//! client. Tests and the demo binary use the in-process fakes in [`memory`].

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::room::{
    MemberId, RoomId,
    error::RoomError,
    message::{ChannelEvent, PresenceMeta},
    read_receipts::ReadWatermark,
};

/// Realtime publish/subscribe service.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Creates an unsubscribed handle for `topic`, keying presence records by
    /// `presence_key`.
    fn channel(&self, topic: &str, presence_key: &MemberId) -> Arc<dyn ChannelHandle>;
}

/// One client's binding to a topic.
#[async_trait]
pub trait ChannelHandle: Send + Sync + std::fmt::Debug {
    fn topic(&self) -> &str;

    /// New receiver for `sync` and broadcast events. Receivers created before
    /// `subscribe` see the snapshot published on subscription.
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn subscribe(&self) -> Result<(), RoomError>;

    /// Publishes (or replaces) this connection's presence record.
    async fn track(&self, meta: &PresenceMeta) -> Result<(), RoomError>;

    async fn untrack(&self) -> Result<(), RoomError>;

    async fn send(&self, event: &str, payload: Value) -> Result<(), RoomError>;

    async fn unsubscribe(&self) -> Result<(), RoomError>;
}

/// Remote procedures backing per-member read watermarks.
#[async_trait]
pub trait ReadReceiptStore: Send + Sync + std::fmt::Debug {
    async fn fetch_watermark(
        &self,
        room_id: &RoomId,
        member_id: &MemberId,
    ) -> Result<Option<DateTime<Utc>>, RoomError>;

    /// Records "read up to now". Returns the server's recorded time when the
    /// procedure echoes it.
    async fn mark_read(
        &self,
        room_id: &RoomId,
        member_id: &MemberId,
    ) -> Result<Option<DateTime<Utc>>, RoomError>;

    /// Most recent watermarks in the room, newest first.
    async fn fetch_room_reads(
        &self,
        room_id: &RoomId,
        limit: usize,
    ) -> Result<Vec<ReadWatermark>, RoomError>;
}
