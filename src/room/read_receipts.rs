//! Read tracking for a room.
//!
//! The watermark ("read up to") lives in the remote store. The coordinator
//! keeps an advisory copy, decides when scrolling means "read", and places the
//! "new messages" divider from the copy plus the rendered message list.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use ts_rs::TS;

use super::{
    MemberId, RoomId,
    config::RoomConfig,
    error::lock,
};
use crate::backend::ReadReceiptStore;

/// How far one member has read in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReadWatermark {
    pub room_id: RoomId,
    pub member_id: MemberId,
    pub last_read_at: DateTime<Utc>,
}

/// What the unread boundary needs from a rendered chat message.
pub trait MessageLike {
    fn created_at(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStamp {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl MessageStamp {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }
}

impl MessageLike for MessageStamp {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Index of the first message created strictly after `last_read_at`.
///
/// A message stamped exactly at the watermark counts as read. Without a
/// watermark nothing is marked unread.
pub fn compute_first_unread_index<M: MessageLike>(
    messages: &[M],
    last_read_at: Option<DateTime<Utc>>,
) -> Option<usize> {
    let last_read_at = last_read_at?;
    messages.iter().position(|m| m.created_at() > last_read_at)
}

/// Number of messages created strictly after `last_read_at`; zero without a watermark.
pub fn unread_count<M: MessageLike>(messages: &[M], last_read_at: Option<DateTime<Utc>>) -> usize {
    match last_read_at {
        Some(last_read_at) => messages
            .iter()
            .filter(|m| m.created_at() > last_read_at)
            .count(),
        None => 0,
    }
}

/// Scroll metrics of the message list container, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollPosition {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    pub fn is_at_bottom(&self, threshold_px: f64) -> bool {
        self.distance_from_bottom() <= threshold_px
    }
}

/// Other members' watermarks for the "seen by" strip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeenBy {
    /// Shown readers, newest first.
    pub readers: Vec<ReadWatermark>,
    /// Readers not shown.
    pub overflow: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadOutcome {
    NotAtBottom,
    /// A previous call has not completed yet.
    InFlight,
    /// Inside the cool-down window of the previous call.
    Throttled,
    Marked(DateTime<Utc>),
    /// The remote call failed; nothing is retried until the next qualifying scroll.
    Failed,
    Disposed,
}

#[derive(Debug, Default)]
struct ReceiptState {
    last_read_at: Option<DateTime<Utc>>,
    pending_mark_read: bool,
    last_mark_issued: Option<Instant>,
    room_reads: Vec<ReadWatermark>,
    disposed: bool,
}

#[derive(Debug)]
pub struct ReadReceiptCoordinator {
    store: Arc<dyn ReadReceiptStore>,
    room_id: RoomId,
    member_id: MemberId,
    cooldown: Duration,
    bottom_threshold_px: f64,
    seen_by_limit: usize,
    seen_by_faces: usize,
    state: Mutex<ReceiptState>,
}

impl ReadReceiptCoordinator {
    pub fn new(
        store: Arc<dyn ReadReceiptStore>,
        room_id: RoomId,
        member_id: MemberId,
        config: &RoomConfig,
    ) -> Self {
        Self {
            store,
            room_id,
            member_id,
            cooldown: config.mark_read_cooldown(),
            bottom_threshold_px: config.bottom_threshold_px,
            seen_by_limit: config.seen_by_limit,
            seen_by_faces: config.seen_by_faces,
            state: Mutex::new(ReceiptState::default()),
        }
    }

    /// Refreshes the cached watermark from the store.
    ///
    /// On failure the previous value stays. The cache never moves backwards:
    /// a read-back that has not yet caught up with our own write is ignored.
    pub async fn load_watermark(&self) -> Option<DateTime<Utc>> {
        let fetched = self.store.fetch_watermark(&self.room_id, &self.member_id).await;
        let mut state = lock(&self.state);
        match fetched {
            _ if state.disposed => {}
            Ok(remote) => {
                state.last_read_at = state.last_read_at.max(remote);
            }
            Err(e) => {
                tracing::debug!(room_id = %self.room_id, member_id = %self.member_id, error = %e, "Keeping cached watermark");
            }
        }
        state.last_read_at
    }

    /// Refreshes the room's most recent watermarks (the seen-by source).
    pub async fn load_room_reads(&self) {
        let fetched = self
            .store
            .fetch_room_reads(&self.room_id, self.seen_by_limit)
            .await;
        let mut state = lock(&self.state);
        match fetched {
            _ if state.disposed => {}
            Ok(reads) => state.room_reads = reads,
            Err(e) => {
                tracing::debug!(room_id = %self.room_id, error = %e, "Keeping cached room reads");
            }
        }
    }

    /// Room entry: reload both the own watermark and the room's reads.
    pub async fn refresh(&self) {
        tokio::join!(self.load_watermark(), self.load_room_reads());
    }

    pub fn last_read_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).last_read_at
    }

    pub fn is_mark_read_pending(&self) -> bool {
        lock(&self.state).pending_mark_read
    }

    pub fn first_unread_index<M: MessageLike>(&self, messages: &[M]) -> Option<usize> {
        compute_first_unread_index(messages, self.last_read_at())
    }

    pub fn unread_count<M: MessageLike>(&self, messages: &[M]) -> usize {
        unread_count(messages, self.last_read_at())
    }

    /// Everyone but the local member, capped at the configured number of faces.
    pub fn seen_by(&self) -> SeenBy {
        let state = lock(&self.state);
        let others: Vec<&ReadWatermark> = state
            .room_reads
            .iter()
            .filter(|read| read.member_id != self.member_id)
            .collect();
        let shown = others.len().min(self.seen_by_faces);
        SeenBy {
            readers: others[..shown].iter().map(|read| (*read).clone()).collect(),
            overflow: others.len() - shown,
        }
    }

    pub async fn notify_scroll(&self, position: ScrollPosition) -> MarkReadOutcome {
        self.mark_read_if_at_bottom(position.is_at_bottom(self.bottom_threshold_px))
            .await
    }

    /// Marks the room read remotely when the viewer sits at the bottom.
    ///
    /// At most one call per cool-down window, counted from when the previous
    /// call was issued, and never two in flight. Failures are swallowed.
    pub async fn mark_read_if_at_bottom(&self, viewport_is_at_bottom: bool) -> MarkReadOutcome {
        if !viewport_is_at_bottom {
            return MarkReadOutcome::NotAtBottom;
        }

        {
            let mut state = lock(&self.state);
            if state.disposed {
                return MarkReadOutcome::Disposed;
            }
            if state.pending_mark_read {
                return MarkReadOutcome::InFlight;
            }
            if let Some(issued) = state.last_mark_issued {
                if issued.elapsed() < self.cooldown {
                    tracing::trace!(room_id = %self.room_id, "Mark-read throttled");
                    return MarkReadOutcome::Throttled;
                }
            }
            state.pending_mark_read = true;
            state.last_mark_issued = Some(Instant::now());
        }

        tracing::debug!(room_id = %self.room_id, member_id = %self.member_id, "Marking room read");
        let result = self.store.mark_read(&self.room_id, &self.member_id).await;

        let marked_at = {
            let mut state = lock(&self.state);
            state.pending_mark_read = false;
            if state.disposed {
                return MarkReadOutcome::Disposed;
            }
            match result {
                Ok(echoed) => {
                    let at = echoed.unwrap_or_else(Utc::now);
                    state.last_read_at = state.last_read_at.max(Some(at));
                    at
                }
                Err(e) => {
                    tracing::warn!(room_id = %self.room_id, member_id = %self.member_id, error = %e, "Mark-read failed");
                    return MarkReadOutcome::Failed;
                }
            }
        };

        self.load_room_reads().await;
        MarkReadOutcome::Marked(marked_at)
    }

    /// Late completions after this are dropped.
    pub fn dispose(&self) {
        lock(&self.state).disposed = true;
    }
}
