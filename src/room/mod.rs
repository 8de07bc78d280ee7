pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod message;
pub mod presence;
pub mod read_receipts;
pub mod subscription;

use std::{
    borrow::Borrow,
    collections::HashSet,
    fmt::{self, Display},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use ts_rs::TS;

use crate::backend::{ReadReceiptStore, Transport};
use channel::PresenceChannel;
use config::RoomConfig;
use connection::ConnectionState;
use error::RoomError;
use message::{PresenceMeta, TypingEvent};
use presence::{
    OnlineMember, PresenceSnapshot, PresenceTracker,
    typing::{LocalTyping, TypingTracker},
};
use read_receipts::{MarkReadOutcome, MessageLike, ReadReceiptCoordinator, ScrollPosition, SeenBy};

// --- Identifiers ---

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
        #[ts(export)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// A member's identity within one room, stable for the session.
    MemberId
);
string_id!(RoomId);

// --- Room session ---

/// Everything the UI needs about one open room: who is online, who is
/// typing, and where the unread divider goes.
///
/// Built per room entry and closed on leave; nothing is shared across rooms.
#[derive(Debug)]
pub struct RoomSession {
    room_id: RoomId,
    member_id: MemberId,
    channel: Arc<PresenceChannel>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingTracker>,
    local_typing: LocalTyping,
    receipts: ReadReceiptCoordinator,
    closed: AtomicBool,
}

impl RoomSession {
    /// Opens the room: binds the presence channel, wires the trackers to it,
    /// subscribes, announces the local member and loads the read watermark.
    ///
    /// Only configuration errors fail; connectivity problems show up in
    /// [`connection_state`](Self::connection_state) and can be retried with
    /// [`reconnect`](Self::reconnect).
    pub async fn open(
        transport: &dyn Transport,
        store: Arc<dyn ReadReceiptStore>,
        room_id: RoomId,
        member_id: MemberId,
        nickname: Option<String>,
        config: &RoomConfig,
    ) -> Result<Self, RoomError> {
        config.validate()?;

        let channel = Arc::new(PresenceChannel::open(
            transport,
            room_id.clone(),
            member_id.clone(),
            config,
        ));
        let presence = Arc::new(PresenceTracker::new(member_id.clone()));
        let typing = Arc::new(TypingTracker::new(member_id.clone(), config.typing_expiry()));

        let snapshot_sink = Arc::clone(&presence);
        channel.on_snapshot(Arc::new(move |snapshot: &PresenceSnapshot| {
            snapshot_sink.on_snapshot(snapshot)
        }));
        let typing_sink = Arc::clone(&typing);
        channel.on_typing(Arc::new(move |event: &TypingEvent| {
            typing_sink.on_typing_event(event)
        }));

        let session = Self {
            local_typing: LocalTyping::new(Arc::clone(&channel), config.local_typing_pause()),
            receipts: ReadReceiptCoordinator::new(store, room_id.clone(), member_id.clone(), config),
            room_id,
            member_id,
            channel,
            presence,
            typing,
            closed: AtomicBool::new(false),
        };

        let state = session.channel.connect().await;
        if let Err(e) = session.channel.announce(PresenceMeta::new(nickname)).await {
            tracing::warn!(room_id = %session.room_id, error = %e, "Presence announcement failed");
        }
        session.receipts.refresh().await;

        tracing::info!(room_id = %session.room_id, member_id = %session.member_id, ?state, "Room session opened");
        Ok(session)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.channel.connection_state()
    }

    /// Retries a failed subscription. Presence and typing state are kept
    /// until the next snapshot arrives.
    pub async fn reconnect(&self) -> ConnectionState {
        self.channel.connect().await
    }

    // --- Presence ---

    pub fn online_members(&self) -> HashSet<MemberId> {
        self.presence.online_members()
    }

    pub fn is_online(&self, member_id: &str) -> bool {
        self.presence.is_online(member_id)
    }

    pub fn roster(&self) -> Vec<OnlineMember> {
        self.presence.roster()
    }

    // --- Typing ---

    pub fn typing_members(&self) -> HashSet<MemberId> {
        self.typing.typing_members()
    }

    /// Broadcasts the local typing latch as-is, without debouncing.
    pub async fn set_local_typing(&self, is_typing: bool) {
        if let Err(e) = self.channel.broadcast_typing(is_typing).await {
            tracing::debug!(room_id = %self.room_id, error = %e, "Typing broadcast dropped");
        }
    }

    /// Debounced typing signal for composer keystrokes.
    pub async fn keystroke(&self) {
        if let Err(e) = self.local_typing.keystroke().await {
            tracing::debug!(room_id = %self.room_id, error = %e, "Typing broadcast dropped");
        }
    }

    /// Ends a typing burst immediately, e.g. after sending.
    pub async fn stop_typing(&self) {
        if let Err(e) = self.local_typing.stop().await {
            tracing::debug!(room_id = %self.room_id, error = %e, "Typing broadcast dropped");
        }
    }

    // --- Read receipts ---

    pub fn first_unread_index<M: MessageLike>(&self, messages: &[M]) -> Option<usize> {
        self.receipts.first_unread_index(messages)
    }

    pub fn unread_count<M: MessageLike>(&self, messages: &[M]) -> usize {
        self.receipts.unread_count(messages)
    }

    pub fn last_read_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.receipts.last_read_at()
    }

    pub fn seen_by(&self) -> SeenBy {
        self.receipts.seen_by()
    }

    pub async fn notify_scroll_position(&self, is_at_bottom: bool) -> MarkReadOutcome {
        self.receipts.mark_read_if_at_bottom(is_at_bottom).await
    }

    pub async fn notify_scroll(&self, position: ScrollPosition) -> MarkReadOutcome {
        self.receipts.notify_scroll(position).await
    }

    /// Reloads the watermark, e.g. after another tab may have moved it.
    pub async fn refresh_read_state(&self) {
        self.receipts.refresh().await;
    }

    // --- Lifecycle ---

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Leaves the room. Timers are cancelled and listeners detached before
    /// the first await; withdrawing presence remotely is best effort.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.local_typing.dispose();
        self.typing.dispose();
        self.presence.dispose();
        self.receipts.dispose();
        self.channel.close().await;
        tracing::info!(room_id = %self.room_id, member_id = %self.member_id, "Room session closed");
    }
}
