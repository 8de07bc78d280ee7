//! Presence, typing indicators and read receipts for chat rooms.
//!
//! A [`RoomSession`] ties one room's realtime presence channel to the trackers
//! the UI reads from: who is online, who is typing, and where the unread
//! divider sits. [`SessionManager`] keeps a single room open at a time.
//!
//! Remote collaborators are injected through the traits in [`backend`].

pub mod backend;
pub mod room;

pub use backend::{ChannelHandle, ReadReceiptStore, Transport};
pub use room::{
    MemberId, RoomId, RoomSession,
    config::RoomConfig,
    connection::ConnectionState,
    error::RoomError,
    manager::SessionManager,
    read_receipts::{MarkReadOutcome, MessageLike, ScrollPosition, SeenBy},
};
