use std::sync::Arc;
use std::time::Duration;

use chat_presence::{
    RoomConfig, RoomSession,
    backend::memory::{MemoryReadStore, MemoryTransport},
    room::read_receipts::MessageStamp,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = RoomConfig::from_json_str(r#"{ "typing_expiry_ms": 1500 }"#)?;
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());
    let room = "general";

    let alice = RoomSession::open(
        &transport,
        store.clone(),
        room.into(),
        "alice".into(),
        Some("Alice".to_string()),
        &config,
    )
    .await?;
    let bob = RoomSession::open(
        &transport,
        store.clone(),
        room.into(),
        "bob".into(),
        Some("Bob".to_string()),
        &config,
    )
    .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for member in alice.roster() {
        tracing::info!(member_id = %member.member_id, nickname = ?member.nickname, "Online");
    }

    bob.keystroke().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(typing = ?alice.typing_members(), "Alice sees");

    tokio::time::sleep(config.local_typing_pause()).await;
    tracing::info!(typing = ?alice.typing_members(), "After Bob paused");

    let outcome = alice.notify_scroll_position(true).await;
    tracing::info!(?outcome, "Alice scrolled to the bottom");

    let messages = vec![
        MessageStamp::new("m1", chrono::Utc::now() - chrono::Duration::seconds(30)),
        MessageStamp::new("m2", chrono::Utc::now() + chrono::Duration::seconds(1)),
    ];
    tracing::info!(
        first_unread = ?alice.first_unread_index(&messages),
        unread = alice.unread_count(&messages),
        "Unread divider"
    );

    bob.refresh_read_state().await;
    let seen = bob.seen_by();
    tracing::info!(readers = seen.readers.len(), overflow = seen.overflow, "Bob's seen-by strip");

    bob.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    tracing::info!(online = ?alice.online_members(), "After Bob left");

    alice.close().await;
    Ok(())
}
