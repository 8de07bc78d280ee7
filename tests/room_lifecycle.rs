use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chat_presence::{
    ConnectionState, MarkReadOutcome, MemberId, RoomConfig, RoomSession, SessionManager,
    backend::memory::{MemoryReadStore, MemoryTransport},
    room::{
        message::{ChannelEvent, presence_topic},
        read_receipts::MessageStamp,
    },
};
use chrono::{DateTime, Utc};
use serde_json::json;

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

fn members(ids: &[&str]) -> HashSet<MemberId> {
    ids.iter().copied().map(MemberId::from).collect()
}

async fn join(
    transport: &MemoryTransport,
    store: &Arc<MemoryReadStore>,
    member: &str,
) -> RoomSession {
    let session = RoomSession::open(
        transport,
        store.clone(),
        "general".into(),
        member.into(),
        Some(member.to_uppercase()),
        &RoomConfig::default(),
    )
    .await
    .unwrap();
    settle().await;
    session
}

#[tokio::test(start_paused = true)]
async fn members_come_and_go() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    assert_eq!(a.online_members(), members(&["a"]));

    let b = join(&transport, &store, "b").await;
    assert_eq!(a.online_members(), members(&["a", "b"]));
    assert_eq!(b.online_members(), members(&["a", "b"]));

    b.close().await;
    settle().await;
    assert_eq!(a.online_members(), members(&["a"]));
    assert!(b.online_members().is_empty());

    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn roster_carries_nicknames() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    let _b = join(&transport, &store, "b").await;

    let roster = a.roster();
    assert_eq!(roster.len(), 2);
    let b = roster.iter().find(|m| m.member_id.as_str() == "b").unwrap();
    assert_eq!(b.nickname.as_deref(), Some("B"));
}

#[tokio::test(start_paused = true)]
async fn typing_reaches_others_but_not_self() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    let b = join(&transport, &store, "b").await;

    b.set_local_typing(true).await;
    settle().await;
    assert_eq!(a.typing_members(), members(&["b"]));
    assert!(b.typing_members().is_empty());

    advance(2_999).await;
    assert_eq!(a.typing_members(), members(&["b"]));
    advance(2).await;
    assert!(a.typing_members().is_empty());
}

#[tokio::test(start_paused = true)]
async fn keystrokes_are_debounced_into_one_burst() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());
    let mut feed = transport.listen(&presence_topic(&"general".into()));

    let a = join(&transport, &store, "a").await;
    let b = join(&transport, &store, "b").await;

    for _ in 0..5 {
        b.keystroke().await;
        advance(500).await;
    }
    assert_eq!(a.typing_members(), members(&["b"]));

    b.stop_typing().await;
    settle().await;
    assert!(a.typing_members().is_empty());

    let mut latches = Vec::new();
    while let Ok(event) = feed.try_recv() {
        if let ChannelEvent::Broadcast { payload, .. } = event {
            latches.push(payload["isTyping"].as_bool().unwrap());
        }
    }
    assert_eq!(latches, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn closed_session_ignores_late_events() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());
    let topic = presence_topic(&"general".into());

    let a = join(&transport, &store, "a").await;
    a.close().await;
    a.close().await;
    assert!(a.is_closed());
    assert_eq!(*a.connection_state().borrow(), ConnectionState::Closed);

    transport.inject(&topic, ChannelEvent::Sync(json!({ "z": [{ "at": 0 }] })));
    transport.inject(
        &topic,
        ChannelEvent::Broadcast {
            event: "typing".to_string(),
            payload: json!({ "memberId": "z", "isTyping": true }),
        },
    );
    settle().await;

    assert!(a.online_members().is_empty());
    assert!(a.typing_members().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_subscription_can_be_retried() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    transport.fail_next_subscribes(1);
    let c = join(&transport, &store, "c").await;

    assert_eq!(
        *c.connection_state().borrow(),
        ConnectionState::Errored { retries: 1 }
    );
    assert_eq!(a.online_members(), members(&["a"]));

    assert_eq!(c.reconnect().await, ConnectionState::Subscribed);
    settle().await;
    assert_eq!(a.online_members(), members(&["a", "c"]));
    assert_eq!(c.online_members(), members(&["a", "c"]));
}

#[tokio::test(start_paused = true)]
async fn read_state_follows_the_watermark() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());
    let read_at: DateTime<Utc> = Utc::now() - chrono::Duration::minutes(5);
    store.set_watermark(&"general".into(), &"a".into(), read_at);

    let a = join(&transport, &store, "a").await;
    assert_eq!(a.last_read_at(), Some(read_at));

    let messages = vec![
        MessageStamp::new("m1", read_at - chrono::Duration::seconds(10)),
        MessageStamp::new("m2", read_at),
        MessageStamp::new("m3", read_at + chrono::Duration::seconds(10)),
        MessageStamp::new("m4", read_at + chrono::Duration::seconds(20)),
    ];
    assert_eq!(a.first_unread_index(&messages), Some(2));
    assert_eq!(a.unread_count(&messages), 2);

    assert_eq!(a.notify_scroll_position(false).await, MarkReadOutcome::NotAtBottom);
    let MarkReadOutcome::Marked(marked_at) = a.notify_scroll_position(true).await else {
        panic!("expected the room to be marked read");
    };
    assert!(marked_at > read_at);
    assert_eq!(a.first_unread_index(&messages), None);
    assert_eq!(a.unread_count(&messages), 0);

    assert_eq!(a.notify_scroll_position(true).await, MarkReadOutcome::Throttled);
    advance(3_000).await;
    assert!(matches!(
        a.notify_scroll_position(true).await,
        MarkReadOutcome::Marked(_)
    ));
    assert_eq!(store.mark_read_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn seen_by_lists_other_readers() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    let b = join(&transport, &store, "b").await;

    assert!(matches!(
        a.notify_scroll_position(true).await,
        MarkReadOutcome::Marked(_)
    ));
    assert!(a.seen_by().readers.is_empty());

    b.refresh_read_state().await;
    let seen = b.seen_by();
    assert_eq!(seen.readers.len(), 1);
    assert_eq!(seen.readers[0].member_id.as_str(), "a");
    assert_eq!(seen.overflow, 0);
}

#[tokio::test(start_paused = true)]
async fn manager_keeps_one_room_open() {
    let transport = Arc::new(MemoryTransport::new());
    let store = Arc::new(MemoryReadStore::new());
    let manager = SessionManager::new(
        transport.clone(),
        store.clone(),
        "a".into(),
        None,
        RoomConfig::default(),
    )
    .unwrap();

    let observer = join(&transport, &store, "o").await;

    let general = manager.enter("general".into()).await.unwrap();
    settle().await;
    assert_eq!(observer.online_members(), members(&["a", "o"]));

    let random = manager.enter("random".into()).await.unwrap();
    settle().await;
    assert!(general.is_closed());
    assert_eq!(observer.online_members(), members(&["o"]));
    assert_eq!(random.online_members(), members(&["a"]));

    manager.leave().await;
    assert!(random.is_closed());
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_keeps_state_until_the_next_snapshot() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    let b = join(&transport, &store, "b").await;
    b.set_local_typing(true).await;
    settle().await;

    transport.disconnect(&presence_topic(&"general".into()));
    settle().await;
    assert_eq!(
        *a.connection_state().borrow(),
        ConnectionState::Errored { retries: 0 }
    );
    assert_eq!(a.online_members(), members(&["a", "b"]));
    assert_eq!(a.typing_members(), members(&["b"]));

    assert_eq!(a.reconnect().await, ConnectionState::Subscribed);
    settle().await;
    assert_eq!(a.online_members(), members(&["a"]));

    assert_eq!(b.reconnect().await, ConnectionState::Subscribed);
    settle().await;
    assert_eq!(a.online_members(), members(&["a", "b"]));
}

#[tokio::test(start_paused = true)]
async fn typing_recovers_after_a_refused_start() {
    let transport = MemoryTransport::new();
    let store = Arc::new(MemoryReadStore::new());

    let a = join(&transport, &store, "a").await;
    transport.fail_next_subscribes(1);
    let b = join(&transport, &store, "b").await;

    // Not subscribed: the `true` latch cannot go out.
    b.keystroke().await;
    assert_eq!(b.reconnect().await, ConnectionState::Subscribed);

    let mut seen_typing = false;
    for _ in 0..4 {
        b.keystroke().await;
        advance(500).await;
        seen_typing |= a.typing_members().contains("b");
    }
    assert!(seen_typing);
}
