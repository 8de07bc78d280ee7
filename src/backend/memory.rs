//! In-process stand-ins for the hosted realtime service and the read-receipt
//! procedures.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ChannelHandle, ReadReceiptStore, Transport};
use crate::room::{
    MemberId, RoomId,
    error::{RoomError, lock},
    message::{ChannelEvent, PresenceMeta},
    read_receipts::ReadWatermark,
};

const DEFAULT_CHANNEL_CAPACITY: usize = 100;

// --- Transport ---

#[derive(Debug)]
struct Topic {
    name: String,
    capacity: usize,
    sender: Mutex<broadcast::Sender<ChannelEvent>>,
    // Bumped on every forced disconnect; subscriptions from older epochs are dead.
    epoch: AtomicU64,
    // member key -> (connection ref, serialized meta)
    presence: Mutex<HashMap<String, Vec<(Uuid, Value)>>>,
}

impl Topic {
    fn state(&self) -> Value {
        let presence = lock(&self.presence);
        let mut state = Map::new();
        for (key, records) in presence.iter() {
            let metas = records
                .iter()
                .map(|(presence_ref, meta)| {
                    let mut meta = meta.clone();
                    if let Value::Object(fields) = &mut meta {
                        fields.insert(
                            "presence_ref".to_string(),
                            Value::String(presence_ref.to_string()),
                        );
                    }
                    meta
                })
                .collect();
            state.insert(key.clone(), Value::Array(metas));
        }
        Value::Object(state)
    }

    fn receiver(&self) -> broadcast::Receiver<ChannelEvent> {
        lock(&self.sender).subscribe()
    }

    fn publish(&self, event: ChannelEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = lock(&self.sender).send(event);
    }

    fn publish_sync(&self) {
        self.publish(ChannelEvent::Sync(self.state()));
    }

    fn remove_record(&self, key: &str, presence_ref: Uuid) -> bool {
        let mut presence = lock(&self.presence);
        let Some(records) = presence.get_mut(key) else {
            return false;
        };
        let before = records.len();
        records.retain(|(record_ref, _)| *record_ref != presence_ref);
        let removed = records.len() != before;
        if records.is_empty() {
            presence.remove(key);
        }
        removed
    }

    /// Ends every live subscription: receivers see the stream close and
    /// presence records are dropped.
    fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.presence).clear();
        let (sender, _) = broadcast::channel(self.capacity);
        *lock(&self.sender) = sender;
    }
}

/// Single-process pub/sub with presence, modelled on a hosted realtime service.
///
/// Broadcasts are delivered to every subscriber of the topic, the sender
/// included.
#[derive(Debug)]
pub struct MemoryTransport {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    capacity: usize,
    failing_subscribes: Arc<AtomicUsize>,
    track_calls: Arc<AtomicUsize>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
            failing_subscribes: Arc::new(AtomicUsize::new(0)),
            track_calls: Arc::new(AtomicUsize::new(0)),
            latency: Arc::new(Mutex::new(None)),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = lock(&self.topics);
        let topic = topics.entry(name.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            Arc::new(Topic {
                name: name.to_string(),
                capacity: self.capacity,
                sender: Mutex::new(sender),
                epoch: AtomicU64::new(0),
                presence: Mutex::new(HashMap::new()),
            })
        });
        Arc::clone(topic)
    }

    /// Makes the next `count` subscription attempts (on any topic) fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Delay applied to `subscribe` and `track`, measured on the tokio clock.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Number of `track` calls made on any channel of this transport.
    pub fn track_calls(&self) -> usize {
        self.track_calls.load(Ordering::SeqCst)
    }

    /// Raw event feed for `topic`, for observers that are not members.
    pub fn listen(&self, topic: &str) -> broadcast::Receiver<ChannelEvent> {
        self.topic(topic).receiver()
    }

    /// Pushes an arbitrary event to every subscriber of `topic`.
    pub fn inject(&self, topic: &str, event: ChannelEvent) {
        self.topic(topic).publish(event);
    }

    /// Current presence state of `topic`, in the shape carried by `sync` events.
    pub fn presence_state(&self, topic: &str) -> Value {
        self.topic(topic).state()
    }

    /// Drops every presence record for `key`, as the service does for idle
    /// connections, and publishes the resulting snapshot.
    pub fn evict(&self, topic: &str, key: &MemberId) {
        let topic = self.topic(topic);
        lock(&topic.presence).remove(key.as_str());
        topic.publish_sync();
    }

    /// Simulates the service dropping every connection to `topic`. Event
    /// streams end and clients must subscribe again.
    pub fn disconnect(&self, topic: &str) {
        self.topic(topic).disconnect();
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn channel(&self, topic: &str, presence_key: &MemberId) -> Arc<dyn ChannelHandle> {
        Arc::new(MemoryChannel {
            topic: self.topic(topic),
            key: presence_key.clone(),
            presence_ref: Uuid::new_v4(),
            subscribed_epoch: Mutex::new(None),
            failing_subscribes: Arc::clone(&self.failing_subscribes),
            track_calls: Arc::clone(&self.track_calls),
            latency: Arc::clone(&self.latency),
        })
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    topic: Arc<Topic>,
    key: MemberId,
    presence_ref: Uuid,
    subscribed_epoch: Mutex<Option<u64>>,
    failing_subscribes: Arc<AtomicUsize>,
    track_calls: Arc<AtomicUsize>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MemoryChannel {
    fn ensure_subscribed(&self) -> Result<(), RoomError> {
        let current = self.topic.epoch.load(Ordering::SeqCst);
        if *lock(&self.subscribed_epoch) == Some(current) {
            Ok(())
        } else {
            Err(RoomError::ChannelClosed(self.topic.name.clone()))
        }
    }

    async fn delay(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic.name
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.topic.receiver()
    }

    async fn subscribe(&self) -> Result<(), RoomError> {
        self.delay().await;
        let injected_failure = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(RoomError::SubscribeFailed {
                topic: self.topic.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        *lock(&self.subscribed_epoch) = Some(self.topic.epoch.load(Ordering::SeqCst));
        self.topic.publish_sync();
        Ok(())
    }

    async fn track(&self, meta: &PresenceMeta) -> Result<(), RoomError> {
        self.track_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.ensure_subscribed()?;
        let meta = serde_json::to_value(meta).map_err(|e| RoomError::TrackFailed(e.to_string()))?;
        {
            let mut presence = lock(&self.topic.presence);
            let records = presence.entry(self.key.as_str().to_string()).or_default();
            records.retain(|(record_ref, _)| *record_ref != self.presence_ref);
            records.push((self.presence_ref, meta));
        }
        self.topic.publish_sync();
        Ok(())
    }

    async fn untrack(&self) -> Result<(), RoomError> {
        if self.topic.remove_record(self.key.as_str(), self.presence_ref) {
            self.topic.publish_sync();
        }
        Ok(())
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), RoomError> {
        self.ensure_subscribed()?;
        self.topic.publish(ChannelEvent::Broadcast {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), RoomError> {
        lock(&self.subscribed_epoch).take();
        if self.topic.remove_record(self.key.as_str(), self.presence_ref) {
            self.topic.publish_sync();
        }
        Ok(())
    }
}

// --- Read receipts ---

/// Watermark table plus the two procedures that read and advance it.
#[derive(Debug, Default)]
pub struct MemoryReadStore {
    watermarks: Mutex<HashMap<(RoomId, MemberId), DateTime<Utc>>>,
    mark_read_calls: AtomicUsize,
    failing_calls: AtomicUsize,
    silent_mark_read: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryReadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a watermark directly, as another session of the member would.
    pub fn set_watermark(&self, room_id: &RoomId, member_id: &MemberId, at: DateTime<Utc>) {
        lock(&self.watermarks).insert((room_id.clone(), member_id.clone()), at);
    }

    pub fn watermark(&self, room_id: &RoomId, member_id: &MemberId) -> Option<DateTime<Utc>> {
        lock(&self.watermarks)
            .get(&(room_id.clone(), member_id.clone()))
            .copied()
    }

    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }

    /// Makes the next `count` procedure calls fail.
    pub fn fail_next_calls(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// When set, `mark_read` records the watermark but echoes nothing back.
    pub fn set_silent_mark_read(&self, silent: bool) {
        self.silent_mark_read.store(silent, Ordering::SeqCst);
    }

    /// Delay applied to every call, measured on the tokio clock.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    async fn round_trip(&self, procedure: &str) -> Result<(), RoomError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let injected_failure = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(RoomError::rpc(procedure, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadReceiptStore for MemoryReadStore {
    async fn fetch_watermark(
        &self,
        room_id: &RoomId,
        member_id: &MemberId,
    ) -> Result<Option<DateTime<Utc>>, RoomError> {
        self.round_trip("get_last_read").await?;
        Ok(self.watermark(room_id, member_id))
    }

    async fn mark_read(
        &self,
        room_id: &RoomId,
        member_id: &MemberId,
    ) -> Result<Option<DateTime<Utc>>, RoomError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip("mark_room_read").await?;
        let now = Utc::now();
        self.set_watermark(room_id, member_id, now);
        if self.silent_mark_read.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(now))
        }
    }

    async fn fetch_room_reads(
        &self,
        room_id: &RoomId,
        limit: usize,
    ) -> Result<Vec<ReadWatermark>, RoomError> {
        self.round_trip("chat_reads").await?;
        let mut reads: Vec<ReadWatermark> = lock(&self.watermarks)
            .iter()
            .filter(|((room, _), _)| room == room_id)
            .map(|((room, member), at)| ReadWatermark {
                room_id: room.clone(),
                member_id: member.clone(),
                last_read_at: *at,
            })
            .collect();
        reads.sort_by(|a, b| b.last_read_at.cmp(&a.last_read_at));
        reads.truncate(limit);
        Ok(reads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn track_publishes_one_record_per_connection() {
        let transport = MemoryTransport::new();
        let alice: MemberId = "alice".into();
        let tab_one = transport.channel("t", &alice);
        let tab_two = transport.channel("t", &alice);
        tab_one.subscribe().await.unwrap();
        tab_two.subscribe().await.unwrap();

        tab_one.track(&PresenceMeta::new(None)).await.unwrap();
        tab_one.track(&PresenceMeta::new(None)).await.unwrap();
        tab_two.track(&PresenceMeta::new(None)).await.unwrap();

        let state = transport.presence_state("t");
        assert_eq!(state["alice"].as_array().map(Vec::len), Some(2));

        tab_one.unsubscribe().await.unwrap();
        let state = transport.presence_state("t");
        assert_eq!(state["alice"].as_array().map(Vec::len), Some(1));

        tab_two.untrack().await.unwrap();
        assert_eq!(transport.presence_state("t"), json!({}));
    }

    #[tokio::test]
    async fn send_requires_subscription() {
        let transport = MemoryTransport::new();
        let channel = transport.channel("t", &"bob".into());
        let err = channel.send("typing", json!({})).await.unwrap_err();
        assert!(matches!(err, RoomError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn injected_subscribe_failures_are_consumed() {
        let transport = MemoryTransport::new();
        transport.fail_next_subscribes(1);
        let channel = transport.channel("t", &"bob".into());
        assert!(channel.subscribe().await.is_err());
        assert!(channel.subscribe().await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_ends_streams_and_subscriptions() {
        let transport = MemoryTransport::new();
        let channel = transport.channel("t", &"bob".into());
        let mut events = channel.events();
        channel.subscribe().await.unwrap();
        channel.track(&PresenceMeta::new(None)).await.unwrap();

        transport.disconnect("t");
        while events.try_recv().is_ok() {}
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(transport.presence_state("t"), json!({}));
        assert!(channel.send("typing", json!({})).await.is_err());

        let mut events = channel.events();
        channel.subscribe().await.unwrap();
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Sync(_))));
        assert!(channel.send("typing", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn room_reads_are_newest_first_and_limited() {
        let store = MemoryReadStore::new();
        let room: RoomId = "r".into();
        for (member, secs) in [("a", 10), ("b", 30), ("c", 20)] {
            store.set_watermark(
                &room,
                &member.into(),
                DateTime::from_timestamp(secs, 0).unwrap(),
            );
        }
        store.set_watermark(&"other".into(), &"z".into(), DateTime::from_timestamp(99, 0).unwrap());

        let reads = store.fetch_room_reads(&room, 2).await.unwrap();
        let members: Vec<&str> = reads.iter().map(|r| r.member_id.as_str()).collect();
        assert_eq!(members, vec!["b", "c"]);
    }
}
