use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use super::{
    MemberId, RoomId,
    config::RoomConfig,
    connection::{ConnectionEvent, ConnectionState},
    error::{RoomError, lock},
    message::{ChannelEvent, PresenceMeta, TYPING_EVENT, TypingEvent, presence_topic},
    presence::PresenceSnapshot,
    subscription::{Callback, ObserverId, Observers},
};
use crate::backend::{ChannelHandle, Transport};

/// Owns a spawned task and aborts it on replacement or drop.
#[derive(Debug, Default)]
struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    fn replace(&self, task: JoinHandle<()>) {
        if let Some(previous) = lock(&self.0).replace(task) {
            previous.abort();
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.0).as_ref().is_some_and(|task| !task.is_finished())
    }

    fn abort(&self) {
        if let Some(task) = lock(&self.0).take() {
            task.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A room-scoped presence topic.
///
/// Announces the local member once per successful subscription, re-announces
/// on a fixed heartbeat so the service does not evict the record as idle, and
/// fans incoming `sync` and typing events out to registered listeners.
#[derive(Debug)]
pub struct PresenceChannel {
    room_id: RoomId,
    member_id: MemberId,
    handle: Arc<dyn ChannelHandle>,
    heartbeat_interval: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    announcement: Arc<Mutex<Option<PresenceMeta>>>,
    // Held across every track/untrack so they reach the transport in order.
    track_gate: Arc<AsyncMutex<()>>,
    snapshot_observers: Arc<Observers<PresenceSnapshot>>,
    typing_observers: Arc<Observers<TypingEvent>>,
    dispatcher: TaskSlot,
    heartbeat: TaskSlot,
}

impl PresenceChannel {
    /// Binds to the room's topic. Nothing is received until
    /// [`connect`](Self::connect).
    pub fn open(
        transport: &dyn Transport,
        room_id: RoomId,
        member_id: MemberId,
        config: &RoomConfig,
    ) -> Self {
        let topic = presence_topic(&room_id);
        let handle = transport.channel(&topic, &member_id);
        let (state, _) = watch::channel(ConnectionState::Idle);

        tracing::debug!(%room_id, %member_id, %topic, "Presence channel opened");
        Self {
            room_id,
            member_id,
            handle,
            heartbeat_interval: config.heartbeat_interval(),
            state: Arc::new(state),
            announcement: Arc::new(Mutex::new(None)),
            track_gate: Arc::new(AsyncMutex::new(())),
            snapshot_observers: Arc::new(Observers::new()),
            typing_observers: Arc::new(Observers::new()),
            dispatcher: TaskSlot::default(),
            heartbeat: TaskSlot::default(),
        }
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let mut events = self.handle.events();
        let snapshots = Arc::clone(&self.snapshot_observers);
        let typing = Arc::clone(&self.typing_observers);
        let state = Arc::clone(&self.state);
        let room_id = self.room_id.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Sync(value)) => {
                        snapshots.notify(&PresenceSnapshot::from_value(&value));
                    }
                    Ok(ChannelEvent::Broadcast { event, payload }) if event == TYPING_EVENT => {
                        match serde_json::from_value::<TypingEvent>(payload) {
                            Ok(typing_event) => typing.notify(&typing_event),
                            Err(e) => {
                                tracing::debug!(%room_id, error = %e, "Dropping malformed typing payload");
                            }
                        }
                    }
                    Ok(ChannelEvent::Broadcast { event, .. }) => {
                        tracing::trace!(%room_id, %event, "Ignoring unrelated broadcast");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The next sync replaces whatever was missed.
                        tracing::warn!(%room_id, skipped, "Presence channel lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        state.send_modify(|s| *s = s.on_event(ConnectionEvent::Failure));
                        let current = *state.borrow();
                        tracing::warn!(%room_id, state = ?current, "Presence stream ended");
                        break;
                    }
                }
            }
        })
    }

    fn transition(&self, event: ConnectionEvent) -> ConnectionState {
        self.state.send_modify(|state| *state = state.on_event(event));
        *self.state.borrow()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Live view of the subscription state, for connection indicators.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribes to the topic.
    ///
    /// Failures, including a stream that ends after subscribing, are reported
    /// through the returned state (and the watch channel), never as an error;
    /// calling again retries. Listener state is left alone until a new
    /// snapshot arrives.
    pub async fn connect(&self) -> ConnectionState {
        if !self.state().can_subscribe() {
            return self.state();
        }
        self.transition(ConnectionEvent::Subscribe);
        // Fresh receiver before subscribing, so the initial sync is not missed.
        self.dispatcher.replace(self.spawn_dispatcher());

        match self.handle.subscribe().await {
            Ok(()) => {
                let _gate = self.track_gate.lock().await;
                let state = self.transition(ConnectionEvent::Success);
                if state.is_closed() {
                    // Closed while the subscription was in flight.
                    if let Err(e) = self.handle.unsubscribe().await {
                        tracing::debug!(room_id = %self.room_id, error = %e, "Late unsubscribe failed");
                    }
                    return state;
                }
                tracing::info!(room_id = %self.room_id, member_id = %self.member_id, "Subscribed to presence channel");

                let pending = lock(&self.announcement).as_ref().map(PresenceMeta::refreshed);
                if let Some(meta) = pending {
                    if let Err(e) = self.handle.track(&meta).await {
                        tracing::warn!(room_id = %self.room_id, error = %e, "Initial presence announcement failed");
                    }
                }
                state
            }
            Err(e) => {
                self.dispatcher.abort();
                let state = self.transition(ConnectionEvent::Failure);
                tracing::warn!(room_id = %self.room_id, member_id = %self.member_id, ?state, "Presence subscription failed: {}", e);
                state
            }
        }
    }

    /// Announces the local member with `meta` and keeps the record fresh.
    ///
    /// If the channel is not subscribed yet, the announcement is made as soon
    /// as `connect` succeeds.
    pub async fn announce(&self, meta: PresenceMeta) -> Result<(), RoomError> {
        let _gate = self.track_gate.lock().await;
        if self.state().is_closed() {
            return Err(RoomError::ChannelClosed(self.room_id.to_string()));
        }
        *lock(&self.announcement) = Some(meta.clone());
        if !self.heartbeat.is_running() {
            self.heartbeat.replace(self.spawn_heartbeat());
        }
        if self.state().is_subscribed() {
            self.handle.track(&meta).await?;
        }
        Ok(())
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let handle = Arc::clone(&self.handle);
        let announcement = Arc::clone(&self.announcement);
        let gate = Arc::clone(&self.track_gate);
        let state = self.state.subscribe();
        let room_id = self.room_id.clone();
        let period = self.heartbeat_interval;
        let start = Instant::now() + period;

        tokio::spawn(async move {
            let mut ticker = interval_at(start, period);
            loop {
                ticker.tick().await;
                let _gate = gate.lock().await;
                if !state.borrow().is_subscribed() {
                    continue;
                }
                let meta = lock(&announcement).as_ref().map(PresenceMeta::refreshed);
                let Some(meta) = meta else {
                    break;
                };
                tracing::trace!(%room_id, "Re-announcing presence");
                if let Err(e) = handle.track(&meta).await {
                    tracing::warn!(%room_id, error = %e, "Presence heartbeat failed");
                }
            }
        })
    }

    /// Stops the heartbeat and withdraws the local presence record.
    pub async fn stop_announcing(&self) -> Result<(), RoomError> {
        self.heartbeat.abort();
        let _gate = self.track_gate.lock().await;
        lock(&self.announcement).take();
        if self.state().is_subscribed() {
            self.handle.untrack().await?;
        }
        Ok(())
    }

    pub fn on_snapshot(&self, callback: Callback<PresenceSnapshot>) -> ObserverId {
        self.snapshot_observers.register(callback)
    }

    /// Removes a snapshot listener. Returns whether it was registered.
    pub fn off_snapshot(&self, id: ObserverId) -> bool {
        self.snapshot_observers.unregister(id)
    }

    pub fn on_typing(&self, callback: Callback<TypingEvent>) -> ObserverId {
        self.typing_observers.register(callback)
    }

    pub fn off_typing(&self, id: ObserverId) -> bool {
        self.typing_observers.unregister(id)
    }

    pub async fn broadcast_typing(&self, is_typing: bool) -> Result<(), RoomError> {
        if self.state().is_closed() {
            return Err(RoomError::ChannelClosed(self.room_id.to_string()));
        }
        let event = TypingEvent::new(self.member_id.clone(), is_typing);
        let payload = serde_json::to_value(&event).map_err(|e| RoomError::SendFailed {
            topic: self.handle.topic().to_string(),
            event: TYPING_EVENT.to_string(),
            reason: e.to_string(),
        })?;
        self.handle.send(TYPING_EVENT, payload).await
    }

    /// Tears the channel down.
    ///
    /// Listeners are detached and background tasks cancelled before the first
    /// await, so nothing from this room fires once `close` has been entered.
    /// An announcement already in flight completes before presence is
    /// withdrawn. Withdrawing presence is best effort.
    pub async fn close(&self) {
        self.transition(ConnectionEvent::Close);
        self.snapshot_observers.detach_all();
        self.typing_observers.detach_all();
        self.heartbeat.abort();
        self.dispatcher.abort();
        lock(&self.announcement).take();

        let _gate = self.track_gate.lock().await;
        if let Err(e) = self.handle.untrack().await {
            tracing::debug!(room_id = %self.room_id, error = %e, "Untrack on close failed");
        }
        if let Err(e) = self.handle.unsubscribe().await {
            tracing::debug!(room_id = %self.room_id, error = %e, "Unsubscribe on close failed");
        }
        tracing::debug!(room_id = %self.room_id, member_id = %self.member_id, "Presence channel closed");
    }
}
