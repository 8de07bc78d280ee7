//! Typing indicators.
//!
//! Inbound: [`TypingTracker`] turns broadcast latches into a "who is typing"
//! set, each entry expiring on its own timer. Outbound: [`LocalTyping`]
//! debounces local keystrokes into `true`/`false` broadcasts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::room::{
    MemberId,
    channel::PresenceChannel,
    error::{RoomError, lock},
    message::TypingEvent,
};

// --- Inbound ---

#[derive(Debug)]
struct Latch {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct TypingState {
    typing: HashMap<MemberId, Latch>,
    next_generation: u64,
    disposed: bool,
}

#[derive(Debug)]
struct TypingInner {
    local_member: MemberId,
    expiry: Duration,
    state: Mutex<TypingState>,
}

impl TypingInner {
    fn expire(&self, member_id: &MemberId, generation: u64) {
        let mut state = lock(&self.state);
        if state.disposed {
            return;
        }
        // A refresh replaced the latch after this timer was armed.
        let current = state.typing.get(member_id).map(|latch| latch.generation);
        if current == Some(generation) {
            state.typing.remove(member_id);
            tracing::trace!(local_member = %self.local_member, %member_id, "Typing latch expired");
        }
    }
}

impl Drop for TypingInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, latch) in state.typing.drain() {
            latch.timer.abort();
        }
    }
}

/// Set of remote members currently typing in one room.
///
/// Must be fed from within a tokio runtime: each `true` latch arms a timer task.
#[derive(Debug)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

impl TypingTracker {
    pub fn new(local_member: MemberId, expiry: Duration) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                local_member,
                expiry,
                state: Mutex::new(TypingState::default()),
            }),
        }
    }

    pub fn on_typing_event(&self, event: &TypingEvent) {
        if event.member_id == self.inner.local_member {
            return;
        }

        let mut state = lock(&self.inner.state);
        if state.disposed {
            tracing::trace!(member_id = %event.member_id, "Typing event after dispose ignored");
            return;
        }

        if event.is_typing {
            let generation = state.next_generation;
            state.next_generation += 1;
            let timer = self.arm_timer(event.member_id.clone(), generation);
            let latch = Latch { generation, timer };
            if let Some(previous) = state.typing.insert(event.member_id.clone(), latch) {
                previous.timer.abort();
            }
        } else if let Some(previous) = state.typing.remove(&event.member_id) {
            previous.timer.abort();
        }
    }

    fn arm_timer(&self, member_id: MemberId, generation: u64) -> JoinHandle<()> {
        let deadline = Instant::now() + self.inner.expiry;
        let inner: Weak<TypingInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&member_id, generation);
            }
        })
    }

    pub fn typing_members(&self) -> HashSet<MemberId> {
        lock(&self.inner.state).typing.keys().cloned().collect()
    }

    pub fn is_typing(&self, member_id: &str) -> bool {
        lock(&self.inner.state).typing.contains_key(member_id)
    }

    /// Cancels every pending expiry and clears the set. Later events are no-ops.
    pub fn dispose(&self) {
        let mut state = lock(&self.inner.state);
        state.disposed = true;
        for (_, latch) in state.typing.drain() {
            latch.timer.abort();
        }
    }
}

// --- Outbound ---

#[derive(Debug, Default)]
struct LocalState {
    active: bool,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
    disposed: bool,
}

/// Debounces local keystrokes: `true` goes out on the first keystroke after
/// idle, `false` after a fixed pause without keystrokes.
#[derive(Debug)]
pub struct LocalTyping {
    channel: Arc<PresenceChannel>,
    pause: Duration,
    state: Arc<Mutex<LocalState>>,
}

impl LocalTyping {
    pub fn new(channel: Arc<PresenceChannel>, pause: Duration) -> Self {
        Self {
            channel,
            pause,
            state: Arc::new(Mutex::new(LocalState::default())),
        }
    }

    /// A failed `true` leaves the debouncer idle, so the next keystroke
    /// tries again.
    pub async fn keystroke(&self) -> Result<(), RoomError> {
        let (started, generation) = {
            let mut state = lock(&self.state);
            if state.disposed {
                return Ok(());
            }
            let started = !state.active;
            state.active = true;
            state.generation += 1;
            let timer = self.arm_idle_timer(state.generation);
            if let Some(previous) = state.idle_timer.replace(timer) {
                previous.abort();
            }
            (started, state.generation)
        };
        if !started {
            return Ok(());
        }
        if let Err(e) = self.channel.broadcast_typing(true).await {
            let mut state = lock(&self.state);
            if state.generation == generation {
                state.active = false;
                if let Some(timer) = state.idle_timer.take() {
                    timer.abort();
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Ends the burst right away, e.g. when the message is sent.
    pub async fn stop(&self) -> Result<(), RoomError> {
        let was_active = {
            let mut state = lock(&self.state);
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            std::mem::replace(&mut state.active, false)
        };
        if was_active {
            self.channel.broadcast_typing(false).await?;
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    pub fn dispose(&self) {
        let mut state = lock(&self.state);
        state.disposed = true;
        state.active = false;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }

    fn arm_idle_timer(&self, generation: u64) -> JoinHandle<()> {
        let deadline = Instant::now() + self.pause;
        let state = Arc::clone(&self.state);
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            let went_idle = {
                let mut state = lock(&state);
                if state.disposed || state.generation != generation || !state.active {
                    false
                } else {
                    state.active = false;
                    state.idle_timer = None;
                    true
                }
            };
            if went_idle {
                if let Err(e) = channel.broadcast_typing(false).await {
                    tracing::debug!(error = %e, "Failed to broadcast end of typing");
                }
            }
        })
    }
}
