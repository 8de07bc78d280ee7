use std::sync::Arc;

use tokio::sync::Mutex;

use super::{MemberId, RoomId, RoomSession, config::RoomConfig, error::RoomError};
use crate::backend::{ReadReceiptStore, Transport};

/// Keeps at most one room open for the local member.
///
/// Entering a room fully closes the previous one first, so no timer or
/// listener from the old room can fire into the new one.
#[derive(Debug)]
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ReadReceiptStore>,
    member_id: MemberId,
    nickname: Option<String>,
    config: RoomConfig,
    current: Mutex<Option<Arc<RoomSession>>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ReadReceiptStore>,
        member_id: MemberId,
        nickname: Option<String>,
        config: RoomConfig,
    ) -> Result<Self, RoomError> {
        config.validate()?;
        Ok(SessionManager {
            transport,
            store,
            member_id,
            nickname,
            config,
            current: Mutex::new(None),
        })
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    /// Switches to `room_id`. Re-entering the open room returns its session.
    pub async fn enter(&self, room_id: RoomId) -> Result<Arc<RoomSession>, RoomError> {
        let mut current = self.current.lock().await;

        if let Some(session) = current.as_ref() {
            if session.room_id() == &room_id && !session.is_closed() {
                return Ok(Arc::clone(session));
            }
        }

        if let Some(previous) = current.take() {
            tracing::debug!(from = %previous.room_id(), to = %room_id, "Switching rooms");
            previous.close().await;
        }

        let session = Arc::new(
            RoomSession::open(
                self.transport.as_ref(),
                Arc::clone(&self.store),
                room_id,
                self.member_id.clone(),
                self.nickname.clone(),
                &self.config,
            )
            .await?,
        );
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Closes the open room, if any. Returns whether one was open.
    pub async fn leave(&self) -> bool {
        let previous = self.current.lock().await.take();
        match previous {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn current(&self) -> Option<Arc<RoomSession>> {
        self.current.lock().await.clone()
    }
}
