use classroom_store::{Batch, Command, EntryId, StoreExt, StoreHandle};
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::events::{append_json, first_id, ChatMessage, RoomNotification, SignalMessage};
use crate::keys::KeySpace;
use crate::live_state::LiveState;
use crate::session::{ContentMarker, Identity, Session, FIELD_TROPHIES};

/// Longest chat message kept, in characters.
pub const MAX_CHAT_CHARS: usize = 1_024;
const TRUNCATION_MARK: char = '…';

/// In-room mutations that fan out through the room's logs.
#[derive(Clone)]
pub struct RoomActions {
    store: StoreHandle,
    keys: KeySpace,
    live: LiveState,
}

impl RoomActions {
    pub fn new(store: StoreHandle, keys: KeySpace, live: LiveState) -> Self {
        Self { store, keys, live }
    }

    /// Post a chat line. Blank input is dropped and `None` returned.
    pub async fn send_chat(&self, identity: &Identity, text: &str) -> RelayResult<Option<ChatMessage>> {
        let Some(text) = normalize_chat(text) else {
            return Ok(None);
        };
        let message = ChatMessage {
            session_id: identity.session_id.clone(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            text,
            sent_at: self.store.time_ms().await?,
        };
        let mut batch = Batch::new(self.store.as_ref());
        append_json(
            &mut batch,
            &self.keys.chat(&identity.room_id),
            &RoomNotification::Chat(message.clone()),
        )
        .await?;
        batch.commit().await.into_result()?;
        Ok(Some(message))
    }

    /// Switch the room's content. Returns whether the content type changed, in which case
    /// whiteboard visibility and permissions are reset as well.
    pub async fn change_content(&self, identity: &Identity, content: ContentMarker) -> RelayResult<bool> {
        identity.require_teacher("change the content")?;
        let room_id = identity.room_id.as_str();
        let key = self.keys.content(room_id);
        let previous: Option<ContentMarker> = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };
        let type_changed = previous
            .as_ref()
            .is_some_and(|previous| previous.content_type != content.content_type);

        let mut batch = Batch::new(self.store.as_ref());
        batch
            .set(&key, serde_json::to_string(&content)?, Some(self.keys.room_ttl()))
            .await;
        if type_changed {
            self.live.hide_whiteboard(&mut batch, room_id).await?;
            self.live
                .reset_whiteboard_permissions(&mut batch, room_id)
                .await?;
        }
        append_json(
            &mut batch,
            &self.keys.room_notify(room_id),
            &RoomNotification::Content { content },
        )
        .await?;
        batch.commit().await.into_result()?;
        debug!(room = %room_id, type_changed, "content changed");
        Ok(type_changed)
    }

    pub async fn mute(&self, identity: &Identity, target_session_id: &str, muted: bool) -> RelayResult<()> {
        identity.require_teacher("mute participants")?;
        self.require_session(&identity.room_id, target_session_id)
            .await?;
        let mut batch = Batch::new(self.store.as_ref());
        append_json(
            &mut batch,
            &self.keys.room_notify(&identity.room_id),
            &RoomNotification::Mute {
                session_id: target_session_id.to_string(),
                muted,
                by_session_id: identity.session_id.clone(),
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        Ok(())
    }

    /// Give a session one trophy and return its new total.
    pub async fn award_trophy(&self, identity: &Identity, target_session_id: &str) -> RelayResult<i64> {
        identity.require_teacher("award trophies")?;
        let room_id = identity.room_id.as_str();
        let target = self.require_session(room_id, target_session_id).await?;
        let trophies = self
            .store
            .execute(Command::HIncrBy {
                key: self.keys.session(room_id, target_session_id),
                field: FIELD_TROPHIES.to_string(),
                delta: 1,
            })
            .await?
            .into_int()?;

        let mut batch = Batch::new(self.store.as_ref());
        append_json(
            &mut batch,
            &self.keys.room_notify(room_id),
            &RoomNotification::Trophy {
                session_id: target.id,
                user_id: target.user_id,
                trophies,
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        Ok(trophies)
    }

    /// Cache the media server address for the room and announce it.
    pub async fn set_sfu_address(&self, room_id: &str, address: &str) -> RelayResult<()> {
        let mut batch = Batch::new(self.store.as_ref());
        batch
            .set(
                &self.keys.sfu_address(room_id),
                address.to_string(),
                Some(self.keys.room_ttl()),
            )
            .await;
        append_json(
            &mut batch,
            &self.keys.room_notify(room_id),
            &RoomNotification::Sfu {
                address: address.to_string(),
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        Ok(())
    }

    /// Deliver a signaling payload to one session's private log.
    pub async fn send_signal(
        &self,
        identity: &Identity,
        target_session_id: &str,
        payload: serde_json::Value,
    ) -> RelayResult<EntryId> {
        let room_id = identity.room_id.as_str();
        self.require_session(room_id, target_session_id).await?;
        let mut batch = Batch::new(self.store.as_ref());
        append_json(
            &mut batch,
            &self.keys.session_notify(room_id, target_session_id),
            &RoomNotification::Signal(SignalMessage {
                from_session_id: identity.session_id.clone(),
                payload,
            }),
        )
        .await?;
        first_id(batch.commit().await.into_result()?)
    }

    async fn require_session(&self, room_id: &str, session_id: &str) -> RelayResult<Session> {
        let fields = self
            .store
            .hgetall(&self.keys.session(room_id, session_id))
            .await?;
        Session::from_fields(&fields).ok_or_else(|| RelayError::SessionNotFound {
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
        })
    }
}

fn normalize_chat(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= MAX_CHAT_CHARS {
        return Some(text.to_string());
    }
    let mut truncated: String = text.chars().take(MAX_CHAT_CHARS).collect();
    truncated.push(TRUNCATION_MARK);
    Some(truncated)
}
