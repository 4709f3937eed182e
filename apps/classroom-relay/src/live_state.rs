//! Latest-value channels for room state that only matters at its newest value.
//!
//! Each channel is a log trimmed to one entry. Readers emit the current value first and
//! afterwards only the newest entry of every read, so a slow consumer skips straight to
//! the present instead of replaying intermediate states.

use std::marker::PhantomData;
use std::time::Duration;

use classroom_store::{Batch, EntryId, StoreExt, StoreHandle, StreamEntry, StreamReader, DATA_FIELD};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};
use crate::events::{append_json, first_id};
use crate::keys::{KeySpace, LogPolicy};
use crate::metrics;
use crate::replay::{EventLog, LoggedEvent};
use crate::session::Identity;

/// A log read only at its newest value.
pub struct LatestValue<T> {
    store: StoreHandle,
    policy: LogPolicy,
    _value: PhantomData<fn() -> T>,
}

impl<T> LatestValue<T>
where
    T: Serialize + DeserializeOwned + Sync,
{
    pub fn new(store: StoreHandle, policy: LogPolicy) -> Self {
        Self {
            store,
            policy,
            _value: PhantomData,
        }
    }

    pub async fn publish(&self, value: &T) -> RelayResult<EntryId> {
        let mut batch = Batch::new(self.store.as_ref());
        self.queue(&mut batch, value).await?;
        first_id(batch.commit().await.into_result()?)
    }

    /// Add the write to a caller's batch instead of committing it alone.
    pub async fn queue(&self, batch: &mut Batch<'_>, value: &T) -> RelayResult<()> {
        append_json(batch, &self.policy, value).await
    }

    pub async fn current(&self) -> RelayResult<Option<T>> {
        Ok(self
            .store
            .last_entry(&self.policy.key)
            .await?
            .and_then(|entry| decode(&entry)))
    }

    pub async fn reader(&self, block: Duration) -> RelayResult<LatestReader<T>> {
        Ok(LatestReader {
            reader: self.store.reader().await?,
            key: self.policy.key.clone(),
            cursor: None,
            block,
            _value: PhantomData,
        })
    }
}

/// Cursor over a [`LatestValue`] on a dedicated reader connection.
pub struct LatestReader<T> {
    reader: Box<dyn StreamReader>,
    key: String,
    cursor: Option<EntryId>,
    block: Duration,
    _value: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> LatestReader<T> {
    /// The current value on the first call; afterwards the newest value written since the
    /// previous call, or `None` when the wait elapsed without a write.
    pub async fn next(&mut self) -> RelayResult<Option<T>> {
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => {
                let last = self
                    .reader
                    .execute(classroom_store::Command::XLast {
                        key: self.key.clone(),
                    })
                    .await?
                    .into_entries()?
                    .pop();
                self.cursor = Some(last.as_ref().map_or(EntryId::ZERO, |entry| entry.id));
                if let Some(value) = last.as_ref().and_then(decode) {
                    return Ok(Some(value));
                }
                self.cursor.unwrap_or(EntryId::ZERO)
            }
        };

        let batch = self
            .reader
            .read(&[(self.key.clone(), cursor)], 1, self.block)
            .await?;
        let Some(woken) = batch.into_iter().flat_map(|(_, entries)| entries).next() else {
            return Ok(None);
        };
        // The read only signals a write; the value comes from the log's tail, however many
        // entries the trim left behind.
        let newest = self
            .reader
            .execute(classroom_store::Command::XLast {
                key: self.key.clone(),
            })
            .await?
            .into_entries()?
            .pop()
            .filter(|entry| entry.id >= woken.id)
            .unwrap_or(woken);
        self.cursor = Some(newest.id);
        Ok(decode(&newest))
    }
}

fn decode<T: DeserializeOwned>(entry: &StreamEntry) -> Option<T> {
    let raw = entry.field(DATA_FIELD)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(id = %entry.id, error = %err, "skipping undecodable state entry");
            None
        }
    }
}

/// Shared video player state. `offset` is in seconds, the timestamp in store-clock ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoState {
    pub source: String,
    pub playing: bool,
    pub offset: f64,
    pub server_time_at_last_change: i64,
}

impl VideoState {
    /// Playhead position at store time `now_ms`.
    pub fn offset_at(&self, now_ms: i64) -> f64 {
        if !self.playing {
            return self.offset;
        }
        let elapsed_ms = (now_ms - self.server_time_at_last_change).max(0);
        self.offset + elapsed_ms as f64 / 1_000.0
    }
}

/// Client request to change the video; the relay stamps the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoUpdate {
    pub source: String,
    pub playing: bool,
    pub offset: f64,
}

/// What a video subscriber receives: the stored state plus the playhead right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnapshot {
    #[serde(flatten)]
    pub state: VideoState,
    pub live_offset: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardState {
    pub visible: bool,
    #[serde(default)]
    pub whiteboard_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardPermissions {
    pub allowed_session_ids: Vec<String>,
}

impl WhiteboardPermissions {
    pub fn allows(&self, session_id: &str) -> bool {
        self.allowed_session_ids.iter().any(|id| id == session_id)
    }
}

#[derive(Clone)]
pub struct LiveState {
    store: StoreHandle,
    keys: KeySpace,
    block_timeout: Duration,
}

impl LiveState {
    pub fn new(store: StoreHandle, keys: KeySpace, block_timeout: Duration) -> Self {
        Self {
            store,
            keys,
            block_timeout,
        }
    }

    pub fn video(&self, room_id: &str) -> LatestValue<VideoState> {
        LatestValue::new(self.store.clone(), self.keys.video_state(room_id))
    }

    pub fn whiteboard_state(&self, room_id: &str) -> LatestValue<WhiteboardState> {
        LatestValue::new(self.store.clone(), self.keys.whiteboard_state(room_id))
    }

    pub fn whiteboard_permissions(&self, room_id: &str) -> LatestValue<WhiteboardPermissions> {
        LatestValue::new(
            self.store.clone(),
            self.keys.whiteboard_permissions(room_id),
        )
    }

    pub fn whiteboard_events(&self, room_id: &str) -> EventLog {
        EventLog::new(
            self.store.clone(),
            self.keys.whiteboard_events(room_id),
            self.block_timeout,
            "whiteboard",
        )
    }

    pub async fn set_video(&self, identity: &Identity, update: VideoUpdate) -> RelayResult<VideoState> {
        identity.require_teacher("control the video")?;
        let state = VideoState {
            source: update.source,
            playing: update.playing,
            offset: update.offset,
            server_time_at_last_change: self.store.time_ms().await?,
        };
        self.video(&identity.room_id).publish(&state).await?;
        debug!(room = %identity.room_id, playing = state.playing, offset = state.offset, "video state changed");
        Ok(state)
    }

    pub async fn set_whiteboard_state(
        &self,
        identity: &Identity,
        state: WhiteboardState,
    ) -> RelayResult<()> {
        identity.require_teacher("show or hide the whiteboard")?;
        self.whiteboard_state(&identity.room_id).publish(&state).await?;
        Ok(())
    }

    pub async fn set_whiteboard_permissions(
        &self,
        identity: &Identity,
        allowed_session_ids: Vec<String>,
    ) -> RelayResult<()> {
        identity.require_teacher("grant whiteboard access")?;
        self.whiteboard_permissions(&identity.room_id)
            .publish(&WhiteboardPermissions { allowed_session_ids })
            .await?;
        Ok(())
    }

    /// Queue a permission reset onto a caller's batch.
    pub async fn reset_whiteboard_permissions(
        &self,
        batch: &mut Batch<'_>,
        room_id: &str,
    ) -> RelayResult<()> {
        self.whiteboard_permissions(room_id)
            .queue(batch, &WhiteboardPermissions::default())
            .await
    }

    /// Queue hiding the whiteboard onto a caller's batch.
    pub async fn hide_whiteboard(&self, batch: &mut Batch<'_>, room_id: &str) -> RelayResult<()> {
        self.whiteboard_state(room_id)
            .queue(batch, &WhiteboardState::default())
            .await
    }

    /// Append drawing events. Teachers may always draw, students only when granted.
    pub async fn append_whiteboard_events(
        &self,
        identity: &Identity,
        events: Vec<serde_json::Value>,
    ) -> RelayResult<Vec<EntryId>> {
        if !identity.is_teacher {
            let permissions = self
                .whiteboard_permissions(&identity.room_id)
                .current()
                .await?
                .unwrap_or_default();
            if !permissions.allows(&identity.session_id) {
                return Err(RelayError::Unauthorized("draw without a whiteboard grant"));
            }
        }
        self.whiteboard_events(&identity.room_id).append(events).await
    }

    pub async fn subscribe_whiteboard_events(
        &self,
        room_id: &str,
        resume: Option<EntryId>,
        sink: mpsc::Sender<LoggedEvent>,
    ) -> RelayResult<()> {
        self.whiteboard_events(room_id).follow(resume, sink).await
    }

    pub async fn subscribe_video(
        &self,
        room_id: &str,
        sink: mpsc::Sender<VideoSnapshot>,
    ) -> RelayResult<()> {
        let mut reader = self.video(room_id).reader(self.block_timeout).await?;
        while !sink.is_closed() {
            let Some(state) = reader.next().await? else {
                continue;
            };
            let now = self.store.time_ms().await?;
            let snapshot = VideoSnapshot {
                live_offset: state.offset_at(now),
                state,
            };
            if sink.send(snapshot).await.is_err() {
                break;
            }
            metrics::NOTIFICATIONS_DELIVERED
                .with_label_values(&["video"])
                .inc();
        }
        Ok(())
    }

    pub async fn subscribe_whiteboard_state(
        &self,
        room_id: &str,
        sink: mpsc::Sender<WhiteboardState>,
    ) -> RelayResult<()> {
        let reader = self.whiteboard_state(room_id).reader(self.block_timeout).await?;
        forward_latest(reader, sink, "whiteboard_state").await
    }

    pub async fn subscribe_whiteboard_permissions(
        &self,
        room_id: &str,
        sink: mpsc::Sender<WhiteboardPermissions>,
    ) -> RelayResult<()> {
        let reader = self
            .whiteboard_permissions(room_id)
            .reader(self.block_timeout)
            .await?;
        forward_latest(reader, sink, "whiteboard_permissions").await
    }
}

async fn forward_latest<T>(
    mut reader: LatestReader<T>,
    sink: mpsc::Sender<T>,
    source: &'static str,
) -> RelayResult<()>
where
    T: DeserializeOwned + Send,
{
    while !sink.is_closed() {
        let Some(value) = reader.next().await? else {
            continue;
        };
        if sink.send(value).await.is_err() {
            break;
        }
        metrics::NOTIFICATIONS_DELIVERED
            .with_label_values(&[source])
            .inc();
    }
    Ok(())
}
