//! Per-connection fan-in of the room, private session and chat logs.
//!
//! One blocking read covers all three logs. Every room-scoped key shares a hash tag, so
//! the multi-log read stays on one cluster slot.

use std::time::Duration;

use classroom_store::{Command, EntryId, StoreHandle, StreamEntry, StreamReader, DATA_FIELD};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RelayResult;
use crate::events::RoomNotification;
use crate::keys::KeySpace;
use crate::metrics;
use crate::replay::READ_COUNT;
use crate::session::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Room,
    Session,
    Chat,
}

impl NotificationSource {
    fn label(self) -> &'static str {
        match self {
            NotificationSource::Room => "room",
            NotificationSource::Session => "session",
            NotificationSource::Chat => "chat",
        }
    }
}

/// Where a reconnecting client left off in each log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeCursors {
    pub room: Option<EntryId>,
    pub session: Option<EntryId>,
    pub chat: Option<EntryId>,
}

/// A delivered notification with the log and id it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub source: NotificationSource,
    pub id: EntryId,
    #[serde(flatten)]
    pub body: RoomNotification,
}

#[derive(Clone)]
pub struct RoomNotifier {
    store: StoreHandle,
    keys: KeySpace,
    block_timeout: Duration,
}

impl RoomNotifier {
    pub fn new(store: StoreHandle, keys: KeySpace, block_timeout: Duration) -> Self {
        Self {
            store,
            keys,
            block_timeout,
        }
    }

    /// Open a subscription and resolve its starting cursors. Without a resume cursor the
    /// room log starts after its current last entry; the other logs replay what is retained.
    pub async fn open(&self, identity: &Identity, resume: ResumeCursors) -> RelayResult<RoomSubscription> {
        identity.validate()?;
        let room_id = identity.room_id.as_str();
        let mut reader = self.store.reader().await?;

        let room_log = self.keys.room_notify(room_id).key;
        let room_start = match resume.room {
            Some(cursor) => cursor,
            None => reader
                .execute(Command::XLast {
                    key: room_log.clone(),
                })
                .await?
                .into_entries()?
                .pop()
                .map_or(EntryId::ZERO, |entry| entry.id),
        };

        let cursors = vec![
            Cursor {
                key: room_log,
                position: room_start,
                source: NotificationSource::Room,
            },
            Cursor {
                key: self
                    .keys
                    .session_notify(room_id, &identity.session_id)
                    .key,
                position: resume.session.unwrap_or(EntryId::ZERO),
                source: NotificationSource::Session,
            },
            Cursor {
                key: self.keys.chat(room_id).key,
                position: resume.chat.unwrap_or(EntryId::ZERO),
                source: NotificationSource::Chat,
            },
        ];
        debug!(room = %room_id, session = %identity.session_id, %room_start, "room subscription opened");
        Ok(RoomSubscription {
            reader,
            cursors,
            ttl: self.keys.room_ttl(),
            block: self.block_timeout,
        })
    }

    pub async fn subscribe(
        &self,
        identity: &Identity,
        resume: ResumeCursors,
        sink: mpsc::Sender<Notification>,
    ) -> RelayResult<()> {
        self.open(identity, resume).await?.run(sink).await
    }
}

struct Cursor {
    key: String,
    position: EntryId,
    source: NotificationSource,
}

pub struct RoomSubscription {
    reader: Box<dyn StreamReader>,
    cursors: Vec<Cursor>,
    ttl: Duration,
    block: Duration,
}

impl RoomSubscription {
    /// Current position in each log, suitable for resuming later.
    pub fn positions(&self) -> ResumeCursors {
        let position = |source| {
            self.cursors
                .iter()
                .find(|cursor| cursor.source == source)
                .map(|cursor| cursor.position)
        };
        ResumeCursors {
            room: position(NotificationSource::Room),
            session: position(NotificationSource::Session),
            chat: position(NotificationSource::Chat),
        }
    }

    /// Deliver notifications until the sink closes. A closed sink is noticed once the
    /// current blocking read returns.
    pub async fn run(mut self, sink: mpsc::Sender<Notification>) -> RelayResult<()> {
        while !sink.is_closed() {
            for cursor in &self.cursors {
                self.reader
                    .execute(Command::Expire {
                        key: cursor.key.clone(),
                        ttl: self.ttl,
                    })
                    .await?;
            }

            let request: Vec<(String, EntryId)> = self
                .cursors
                .iter()
                .map(|cursor| (cursor.key.clone(), cursor.position))
                .collect();
            let batch = self.reader.read(&request, READ_COUNT, self.block).await?;

            for (key, entries) in batch {
                let Some(cursor) = self.cursors.iter_mut().find(|cursor| cursor.key == key) else {
                    continue;
                };
                for entry in entries {
                    cursor.position = entry.id;
                    let Some(body) = decode(&entry) else {
                        continue;
                    };
                    let notification = Notification {
                        source: cursor.source,
                        id: entry.id,
                        body,
                    };
                    if sink.send(notification).await.is_err() {
                        return Ok(());
                    }
                    metrics::NOTIFICATIONS_DELIVERED
                        .with_label_values(&[cursor.source.label()])
                        .inc();
                }
            }
        }
        Ok(())
    }
}

fn decode(entry: &StreamEntry) -> Option<RoomNotification> {
    let Some(raw) = entry.field(DATA_FIELD) else {
        warn!(id = %entry.id, "notification without data field");
        return None;
    };
    match serde_json::from_str(raw) {
        Ok(body) => Some(body),
        Err(err) => {
            warn!(id = %entry.id, error = %err, "skipping undecodable notification");
            None
        }
    }
}
