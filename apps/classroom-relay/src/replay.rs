//! Full-fidelity log delivery and keyframe-compacted page replay.
//!
//! Page and drawing logs are trimmed to the current keyframe interval on every append.
//! Each resource also carries a keyframe pointer: the id of the entry appended just
//! before the latest keyframe. Reads are exclusive of their cursor, so a reader that
//! starts at the pointer sees the keyframe first and then everything after it.

use std::time::Duration;

use classroom_store::{Batch, EntryId, StoreExt, StoreHandle, StreamEntry, StreamReader, DATA_FIELD};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};
use crate::keys::{KeySpace, LogPolicy};
use crate::metrics;

/// Upper bound on entries pulled by one blocking read.
pub(crate) const READ_COUNT: usize = 100;

/// One drawing or page-turn event as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEvent {
    pub is_keyframe: bool,
    /// Events appended since the latest keyframe, counting this one. Zero for a keyframe.
    #[serde(default)]
    pub events_since_keyframe: usize,
    pub payload: serde_json::Value,
}

/// Log entry delivered to a subscriber together with its resume cursor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedEvent {
    pub id: EntryId,
    pub data: serde_json::Value,
}

impl LoggedEvent {
    fn decode(entry: &StreamEntry) -> Option<Self> {
        let raw = entry.field(DATA_FIELD)?;
        match serde_json::from_str(raw) {
            Ok(data) => Some(Self { id: entry.id, data }),
            Err(err) => {
                warn!(id = %entry.id, error = %err, "skipping undecodable log entry");
                None
            }
        }
    }
}

/// Deliver every entry of `key` after `cursor` until the sink closes.
pub(crate) async fn follow_log(
    reader: &mut dyn StreamReader,
    key: &str,
    mut cursor: EntryId,
    sink: &mpsc::Sender<LoggedEvent>,
    block: Duration,
    source: &'static str,
) -> RelayResult<()> {
    while !sink.is_closed() {
        let batch = reader
            .read(&[(key.to_string(), cursor)], READ_COUNT, block)
            .await?;
        for (_, entries) in batch {
            for entry in entries {
                cursor = entry.id;
                let Some(event) = LoggedEvent::decode(&entry) else {
                    continue;
                };
                if sink.send(event).await.is_err() {
                    return Ok(());
                }
                metrics::NOTIFICATIONS_DELIVERED
                    .with_label_values(&[source])
                    .inc();
            }
        }
    }
    debug!(%key, %cursor, "log subscriber closed");
    Ok(())
}

/// Append a run of JSON values and return their ids in order.
async fn append_all<T>(store: &StoreHandle, policies: &[(LogPolicy, T)]) -> RelayResult<Vec<EntryId>>
where
    T: Serialize + Sync,
{
    let Some((last, _)) = policies.last() else {
        return Ok(Vec::new());
    };
    let mut batch = Batch::new(store.as_ref());
    for (policy, value) in policies {
        batch
            .append(&policy.key, policy.max_len, serde_json::to_string(value)?)
            .await;
    }
    batch.expire(&last.key, last.ttl).await;
    batch
        .commit()
        .await
        .into_result()?
        .into_iter()
        .take(policies.len())
        .map(|reply| reply.into_id().map_err(RelayError::from))
        .collect()
}

/// A log delivered entry by entry, nothing coalesced.
#[derive(Clone)]
pub struct EventLog {
    store: StoreHandle,
    policy: LogPolicy,
    block_timeout: Duration,
    source: &'static str,
}

impl EventLog {
    pub fn new(
        store: StoreHandle,
        policy: LogPolicy,
        block_timeout: Duration,
        source: &'static str,
    ) -> Self {
        Self {
            store,
            policy,
            block_timeout,
            source,
        }
    }

    pub fn key(&self) -> &str {
        &self.policy.key
    }

    pub async fn append<T>(&self, values: Vec<T>) -> RelayResult<Vec<EntryId>>
    where
        T: Serialize + Sync,
    {
        let runs: Vec<(LogPolicy, T)> = values
            .into_iter()
            .map(|value| (self.policy.clone(), value))
            .collect();
        append_all(&self.store, &runs).await
    }

    /// Stream entries after `from` (or the whole retained log) into `sink`.
    pub async fn follow(
        &self,
        from: Option<EntryId>,
        sink: mpsc::Sender<LoggedEvent>,
    ) -> RelayResult<()> {
        let mut reader = self.store.reader().await?;
        follow_log(
            reader.as_mut(),
            &self.policy.key,
            from.unwrap_or(EntryId::ZERO),
            &sink,
            self.block_timeout,
            self.source,
        )
        .await
    }
}

/// Per-resource page and drawing logs.
#[derive(Clone)]
pub struct PageEvents {
    store: StoreHandle,
    keys: KeySpace,
    block_timeout: Duration,
}

impl PageEvents {
    pub fn new(store: StoreHandle, keys: KeySpace, block_timeout: Duration) -> Self {
        Self {
            store,
            keys,
            block_timeout,
        }
    }

    /// Append `events` in order and move the keyframe pointer if the run holds a keyframe.
    pub async fn append(
        &self,
        room_id: &str,
        resource_id: &str,
        events: Vec<PageEvent>,
    ) -> RelayResult<Vec<EntryId>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let log_key = self.keys.page_events(room_id, resource_id, 0).key;
        let before = self.store.last_entry(&log_key).await?.map(|entry| entry.id);
        let last_keyframe = events.iter().rposition(|event| event.is_keyframe);

        let runs: Vec<(LogPolicy, PageEvent)> = events
            .into_iter()
            .map(|event| {
                let policy =
                    self.keys
                        .page_events(room_id, resource_id, event.events_since_keyframe);
                (policy, event)
            })
            .collect();
        let ids = append_all(&self.store, &runs).await?;

        if let Some(idx) = last_keyframe {
            let previous = match idx {
                0 => before,
                _ => ids.get(idx - 1).copied(),
            };
            let pointer = self.keys.keyframe_pointer(room_id, resource_id);
            match previous {
                Some(id) => {
                    self.store
                        .set(&pointer, &id.to_string(), Some(self.keys.room_ttl()))
                        .await?
                }
                None => {
                    self.store.del(&pointer).await?;
                }
            }
        }
        Ok(ids)
    }

    pub async fn keyframe_pointer(
        &self,
        room_id: &str,
        resource_id: &str,
    ) -> RelayResult<Option<EntryId>> {
        let raw = self
            .store
            .get(&self.keys.keyframe_pointer(room_id, resource_id))
            .await?;
        match raw {
            Some(raw) => Ok(Some(raw.parse().map_err(classroom_store::StoreError::from)?)),
            None => Ok(None),
        }
    }

    /// Replay a resource from `resume`, else from its latest keyframe, else from the start.
    pub async fn subscribe(
        &self,
        room_id: &str,
        resource_id: &str,
        resume: Option<EntryId>,
        sink: mpsc::Sender<LoggedEvent>,
    ) -> RelayResult<()> {
        let start = match resume {
            Some(cursor) => cursor,
            None => self
                .keyframe_pointer(room_id, resource_id)
                .await?
                .unwrap_or(EntryId::ZERO),
        };
        let key = self.keys.page_events(room_id, resource_id, 0).key;
        let mut reader = self.store.reader().await?;
        follow_log(
            reader.as_mut(),
            &key,
            start,
            &sink,
            self.block_timeout,
            "pages",
        )
        .await
    }
}
