use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    Command, EntryId, ReadBatch, Reply, SetCondition, Store, StoreError, StoreMode, StreamEntry,
    StreamReader,
};

/// In-process store for tests and early wiring.
///
/// Mirrors the store semantics the relay relies on: key expiry, conditional sets,
/// monotonically increasing log ids, length-bounded logs and blocking reads. The clock can
/// be pinned so time-dependent behaviour is deterministic, and individual keys can be made
/// to fail to exercise partial batches.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    mode: StoreMode,
    keyspace: Mutex<Keyspace>,
    appended: Notify,
}

#[derive(Default)]
struct Keyspace {
    values: HashMap<String, Value>,
    expires_at: HashMap<String, u64>,
    pinned_clock: Option<u64>,
    failing_keys: HashSet<String>,
}

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    Sorted(HashMap<String, i64>),
    Log(Log),
}

#[derive(Default)]
struct Log {
    entries: VecDeque<StreamEntry>,
    last_id: EntryId,
}

impl MemoryStore {
    pub fn new(mode: StoreMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                keyspace: Mutex::new(Keyspace::default()),
                appended: Notify::new(),
            }),
        }
    }

    /// Freeze the store clock at `ms`.
    pub fn set_clock(&self, ms: u64) {
        self.shared.keyspace.lock().pinned_clock = Some(ms);
    }

    /// Move a pinned clock forward. Pins the clock at the current wall time first if needed.
    pub fn advance_clock(&self, by: Duration) {
        let mut keyspace = self.shared.keyspace.lock();
        let now = keyspace.now();
        keyspace.pinned_clock = Some(now + by.as_millis() as u64);
    }

    /// Make every command touching `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.shared.keyspace.lock().failing_keys.insert(key.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        self.shared.keyspace.lock().failing_keys.remove(key);
    }

    /// Milliseconds until `key` expires, if it carries a ttl.
    pub fn ttl_ms(&self, key: &str) -> Option<u64> {
        let mut keyspace = self.shared.keyspace.lock();
        let now = keyspace.now();
        keyspace.purge(key, now);
        keyspace
            .expires_at
            .get(key)
            .map(|at| at.saturating_sub(now))
    }

    /// Number of entries currently retained in a log.
    pub fn log_len(&self, key: &str) -> usize {
        let mut keyspace = self.shared.keyspace.lock();
        let now = keyspace.now();
        keyspace.purge(key, now);
        match keyspace.values.get(key) {
            Some(Value::Log(log)) => log.entries.len(),
            _ => 0,
        }
    }

    fn run(&self, commands: Vec<Command>) -> Vec<Result<Reply, StoreError>> {
        let mut appended = false;
        let results = {
            let mut keyspace = self.shared.keyspace.lock();
            commands
                .into_iter()
                .map(|command| {
                    appended |= matches!(command, Command::XAdd { .. });
                    keyspace.apply(command)
                })
                .collect()
        };
        if appended {
            self.shared.appended.notify_waiters();
        }
        results
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn mode(&self) -> StoreMode {
        self.shared.mode
    }

    async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        self.run(vec![command])
            .pop()
            .unwrap_or(Err(StoreError::Backend("no reply".into())))
    }

    async fn execute_atomic(&self, commands: Vec<Command>) -> Vec<Result<Reply, StoreError>> {
        self.run(commands)
    }

    async fn reader(&self) -> Result<Box<dyn StreamReader>, StoreError> {
        Ok(Box::new(MemoryReader {
            store: self.clone(),
        }))
    }
}

struct MemoryReader {
    store: MemoryStore,
}

#[async_trait]
impl StreamReader for MemoryReader {
    async fn read(
        &mut self,
        cursors: &[(String, EntryId)],
        count: usize,
        block: Duration,
    ) -> Result<ReadBatch, StoreError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.store.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.store.shared.keyspace.lock().read_after(cursors, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError> {
        Store::execute(&self.store, command).await
    }
}

impl Keyspace {
    fn now(&self) -> u64 {
        self.pinned_clock.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64
        })
    }

    fn purge(&mut self, key: &str, now: u64) {
        if self.expires_at.get(key).is_some_and(|at| *at <= now) {
            self.expires_at.remove(key);
            self.values.remove(key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expires_at.remove(key);
        self.values.remove(key).is_some()
    }

    fn apply(&mut self, command: Command) -> Result<Reply, StoreError> {
        if let Some(key) = command.key() {
            if self.failing_keys.contains(key) {
                return Err(StoreError::Backend(format!(
                    "injected failure for {} {key}",
                    command.name()
                )));
            }
        }
        let now = self.now();
        if let Some(key) = command.key() {
            let key = key.to_string();
            self.purge(&key, now);
        }

        match command {
            Command::Get { key } => match self.values.get(&key) {
                None => Ok(Reply::Nil),
                Some(Value::Text(value)) => Ok(Reply::Text(value.clone())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::Set {
                key,
                value,
                ttl,
                condition,
            } => {
                if condition == SetCondition::IfAbsent && self.values.contains_key(&key) {
                    return Ok(Reply::Nil);
                }
                self.write_text(key, value, ttl, now);
                Ok(Reply::Ok)
            }
            Command::Swap { key, value, ttl } => {
                let previous = match self.values.get(&key) {
                    None => Reply::Nil,
                    Some(Value::Text(previous)) => Reply::Text(previous.clone()),
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                self.write_text(key, value, ttl, now);
                Ok(previous)
            }
            Command::Del { key } => Ok(Reply::Int(self.remove(&key) as i64)),
            Command::DelIfEquals { key, value } => {
                let owned = match self.values.get(&key) {
                    None => false,
                    Some(Value::Text(current)) => *current == value,
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                if !owned {
                    return Ok(Reply::Int(0));
                }
                Ok(Reply::Int(self.remove(&key) as i64))
            }
            Command::Expire { key, ttl } => {
                if !self.values.contains_key(&key) {
                    return Ok(Reply::Int(0));
                }
                self.expires_at.insert(key, now + ttl.as_millis() as u64);
                Ok(Reply::Int(1))
            }
            Command::HSet { key, fields } => {
                let hash = self.hash_mut(&key)?;
                let added = fields
                    .into_iter()
                    .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
                    .count();
                Ok(Reply::Int(added as i64))
            }
            Command::HGetAll { key } => match self.values.get(&key) {
                None => Ok(Reply::Fields(HashMap::new())),
                Some(Value::Hash(hash)) => Ok(Reply::Fields(hash.clone())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::HIncrBy { key, field, delta } => {
                let hash = self.hash_mut(&key)?;
                let current = match hash.get(&field) {
                    Some(raw) => raw
                        .parse::<i64>()
                        .map_err(|_| StoreError::Backend(format!("hash value at {field} is not an integer")))?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field, next.to_string());
                Ok(Reply::Int(next))
            }
            Command::SAdd { key, member } => {
                let set = match self.values.entry(key.clone()).or_insert_with(|| Value::Set(BTreeSet::new())) {
                    Value::Set(set) => set,
                    _ => return Err(StoreError::WrongType(key)),
                };
                Ok(Reply::Int(set.insert(member) as i64))
            }
            Command::SRem { key, member } => {
                let (removed, now_empty) = match self.values.get_mut(&key) {
                    None => return Ok(Reply::Int(0)),
                    Some(Value::Set(set)) => (set.remove(&member), set.is_empty()),
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                if now_empty {
                    self.remove(&key);
                }
                Ok(Reply::Int(removed as i64))
            }
            Command::SMembers { key } => match self.values.get(&key) {
                None => Ok(Reply::Members(Vec::new())),
                Some(Value::Set(set)) => Ok(Reply::Members(set.iter().cloned().collect())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::TakeMembers { key } => {
                let members = match self.values.get(&key) {
                    None => Vec::new(),
                    Some(Value::Set(set)) => set.iter().cloned().collect(),
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                self.remove(&key);
                Ok(Reply::Members(members))
            }
            Command::ZAdd {
                key,
                member,
                score,
                only_new,
            } => {
                let sorted = match self.values.entry(key.clone()).or_insert_with(|| Value::Sorted(HashMap::new())) {
                    Value::Sorted(sorted) => sorted,
                    _ => return Err(StoreError::WrongType(key)),
                };
                if only_new && sorted.contains_key(&member) {
                    return Ok(Reply::Int(0));
                }
                Ok(Reply::Int(sorted.insert(member, score).is_none() as i64))
            }
            Command::ZRangeByScore { key, max } => match self.values.get(&key) {
                None => Ok(Reply::Members(Vec::new())),
                Some(Value::Sorted(sorted)) => {
                    let mut due: Vec<(&String, &i64)> =
                        sorted.iter().filter(|(_, score)| **score <= max).collect();
                    due.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
                    Ok(Reply::Members(due.into_iter().map(|(m, _)| m.clone()).collect()))
                }
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::ZRem { key, member } => {
                let (removed, now_empty) = match self.values.get_mut(&key) {
                    None => return Ok(Reply::Int(0)),
                    Some(Value::Sorted(sorted)) => (sorted.remove(&member).is_some(), sorted.is_empty()),
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                if now_empty {
                    self.remove(&key);
                }
                Ok(Reply::Int(removed as i64))
            }
            Command::XAdd {
                key,
                max_len,
                fields,
            } => {
                let log = match self.values.entry(key.clone()).or_insert_with(|| Value::Log(Log::default())) {
                    Value::Log(log) => log,
                    _ => return Err(StoreError::WrongType(key)),
                };
                let id = log.last_id.successor(now);
                log.last_id = id;
                log.entries.push_back(StreamEntry {
                    id,
                    fields: fields.into_iter().collect(),
                });
                if let Some(max_len) = max_len {
                    while log.entries.len() > max_len {
                        log.entries.pop_front();
                    }
                }
                Ok(Reply::Id(id))
            }
            Command::XLast { key } => match self.values.get(&key) {
                None => Ok(Reply::Entries(Vec::new())),
                Some(Value::Log(log)) => Ok(Reply::Entries(log.entries.back().cloned().into_iter().collect())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::Time => Ok(Reply::Int(now as i64)),
        }
    }

    fn write_text(&mut self, key: String, value: String, ttl: Option<Duration>, now: u64) {
        match ttl {
            Some(ttl) => {
                self.expires_at.insert(key.clone(), now + ttl.as_millis() as u64);
            }
            None => {
                self.expires_at.remove(&key);
            }
        }
        self.values.insert(key, Value::Text(value));
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>, StoreError> {
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()))
        {
            Value::Hash(hash) => Ok(hash),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn read_after(
        &mut self,
        cursors: &[(String, EntryId)],
        count: usize,
    ) -> Result<ReadBatch, StoreError> {
        let now = self.now();
        let mut batch = Vec::new();
        for (key, after) in cursors {
            if self.failing_keys.contains(key) {
                return Err(StoreError::Backend(format!("injected failure for XREAD {key}")));
            }
            self.purge(key, now);
            let entries: Vec<StreamEntry> = match self.values.get(key) {
                None => continue,
                Some(Value::Log(log)) => log
                    .entries
                    .iter()
                    .filter(|entry| entry.id > *after)
                    .take(count)
                    .cloned()
                    .collect(),
                Some(_) => return Err(StoreError::WrongType(key.clone())),
            };
            if !entries.is_empty() {
                batch.push((key.clone(), entries));
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreExt;

    #[tokio::test]
    async fn conditional_set_only_creates_once() {
        let store = MemoryStore::new(StoreMode::Single);
        assert!(store.set_if_absent("lock", "a", None).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", None).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn keys_expire_on_the_store_clock() {
        let store = MemoryStore::new(StoreMode::Single);
        store.set_clock(1_000);
        store
            .set("lock", "a", Some(Duration::from_millis(500)))
            .await
            .unwrap();
        store.advance_clock(Duration::from_millis(499));
        assert!(store.get("lock").await.unwrap().is_some());
        store.advance_clock(Duration::from_millis(1));
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_ids_stay_monotonic_under_a_pinned_clock_and_trim() {
        let store = MemoryStore::new(StoreMode::Single);
        store.set_clock(5);
        let mut ids = Vec::new();
        for n in 0..4 {
            let id = store
                .execute(Command::append("log", Some(2), n.to_string()))
                .await
                .unwrap()
                .into_id()
                .unwrap();
            ids.push(id);
        }
        assert_eq!(ids[0], EntryId::new(5, 0));
        assert_eq!(ids[3], EntryId::new(5, 3));
        assert_eq!(store.log_len("log"), 2);
        let last = store.last_entry("log").await.unwrap().unwrap();
        assert_eq!(last.id, ids[3]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn blocking_read_wakes_on_append() {
        let store = MemoryStore::new(StoreMode::Single);
        let mut reader = store.reader().await.unwrap();
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer
                .execute(Command::append("log", None, "hello"))
                .await
                .unwrap();
        });
        let batch = reader
            .read(&[("log".into(), EntryId::ZERO)], 10, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1[0].field("data"), Some("hello"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn blocking_read_times_out_empty() {
        let store = MemoryStore::new(StoreMode::Single);
        let mut reader = store.reader().await.unwrap();
        let batch = reader
            .read(&[("log".into(), EntryId::ZERO)], 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn conditional_delete_spares_a_replaced_value() {
        let store = MemoryStore::new(StoreMode::Single);
        store.set("lock", "b", None).await.unwrap();
        assert!(!store.del_if_equals("lock", "a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
        assert!(store.del_if_equals("lock", "b").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(!store.del_if_equals("lock", "b").await.unwrap());
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new(StoreMode::Single);
        store.set("k", "v", None).await.unwrap();
        let err = store
            .execute(Command::SAdd {
                key: "k".into(),
                member: "m".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
    }
}
