use std::time::Duration;

use crate::{Command, Reply, SetCondition, Store, StoreError, StoreMode};

/// Groups related writes.
///
/// On a single node the queued commands go out as one atomic round trip at
/// [`Batch::commit`]. Against a cluster, atomic multi-key batches are restricted to one
/// shard, so every command runs the moment it is pushed and the batch only collects the
/// outcomes. Callers must tolerate partial application in that mode; the report says
/// exactly which commands landed.
pub enum Batch<'a> {
    Atomic {
        store: &'a dyn Store,
        queued: Vec<Command>,
    },
    Sequential {
        store: &'a dyn Store,
        results: Vec<Result<Reply, StoreError>>,
    },
}

impl<'a> Batch<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        match store.mode() {
            StoreMode::Single => Batch::Atomic {
                store,
                queued: Vec::new(),
            },
            StoreMode::Cluster => Batch::Sequential {
                store,
                results: Vec::new(),
            },
        }
    }

    pub fn mode(&self) -> StoreMode {
        match self {
            Batch::Atomic { .. } => StoreMode::Single,
            Batch::Sequential { .. } => StoreMode::Cluster,
        }
    }

    pub async fn push(&mut self, command: Command) {
        match self {
            Batch::Atomic { queued, .. } => queued.push(command),
            Batch::Sequential { store, results } => {
                let result = store.execute(command).await;
                if let Err(err) = &result {
                    tracing::debug!(error = %err, "sequential batch command failed");
                }
                results.push(result);
            }
        }
    }

    pub async fn append(&mut self, key: &str, max_len: Option<usize>, data: String) {
        self.push(Command::append(key, max_len, data)).await;
    }

    pub async fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        self.push(Command::Set {
            key: key.into(),
            value,
            ttl,
            condition: SetCondition::Always,
        })
        .await;
    }

    pub async fn delete(&mut self, key: &str) {
        self.push(Command::Del { key: key.into() }).await;
    }

    pub async fn set_fields(&mut self, key: &str, fields: Vec<(String, String)>) {
        self.push(Command::HSet {
            key: key.into(),
            fields,
        })
        .await;
    }

    pub async fn add_member(&mut self, key: &str, member: &str) {
        self.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        })
        .await;
    }

    pub async fn remove_member(&mut self, key: &str, member: &str) {
        self.push(Command::SRem {
            key: key.into(),
            member: member.into(),
        })
        .await;
    }

    pub async fn expire(&mut self, key: &str, ttl: Duration) {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
        .await;
    }

    pub async fn commit(self) -> BatchReport {
        match self {
            Batch::Atomic { queued, .. } if queued.is_empty() => BatchReport::default(),
            Batch::Atomic { store, queued } => BatchReport {
                results: store.execute_atomic(queued).await,
            },
            Batch::Sequential { results, .. } => BatchReport { results },
        }
    }
}

/// Per-command outcome of a committed [`Batch`].
#[derive(Debug, Default)]
pub struct BatchReport {
    results: Vec<Result<Reply, StoreError>>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn applied(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// Index and error of every command that did not apply.
    pub fn failures(&self) -> Vec<(usize, &StoreError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(idx, result)| result.as_ref().err().map(|err| (idx, err)))
            .collect()
    }

    pub fn results(&self) -> &[Result<Reply, StoreError>] {
        &self.results
    }

    /// All replies, or a [`StoreError::PartialBatch`] describing what went wrong.
    pub fn into_result(self) -> Result<Vec<Reply>, StoreError> {
        let applied = self.applied();
        let failed = self.results.len() - applied;
        let mut replies = Vec::with_capacity(applied);
        let mut first = None;
        for result in self.results {
            match result {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    first.get_or_insert(err);
                }
            }
        }
        match first {
            None => Ok(replies),
            Some(first) => Err(StoreError::PartialBatch {
                applied,
                failed,
                first: Box::new(first),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, StoreExt};

    #[tokio::test]
    async fn single_node_batch_defers_until_commit() {
        let store = MemoryStore::new(StoreMode::Single);
        let mut batch = Batch::new(&store);
        assert_eq!(batch.mode(), StoreMode::Single);
        batch.set("a", "1".into(), None).await;
        batch.add_member("members", "a").await;

        assert_eq!(store.get("a").await.unwrap(), None);

        let report = batch.commit().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report.applied(), 2);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn cluster_batch_applies_each_command_immediately() {
        let store = MemoryStore::new(StoreMode::Cluster);
        let mut batch = Batch::new(&store);
        assert_eq!(batch.mode(), StoreMode::Cluster);
        batch.set("a", "1".into(), None).await;

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(batch.commit().await.applied(), 1);
    }

    #[tokio::test]
    async fn cluster_batch_reports_partial_application() {
        let store = MemoryStore::new(StoreMode::Cluster);
        store.fail_key("broken");

        let mut batch = Batch::new(&store);
        batch.set("first", "1".into(), None).await;
        batch.set("broken", "2".into(), None).await;
        batch.set("last", "3".into(), None).await;
        let report = batch.commit().await;

        assert_eq!(report.applied(), 2);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 1);
        assert_eq!(store.get("first").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("last").await.unwrap().as_deref(), Some("3"));

        match report.into_result() {
            Err(StoreError::PartialBatch {
                applied, failed, ..
            }) => {
                assert_eq!(applied, 2);
                assert_eq!(failed, 1);
            }
            other => panic!("expected partial batch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_atomic_batch_skips_round_trip() {
        let store = MemoryStore::new(StoreMode::Single);
        let report = Batch::new(&store).commit().await;
        assert!(report.is_empty());
        assert!(report.into_result().unwrap().is_empty());
    }
}
