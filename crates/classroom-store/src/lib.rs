//! Storage seam for the classroom relay.
//!
//! Everything the relay persists goes through [`Store`]: point-in-time values (session
//! hashes, locks, cached addresses) and append-only logs. Two adapters exist: the
//! in-memory [`MemoryStore`] used by tests and local wiring, and the Redis adapter that
//! lives in the relay app. [`Batch`] layers the node-vs-cluster batching rules on top.

mod batch;
mod command;
mod entry;
mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use batch::{Batch, BatchReport};
pub use command::{Command, Reply, SetCondition, DATA_FIELD};
pub use entry::{EntryId, ParseEntryIdError, StreamEntry};
pub use memory::MemoryStore;

/// Deployment shape of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// One addressable node; a batch travels as one atomic round trip.
    Single,
    /// Sharded deployment; multi-key batches degrade to per-command execution.
    Cluster,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("wrong value type at key {0}")]
    WrongType(String),
    #[error("unexpected {command} reply: {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },
    #[error(transparent)]
    InvalidEntryId(#[from] ParseEntryIdError),
    #[error("batch partially applied ({applied} applied, {failed} failed): {first}")]
    PartialBatch {
        applied: usize,
        failed: usize,
        first: Box<StoreError>,
    },
}

/// Entries returned by a blocking read, grouped by log key.
pub type ReadBatch = Vec<(String, Vec<StreamEntry>)>;

#[async_trait]
pub trait Store: Send + Sync {
    fn mode(&self) -> StoreMode;

    async fn execute(&self, command: Command) -> Result<Reply, StoreError>;

    /// Run every command in one round trip. One result per command, in order.
    async fn execute_atomic(&self, commands: Vec<Command>) -> Vec<Result<Reply, StoreError>>;

    /// Open a dedicated connection for blocking reads so long polls never stall the
    /// shared command connection.
    async fn reader(&self) -> Result<Box<dyn StreamReader>, StoreError>;
}

pub type StoreHandle = Arc<dyn Store>;

#[async_trait]
pub trait StreamReader: Send {
    /// Read entries strictly after each cursor, waiting up to `block` when none are
    /// available yet. An empty result means the wait elapsed.
    async fn read(
        &mut self,
        cursors: &[(String, EntryId)],
        count: usize,
        block: Duration,
    ) -> Result<ReadBatch, StoreError>;

    /// Run a plain command on the reader's own connection.
    async fn execute(&mut self, command: Command) -> Result<Reply, StoreError>;
}

/// Typed shortcuts over [`Store::execute`].
#[async_trait]
pub trait StoreExt: Store {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.execute(Command::Get { key: key.into() }).await?.into_text()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.execute(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
            condition: SetCondition::Always,
        })
        .await?;
        Ok(())
    }

    /// Create `key` only when absent. Returns whether this call created it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let reply = self
            .execute(Command::Set {
                key: key.into(),
                value: value.into(),
                ttl,
                condition: SetCondition::IfAbsent,
            })
            .await?;
        Ok(reply.was_applied())
    }

    async fn swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<String>, StoreError> {
        self.execute(Command::Swap {
            key: key.into(),
            value: value.into(),
            ttl,
        })
        .await?
        .into_text()
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.execute(Command::Del { key: key.into() }).await?.into_int()?;
        Ok(removed > 0)
    }

    /// Delete `key` only while it still holds `value`. Returns whether it was removed.
    async fn del_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let removed = self
            .execute(Command::DelIfEquals {
                key: key.into(),
                value: value.into(),
            })
            .await?
            .into_int()?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.execute(Command::HGetAll { key: key.into() })
            .await?
            .into_fields()
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.execute(Command::SMembers { key: key.into() })
            .await?
            .into_members()
    }

    /// Drain a set: its members are returned and the set is gone afterwards.
    async fn take_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.execute(Command::TakeMembers { key: key.into() })
            .await?
            .into_members()
    }

    async fn last_entry(&self, key: &str) -> Result<Option<StreamEntry>, StoreError> {
        let mut entries = self
            .execute(Command::XLast { key: key.into() })
            .await?
            .into_entries()?;
        Ok(entries.pop())
    }

    async fn time_ms(&self) -> Result<i64, StoreError> {
        self.execute(Command::Time).await?.into_int()
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
