use std::time::Duration;

use classroom_store::{Command, StoreExt, StoreHandle};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accounting::ClassAccounting;
use crate::error::RelayResult;
use crate::keys::KeySpace;
use crate::metrics;
use crate::session::RoomContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another instance holds the sweep lock.
    Skipped,
    /// Rooms whose deadline had passed and were submitted.
    Fired(Vec<String>),
}

/// Submits class accounting once a scheduled room's deadline passes.
///
/// Deadlines live in one sorted set shared by every relay instance; a short-lived lock
/// keeps concurrent sweeps from submitting the same room twice.
#[derive(Clone)]
pub struct AttendanceScheduler {
    store: StoreHandle,
    keys: KeySpace,
    accounting: ClassAccounting,
    instance_id: String,
    grace: Duration,
    lock_ttl: Duration,
}

impl AttendanceScheduler {
    pub fn new(
        store: StoreHandle,
        keys: KeySpace,
        accounting: ClassAccounting,
        instance_id: String,
        grace: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            accounting,
            instance_id,
            grace,
            lock_ttl,
        }
    }

    /// Register the room's deadline. Returns whether a new entry was added.
    pub async fn add_schedule(&self, room_id: &str, context: &RoomContext) -> RelayResult<bool> {
        if !context.class_type.policy().arm_deadline {
            return Ok(false);
        }
        let Some(end) = context.scheduled_end_at else {
            debug!(room = %room_id, "scheduled class without an end time");
            return Ok(false);
        };
        let deadline = end + self.grace.as_millis() as i64;
        let now = self.store.time_ms().await?;
        if deadline <= now {
            debug!(room = %room_id, deadline, now, "deadline already passed; not scheduling");
            return Ok(false);
        }
        let added = self
            .store
            .execute(Command::ZAdd {
                key: self.keys.pending_attendance(),
                member: room_id.to_string(),
                score: deadline,
                only_new: true,
            })
            .await?
            .into_int()?;
        if added > 0 {
            debug!(room = %room_id, deadline, "attendance deadline armed");
        }
        Ok(added > 0)
    }

    /// Drop a room's pending deadline, e.g. after the class was ended explicitly.
    pub async fn cancel(&self, room_id: &str) -> RelayResult<()> {
        self.store
            .execute(Command::ZRem {
                key: self.keys.pending_attendance(),
                member: room_id.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn sweep(&self) -> RelayResult<SweepOutcome> {
        let lock = self.keys.sweep_lock();
        if !self
            .store
            .set_if_absent(&lock, &self.instance_id, Some(self.lock_ttl))
            .await?
        {
            metrics::SWEEPS.with_label_values(&["skipped"]).inc();
            return Ok(SweepOutcome::Skipped);
        }

        let fired = self.fire_due().await;
        self.release(&lock).await;
        let fired = fired?;
        metrics::SWEEPS.with_label_values(&["fired"]).inc();
        Ok(SweepOutcome::Fired(fired))
    }

    async fn fire_due(&self) -> RelayResult<Vec<String>> {
        let now = self.store.time_ms().await?;
        let due = self
            .store
            .execute(Command::ZRangeByScore {
                key: self.keys.pending_attendance(),
                max: now,
            })
            .await?
            .into_members()?;
        for room_id in &due {
            self.accounting.submit_room(room_id).await;
            self.cancel(room_id).await?;
        }
        Ok(due)
    }

    async fn release(&self, lock: &str) {
        match self.store.del_if_equals(lock, &self.instance_id).await {
            Ok(true) => {}
            Ok(false) => debug!("sweep lock expired before release"),
            Err(err) => warn!(error = %err, "failed to release sweep lock"),
        }
    }

    pub fn spawn(&self, interval: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match scheduler.sweep().await {
                    Ok(SweepOutcome::Fired(rooms)) if !rooms.is_empty() => {
                        info!(rooms = rooms.len(), "attendance deadlines fired");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        metrics::SWEEPS.with_label_values(&["error"]).inc();
                        warn!(error = %err, "attendance sweep failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use classroom_store::{MemoryStore, StoreMode};

    use super::*;
    use crate::accounting::InMemoryAccounting;
    use crate::session::ClassType;

    const NOW: u64 = 1_000_000;

    fn scheduler(
        store: &MemoryStore,
        sink: Arc<InMemoryAccounting>,
        instance: &str,
    ) -> AttendanceScheduler {
        let handle: StoreHandle = Arc::new(store.clone());
        let keys = KeySpace::new(Duration::from_secs(600));
        let accounting = ClassAccounting::new(handle.clone(), keys.clone(), sink);
        AttendanceScheduler::new(
            handle,
            keys,
            accounting,
            instance.to_string(),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    fn scheduled(end: i64) -> RoomContext {
        RoomContext {
            class_type: ClassType::Scheduled,
            scheduled_start_at: None,
            scheduled_end_at: Some(end),
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn sweep_fires_only_due_rooms() -> anyhow::Result<()> {
        let store = MemoryStore::new(StoreMode::Single);
        store.set_clock(NOW);
        let sink = InMemoryAccounting::new();
        let scheduler = scheduler(&store, sink.clone(), "relay-a");

        let end = NOW as i64 + 1_000;
        assert!(scheduler.add_schedule("early-1", &scheduled(end)).await?);
        assert!(scheduler.add_schedule("early-2", &scheduled(end)).await?);
        assert!(
            scheduler
                .add_schedule("late", &scheduled(end + 3_600_000))
                .await?
        );

        store.advance_clock(Duration::from_secs(120));
        match scheduler.sweep().await? {
            SweepOutcome::Fired(mut rooms) => {
                rooms.sort();
                assert_eq!(rooms, vec!["early-1".to_string(), "early-2".to_string()]);
            }
            other => panic!("expected a sweep, got {other:?}"),
        }
        let submitted: Vec<String> = sink.submissions().into_iter().map(|s| s.room_id).collect();
        assert_eq!(submitted.len(), 2);
        assert!(!submitted.contains(&"late".to_string()));

        assert_eq!(scheduler.sweep().await?, SweepOutcome::Fired(Vec::new()));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn deadline_is_armed_once_and_never_in_the_past() -> anyhow::Result<()> {
        let store = MemoryStore::new(StoreMode::Single);
        store.set_clock(NOW);
        let scheduler = scheduler(&store, InMemoryAccounting::new(), "relay-a");

        assert!(!scheduler.add_schedule("gone", &scheduled(NOW as i64 - 120_000)).await?);
        assert!(scheduler.add_schedule("r", &scheduled(NOW as i64)).await?);
        assert!(!scheduler.add_schedule("r", &scheduled(NOW as i64 + 5_000)).await?);

        let drop_in = RoomContext {
            class_type: ClassType::DropIn,
            scheduled_start_at: None,
            scheduled_end_at: Some(NOW as i64 + 5_000),
        };
        assert!(!scheduler.add_schedule("d", &drop_in).await?);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn held_lock_skips_other_instances() -> anyhow::Result<()> {
        let store = MemoryStore::new(StoreMode::Single);
        store.set_clock(NOW);
        let sink = InMemoryAccounting::new();
        let a = scheduler(&store, sink.clone(), "relay-a");
        let b = scheduler(&store, sink.clone(), "relay-b");
        a.add_schedule("r", &scheduled(NOW as i64)).await?;
        store.advance_clock(Duration::from_secs(120));

        let lock = KeySpace::new(Duration::from_secs(600)).sweep_lock();
        store.set(&lock, "relay-a", Some(Duration::from_secs(30))).await?;
        assert_eq!(b.sweep().await?, SweepOutcome::Skipped);
        assert!(sink.submissions().is_empty());

        store.del(&lock).await?;
        assert_eq!(b.sweep().await?, SweepOutcome::Fired(vec!["r".to_string()]));
        assert_eq!(store.get(&lock).await?, None);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn release_leaves_a_lock_taken_over_by_another_instance() -> anyhow::Result<()> {
        let store = MemoryStore::new(StoreMode::Single);
        let a = scheduler(&store, InMemoryAccounting::new(), "relay-a");
        let lock = KeySpace::new(Duration::from_secs(600)).sweep_lock();

        store.set(&lock, "relay-b", Some(Duration::from_secs(30))).await?;
        a.release(&lock).await;
        assert_eq!(store.get(&lock).await?.as_deref(), Some("relay-b"));

        store.set(&lock, "relay-a", Some(Duration::from_secs(30))).await?;
        a.release(&lock).await;
        assert_eq!(store.get(&lock).await?, None);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn failing_accounting_still_clears_the_room() -> anyhow::Result<()> {
        let store = MemoryStore::new(StoreMode::Cluster);
        store.set_clock(NOW);
        let sink = InMemoryAccounting::new();
        sink.set_unavailable(true);
        let scheduler = scheduler(&store, sink, "relay-a");
        scheduler.add_schedule("r", &scheduled(NOW as i64)).await?;
        store.advance_clock(Duration::from_secs(120));

        assert_eq!(scheduler.sweep().await?, SweepOutcome::Fired(vec!["r".to_string()]));
        assert_eq!(scheduler.sweep().await?, SweepOutcome::Fired(Vec::new()));
        Ok(())
    }
}
