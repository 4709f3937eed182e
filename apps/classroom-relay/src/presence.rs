//! Session presence and host election.
//!
//! The host lock is the single source of truth for who hosts a room. It is only ever
//! created conditionally (a teacher's join) or replaced through an explicit swap, and a
//! session's `is_host` flag is always derived from the lock value it observed.

use classroom_store::{Batch, Command, SetCondition, StoreExt, StoreHandle};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounting::{AttendanceEntry, ClassAccounting};
use crate::error::{RelayError, RelayResult};
use crate::events::{append_json, RoomNotification};
use crate::keys::KeySpace;
use crate::live_state::LiveState;
use crate::metrics;
use crate::scheduler::AttendanceScheduler;
use crate::session::{flag, ContentMarker, Identity, Session, FIELD_IS_HOST, FIELD_STREAM_ID};

/// What a joining client needs to render the room without replaying history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub session: Session,
    pub host_session_id: Option<String>,
    pub content: Option<ContentMarker>,
    pub sfu_address: Option<String>,
}

#[derive(Clone)]
pub struct PresenceEngine {
    store: StoreHandle,
    keys: KeySpace,
    live: LiveState,
    accounting: ClassAccounting,
    scheduler: AttendanceScheduler,
}

impl PresenceEngine {
    pub fn new(
        store: StoreHandle,
        keys: KeySpace,
        live: LiveState,
        accounting: ClassAccounting,
        scheduler: AttendanceScheduler,
    ) -> Self {
        Self {
            store,
            keys,
            live,
            accounting,
            scheduler,
        }
    }

    pub async fn join(&self, identity: &Identity) -> RelayResult<JoinOutcome> {
        identity.validate()?;
        let room_id = identity.room_id.as_str();
        let session_id = identity.session_id.as_str();
        let ttl = self.keys.room_ttl();

        let existing = self.load_session(room_id, session_id).await?;
        let joined_at = match &existing {
            Some(previous) => previous.joined_at,
            None => self.store.time_ms().await?,
        };
        let mut session = Session::from_identity(identity, joined_at);
        if let Some(previous) = existing {
            session.stream_id = previous.stream_id;
            session.trophies = previous.trophies;
        }

        let host_key = self.keys.host_lock(room_id);
        let host_session_id = if identity.is_teacher
            && self
                .store
                .set_if_absent(&host_key, session_id, Some(ttl))
                .await?
        {
            metrics::HOST_ELECTIONS.with_label_values(&["join"]).inc();
            Some(session_id.to_string())
        } else {
            self.store.get(&host_key).await?
        };
        session.is_host = host_session_id.as_deref() == Some(session_id);

        let mut batch = Batch::new(self.store.as_ref());
        let session_key = self.keys.session(room_id, session_id);
        batch.set_fields(&session_key, session.to_fields()).await;
        batch.expire(&session_key, ttl).await;
        let members = self.keys.members(room_id);
        batch.add_member(&members, session_id).await;
        batch.expire(&members, ttl).await;
        let attendees = self.keys.attendees(room_id);
        batch.add_member(&attendees, &identity.user_id).await;
        batch.expire(&attendees, ttl).await;
        batch
            .push(Command::Set {
                key: self.keys.context(room_id),
                value: serde_json::to_string(&identity.room_context())?,
                ttl: Some(ttl),
                condition: SetCondition::IfAbsent,
            })
            .await;
        if session.is_host {
            batch.expire(&host_key, ttl).await;
        }
        append_json(
            &mut batch,
            &self.keys.room_notify(room_id),
            &RoomNotification::Join {
                session: session.clone(),
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        metrics::PRESENCE_EVENTS.with_label_values(&["join"]).inc();

        if let Some(context) = self.accounting.room_context(room_id).await {
            if let Err(err) = self.scheduler.add_schedule(room_id, &context).await {
                warn!(room = %room_id, error = %err, "failed to arm attendance deadline");
            }
        }

        let content = match self.store.get(&self.keys.content(room_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|err| warn!(room = %room_id, error = %err, "cached content is not decodable"))
                .ok(),
            None => None,
        };
        let sfu_address = self.store.get(&self.keys.sfu_address(room_id)).await?;

        info!(
            room = %room_id,
            session = %session_id,
            user = %identity.user_id,
            teacher = identity.is_teacher,
            host = session.is_host,
            "session joined"
        );
        Ok(JoinOutcome {
            session,
            host_session_id,
            content,
            sfu_address,
        })
    }

    /// Explicit host handover requested by a teacher.
    pub async fn set_host(&self, identity: &Identity, next_session_id: &str) -> RelayResult<bool> {
        if !identity.is_teacher {
            return Err(RelayError::Unauthorized("assign the host"));
        }
        self.promote(&identity.room_id, next_session_id).await
    }

    /// Make `next_session_id` the host. Returns `false` when it already was.
    pub async fn promote(&self, room_id: &str, next_session_id: &str) -> RelayResult<bool> {
        let mut target = self
            .load_session(room_id, next_session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound {
                room_id: room_id.to_string(),
                session_id: next_session_id.to_string(),
            })?;
        if !target.is_teacher {
            return Err(RelayError::NotTeacher(next_session_id.to_string()));
        }

        let previous = self
            .store
            .swap(
                &self.keys.host_lock(room_id),
                next_session_id,
                Some(self.keys.room_ttl()),
            )
            .await?;
        if previous.as_deref() == Some(next_session_id) {
            metrics::HOST_ELECTIONS
                .with_label_values(&["unchanged"])
                .inc();
            return Ok(false);
        }
        let previous_session = match previous.as_deref() {
            Some(previous_id) => self.load_session(room_id, previous_id).await?,
            None => None,
        };
        target.is_host = true;
        self.announce_host(room_id, &target, previous.as_deref(), previous_session)
            .await?;

        metrics::HOST_ELECTIONS.with_label_values(&["changed"]).inc();
        info!(room = %room_id, host = %target.id, previous = ?previous, "host changed");
        Ok(true)
    }

    /// Write the host flags and notify the room once the lock names `target`.
    async fn announce_host(
        &self,
        room_id: &str,
        target: &Session,
        previous_id: Option<&str>,
        previous_session: Option<Session>,
    ) -> RelayResult<()> {
        let notify = self.keys.room_notify(room_id);
        let mut batch = Batch::new(self.store.as_ref());
        batch
            .set_fields(
                &self.keys.session(room_id, &target.id),
                vec![(FIELD_IS_HOST.to_string(), flag(true))],
            )
            .await;
        if let Some(mut demoted) = previous_session {
            demoted.is_host = false;
            batch
                .set_fields(
                    &self.keys.session(room_id, &demoted.id),
                    vec![(FIELD_IS_HOST.to_string(), flag(false))],
                )
                .await;
            append_json(&mut batch, &notify, &RoomNotification::Join { session: demoted }).await?;
        }
        self.live
            .reset_whiteboard_permissions(&mut batch, room_id)
            .await?;
        append_json(
            &mut batch,
            &notify,
            &RoomNotification::Join {
                session: target.clone(),
            },
        )
        .await?;
        append_json(
            &mut batch,
            &notify,
            &RoomNotification::Host {
                session_id: target.id.clone(),
                previous_session_id: previous_id.map(str::to_string),
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        Ok(())
    }

    /// Remove a session. Unknown sessions are ignored.
    pub async fn leave(&self, room_id: &str, session_id: &str) -> RelayResult<()> {
        let Some(session) = self.load_session(room_id, session_id).await? else {
            debug!(room = %room_id, session = %session_id, "leave for unknown session");
            return Ok(());
        };
        let left_at = self.store.time_ms().await?;
        self.accounting
            .log_attendance(AttendanceEntry::for_session(room_id, &session, left_at))
            .await;

        let mut batch = Batch::new(self.store.as_ref());
        batch.delete(&self.keys.session(room_id, session_id)).await;
        batch
            .remove_member(&self.keys.members(room_id), session_id)
            .await;
        append_json(
            &mut batch,
            &self.keys.room_notify(room_id),
            &RoomNotification::Leave {
                session_id: session.id.clone(),
                user_id: session.user_id.clone(),
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        // Only the session the lock still names may vacate it; a concurrent handover wins.
        let was_host = self
            .store
            .del_if_equals(&self.keys.host_lock(room_id), session_id)
            .await?;
        metrics::PRESENCE_EVENTS.with_label_values(&["leave"]).inc();
        info!(room = %room_id, session = %session_id, host = was_host, "session left");

        if was_host {
            self.elect_successor(room_id).await?;
        }

        let Some(context) = self.accounting.room_context(room_id).await else {
            return Ok(());
        };
        let policy = context.class_type.policy();
        let submit = policy.submit_on_leave
            || (policy.submit_on_empty && self.roster(room_id).await?.is_empty());
        if submit {
            self.accounting.submit_room(room_id).await;
        }
        Ok(())
    }

    /// Claim a vacant host lock for the longest-present remaining teacher. Returns the
    /// room's host afterwards; a host that took the lock in the meantime is kept.
    pub async fn elect_successor(&self, room_id: &str) -> RelayResult<Option<String>> {
        let successor = self
            .roster(room_id)
            .await?
            .into_iter()
            .filter(|session| session.is_teacher)
            .min_by(|a, b| (a.joined_at, &a.id).cmp(&(b.joined_at, &b.id)));
        match successor {
            Some(mut next) => {
                let host_key = self.keys.host_lock(room_id);
                if !self
                    .store
                    .set_if_absent(&host_key, &next.id, Some(self.keys.room_ttl()))
                    .await?
                {
                    let current = self.store.get(&host_key).await?;
                    debug!(room = %room_id, host = ?current, "host lock already claimed");
                    return Ok(current);
                }
                next.is_host = true;
                self.announce_host(room_id, &next, None, None).await?;
                metrics::HOST_ELECTIONS.with_label_values(&["failover"]).inc();
                info!(room = %room_id, host = %next.id, "host failed over");
                Ok(Some(next.id))
            }
            None => {
                metrics::HOST_ELECTIONS.with_label_values(&["vacant"]).inc();
                info!(room = %room_id, "no teacher left; room has no host");
                Ok(None)
            }
        }
    }

    /// End the class for everyone. Returns how many sessions were removed.
    pub async fn end_class(&self, identity: &Identity) -> RelayResult<usize> {
        identity.validate()?;
        if !identity.is_teacher {
            return Err(RelayError::Unauthorized("end the class"));
        }
        let room_id = identity.room_id.as_str();
        let sessions = self.roster(room_id).await?;
        let left_at = self.store.time_ms().await?;
        for session in &sessions {
            self.accounting
                .log_attendance(AttendanceEntry::for_session(room_id, session, left_at))
                .await;
        }

        let notify = self.keys.room_notify(room_id);
        let members = self.keys.members(room_id);
        let mut batch = Batch::new(self.store.as_ref());
        batch.delete(&self.keys.host_lock(room_id)).await;
        for session in &sessions {
            batch.delete(&self.keys.session(room_id, &session.id)).await;
            batch.remove_member(&members, &session.id).await;
            append_json(
                &mut batch,
                &notify,
                &RoomNotification::Leave {
                    session_id: session.id.clone(),
                    user_id: session.user_id.clone(),
                },
            )
            .await?;
        }
        batch.commit().await.into_result()?;

        if let Err(err) = self.scheduler.cancel(room_id).await {
            warn!(room = %room_id, error = %err, "failed to clear attendance deadline");
        }
        self.accounting.submit_room(room_id).await;
        info!(room = %room_id, sessions = sessions.len(), by = %identity.session_id, "class ended");
        Ok(sessions.len())
    }

    /// Record the media stream a session publishes and announce it.
    pub async fn set_stream_id(&self, identity: &Identity, stream_id: &str) -> RelayResult<Session> {
        let room_id = identity.room_id.as_str();
        let mut session = self
            .load_session(room_id, &identity.session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound {
                room_id: room_id.to_string(),
                session_id: identity.session_id.clone(),
            })?;
        session.stream_id = Some(stream_id.to_string());

        let mut batch = Batch::new(self.store.as_ref());
        batch
            .set_fields(
                &self.keys.session(room_id, &session.id),
                vec![(FIELD_STREAM_ID.to_string(), stream_id.to_string())],
            )
            .await;
        append_json(
            &mut batch,
            &self.keys.room_notify(room_id),
            &RoomNotification::Join {
                session: session.clone(),
            },
        )
        .await?;
        batch.commit().await.into_result()?;
        Ok(session)
    }

    /// Current members ordered by join time. Members whose session expired are dropped.
    pub async fn roster(&self, room_id: &str) -> RelayResult<Vec<Session>> {
        let members = self.keys.members(room_id);
        let mut sessions = Vec::new();
        for session_id in self.store.smembers(&members).await? {
            match self.load_session(room_id, &session_id).await? {
                Some(session) => sessions.push(session),
                None => {
                    debug!(room = %room_id, session = %session_id, "dropping stale member");
                    self.store
                        .execute(Command::SRem {
                            key: members.clone(),
                            member: session_id,
                        })
                        .await?;
                }
            }
        }
        sessions.sort_by(|a, b| (a.joined_at, &a.id).cmp(&(b.joined_at, &b.id)));
        Ok(sessions)
    }

    pub async fn load_session(&self, room_id: &str, session_id: &str) -> RelayResult<Option<Session>> {
        let fields = self
            .store
            .hgetall(&self.keys.session(room_id, session_id))
            .await?;
        Ok(Session::from_fields(&fields))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use classroom_store::{MemoryStore, Reply, Store, StoreError, StoreMode, StreamReader};

    use super::*;
    use crate::accounting::InMemoryAccounting;
    use crate::session::ClassType;
    use crate::state::testing::{identity, relay, settings, TestRelay};
    use crate::state::Relay;

    /// Yields to the scheduler before every command, like a network round trip would.
    struct RoundTripStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for RoundTripStore {
        fn mode(&self) -> StoreMode {
            self.inner.mode()
        }

        async fn execute(&self, command: Command) -> Result<Reply, StoreError> {
            tokio::task::yield_now().await;
            self.inner.execute(command).await
        }

        async fn execute_atomic(&self, commands: Vec<Command>) -> Vec<Result<Reply, StoreError>> {
            tokio::task::yield_now().await;
            self.inner.execute_atomic(commands).await
        }

        async fn reader(&self) -> Result<Box<dyn StreamReader>, StoreError> {
            self.inner.reader().await
        }
    }

    fn host_of(outcome: &JoinOutcome) -> Option<&str> {
        outcome.host_session_id.as_deref()
    }

    async fn host_lock(t: &TestRelay, room: &str) -> Option<String> {
        t.store
            .get(&KeySpace::new(Duration::from_secs(60)).host_lock(room))
            .await
            .unwrap()
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn teacher_then_student_join() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let teacher = t.relay.presence.join(&identity("t1", true)).await?;
        assert!(teacher.session.is_host);
        assert_eq!(host_of(&teacher), Some("t1"));

        let student = t.relay.presence.join(&identity("s1", false)).await?;
        assert!(!student.session.is_host);
        assert_eq!(host_of(&student), Some("t1"));

        let roster = t.relay.presence.roster("room-1").await?;
        assert_eq!(roster.len(), 2);
        assert_eq!(t.store.log_len(&t.keys.room_notify("room-1").key), 2);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn concurrent_teacher_joins_elect_one_host() -> anyhow::Result<()> {
        let t = relay(StoreMode::Cluster);
        let presence = t.relay.presence.clone();
        let (t1, t2, t3) = (identity("t1", true), identity("t2", true), identity("t3", true));
        let (a, b, c) = tokio::join!(presence.join(&t1), presence.join(&t2), presence.join(&t3));
        let hosts = [a?, b?, c?]
            .iter()
            .filter(|outcome| outcome.session.is_host)
            .count();
        assert_eq!(hosts, 1);

        let flagged = t
            .relay
            .presence
            .roster("room-1")
            .await?
            .into_iter()
            .filter(|s| s.is_host)
            .count();
        assert_eq!(flagged, 1);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn host_fails_over_to_earliest_teacher() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        t.store.set_clock(1_000);
        t.relay.presence.join(&identity("t1", true)).await?;
        t.store.set_clock(2_000);
        t.relay.presence.join(&identity("t3", true)).await?;
        t.relay.presence.join(&identity("t2", true)).await?;
        t.store.set_clock(3_000);
        t.relay.presence.join(&identity("s1", false)).await?;

        t.relay.presence.leave("room-1", "t1").await?;
        assert_eq!(host_lock(&t, "room-1").await.as_deref(), Some("t2"));
        let t2 = t.relay.presence.load_session("room-1", "t2").await?;
        assert!(t2.is_some_and(|s| s.is_host));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn handover_racing_the_host_leave_keeps_one_host() -> anyhow::Result<()> {
        let memory = MemoryStore::new(StoreMode::Single);
        let relay = Relay::new(
            Arc::new(RoundTripStore {
                inner: memory.clone(),
            }),
            InMemoryAccounting::new(),
            &settings(),
        );
        let presence = &relay.presence;
        memory.set_clock(1_000);
        let t1 = identity("t1", true);
        presence.join(&t1).await?;
        memory.set_clock(2_000);
        presence.join(&identity("t3", true)).await?;
        memory.set_clock(3_000);
        presence.join(&identity("t2", true)).await?;

        let handover = async {
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            presence.set_host(&t1, "t2").await
        };
        let (handed, left) = tokio::join!(handover, presence.leave("room-1", "t1"));
        handed?;
        left?;

        let lock = memory
            .get(&KeySpace::new(Duration::from_secs(60)).host_lock("room-1"))
            .await?;
        let flagged: Vec<String> = presence
            .roster("room-1")
            .await?
            .into_iter()
            .filter(|s| s.is_host)
            .map(|s| s.id)
            .collect();
        assert_eq!(flagged.len(), 1, "flagged hosts: {flagged:?}");
        assert_eq!(lock.as_deref(), Some(flagged[0].as_str()));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn leaving_former_host_does_not_release_the_new_lock() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let t1 = identity("t1", true);
        t.relay.presence.join(&t1).await?;
        t.relay.presence.join(&identity("t2", true)).await?;
        t.relay.presence.set_host(&t1, "t2").await?;

        t.relay.presence.leave("room-1", "t1").await?;
        assert_eq!(host_lock(&t, "room-1").await.as_deref(), Some("t2"));
        let t2 = t.relay.presence.load_session("room-1", "t2").await?;
        assert!(t2.is_some_and(|s| s.is_host));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn earlier_teacher_rejoining_does_not_reclaim_host() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        t.store.set_clock(1_000);
        t.relay.presence.join(&identity("t1", true)).await?;
        t.store.set_clock(2_000);
        t.relay.presence.join(&identity("t2", true)).await?;

        t.relay.presence.leave("room-1", "t1").await?;
        assert_eq!(host_lock(&t, "room-1").await.as_deref(), Some("t2"));

        t.store.set_clock(3_000);
        let back = t.relay.presence.join(&identity("t1", true)).await?;
        assert!(!back.session.is_host);
        assert_eq!(host_of(&back), Some("t2"));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn last_teacher_leaving_leaves_room_hostless() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        t.relay.presence.join(&identity("t1", true)).await?;
        t.relay.presence.join(&identity("s1", false)).await?;
        t.relay.presence.leave("room-1", "t1").await?;
        assert_eq!(host_lock(&t, "room-1").await, None);

        let late = t.relay.presence.join(&identity("t2", true)).await?;
        assert!(late.session.is_host);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn set_host_to_current_host_is_a_no_op() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let teacher = identity("t1", true);
        t.relay.presence.join(&teacher).await?;
        t.relay.presence.join(&identity("t2", true)).await?;
        let notify = t.keys.room_notify("room-1").key;
        let before = t.store.log_len(&notify);

        assert!(!t.relay.presence.set_host(&teacher, "t1").await?);
        assert_eq!(t.store.log_len(&notify), before);

        assert!(t.relay.presence.set_host(&teacher, "t2").await?);
        // demoted join, promoted join, host
        assert_eq!(t.store.log_len(&notify), before + 3);
        let t1 = t.relay.presence.load_session("room-1", "t1").await?;
        assert!(t1.is_some_and(|s| !s.is_host));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn set_host_rejects_students_on_both_ends() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let teacher = identity("t1", true);
        let student = identity("s1", false);
        t.relay.presence.join(&teacher).await?;
        t.relay.presence.join(&student).await?;

        let err = t.relay.presence.set_host(&student, "s1").await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));
        let err = t.relay.presence.set_host(&teacher, "s1").await.unwrap_err();
        assert!(matches!(err, RelayError::NotTeacher(_)));
        let err = t.relay.presence.set_host(&teacher, "ghost").await.unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound { .. }));
        assert_eq!(host_lock(&t, "room-1").await.as_deref(), Some("t1"));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn leave_is_idempotent_and_logs_attendance_once() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        t.relay.presence.join(&identity("s1", false)).await?;
        t.relay.presence.leave("room-1", "s1").await?;
        t.relay.presence.leave("room-1", "s1").await?;
        t.relay.presence.leave("room-1", "never-joined").await?;

        let attendance = t.accounting.attendance();
        assert_eq!(attendance.len(), 1);
        assert_eq!(attendance[0].session_id, "s1");
        assert!(t.relay.presence.roster("room-1").await?.is_empty());
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn end_class_requires_teacher_and_clears_room() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let teacher = identity("t1", true);
        let student = identity("s1", false);
        t.relay.presence.join(&teacher).await?;
        t.relay.presence.join(&student).await?;

        let err = t.relay.presence.end_class(&student).await.unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));
        assert_eq!(t.relay.presence.roster("room-1").await?.len(), 2);
        assert!(t.accounting.submissions().is_empty());

        assert_eq!(t.relay.presence.end_class(&teacher).await?, 2);
        assert!(t.relay.presence.roster("room-1").await?.is_empty());
        assert_eq!(host_lock(&t, "room-1").await, None);
        assert_eq!(t.accounting.attendance().len(), 2);
        let submissions = t.accounting.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].participant_user_ids.len(), 2);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn class_type_decides_when_accounting_fires() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let mut first = identity("s1", false);
        first.room_id = "drop-in".into();
        first.class_type = ClassType::DropIn;
        let mut second = first.clone();
        second.session_id = "s2".into();
        t.relay.presence.join(&first).await?;
        t.relay.presence.join(&second).await?;
        t.relay.presence.leave("drop-in", "s1").await?;
        assert!(t.accounting.submissions().is_empty());
        t.relay.presence.leave("drop-in", "s2").await?;
        assert_eq!(t.accounting.submissions().len(), 1);

        let mut solo = identity("s9", false);
        solo.room_id = "study".into();
        solo.class_type = ClassType::SelfPaced;
        t.relay.presence.join(&solo).await?;
        t.relay.presence.leave("study", "s9").await?;
        assert_eq!(t.accounting.submissions().len(), 2);
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn each_submission_reports_only_its_own_attendees() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let mut first = identity("s1", false);
        first.class_type = ClassType::DropIn;
        let mut second = first.clone();
        second.session_id = "s2".into();
        second.user_id = "user-s2".into();

        t.relay.presence.join(&first).await?;
        t.relay.presence.leave("room-1", "s1").await?;
        t.relay.presence.join(&second).await?;
        t.relay.presence.leave("room-1", "s2").await?;

        let reported: Vec<Vec<String>> = t
            .accounting
            .submissions()
            .into_iter()
            .map(|s| s.participant_user_ids)
            .collect();
        assert_eq!(
            reported,
            vec![vec!["user-s1".to_string()], vec!["user-s2".to_string()]]
        );
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn accounting_outage_does_not_block_leave() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        t.accounting.set_unavailable(true);
        t.relay.presence.join(&identity("s1", false)).await?;
        t.relay.presence.leave("room-1", "s1").await?;
        assert!(t.relay.presence.roster("room-1").await?.is_empty());
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn join_rejects_missing_ids() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let mut anonymous = identity("s1", false);
        anonymous.user_id = " ".into();
        let err = t.relay.presence.join(&anonymous).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingField(_)));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn stream_id_is_recorded_and_announced() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        let student = identity("s1", false);
        t.relay.presence.join(&student).await?;
        let session = t.relay.presence.set_stream_id(&student, "cam-7").await?;
        assert_eq!(session.stream_id.as_deref(), Some("cam-7"));

        let rejoined = t.relay.presence.join(&student).await?;
        assert_eq!(rejoined.session.stream_id.as_deref(), Some("cam-7"));
        Ok(())
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn scheduled_join_arms_the_deadline() -> anyhow::Result<()> {
        let t = relay(StoreMode::Single);
        t.store.set_clock(10_000);
        let mut teacher = identity("t1", true);
        teacher.scheduled_end_at = Some(20_000);
        t.relay.presence.join(&teacher).await?;

        let pending = t
            .store
            .execute(Command::ZRangeByScore {
                key: t.keys.pending_attendance(),
                max: i64::MAX,
            })
            .await?
            .into_members()?;
        assert_eq!(pending, vec!["room-1".to_string()]);
        Ok(())
    }
}
