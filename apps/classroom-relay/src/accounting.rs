//! Boundary to the external accounting collaborator.
//!
//! Attendance entries and end-of-class submissions are handed over by value. The relay
//! never persists them itself, and a failing collaborator is logged, never surfaced to
//! the caller.

use std::sync::Arc;

use async_trait::async_trait;
use classroom_store::{StoreExt, StoreHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::keys::KeySpace;
use crate::metrics;
use crate::session::{ClassType, RoomContext, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    pub room_id: String,
    pub session_id: String,
    pub user_id: String,
    pub is_teacher: bool,
    pub joined_at: i64,
    pub left_at: i64,
}

impl AttendanceEntry {
    pub fn for_session(room_id: &str, session: &Session, left_at: i64) -> Self {
        Self {
            room_id: room_id.to_string(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            is_teacher: session.is_teacher,
            joined_at: session.joined_at,
            left_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubmission {
    pub room_id: String,
    pub class_type: Option<ClassType>,
    pub participant_user_ids: Vec<String>,
    pub scheduled_start_at: Option<i64>,
    pub scheduled_end_at: Option<i64>,
    pub submitted_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    #[error("accounting request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("accounting rejected request: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("accounting unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Accounting: Send + Sync {
    async fn log_attendance(&self, entry: &AttendanceEntry) -> Result<(), AccountingError>;
    async fn submit_class(&self, submission: &ClassSubmission) -> Result<(), AccountingError>;
}

pub fn build_accounting(base_url: Option<&str>) -> Arc<dyn Accounting> {
    match base_url {
        Some(url) => Arc::new(HttpAccounting::new(url)),
        None => {
            warn!("ACCOUNTING_URL unset; attendance is only logged");
            Arc::new(TracingAccounting)
        }
    }
}

/// Posts JSON to the accounting service.
pub struct HttpAccounting {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccounting {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), AccountingError> {
        let url = format!("{}/{}", self.base_url, path);
        let res = self.http.post(url).json(body).send().await?;
        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(AccountingError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl Accounting for HttpAccounting {
    async fn log_attendance(&self, entry: &AttendanceEntry) -> Result<(), AccountingError> {
        self.post("attendance", entry).await
    }

    async fn submit_class(&self, submission: &ClassSubmission) -> Result<(), AccountingError> {
        self.post("classes", submission).await
    }
}

/// Writes accounting traffic to the log only.
pub struct TracingAccounting;

#[async_trait]
impl Accounting for TracingAccounting {
    async fn log_attendance(&self, entry: &AttendanceEntry) -> Result<(), AccountingError> {
        info!(
            room = %entry.room_id,
            session = %entry.session_id,
            user = %entry.user_id,
            teacher = entry.is_teacher,
            joined_at = entry.joined_at,
            left_at = entry.left_at,
            "attendance"
        );
        Ok(())
    }

    async fn submit_class(&self, submission: &ClassSubmission) -> Result<(), AccountingError> {
        info!(
            room = %submission.room_id,
            participants = submission.participant_user_ids.len(),
            "class submission"
        );
        Ok(())
    }
}

/// Records everything in memory; can be told to fail. For tests and local wiring.
#[derive(Default)]
pub struct InMemoryAccounting {
    attendance: Mutex<Vec<AttendanceEntry>>,
    submissions: Mutex<Vec<ClassSubmission>>,
    unavailable: Mutex<bool>,
}

impl InMemoryAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn attendance(&self) -> Vec<AttendanceEntry> {
        self.attendance.lock().clone()
    }

    pub fn submissions(&self) -> Vec<ClassSubmission> {
        self.submissions.lock().clone()
    }

    fn check(&self) -> Result<(), AccountingError> {
        if *self.unavailable.lock() {
            return Err(AccountingError::Unavailable("configured to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Accounting for InMemoryAccounting {
    async fn log_attendance(&self, entry: &AttendanceEntry) -> Result<(), AccountingError> {
        self.check()?;
        self.attendance.lock().push(entry.clone());
        Ok(())
    }

    async fn submit_class(&self, submission: &ClassSubmission) -> Result<(), AccountingError> {
        self.check()?;
        self.submissions.lock().push(submission.clone());
        Ok(())
    }
}

/// Store-aware front of the accounting collaborator. Every method is best-effort.
#[derive(Clone)]
pub struct ClassAccounting {
    store: StoreHandle,
    keys: KeySpace,
    sink: Arc<dyn Accounting>,
}

impl ClassAccounting {
    pub fn new(store: StoreHandle, keys: KeySpace, sink: Arc<dyn Accounting>) -> Self {
        Self { store, keys, sink }
    }

    pub async fn log_attendance(&self, entry: AttendanceEntry) {
        if let Err(err) = self.sink.log_attendance(&entry).await {
            metrics::ACCOUNTING_FAILURES
                .with_label_values(&["attendance"])
                .inc();
            warn!(
                room = %entry.room_id,
                session = %entry.session_id,
                error = %err,
                "failed to log attendance"
            );
        }
    }

    /// Cached scheduling metadata, or `None` when missing or unreadable.
    pub async fn room_context(&self, room_id: &str) -> Option<RoomContext> {
        let raw = match self.store.get(&self.keys.context(room_id)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(room = %room_id, error = %err, "room context lookup failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(context) => Some(context),
            Err(err) => {
                warn!(room = %room_id, error = %err, "room context is not decodable");
                None
            }
        }
    }

    /// Build and hand over the end-of-class payload for `room_id`. The attendee set is
    /// drained, so the next submission for the room only reports later arrivals.
    pub async fn submit_room(&self, room_id: &str) {
        let context = self.room_context(room_id).await;
        let attendees = self.keys.attendees(room_id);
        let participant_user_ids = match self.store.take_members(&attendees).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(room = %room_id, error = %err, "attendee lookup failed");
                Vec::new()
            }
        };
        let submitted_at = match self.store.time_ms().await {
            Ok(now) => now,
            Err(err) => {
                warn!(room = %room_id, error = %err, "store clock unavailable");
                0
            }
        };
        let submission = ClassSubmission {
            room_id: room_id.to_string(),
            class_type: context.as_ref().map(|c| c.class_type),
            participant_user_ids,
            scheduled_start_at: context.as_ref().and_then(|c| c.scheduled_start_at),
            scheduled_end_at: context.as_ref().and_then(|c| c.scheduled_end_at),
            submitted_at,
        };
        match self.sink.submit_class(&submission).await {
            Ok(()) => debug!(
                room = %room_id,
                participants = submission.participant_user_ids.len(),
                "class submitted"
            ),
            Err(err) => {
                metrics::ACCOUNTING_FAILURES
                    .with_label_values(&["submission"])
                    .inc();
                warn!(room = %room_id, error = %err, "class submission failed");
            }
        }
    }
}
