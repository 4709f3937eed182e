use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Already-verified caller identity handed in by the API surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub room_id: String,
    pub session_id: String,
    pub user_id: String,
    pub is_teacher: bool,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub class_type: ClassType,
    #[serde(default)]
    pub scheduled_start_at: Option<i64>,
    #[serde(default)]
    pub scheduled_end_at: Option<i64>,
}

impl Identity {
    pub fn validate(&self) -> RelayResult<()> {
        if self.room_id.trim().is_empty() {
            return Err(RelayError::MissingField("room id"));
        }
        if self.session_id.trim().is_empty() {
            return Err(RelayError::MissingField("session id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(RelayError::MissingField("user id"));
        }
        Ok(())
    }

    pub fn require_teacher(&self, action: &'static str) -> RelayResult<()> {
        if self.is_teacher {
            Ok(())
        } else {
            Err(RelayError::Unauthorized(action))
        }
    }

    pub fn room_context(&self) -> RoomContext {
        RoomContext {
            class_type: self.class_type,
            scheduled_start_at: self.scheduled_start_at,
            scheduled_end_at: self.scheduled_end_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassType {
    /// Fixed-length class with a scheduled end.
    Scheduled,
    /// Unscheduled room people drop into.
    DropIn,
    /// Self-study with no class boundary.
    SelfPaced,
}

/// When end-of-class accounting fires for a class type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountingPolicy {
    pub arm_deadline: bool,
    pub submit_on_leave: bool,
    pub submit_on_empty: bool,
}

impl ClassType {
    pub fn policy(self) -> AccountingPolicy {
        match self {
            ClassType::Scheduled => AccountingPolicy {
                arm_deadline: true,
                submit_on_leave: false,
                submit_on_empty: false,
            },
            ClassType::DropIn => AccountingPolicy {
                arm_deadline: false,
                submit_on_leave: false,
                submit_on_empty: true,
            },
            ClassType::SelfPaced => AccountingPolicy {
                arm_deadline: false,
                submit_on_leave: true,
                submit_on_empty: false,
            },
        }
    }
}

/// Cached scheduling metadata for a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomContext {
    pub class_type: ClassType,
    #[serde(default)]
    pub scheduled_start_at: Option<i64>,
    #[serde(default)]
    pub scheduled_end_at: Option<i64>,
}

/// Last content shown in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMarker {
    pub content_type: String,
    #[serde(default)]
    pub content_id: Option<String>,
}

/// One participant connection inside a room, stored as a field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub stream_id: Option<String>,
    pub is_teacher: bool,
    pub is_host: bool,
    pub joined_at: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub trophies: i64,
}

pub(crate) const FIELD_IS_HOST: &str = "is_host";
pub(crate) const FIELD_STREAM_ID: &str = "stream_id";
pub(crate) const FIELD_TROPHIES: &str = "trophies";

impl Session {
    pub fn from_identity(identity: &Identity, joined_at: i64) -> Self {
        Self {
            id: identity.session_id.clone(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            stream_id: None,
            is_teacher: identity.is_teacher,
            is_host: false,
            joined_at,
            email: identity.email.clone(),
            trophies: 0,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("user_id".to_string(), self.user_id.clone()),
            ("display_name".to_string(), self.display_name.clone()),
            ("is_teacher".to_string(), flag(self.is_teacher)),
            (FIELD_IS_HOST.to_string(), flag(self.is_host)),
            ("joined_at".to_string(), self.joined_at.to_string()),
            (FIELD_TROPHIES.to_string(), self.trophies.to_string()),
        ];
        if let Some(stream_id) = &self.stream_id {
            fields.push((FIELD_STREAM_ID.to_string(), stream_id.clone()));
        }
        if let Some(email) = &self.email {
            fields.push(("email".to_string(), email.clone()));
        }
        fields
    }

    /// `None` when the hash is missing (deleted or expired session).
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let id = fields.get("id")?.clone();
        let non_empty = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();
        Some(Self {
            id,
            user_id: fields.get("user_id").cloned().unwrap_or_default(),
            display_name: fields.get("display_name").cloned().unwrap_or_default(),
            stream_id: non_empty(FIELD_STREAM_ID),
            is_teacher: fields.get("is_teacher").is_some_and(|v| v == "1"),
            is_host: fields.get(FIELD_IS_HOST).is_some_and(|v| v == "1"),
            joined_at: fields
                .get("joined_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            email: non_empty("email"),
            trophies: fields
                .get(FIELD_TROPHIES)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        })
    }
}

pub(crate) fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_survives_field_map_encoding() {
        let session = Session {
            id: "s1".into(),
            user_id: "u1".into(),
            display_name: "Ada".into(),
            stream_id: Some("cam-1".into()),
            is_teacher: true,
            is_host: true,
            joined_at: 1_700_000_000_000,
            email: None,
            trophies: 2,
        };
        let fields: HashMap<String, String> = session.to_fields().into_iter().collect();
        assert_eq!(Session::from_fields(&fields), Some(session));
    }

    #[test]
    fn empty_hash_is_no_session() {
        assert_eq!(Session::from_fields(&HashMap::new()), None);
    }

    #[test]
    fn policy_table_covers_each_class_type() {
        assert!(ClassType::Scheduled.policy().arm_deadline);
        assert!(ClassType::SelfPaced.policy().submit_on_leave);
        assert!(ClassType::DropIn.policy().submit_on_empty);
        assert!(!ClassType::DropIn.policy().arm_deadline);
    }
}
