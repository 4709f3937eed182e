use classroom_store::{Batch, EntryId, Reply, StoreError};
use serde::{Deserialize, Serialize};

use crate::error::RelayResult;
use crate::keys::LogPolicy;
use crate::session::{ContentMarker, Session};

/// Notification fanned out to every participant of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomNotification {
    Join {
        session: Session,
    },
    Leave {
        session_id: String,
        user_id: String,
    },
    Mute {
        session_id: String,
        muted: bool,
        by_session_id: String,
    },
    Trophy {
        session_id: String,
        user_id: String,
        trophies: i64,
    },
    Content {
        content: ContentMarker,
    },
    Host {
        session_id: String,
        previous_session_id: Option<String>,
    },
    Sfu {
        address: String,
    },
    Signal(SignalMessage),
    Chat(ChatMessage),
}

/// WebRTC signaling payload addressed to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub from_session_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    pub sent_at: i64,
}

/// Queue a JSON entry onto `policy`'s log and refresh the log's expiry.
pub(crate) async fn append_json<T>(
    batch: &mut Batch<'_>,
    policy: &LogPolicy,
    value: &T,
) -> RelayResult<()>
where
    T: Serialize + Sync,
{
    let data = serde_json::to_string(value)?;
    batch.append(&policy.key, policy.max_len, data).await;
    batch.expire(&policy.key, policy.ttl).await;
    Ok(())
}

/// Id of the first append among a committed batch's replies.
pub(crate) fn first_id(replies: Vec<Reply>) -> RelayResult<EntryId> {
    let reply = replies
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Backend("append produced no reply".into()))?;
    Ok(reply.into_id()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_are_tagged_by_type() {
        let json = serde_json::to_value(RoomNotification::Leave {
            session_id: "s1".into(),
            user_id: "u1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "leave");

        let json = serde_json::to_value(RoomNotification::Signal(SignalMessage {
            from_session_id: "s2".into(),
            payload: serde_json::json!({"sdp": "x"}),
        }))
        .unwrap();
        assert_eq!(json["type"], "signal");
        assert_eq!(json["fromSessionId"], "s2");
    }
}
