//! Store key layout.
//!
//! Every room-scoped key wraps the room id in a hash tag (`room:{<id>}:...`) so all of a
//! room's keys hash to one cluster slot; multi-log reads over a room stay legal in
//! cluster mode. Nothing else in the crate formats store keys.

use std::time::Duration;

const ROOM_NOTIFY_MAX_LEN: usize = 1_000;
const SESSION_NOTIFY_MAX_LEN: usize = 200;
const CHAT_MAX_LEN: usize = 500;
const WHITEBOARD_EVENTS_MAX_LEN: usize = 2_000;
const LATEST_VALUE_MAX_LEN: usize = 1;

/// Key of a log plus its trim bound and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPolicy {
    pub key: String,
    pub max_len: Option<usize>,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct KeySpace {
    room_ttl: Duration,
}

impl KeySpace {
    pub fn new(room_ttl: Duration) -> Self {
        Self { room_ttl }
    }

    pub fn room_ttl(&self) -> Duration {
        self.room_ttl
    }

    pub fn session(&self, room_id: &str, session_id: &str) -> String {
        format!("room:{{{room_id}}}:session:{session_id}")
    }

    pub fn members(&self, room_id: &str) -> String {
        format!("room:{{{room_id}}}:members")
    }

    pub fn attendees(&self, room_id: &str) -> String {
        format!("room:{{{room_id}}}:attendees")
    }

    pub fn host_lock(&self, room_id: &str) -> String {
        format!("room:{{{room_id}}}:host")
    }

    pub fn content(&self, room_id: &str) -> String {
        format!("room:{{{room_id}}}:content")
    }

    pub fn context(&self, room_id: &str) -> String {
        format!("room:{{{room_id}}}:context")
    }

    pub fn sfu_address(&self, room_id: &str) -> String {
        format!("room:{{{room_id}}}:sfu")
    }

    pub fn keyframe_pointer(&self, room_id: &str, resource_id: &str) -> String {
        format!("room:{{{room_id}}}:pages:{resource_id}:keyframe")
    }

    pub fn room_notify(&self, room_id: &str) -> LogPolicy {
        self.log(format!("room:{{{room_id}}}:notify"), ROOM_NOTIFY_MAX_LEN)
    }

    pub fn session_notify(&self, room_id: &str, session_id: &str) -> LogPolicy {
        self.log(
            format!("room:{{{room_id}}}:session:{session_id}:notify"),
            SESSION_NOTIFY_MAX_LEN,
        )
    }

    pub fn chat(&self, room_id: &str) -> LogPolicy {
        self.log(format!("room:{{{room_id}}}:chat"), CHAT_MAX_LEN)
    }

    /// Page/drawing log of one resource, bounded to the current keyframe interval.
    pub fn page_events(
        &self,
        room_id: &str,
        resource_id: &str,
        events_since_keyframe: usize,
    ) -> LogPolicy {
        self.log(
            format!("room:{{{room_id}}}:pages:{resource_id}:events"),
            events_since_keyframe.saturating_add(1),
        )
    }

    pub fn whiteboard_events(&self, room_id: &str) -> LogPolicy {
        self.log(
            format!("room:{{{room_id}}}:whiteboard:events"),
            WHITEBOARD_EVENTS_MAX_LEN,
        )
    }

    pub fn video_state(&self, room_id: &str) -> LogPolicy {
        self.log(format!("room:{{{room_id}}}:video"), LATEST_VALUE_MAX_LEN)
    }

    pub fn whiteboard_state(&self, room_id: &str) -> LogPolicy {
        self.log(
            format!("room:{{{room_id}}}:whiteboard:state"),
            LATEST_VALUE_MAX_LEN,
        )
    }

    pub fn whiteboard_permissions(&self, room_id: &str) -> LogPolicy {
        self.log(
            format!("room:{{{room_id}}}:whiteboard:permissions"),
            LATEST_VALUE_MAX_LEN,
        )
    }

    pub fn pending_attendance(&self) -> String {
        "attendance:pending".to_string()
    }

    pub fn sweep_lock(&self) -> String {
        "attendance:sweep-lock".to_string()
    }

    fn log(&self, key: String, max_len: usize) -> LogPolicy {
        LogPolicy {
            key,
            max_len: Some(max_len),
            ttl: self.room_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_keys_share_a_hash_tag() {
        let keys = KeySpace::new(Duration::from_secs(60));
        for key in [
            keys.session("r1", "s1"),
            keys.host_lock("r1"),
            keys.room_notify("r1").key,
            keys.session_notify("r1", "s1").key,
            keys.chat("r1").key,
        ] {
            assert!(key.starts_with("room:{r1}:"), "{key}");
        }
    }

    #[test]
    fn page_log_is_bounded_to_one_keyframe_interval() {
        let keys = KeySpace::new(Duration::from_secs(60));
        assert_eq!(keys.page_events("r", "p", 0).max_len, Some(1));
        assert_eq!(keys.page_events("r", "p", 7).max_len, Some(8));
        assert_eq!(keys.video_state("r").max_len, Some(1));
    }
}
