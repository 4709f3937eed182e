use std::collections::HashMap;
use std::time::Duration;

use crate::entry::{EntryId, StreamEntry};
use crate::StoreError;

/// Field name every log entry stores its JSON payload under.
pub const DATA_FIELD: &str = "data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    Always,
    IfAbsent,
}

/// Store-neutral command. Adapters translate these into their own wire calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
        condition: SetCondition,
    },
    /// Replace the value and return the previous one in a single step.
    Swap {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    /// Delete `key` only while it still holds `value`. Replies with the number removed.
    DelIfEquals {
        key: String,
        value: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HGetAll {
        key: String,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    SMembers {
        key: String,
    },
    /// Read every member and delete the set in one step.
    TakeMembers {
        key: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: i64,
        only_new: bool,
    },
    ZRangeByScore {
        key: String,
        max: i64,
    },
    ZRem {
        key: String,
        member: String,
    },
    /// Append with an approximate length bound.
    XAdd {
        key: String,
        max_len: Option<usize>,
        fields: Vec<(String, String)>,
    },
    /// Newest retained entry, if any.
    XLast {
        key: String,
    },
    /// Store clock in milliseconds since the epoch.
    Time,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Swap { .. } => "SET GET",
            Command::Del { .. } => "DEL",
            Command::DelIfEquals { .. } => "EVAL",
            Command::Expire { .. } => "PEXPIRE",
            Command::HSet { .. } => "HSET",
            Command::HGetAll { .. } => "HGETALL",
            Command::HIncrBy { .. } => "HINCRBY",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMembers { .. } => "SMEMBERS",
            Command::TakeMembers { .. } => "EVAL",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Command::ZRem { .. } => "ZREM",
            Command::XAdd { .. } => "XADD",
            Command::XLast { .. } => "XREVRANGE",
            Command::Time => "TIME",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Swap { key, .. }
            | Command::Del { key }
            | Command::DelIfEquals { key, .. }
            | Command::Expire { key, .. }
            | Command::HSet { key, .. }
            | Command::HGetAll { key }
            | Command::HIncrBy { key, .. }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::SMembers { key }
            | Command::TakeMembers { key }
            | Command::ZAdd { key, .. }
            | Command::ZRangeByScore { key, .. }
            | Command::ZRem { key, .. }
            | Command::XAdd { key, .. }
            | Command::XLast { key } => Some(key),
            Command::Time => None,
        }
    }

    pub fn append(key: impl Into<String>, max_len: Option<usize>, data: impl Into<String>) -> Self {
        Command::XAdd {
            key: key.into(),
            max_len,
            fields: vec![(DATA_FIELD.to_string(), data.into())],
        }
    }
}

/// Decoded response to a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
    Id(EntryId),
    Members(Vec<String>),
    Fields(HashMap<String, String>),
    Entries(Vec<StreamEntry>),
}

impl Reply {
    fn unexpected(self, command: &'static str) -> StoreError {
        StoreError::UnexpectedReply {
            command,
            reply: format!("{self:?}"),
        }
    }

    pub fn into_text(self) -> Result<Option<String>, StoreError> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Text(value) => Ok(Some(value)),
            other => Err(other.unexpected("text")),
        }
    }

    pub fn into_int(self) -> Result<i64, StoreError> {
        match self {
            Reply::Int(value) => Ok(value),
            other => Err(other.unexpected("int")),
        }
    }

    pub fn into_id(self) -> Result<EntryId, StoreError> {
        match self {
            Reply::Id(id) => Ok(id),
            other => Err(other.unexpected("id")),
        }
    }

    pub fn into_members(self) -> Result<Vec<String>, StoreError> {
        match self {
            Reply::Nil => Ok(Vec::new()),
            Reply::Members(members) => Ok(members),
            other => Err(other.unexpected("members")),
        }
    }

    pub fn into_fields(self) -> Result<HashMap<String, String>, StoreError> {
        match self {
            Reply::Nil => Ok(HashMap::new()),
            Reply::Fields(fields) => Ok(fields),
            other => Err(other.unexpected("fields")),
        }
    }

    pub fn into_entries(self) -> Result<Vec<StreamEntry>, StoreError> {
        match self {
            Reply::Nil => Ok(Vec::new()),
            Reply::Entries(entries) => Ok(entries),
            other => Err(other.unexpected("entries")),
        }
    }

    /// `true` when a conditional write was applied.
    pub fn was_applied(&self) -> bool {
        matches!(self, Reply::Ok)
    }
}
