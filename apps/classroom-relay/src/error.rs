use classroom_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("only a teacher may {0}")]
    Unauthorized(&'static str),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("session {session_id} not found in room {room_id}")]
    SessionNotFound { room_id: String, session_id: String },
    #[error("session {0} is not a teacher")]
    NotTeacher(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
