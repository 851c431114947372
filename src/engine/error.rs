use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// First existing booking (by enter time) that collides with the request.
    Conflict(Ulid),
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    TimezoneResolution(String),
    OrganizationMismatch {
        user_id: Ulid,
        space_id: Ulid,
    },
    LimitExceeded(&'static str),
    StoreUnavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}]: leave must be after enter")
            }
            EngineError::TimezoneResolution(name) => {
                write!(f, "cannot resolve timezone: {name:?}")
            }
            EngineError::OrganizationMismatch { user_id, space_id } => {
                write!(f, "user {user_id} does not belong to the organization of space {space_id}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
