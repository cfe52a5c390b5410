use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    DuplicateEmail(String),
    /// The candidate range intersects the booking with this id.
    Conflict(Ulid),
    InvalidSpan {
        start: Ms,
        end: Ms,
    },
    /// A field value failed validation; carries the field name.
    Invalid(&'static str),
    /// `id` is still referenced by `booking`.
    InUse {
        id: Ulid,
        booking: Ulid,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateEmail(email) => write!(f, "email already in use: {email}"),
            EngineError::Conflict(id) => write!(f, "time range conflicts with booking: {id}"),
            EngineError::InvalidSpan { start, end } => {
                write!(f, "invalid time range [{start}, {end}): start must be before end")
            }
            EngineError::Invalid(field) => write!(f, "invalid value for {field}"),
            EngineError::InUse { id, booking } => {
                write!(f, "cannot delete {id}: referenced by booking {booking}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
