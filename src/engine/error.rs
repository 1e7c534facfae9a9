use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::EntityKind;

/// Structured validation body: `{field_or_general: [messages]}`.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Key for messages that don't belong to a single field.
pub const GENERAL_FIELD: &str = "non_field_errors";

/// Coarse classification every caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Conflict,
    Forbidden,
    NotFound,
    /// Retryable by the client.
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    ProfessorOwnsRoom { professor: Ulid, room: Ulid },
    RoomReserved { room: Ulid, reservation: Ulid },
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(EntityKind, Ulid),
    AlreadyExists(EntityKind, Ulid),
    Invalid(FieldErrors),
    InvalidInterval,
    Conflict(ConflictReason),
    Forbidden(&'static str),
    UnknownLogin(String),
    Unavailable(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(..) => ErrorKind::NotFound,
            EngineError::AlreadyExists(..)
            | EngineError::Invalid(_)
            | EngineError::InvalidInterval
            | EngineError::LimitExceeded(_) => ErrorKind::BadRequest,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Forbidden(_) | EngineError::UnknownLogin(_) => ErrorKind::Forbidden,
            EngineError::Unavailable(_) => ErrorKind::Unavailable,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Single-field validation failure.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        EngineError::Invalid(errors)
    }

    /// The error as the structured body clients receive.
    pub fn body(&self) -> FieldErrors {
        match self {
            EngineError::Invalid(errors) => errors.clone(),
            other => {
                let mut errors = FieldErrors::new();
                errors.insert(GENERAL_FIELD.to_string(), vec![other.to_string()]);
                errors
            }
        }
    }
}

impl ConflictReason {
    /// Short metric label.
    pub fn label(&self) -> &'static str {
        match self {
            ConflictReason::ProfessorOwnsRoom { .. } => "professor_owns_room",
            ConflictReason::RoomReserved { .. } => "room_reserved",
        }
    }
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::ProfessorOwnsRoom { .. } => write!(f, "professor already owns a room"),
            ConflictReason::RoomReserved { .. } => {
                write!(f, "room already reserved for this period")
            }
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(kind, id) => write!(f, "{kind} not found: {id}"),
            EngineError::AlreadyExists(kind, id) => write!(f, "{kind} already exists: {id}"),
            EngineError::Invalid(errors) => {
                let mut first = true;
                for (field, messages) in errors {
                    for message in messages {
                        if !first {
                            write!(f, "; ")?;
                        }
                        write!(f, "{field}: {message}")?;
                        first = false;
                    }
                }
                Ok(())
            }
            EngineError::InvalidInterval => write!(f, "invalid interval"),
            EngineError::Conflict(reason) => write!(f, "{reason}"),
            EngineError::Forbidden(reason) => write!(f, "permission denied: {reason}"),
            EngineError::UnknownLogin(name) => write!(f, "unknown user: {name}"),
            EngineError::Unavailable(what) => write!(f, "unavailable, retry later: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
