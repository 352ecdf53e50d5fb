use ulid::Ulid;

use crate::model::BookingStatus;

/// A single policy violation found by the booking validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `end` is not after `start`.
    Chronology,
    AdvanceNotice { earliest: chrono::NaiveDate },
    MinDuration { days: i64, required: u32 },
    Unavailable { reason: Option<String> },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Chronology => write!(f, "end date must be after start date"),
            Violation::AdvanceNotice { earliest } => {
                write!(f, "bookings must start on or after {earliest}")
            }
            Violation::MinDuration { days, required } => {
                write!(f, "campaign of {days} days is shorter than the {required}-day minimum")
            }
            Violation::Unavailable { reason: Some(r) } => {
                write!(f, "billboard is not accepting bookings: {r}")
            }
            Violation::Unavailable { reason: None } => {
                write!(f, "billboard is not accepting bookings")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Submitted range broke one or more billboard policies. Always non-empty.
    Invalid(Vec<Violation>),
    /// Writing this entry would overlap committed occupancy.
    Conflict(Ulid),
    Permission {
        actor: Ulid,
        entity: Ulid,
    },
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        action: &'static str,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Invalid(violations) => {
                write!(f, "invalid booking: ")?;
                for (i, v) in violations.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
            EngineError::Conflict(id) => write!(f, "conflict with occupancy: {id}"),
            EngineError::Permission { actor, entity } => {
                write!(f, "actor {actor} may not modify {entity}")
            }
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} booking {id}: it is {from}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
