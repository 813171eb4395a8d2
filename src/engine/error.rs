use thiserror::Error;
use ulid::Ulid;

use crate::model::{ActorRole, PaymentKey, SessionStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("slot overlaps session {0}")]
    SlotConflict(Ulid),
    #[error("cannot {action} a {from} session")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },
    #[error("{actor} may not {action} this session")]
    Forbidden {
        actor: ActorRole,
        action: &'static str,
    },
    #[error("payment {key} already recorded as transaction {existing}")]
    DuplicatePayment { key: PaymentKey, existing: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn session_not_found(id: Ulid) -> Self {
        EngineError::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => "ValidationError",
            EngineError::NotFound { .. } => "NotFound",
            EngineError::SlotConflict(_) => "SlotConflict",
            EngineError::InvalidTransition { .. } => "InvalidTransition",
            EngineError::Forbidden { .. } => "Forbidden",
            EngineError::DuplicatePayment { .. } | EngineError::AlreadyExists(_) => {
                "SettlementConflict"
            }
            EngineError::WalError(_) => "StorageError",
        }
    }
}
