use crate::session::ModeKind;
use crate::types::{ConnectionId, PeerId};
use thiserror::Error;

/// Errors surfaced synchronously to callers of the coordinator
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid mode transition {from:?} -> {to:?}: {reason}")]
    InvalidModeTransition {
        from: ModeKind,
        to: ModeKind,
        reason: &'static str,
    },

    #[error("torrent metadata not resolved")]
    MetadataNotSet,

    #[error("session mode not set")]
    ModeNotSet,

    #[error("operation requires {expected:?} mode, session is {actual:?}")]
    ModeMismatch { expected: ModeKind, actual: ModeKind },

    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("peer {0} is not an active, unregistered connection")]
    ConnectionNotActive(PeerId),

    #[error("peer {0} did not advertise payment extension support")]
    PaymentExtensionUnsupported(PeerId),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Peer registry lookups
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no connection for peer {0}")]
    NotFound(PeerId),

    #[error("no connection awaiting handshake with id {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("peer {0} already has an active connection")]
    DuplicatePeerId(PeerId),
}

/// Piece picking
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickError {
    #[error("no unassigned piece available")]
    NoPieceAvailable,
}

/// Storage read failure reported by the transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("storage read failed: {0}")]
pub struct StorageError(pub String);

/// Trading engine refused an operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("trading engine: {0}")]
pub struct EngineError(pub String);

/// Configuration values the types cannot rule out
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvalidConfig {
    #[error("piece_timeout.target_rate_bytes_per_sec must be positive, got {0}")]
    NonPositiveRate(f64),

    #[error("piece_timeout.min_timeout_secs must not be negative, got {0}")]
    NegativeMinTimeout(f64),
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

/// A second full piece arrived for an index still under validation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("piece {index} is already being validated for peer {owner}")]
pub struct DuplicateArrival {
    pub index: u32,
    pub owner: PeerId,
}
