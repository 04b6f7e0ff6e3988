//! The BitTorrent transport engine as seen from the coordinator.
//!
//! The transport owns sockets, wire framing, storage and hash checking. Reads
//! and writes may finish inside the call that issued them; such calls report
//! the result inline through [`ReadStatus`] / [`ValidationStatus`] instead of
//! re-entering the coordinator.

use crate::config::TransportInteraction;
use crate::engine::WireMessage;
use crate::error::StorageError;
use crate::types::{ConnectionId, PieceData};
use std::net::SocketAddr;
use std::sync::Arc;

/// Live view of the transport's per-piece download priorities.
///
/// Each call reads the current value, so a priority changed after the view
/// was handed out is seen by the next call.
pub type PriorityLookup = Arc<dyn Fn(u32) -> i32 + Send + Sync>;

/// Result of issuing a piece read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    /// Completion arrives later through `on_storage_read_complete`
    Queued,
    /// The read finished synchronously
    Completed(Result<PieceData, StorageError>),
}

/// Result of handing piece bytes to the transport's integrity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    /// Outcome arrives later through `on_piece_validated` / `on_piece_validation_failed`
    Queued,
    /// Hash check finished synchronously
    Completed { valid: bool },
}

/// Extended message the transport could not decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    pub reason: String,
}

/// Extended handshake flavour to send to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedHandshake {
    /// Advertise the payment extension
    Install,
    /// Withdraw the payment extension mapping
    Uninstall,
}

/// Why the coordinator asks the transport to drop a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Banned,
    MalformedMessage,
    ProtocolViolation,
    RemovedFromSession,
    Requested,
}

pub trait TransportEngine {
    /// Torrent is fully present locally (seeding)
    fn is_fully_stored(&self) -> bool;

    /// File layout known
    fn is_metadata_resolved(&self) -> bool;

    fn piece_count(&self) -> u32;

    /// Nominal piece length in bytes
    fn piece_length(&self) -> u64;

    fn has_local_piece(&self, index: u32) -> bool;

    /// Handle onto the local download priority hints, valid after this call returns
    fn priority_lookup(&self) -> PriorityLookup;

    fn read_piece(&mut self, index: u32) -> ReadStatus;

    /// Submit piece bytes for hashing and storage
    fn add_piece(&mut self, index: u32, data: PieceData) -> ValidationStatus;

    /// Send an extended message on a live connection
    fn send(&mut self, conn: ConnectionId, endpoint: SocketAddr, message: WireMessage);

    fn send_extended_handshake(&mut self, conn: ConnectionId, handshake: ExtendedHandshake);

    fn drop_connection(&mut self, conn: ConnectionId, reason: DropReason);

    fn set_interaction(&mut self, interaction: TransportInteraction);
}
