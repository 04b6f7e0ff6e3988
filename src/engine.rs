//! The payment-channel trading engine as seen from the coordinator.
//!
//! The engine never calls back into the coordinator directly. Everything it
//! wants done (send a message, load a piece, report a payment) is queued as an
//! [`EngineRequest`] and collected by the coordinator through
//! [`TradingEngine::drain_requests`] after every call into the engine.

use crate::error::{EngineError, PickError, StorageError};
use crate::exchange::PieceAssignment;
use crate::types::{BuyerTerms, PeerId, PieceData, SellerTerms};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Extended protocol messages exchanged over a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Observe,
    Buy(BuyerTerms),
    Sell { terms: SellerTerms, index: u32 },
    JoinContract { index: u32 },
    JoiningContract { contract_pk: Vec<u8>, final_pk_hash: Vec<u8> },
    Ready { value: u64, anchor: Vec<u8>, contract_pk: Vec<u8>, final_pk_hash: Vec<u8> },
    RequestFullPiece { piece_index: u32 },
    FullPiece(PieceData),
    Payment { signature: Vec<u8> },
}

impl WireMessage {
    pub fn command_name(&self) -> &'static str {
        match self {
            WireMessage::Observe => "observe",
            WireMessage::Buy(_) => "buy",
            WireMessage::Sell { .. } => "sell",
            WireMessage::JoinContract { .. } => "join_contract",
            WireMessage::JoiningContract { .. } => "joining_contract",
            WireMessage::Ready { .. } => "ready",
            WireMessage::RequestFullPiece { .. } => "request_full_piece",
            WireMessage::FullPiece(_) => "full_piece",
            WireMessage::Payment { .. } => "payment",
        }
    }
}

/// Why the engine dropped a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectCause {
    /// Initiated locally, e.g. a mode change. Never counts as misbehaviour.
    Client,
    SellerServicingPieceHasTimedOut,
    SellerSentInvalidPiece,
    SellerHasInterruptedContract,
    BuyerInterruptedPayment,
    BuyerRequestedInvalidPiece,
    BuyerSentInvalidPayment,
    ProtocolViolation,
}

impl DisconnectCause {
    /// Whether this cause puts the peer on the misbehaviour list
    pub fn is_misbehavior(&self) -> bool {
        !matches!(
            self,
            DisconnectCause::Client | DisconnectCause::SellerServicingPieceHasTimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Stopped,
    Started,
    Paused,
}

/// Per-piece inventory handed to the engine in buy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInformation {
    pub size: u64,
    pub downloaded: bool,
}

/// Engine view of one registered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub peer: PeerId,
    /// Engine state machine state, engine-defined
    pub state: String,
}

/// Seller allocation within a download contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellerAllocation {
    pub output_index: u32,
    pub value: u64,
    pub contract_pk: Vec<u8>,
    pub final_pk_hash: Vec<u8>,
}

/// Signed contract transaction and the sellers it pays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadContract {
    pub transaction: Vec<u8>,
    pub sellers: BTreeMap<PeerId, SellerAllocation>,
}

/// Keys a seller uses when joining a buyer's contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadContract {
    pub contract_key_pair: Vec<u8>,
    pub final_pk_hash: Vec<u8>,
}

/// Chooses the next piece to request while downloading
pub type PieceSelector = Box<dyn FnMut(&[PieceAssignment]) -> Result<u32, PickError>>;

/// Work the engine asks the coordinator to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Send {
        peer: PeerId,
        message: WireMessage,
    },
    /// Engine dropped the connection on its own initiative
    RemoveConnection {
        peer: PeerId,
        cause: DisconnectCause,
    },
    /// Selling: a buyer asked for a piece
    LoadPiece {
        peer: PeerId,
        index: u32,
    },
    /// Selling: the buyer's last payment can be claimed
    ClaimLastPayment {
        peer: PeerId,
        settlement: Vec<u8>,
    },
    /// Selling: buyer announced the contract anchor
    AnchorAnnounced {
        peer: PeerId,
        value: u64,
        anchor: Vec<u8>,
        contract_pk: Vec<u8>,
        final_pk_hash: Vec<u8>,
    },
    /// Selling: buyer paid for a piece
    ReceivedValidPayment {
        peer: PeerId,
        increment: u64,
        total_payments: u64,
        total_amount: u64,
    },
    /// Buying: a seller delivered a full piece
    FullPieceArrived {
        peer: PeerId,
        data: PieceData,
        index: u32,
    },
    /// Buying: we paid a seller
    SentPayment {
        peer: PeerId,
        increment: u64,
        total_payments: u64,
        total_amount: u64,
        index: u32,
    },
    /// Buying: no sellers left
    AllSellersGone,
}

pub trait TradingEngine {
    fn state(&self) -> SessionState;

    fn start(&mut self);

    fn stop(&mut self);

    fn pause(&mut self);

    fn to_observe_mode(&mut self);

    fn to_sell_mode(&mut self, terms: SellerTerms, max_piece_index: u32);

    fn to_buy_mode(
        &mut self,
        terms: BuyerTerms,
        pieces: Vec<PieceInformation>,
        piece_timeout: Duration,
    );

    fn update_seller_terms(&mut self, terms: SellerTerms);

    fn update_buyer_terms(&mut self, terms: BuyerTerms);

    fn add_connection(&mut self, peer: PeerId) -> Result<(), EngineError>;

    /// Remove without queueing a `RemoveConnection` request
    fn remove_connection(&mut self, peer: PeerId) -> Result<(), EngineError>;

    fn has_connection(&self, peer: &PeerId) -> bool;

    fn connection_status(&self, peer: &PeerId) -> Option<ConnectionStatus>;

    fn process_message(&mut self, peer: PeerId, message: WireMessage);

    /// Selling: bytes for a piece the peer asked for
    fn piece_loaded(&mut self, peer: PeerId, data: PieceData, index: u32);

    /// Selling: a piece the peer asked for could not be read
    fn piece_load_failed(&mut self, peer: PeerId, index: u32, error: &StorageError);

    /// Buying: piece from `peer` passed the hash check
    fn valid_piece_received(&mut self, peer: PeerId, index: u32);

    /// Buying: piece from `peer` failed the hash check
    fn invalid_piece_received(&mut self, peer: PeerId, index: u32);

    /// Buying: piece obtained outside the engine, e.g. from a plain BitTorrent peer
    fn piece_downloaded(&mut self, index: u32);

    fn tick(&mut self);

    fn start_downloading(
        &mut self,
        contract: DownloadContract,
        selector: PieceSelector,
    ) -> Result<(), EngineError>;

    fn start_uploading(
        &mut self,
        peer: PeerId,
        terms: BuyerTerms,
        contract: UploadContract,
    ) -> Result<(), EngineError>;

    fn drain_requests(&mut self) -> Vec<EngineRequest>;
}
