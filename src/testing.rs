//! In-memory transport and trading engine for exercising the coordinator
//! without a BitTorrent stack or a payment channel implementation.

use crate::config::TransportInteraction;
use crate::engine::{
    ConnectionStatus, DownloadContract, EngineRequest, PieceInformation, PieceSelector,
    SessionState, TradingEngine, UploadContract, WireMessage,
};
use crate::error::{EngineError, StorageError};
use crate::transport::{
    DropReason, ExtendedHandshake, PriorityLookup, ReadStatus, TransportEngine, ValidationStatus,
};
use crate::types::{BuyerTerms, ConnectionId, PeerId, PieceData, SellerTerms};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Everything a [`MemoryTransport`] was asked to do, plus the knobs that shape its answers
#[derive(Debug, Default)]
pub struct TransportState {
    pub fully_stored: bool,
    pub metadata_resolved: bool,
    pub piece_count: u32,
    pub piece_length: u64,
    pub have: Vec<bool>,
    pub priorities: Vec<i32>,

    /// Leave reads pending instead of completing them inside `read_piece`
    pub queue_reads: bool,
    /// Leave hash checks pending instead of completing them inside `add_piece`
    pub queue_validations: bool,
    /// Fail every synchronous read with this message
    pub fail_reads: Option<String>,
    /// Indices whose submitted bytes fail the hash check
    pub invalid_pieces: BTreeSet<u32>,

    pub reads: Vec<u32>,
    pub added: Vec<(u32, PieceData)>,
    pub sent: Vec<(ConnectionId, WireMessage)>,
    pub handshakes: Vec<(ConnectionId, ExtendedHandshake)>,
    pub dropped: Vec<(ConnectionId, DropReason)>,
    pub interaction: TransportInteraction,
}

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MemoryTransport {
    /// Every piece present locally
    pub fn seeding(piece_count: u32, piece_length: u64) -> Self {
        Self::with_state(TransportState {
            fully_stored: true,
            metadata_resolved: true,
            piece_count,
            piece_length,
            have: vec![true; piece_count as usize],
            priorities: vec![1; piece_count as usize],
            ..Default::default()
        })
    }

    /// Metadata known, no pieces present
    pub fn downloading(piece_count: u32, piece_length: u64) -> Self {
        Self::with_state(TransportState {
            fully_stored: false,
            metadata_resolved: true,
            piece_count,
            piece_length,
            have: vec![false; piece_count as usize],
            priorities: vec![1; piece_count as usize],
            ..Default::default()
        })
    }

    /// Metadata still being fetched
    pub fn unresolved() -> Self {
        Self::with_state(TransportState::default())
    }

    pub fn with_state(state: TransportState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Shared view for inspecting calls after the transport is handed away
    pub fn handle(&self) -> Arc<Mutex<TransportState>> {
        self.state.clone()
    }

    fn piece_bytes(index: u32, len: u64) -> PieceData {
        PieceData::from(vec![index as u8; len as usize])
    }
}

impl TransportEngine for MemoryTransport {
    fn is_fully_stored(&self) -> bool {
        self.state.lock().fully_stored
    }

    fn is_metadata_resolved(&self) -> bool {
        self.state.lock().metadata_resolved
    }

    fn piece_count(&self) -> u32 {
        self.state.lock().piece_count
    }

    fn piece_length(&self) -> u64 {
        self.state.lock().piece_length
    }

    fn has_local_piece(&self, index: u32) -> bool {
        self.state
            .lock()
            .have
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    fn priority_lookup(&self) -> PriorityLookup {
        let state = Arc::clone(&self.state);
        Arc::new(move |index| {
            state
                .lock()
                .priorities
                .get(index as usize)
                .copied()
                .unwrap_or(0)
        })
    }

    fn read_piece(&mut self, index: u32) -> ReadStatus {
        let mut state = self.state.lock();
        state.reads.push(index);
        if state.queue_reads {
            return ReadStatus::Queued;
        }
        match &state.fail_reads {
            Some(reason) => ReadStatus::Completed(Err(StorageError(reason.clone()))),
            None => ReadStatus::Completed(Ok(Self::piece_bytes(index, state.piece_length))),
        }
    }

    fn add_piece(&mut self, index: u32, data: PieceData) -> ValidationStatus {
        let mut state = self.state.lock();
        state.added.push((index, data));
        if state.queue_validations {
            return ValidationStatus::Queued;
        }
        let valid = !state.invalid_pieces.contains(&index);
        if valid {
            if let Some(have) = state.have.get_mut(index as usize) {
                *have = true;
            }
        }
        ValidationStatus::Completed { valid }
    }

    fn send(&mut self, conn: ConnectionId, _endpoint: SocketAddr, message: WireMessage) {
        self.state.lock().sent.push((conn, message));
    }

    fn send_extended_handshake(&mut self, conn: ConnectionId, handshake: ExtendedHandshake) {
        self.state.lock().handshakes.push((conn, handshake));
    }

    fn drop_connection(&mut self, conn: ConnectionId, reason: DropReason) {
        self.state.lock().dropped.push((conn, reason));
    }

    fn set_interaction(&mut self, interaction: TransportInteraction) {
        self.state.lock().interaction = interaction;
    }
}

/// Calls a [`MemoryEngine`] received, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Start,
    Stop,
    Pause,
    ToObserve,
    ToSell { terms: SellerTerms, max_piece_index: u32 },
    ToBuy { terms: BuyerTerms, pieces: Vec<PieceInformation>, piece_timeout: Duration },
    UpdateSellerTerms(SellerTerms),
    UpdateBuyerTerms(BuyerTerms),
    AddConnection(PeerId),
    RemoveConnection(PeerId),
    ProcessMessage(PeerId, WireMessage),
    PieceLoaded { peer: PeerId, index: u32 },
    PieceLoadFailed { peer: PeerId, index: u32 },
    ValidPiece { peer: PeerId, index: u32 },
    InvalidPiece { peer: PeerId, index: u32 },
    PieceDownloaded(u32),
    Tick,
    StartDownloading { sellers: Vec<PeerId> },
    StartUploading { peer: PeerId },
}

#[derive(Default)]
pub struct EngineState {
    pub state: Option<SessionState>,
    pub connections: BTreeSet<PeerId>,
    pub requests: VecDeque<EngineRequest>,
    pub calls: Vec<EngineCall>,

    /// Refuse `add_connection`
    pub reject_connections: bool,
    /// Requests queued as a reaction to the next `piece_loaded`
    pub on_piece_loaded: Vec<EngineRequest>,
    /// Selector handed over by `start_downloading`
    pub selector: Option<PieceSelector>,
}

impl EngineState {
    pub fn session_state(&self) -> SessionState {
        self.state.unwrap_or(SessionState::Stopped)
    }
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine already in the started state
    pub fn started() -> Self {
        let engine = Self::new();
        engine.state.lock().state = Some(SessionState::Started);
        engine
    }

    pub fn handle(&self) -> Arc<Mutex<EngineState>> {
        self.state.clone()
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

impl TradingEngine for MemoryEngine {
    fn state(&self) -> SessionState {
        self.state.lock().session_state()
    }

    fn start(&mut self) {
        self.record(EngineCall::Start);
        self.state.lock().state = Some(SessionState::Started);
    }

    fn stop(&mut self) {
        self.record(EngineCall::Stop);
        self.state.lock().state = Some(SessionState::Stopped);
    }

    fn pause(&mut self) {
        self.record(EngineCall::Pause);
        self.state.lock().state = Some(SessionState::Paused);
    }

    fn to_observe_mode(&mut self) {
        self.record(EngineCall::ToObserve);
    }

    fn to_sell_mode(&mut self, terms: SellerTerms, max_piece_index: u32) {
        self.record(EngineCall::ToSell {
            terms,
            max_piece_index,
        });
    }

    fn to_buy_mode(&mut self, terms: BuyerTerms, pieces: Vec<PieceInformation>, piece_timeout: Duration) {
        self.record(EngineCall::ToBuy {
            terms,
            pieces,
            piece_timeout,
        });
    }

    fn update_seller_terms(&mut self, terms: SellerTerms) {
        self.record(EngineCall::UpdateSellerTerms(terms));
    }

    fn update_buyer_terms(&mut self, terms: BuyerTerms) {
        self.record(EngineCall::UpdateBuyerTerms(terms));
    }

    fn add_connection(&mut self, peer: PeerId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.reject_connections {
            return Err(EngineError(format!("connection {peer} refused")));
        }
        if !state.connections.insert(peer) {
            return Err(EngineError(format!("connection {peer} already added")));
        }
        state.calls.push(EngineCall::AddConnection(peer));
        Ok(())
    }

    fn remove_connection(&mut self, peer: PeerId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.connections.remove(&peer) {
            return Err(EngineError(format!("unknown connection {peer}")));
        }
        state.calls.push(EngineCall::RemoveConnection(peer));
        Ok(())
    }

    fn has_connection(&self, peer: &PeerId) -> bool {
        self.state.lock().connections.contains(peer)
    }

    fn connection_status(&self, peer: &PeerId) -> Option<ConnectionStatus> {
        self.has_connection(peer).then(|| ConnectionStatus {
            peer: *peer,
            state: "preparing".to_string(),
        })
    }

    fn process_message(&mut self, peer: PeerId, message: WireMessage) {
        self.record(EngineCall::ProcessMessage(peer, message));
    }

    fn piece_loaded(&mut self, peer: PeerId, _data: PieceData, index: u32) {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::PieceLoaded { peer, index });
        let reactions = std::mem::take(&mut state.on_piece_loaded);
        state.requests.extend(reactions);
    }

    fn piece_load_failed(&mut self, peer: PeerId, index: u32, _error: &StorageError) {
        self.record(EngineCall::PieceLoadFailed { peer, index });
    }

    fn valid_piece_received(&mut self, peer: PeerId, index: u32) {
        self.record(EngineCall::ValidPiece { peer, index });
    }

    fn invalid_piece_received(&mut self, peer: PeerId, index: u32) {
        self.record(EngineCall::InvalidPiece { peer, index });
    }

    fn piece_downloaded(&mut self, index: u32) {
        self.record(EngineCall::PieceDownloaded(index));
    }

    fn tick(&mut self) {
        self.record(EngineCall::Tick);
    }

    fn start_downloading(
        &mut self,
        contract: DownloadContract,
        selector: PieceSelector,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.calls.push(EngineCall::StartDownloading {
            sellers: contract.sellers.keys().copied().collect(),
        });
        state.selector = Some(selector);
        Ok(())
    }

    fn start_uploading(
        &mut self,
        peer: PeerId,
        _terms: BuyerTerms,
        _contract: UploadContract,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.connections.contains(&peer) {
            return Err(EngineError(format!("unknown connection {peer}")));
        }
        state.calls.push(EngineCall::StartUploading { peer });
        Ok(())
    }

    fn drain_requests(&mut self) -> Vec<EngineRequest> {
        self.state.lock().requests.drain(..).collect()
    }
}
