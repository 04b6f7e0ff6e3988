use super::mode::{ModeKind, OperatingMode};
use crate::alert::{AlertKind, AlertSender};
use crate::config::CoordinatorConfig;
use crate::engine::{
    DisconnectCause, DownloadContract, EngineRequest, PieceInformation, PieceSelector,
    SessionState, TradingEngine, UploadContract,
};
use crate::error::{CoordinatorError, Result};
use crate::exchange::{
    self, ArrivalOutcome, ArrivalSubmission, LoadDelivery, LoadRequest, PieceExchangeOrchestrator,
};
use crate::peer::{BanPolicy, PeerRegistry, PeerState};
use crate::transport::{DropReason, ExtendedHandshake, TransportEngine};
use crate::types::{BuyerTerms, ConnectionId, PeerId, SellerTerms};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-torrent state the controller works on, borrowed from the coordinator
pub struct SessionContext<'a> {
    pub registry: &'a mut PeerRegistry,
    pub orchestrator: &'a mut PieceExchangeOrchestrator,
    pub bans: &'a mut BanPolicy,
    pub transport: &'a mut dyn TransportEngine,
    pub alerts: &'a AlertSender,
    pub config: &'a CoordinatorConfig,
}

/// Owns the operating mode and the trading engine.
///
/// Sequences mode transitions, moves connections in and out of the engine and
/// dispatches the engine's requests to the hooks wired for the current mode.
pub struct SessionModeController {
    mode: OperatingMode,
    engine: Box<dyn TradingEngine>,

    /// Highest valid piece index while selling
    max_piece_index: Option<u32>,

    /// Piece-service timeout while buying
    piece_timeout: Option<Duration>,
}

impl SessionModeController {
    pub fn new(engine: Box<dyn TradingEngine>) -> Self {
        Self {
            mode: OperatingMode::NotSet,
            engine,
            max_piece_index: None,
            piece_timeout: None,
        }
    }

    pub fn mode(&self) -> &OperatingMode {
        &self.mode
    }

    pub fn engine(&self) -> &dyn TradingEngine {
        self.engine.as_ref()
    }

    pub fn session_state(&self) -> SessionState {
        self.engine.state()
    }

    pub fn max_piece_index(&self) -> Option<u32> {
        self.max_piece_index
    }

    pub fn piece_timeout(&self) -> Option<Duration> {
        self.piece_timeout
    }

    // ------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------

    pub fn to_observe(&mut self, ctx: &mut SessionContext<'_>) {
        let from = self.mode.kind();
        let eligible = Self::registrable_peers(ctx);

        self.leave_mode(ctx);

        for peer in ctx.registry.peers_in_state(PeerState::Registered) {
            self.deregister_connection(ctx, peer, DisconnectCause::Client);
        }

        self.engine.to_observe_mode();
        self.enter(ctx, OperatingMode::Observing, from);
        self.register_all(ctx, eligible);
    }

    pub fn to_sell(&mut self, ctx: &mut SessionContext<'_>, terms: SellerTerms) -> Result<()> {
        let from = self.mode.kind();

        if !ctx.transport.is_fully_stored() {
            return Err(CoordinatorError::InvalidModeTransition {
                from,
                to: ModeKind::Selling,
                reason: "torrent is not fully stored locally",
            });
        }
        if !ctx.transport.is_metadata_resolved() || ctx.transport.piece_count() == 0 {
            return Err(CoordinatorError::MetadataNotSet);
        }
        let max_piece_index = ctx.transport.piece_count() - 1;

        let eligible = Self::registrable_peers(ctx);
        self.leave_mode(ctx);
        debug_assert_eq!(ctx.orchestrator.pending_load_count(), 0);

        self.engine.to_sell_mode(terms.clone(), max_piece_index);
        self.enter(ctx, OperatingMode::Selling(terms), from);
        self.max_piece_index = Some(max_piece_index);
        self.register_all(ctx, eligible);
        Ok(())
    }

    pub fn to_buy(&mut self, ctx: &mut SessionContext<'_>, terms: BuyerTerms) -> Result<()> {
        let from = self.mode.kind();

        if ctx.transport.is_fully_stored() {
            return Err(CoordinatorError::InvalidModeTransition {
                from,
                to: ModeKind::Buying,
                reason: "torrent is already fully stored locally",
            });
        }
        if !ctx.transport.is_metadata_resolved() {
            return Err(CoordinatorError::MetadataNotSet);
        }

        let pieces: Vec<PieceInformation> = (0..ctx.transport.piece_count())
            .map(|index| PieceInformation {
                size: 0,
                downloaded: ctx.transport.has_local_piece(index),
            })
            .collect();
        let piece_timeout = ctx
            .config
            .piece_timeout
            .piece_timeout(ctx.transport.piece_length());

        let eligible = Self::registrable_peers(ctx);
        self.leave_mode(ctx);
        debug_assert_eq!(ctx.orchestrator.pending_arrival_count(), 0);

        self.engine.to_buy_mode(terms.clone(), pieces, piece_timeout);
        self.enter(ctx, OperatingMode::Buying(terms), from);
        self.piece_timeout = Some(piece_timeout);
        self.register_all(ctx, eligible);
        Ok(())
    }

    /// Discard asynchronous work belonging to the mode being left
    fn leave_mode(&mut self, ctx: &mut SessionContext<'_>) {
        match self.mode.kind() {
            ModeKind::Selling => ctx.orchestrator.clear_loads(),
            ModeKind::Buying => ctx.orchestrator.clear_arrivals(),
            ModeKind::NotSet | ModeKind::Observing => {}
        }
    }

    fn enter(&mut self, ctx: &mut SessionContext<'_>, mode: OperatingMode, from: ModeKind) {
        let to = mode.kind();
        info!(?from, ?to, "session mode changed");
        self.mode = mode;
        self.max_piece_index = None;
        self.piece_timeout = None;
        ctx.alerts.emit(AlertKind::ModeChanged(to));
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub fn start(&mut self, ctx: &mut SessionContext<'_>) {
        let initial = self.engine.state();
        self.engine.start();
        ctx.alerts.emit(AlertKind::SessionStarted);

        // a stopped session told every peer it uninstalled the extension
        if initial != SessionState::Stopped {
            return;
        }

        for peer in ctx.registry.peers_in_state(PeerState::Active) {
            let Ok(conn) = ctx.registry.lookup(&peer) else {
                continue;
            };
            let (conn_id, supports_payment) = (conn.connection_id, conn.supports_payment());

            ctx.transport
                .send_extended_handshake(conn_id, ExtendedHandshake::Install);

            if self.mode.is_set() && supports_payment {
                if let Err(e) = self.register_connection(ctx, peer) {
                    warn!(%peer, error = %e, "could not add connection on start");
                }
            }
        }
    }

    pub fn stop(&mut self, ctx: &mut SessionContext<'_>) {
        for peer in ctx.registry.peers_in_state(PeerState::Registered) {
            self.unregister_connection(ctx, peer);
        }

        self.engine.stop();
        ctx.alerts.emit(AlertKind::SessionStopped);

        let connections: Vec<ConnectionId> =
            ctx.registry.connections().map(|c| c.connection_id).collect();
        for conn in connections {
            ctx.transport
                .send_extended_handshake(conn, ExtendedHandshake::Uninstall);
        }
    }

    pub fn pause(&mut self, ctx: &mut SessionContext<'_>) {
        self.engine.pause();
        ctx.alerts.emit(AlertKind::SessionPaused);
    }

    pub fn tick(&mut self) {
        if self.mode.is_set() {
            self.engine.tick();
        }
    }

    pub fn update_seller_terms(&mut self, ctx: &mut SessionContext<'_>, terms: SellerTerms) -> Result<()> {
        if self.mode.kind() != ModeKind::Selling {
            return Err(self.mismatch(ModeKind::Selling));
        }
        self.mode = OperatingMode::Selling(terms.clone());
        self.engine.update_seller_terms(terms.clone());
        ctx.alerts.emit(AlertKind::SellerTermsUpdated(terms));
        Ok(())
    }

    pub fn update_buyer_terms(&mut self, ctx: &mut SessionContext<'_>, terms: BuyerTerms) -> Result<()> {
        if self.mode.kind() != ModeKind::Buying {
            return Err(self.mismatch(ModeKind::Buying));
        }
        self.mode = OperatingMode::Buying(terms.clone());
        self.engine.update_buyer_terms(terms.clone());
        ctx.alerts.emit(AlertKind::BuyerTermsUpdated(terms));
        Ok(())
    }

    pub fn start_downloading(
        &mut self,
        ctx: &mut SessionContext<'_>,
        contract: DownloadContract,
    ) -> Result<()> {
        if self.mode.kind() != ModeKind::Buying {
            return Err(self.mismatch(ModeKind::Buying));
        }

        let priority = ctx.transport.priority_lookup();
        let selector: PieceSelector =
            Box::new(move |pieces| exchange::pick(pieces, |index| priority(index)));

        let sellers: Vec<PeerId> = contract.sellers.keys().copied().collect();
        self.engine.start_downloading(contract, selector)?;

        info!(sellers = sellers.len(), "download started");
        ctx.alerts.emit(AlertKind::DownloadStarted { sellers });
        Ok(())
    }

    pub fn start_uploading(
        &mut self,
        ctx: &mut SessionContext<'_>,
        peer: PeerId,
        terms: BuyerTerms,
        contract: UploadContract,
    ) -> Result<()> {
        if self.mode.kind() != ModeKind::Selling {
            return Err(self.mismatch(ModeKind::Selling));
        }
        if !ctx.registry.lookup(&peer).is_ok_and(|c| c.is_registered()) {
            return Err(CoordinatorError::PeerNotFound(peer));
        }

        self.engine.start_uploading(peer, terms.clone(), contract)?;

        info!(%peer, "upload started");
        ctx.alerts.emit(AlertKind::UploadStarted { peer, terms });
        Ok(())
    }

    fn mismatch(&self, expected: ModeKind) -> CoordinatorError {
        CoordinatorError::ModeMismatch {
            expected,
            actual: self.mode.kind(),
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Admit an active peer that advertised the payment extension into the engine
    pub fn register_connection(&mut self, ctx: &mut SessionContext<'_>, peer: PeerId) -> Result<()> {
        if !self.mode.is_set() {
            return Err(CoordinatorError::ModeNotSet);
        }

        let conn = ctx
            .registry
            .lookup(&peer)
            .map_err(|_| CoordinatorError::PeerNotFound(peer))?;
        if conn.state != PeerState::Active {
            return Err(CoordinatorError::ConnectionNotActive(peer));
        }
        if !conn.supports_payment() {
            return Err(CoordinatorError::PaymentExtensionUnsupported(peer));
        }
        let endpoint = conn.endpoint;

        self.engine.add_connection(peer)?;
        ctx.registry
            .mark_registered(&peer)
            .map_err(|_| CoordinatorError::PeerNotFound(peer))?;

        info!(%peer, %endpoint, "connection added to session");
        let status = self.engine.connection_status(&peer);
        ctx.alerts.emit(AlertKind::ConnectionAdded {
            endpoint,
            peer,
            status,
        });
        Ok(())
    }

    /// Register every peer in `peers` unless the session is stopped
    fn register_all(&mut self, ctx: &mut SessionContext<'_>, peers: Vec<PeerId>) {
        if self.engine.state() == SessionState::Stopped {
            return;
        }
        for peer in peers {
            if let Err(e) = self.register_connection(ctx, peer) {
                warn!(%peer, error = %e, "could not add connection to session");
            }
        }
    }

    fn registrable_peers(ctx: &SessionContext<'_>) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = ctx
            .registry
            .connections()
            .filter(|c| c.is_registrable())
            .filter_map(|c| c.peer_id)
            .collect();
        peers.sort();
        peers
    }

    /// Register `peer` if it qualifies and the session accepts connections
    pub fn register_if_eligible(&mut self, ctx: &mut SessionContext<'_>, peer: PeerId) {
        if !self.mode.is_set() {
            return;
        }
        if ctx.registry.lookup(&peer).is_ok_and(|c| c.is_registrable()) {
            self.register_all(ctx, vec![peer]);
        }
    }

    /// Take `peer` out of the engine and drop the connection.
    ///
    /// Causes other than a client-initiated removal or a piece-service timeout
    /// put the endpoint on the misbehaviour list.
    pub fn deregister_connection(
        &mut self,
        ctx: &mut SessionContext<'_>,
        peer: PeerId,
        cause: DisconnectCause,
    ) {
        let Some((conn, endpoint)) = self.detach(ctx, peer) else {
            return;
        };

        if cause.is_misbehavior() {
            info!(%peer, %endpoint, ?cause, "peer removed for misbehaviour");
            ctx.bans.record_misbehavior(endpoint);
        } else {
            debug!(%peer, %endpoint, ?cause, "peer removed from session");
        }

        ctx.transport
            .drop_connection(conn, DropReason::RemovedFromSession);
    }

    /// Take `peer` out of the engine but keep the connection
    pub fn unregister_connection(&mut self, ctx: &mut SessionContext<'_>, peer: PeerId) {
        self.detach(ctx, peer);
    }

    fn detach(&mut self, ctx: &mut SessionContext<'_>, peer: PeerId) -> Option<(ConnectionId, SocketAddr)> {
        let (conn, endpoint, registered) = match ctx.registry.lookup(&peer) {
            Ok(c) => (c.connection_id, c.endpoint, c.is_registered()),
            Err(e) => {
                error!(%peer, error = %e, "removing connection that is not tracked");
                return None;
            }
        };

        if self.engine.has_connection(&peer) {
            if let Err(e) = self.engine.remove_connection(peer) {
                warn!(%peer, error = %e, "engine refused to remove connection");
            }
        }

        let purged = ctx.orchestrator.purge_for_peer(&peer);
        if !purged.loads_left.is_empty() || !purged.arrivals_dropped.is_empty() {
            debug!(%peer, loads = ?purged.loads_left, arrivals = ?purged.arrivals_dropped, "purged pending piece work");
        }

        if registered {
            if let Err(e) = ctx.registry.mark_unregistered(&peer) {
                error!(%peer, error = %e, "unregistering vanished connection");
            }
            ctx.alerts
                .emit(AlertKind::ConnectionRemoved { endpoint, peer });
        }

        Some((conn, endpoint))
    }

    // ------------------------------------------------------------------
    // Engine requests
    // ------------------------------------------------------------------

    pub fn process_message(&mut self, peer: PeerId, message: crate::engine::WireMessage) {
        self.engine.process_message(peer, message);
    }

    /// Dispatch engine requests until the engine has nothing more to ask
    pub fn pump(&mut self, ctx: &mut SessionContext<'_>) {
        loop {
            let requests = self.engine.drain_requests();
            if requests.is_empty() {
                break;
            }
            for request in requests {
                self.handle_request(ctx, request);
            }
        }
    }

    fn handle_request(&mut self, ctx: &mut SessionContext<'_>, request: EngineRequest) {
        if !self.mode.accepts(&request) {
            debug!(mode = ?self.mode.kind(), ?request, "ignoring engine request not wired in current mode");
            return;
        }

        match request {
            EngineRequest::Send { peer, message } => match ctx.registry.lookup(&peer) {
                Ok(conn) => {
                    debug!(%peer, message = message.command_name(), "sending");
                    ctx.transport.send(conn.connection_id, conn.endpoint, message);
                }
                Err(e) => {
                    error!(%peer, message = message.command_name(), error = %e, "send on vanished connection");
                }
            },

            EngineRequest::RemoveConnection { peer, cause } => {
                self.deregister_connection(ctx, peer, cause);
            }

            EngineRequest::LoadPiece { peer, index } => {
                if let LoadRequest::Completed(deliveries) =
                    ctx.orchestrator.request_load(peer, index, ctx.transport)
                {
                    self.deliver_loads(ctx, deliveries);
                }
            }

            EngineRequest::ClaimLastPayment { peer, settlement } => {
                if let Some(endpoint) = Self::endpoint_of(ctx, &peer) {
                    ctx.alerts.emit(AlertKind::LastPaymentReceived {
                        endpoint,
                        peer,
                        settlement,
                    });
                }
            }

            EngineRequest::AnchorAnnounced {
                peer,
                value,
                anchor,
                contract_pk,
                final_pk_hash,
            } => {
                ctx.alerts.emit(AlertKind::AnchorAnnounced {
                    peer,
                    value,
                    anchor,
                    contract_pk,
                    final_pk_hash,
                });
            }

            EngineRequest::ReceivedValidPayment {
                peer,
                increment,
                total_payments,
                total_amount,
            } => {
                if let Some(endpoint) = Self::endpoint_of(ctx, &peer) {
                    ctx.alerts.emit(AlertKind::PaymentReceived {
                        endpoint,
                        peer,
                        increment,
                        total_payments,
                        total_amount,
                    });
                }
            }

            EngineRequest::FullPieceArrived { peer, data, index } => {
                match ctx.orchestrator.submit_arrival(peer, data, index, ctx.transport) {
                    Ok(ArrivalSubmission::Submitted) => {}
                    Ok(ArrivalSubmission::Validated(outcome)) => {
                        self.apply_arrival_outcome(ctx, outcome);
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "duplicate full piece");
                        self.deregister_connection(ctx, peer, DisconnectCause::ProtocolViolation);
                    }
                }
            }

            EngineRequest::SentPayment {
                peer,
                increment,
                total_payments,
                total_amount,
                index,
            } => {
                if let Some(endpoint) = Self::endpoint_of(ctx, &peer) {
                    ctx.alerts.emit(AlertKind::PaymentSent {
                        endpoint,
                        peer,
                        increment,
                        total_payments,
                        total_amount,
                        index,
                    });
                }
            }

            EngineRequest::AllSellersGone => {
                info!("all sellers gone");
                ctx.alerts.emit(AlertKind::AllSellersGone);
            }
        }
    }

    fn endpoint_of(ctx: &SessionContext<'_>, peer: &PeerId) -> Option<SocketAddr> {
        match ctx.registry.lookup(peer) {
            Ok(conn) => Some(conn.endpoint),
            Err(e) => {
                error!(%peer, error = %e, "engine referenced unknown peer");
                None
            }
        }
    }

    /// Hand finished reads to the engine, one call per waiting buyer
    pub fn deliver_loads(&mut self, ctx: &mut SessionContext<'_>, deliveries: Vec<LoadDelivery>) {
        for delivery in deliveries {
            let LoadDelivery { peer, index, result } = delivery;
            match result {
                Ok(data) => {
                    debug!(%peer, index, "piece loaded");
                    self.engine.piece_loaded(peer, data, index);
                }
                Err(e) => {
                    warn!(%peer, index, error = %e, "failed reading piece");
                    self.engine.piece_load_failed(peer, index, &e);
                    if let Some(endpoint) = Self::endpoint_of(ctx, &peer) {
                        ctx.alerts.emit(AlertKind::PieceLoadFailed {
                            endpoint,
                            peer,
                            index,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Report a hash check result to the engine
    pub fn apply_arrival_outcome(&mut self, ctx: &mut SessionContext<'_>, outcome: ArrivalOutcome) {
        match outcome {
            ArrivalOutcome::Attributed { peer, index, valid } => {
                let endpoint = Self::endpoint_of(ctx, &peer);
                if valid {
                    if let Some(endpoint) = endpoint {
                        ctx.alerts.emit(AlertKind::ValidPieceArrived {
                            endpoint,
                            peer,
                            index,
                        });
                    }
                    self.engine.valid_piece_received(peer, index);
                } else {
                    warn!(%peer, index, "piece failed hash check");
                    if let Some(endpoint) = endpoint {
                        ctx.alerts.emit(AlertKind::InvalidPieceArrived {
                            endpoint,
                            peer,
                            index,
                        });
                    }
                    self.engine.invalid_piece_received(peer, index);
                }
            }
            ArrivalOutcome::Unattributed { index, valid: true } => {
                self.engine.piece_downloaded(index);
            }
            ArrivalOutcome::Unattributed { index, valid: false } => {
                debug!(index, "foreign piece failed hash check");
            }
        }
    }
}
