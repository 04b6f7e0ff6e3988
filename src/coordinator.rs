//! Per-torrent coordinator.
//!
//! Receives transport events and application calls, routes them through the
//! peer registry, ban policy, piece exchange bookkeeping and the session
//! controller, and drains the trading engine's requests after every call that
//! reaches the engine.

use crate::alert::{self, AlertReceiver, AlertSender};
use crate::config::{CoordinatorConfig, TransportInteraction};
use crate::engine::{DownloadContract, TradingEngine, UploadContract, WireMessage};
use crate::error::{CoordinatorError, RegistryError, Result, StorageError};
use crate::exchange::PieceExchangeOrchestrator;
use crate::peer::{
    Admission, BanPolicy, ExtensionSupport, HandshakeOutcome, NewConnection, PeerRegistry,
};
use crate::session::{ModeKind, OperatingMode, SessionContext, SessionModeController};
use crate::status::{CoordinatorStatus, PeerStatus};
use crate::transport::{DropReason, MalformedMessage, TransportEngine};
use crate::types::{BuyerTerms, ConnectionId, InfoHash, PeerId, PieceData, SellerTerms};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

pub struct Coordinator {
    info_hash: InfoHash,
    config: CoordinatorConfig,
    registry: PeerRegistry,
    bans: BanPolicy,
    orchestrator: PieceExchangeOrchestrator,
    session: SessionModeController,
    transport: Box<dyn TransportEngine>,
    alerts: AlertSender,
}

impl Coordinator {
    pub fn new(
        info_hash: InfoHash,
        config: CoordinatorConfig,
        mut transport: Box<dyn TransportEngine>,
        engine: Box<dyn TradingEngine>,
    ) -> (Self, AlertReceiver) {
        let (alerts, receiver) = alert::channel(info_hash);
        transport.set_interaction(config.interaction);

        info!(%info_hash, interaction = ?config.interaction, "coordinator created");

        let coordinator = Self {
            info_hash,
            config,
            registry: PeerRegistry::new(),
            bans: BanPolicy::new(),
            orchestrator: PieceExchangeOrchestrator::new(),
            session: SessionModeController::new(engine),
            transport,
            alerts,
        };
        (coordinator, receiver)
    }

    /// Run `f` against the session controller, then drain the engine's requests
    fn run<R>(&mut self, f: impl FnOnce(&mut SessionModeController, &mut SessionContext<'_>) -> R) -> R {
        let mut ctx = SessionContext {
            registry: &mut self.registry,
            orchestrator: &mut self.orchestrator,
            bans: &mut self.bans,
            transport: self.transport.as_mut(),
            alerts: &self.alerts,
            config: &self.config,
        };
        let result = f(&mut self.session, &mut ctx);
        self.session.pump(&mut ctx);
        result
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub fn on_new_connection(&mut self, conn: NewConnection) -> Admission {
        self.registry.admit(&conn)
    }

    /// The peer id of a connection is known. Banned endpoints are dropped.
    pub fn on_handshake_complete(
        &mut self,
        id: ConnectionId,
        peer: PeerId,
    ) -> Result<HandshakeOutcome, RegistryError> {
        let outcome = self
            .registry
            .complete_handshake(id, peer, &self.bans, &self.config.ban);

        match &outcome {
            Ok(HandshakeOutcome::Ok) => {}
            Ok(HandshakeOutcome::Banned) => {
                self.transport.drop_connection(id, DropReason::Banned);
            }
            Err(e) => {
                error!(%peer, connection = %id, error = %e, "handshake rejected by registry");
            }
        }
        outcome
    }

    /// Extension support advertised in the peer's extended handshake
    pub fn on_extended_handshake(&mut self, peer: PeerId, bep10: bool, payment: bool) {
        let (had_payment, registered) = match self.registry.lookup(&peer) {
            Ok(conn) => (conn.supports_payment(), conn.is_registered()),
            Err(e) => {
                error!(%peer, error = %e, "extended handshake from untracked peer");
                return;
            }
        };

        if let Err(e) = self.registry.set_extension_support(
            &peer,
            ExtensionSupport::from_flag(bep10),
            ExtensionSupport::from_flag(payment),
        ) {
            error!(%peer, error = %e, "recording extension support");
            return;
        }
        debug!(%peer, bep10, payment, "extended handshake");

        if !had_payment && payment {
            self.run(|session, ctx| session.register_if_eligible(ctx, peer));
        } else if had_payment && !payment && registered {
            info!(%peer, "peer withdrew payment extension support");
            self.run(|session, ctx| session.unregister_connection(ctx, peer));
        }
    }

    pub fn on_extended_message(
        &mut self,
        peer: PeerId,
        message: std::result::Result<WireMessage, MalformedMessage>,
    ) {
        let (conn, endpoint, bep10, registered) = match self.registry.lookup(&peer) {
            Ok(c) => (c.connection_id, c.endpoint, c.bep10, c.is_registered()),
            Err(e) => {
                error!(%peer, error = %e, "extended message from untracked peer");
                return;
            }
        };

        let message = match message {
            Ok(message) => message,
            Err(malformed) => {
                warn!(%peer, %endpoint, reason = %malformed.reason, "malformed extended message");
                self.bans.record_malformed_message(endpoint);
                self.expel(peer, conn, registered, DropReason::MalformedMessage);
                return;
            }
        };

        if bep10 == ExtensionSupport::NotSupported {
            warn!(%peer, %endpoint, message = message.command_name(), "extended message from peer without extension protocol");
            self.bans.record_misbehavior(endpoint);
            self.expel(peer, conn, registered, DropReason::ProtocolViolation);
            return;
        }

        if !self.session.mode().is_set() || !registered {
            debug!(%peer, message = message.command_name(), "ignoring message from peer outside session");
            return;
        }

        self.run(|session, _| session.process_message(peer, message));
    }

    fn expel(&mut self, peer: PeerId, conn: ConnectionId, registered: bool, reason: DropReason) {
        if registered {
            self.run(|session, ctx| session.unregister_connection(ctx, peer));
        }
        self.transport.drop_connection(conn, reason);
    }

    /// Transport closed a connection; the record is gone afterwards
    pub fn on_disconnect(&mut self, id: ConnectionId, reason: &str) {
        if self.registry.is_awaiting(id) {
            self.registry.remove(id);
            debug!(connection = %id, reason, "connection closed before handshake");
            return;
        }

        let Some(peer) = self.registry.find_by_connection(id).and_then(|c| c.peer_id) else {
            debug!(connection = %id, reason, "disconnect for untracked connection");
            return;
        };

        self.run(|session, ctx| session.unregister_connection(ctx, peer));
        self.registry.remove(id);
        info!(%peer, connection = %id, reason, "peer disconnected");
    }

    pub fn on_piece_validated(&mut self, index: u32) {
        self.on_validation(index, true);
    }

    pub fn on_piece_validation_failed(&mut self, index: u32) {
        self.on_validation(index, false);
    }

    fn on_validation(&mut self, index: u32, valid: bool) {
        if self.session.mode().kind() != ModeKind::Buying {
            debug!(index, valid, "ignoring piece validation outside buy mode");
            return;
        }
        self.run(|session, ctx| {
            let outcome = ctx.orchestrator.on_arrival_validated(index, valid);
            session.apply_arrival_outcome(ctx, outcome);
        });
    }

    pub fn on_storage_read_complete(
        &mut self,
        index: u32,
        result: std::result::Result<PieceData, StorageError>,
    ) {
        self.run(|session, ctx| {
            let deliveries = ctx.orchestrator.on_load_complete(index, result);
            session.deliver_loads(ctx, deliveries);
        });
    }

    pub fn on_tick(&mut self) {
        self.run(|session, _| session.tick());
    }

    /// Whether a discovered endpoint is worth connecting to
    pub fn on_add_peer(&self, endpoint: SocketAddr) -> bool {
        !self.bans.is_banned(&endpoint, &self.config.ban)
    }

    // ------------------------------------------------------------------
    // Application API
    // ------------------------------------------------------------------

    pub fn start(&mut self) {
        self.run(|session, ctx| session.start(ctx));
    }

    pub fn stop(&mut self) {
        self.run(|session, ctx| session.stop(ctx));
    }

    pub fn pause(&mut self) {
        self.run(|session, ctx| session.pause(ctx));
    }

    pub fn update_seller_terms(&mut self, terms: SellerTerms) -> Result<()> {
        self.run(|session, ctx| session.update_seller_terms(ctx, terms))
    }

    pub fn update_buyer_terms(&mut self, terms: BuyerTerms) -> Result<()> {
        self.run(|session, ctx| session.update_buyer_terms(ctx, terms))
    }

    pub fn to_observe(&mut self) {
        self.run(|session, ctx| session.to_observe(ctx));
    }

    pub fn to_sell(&mut self, terms: SellerTerms) -> Result<()> {
        self.run(|session, ctx| session.to_sell(ctx, terms))
    }

    pub fn to_buy(&mut self, terms: BuyerTerms) -> Result<()> {
        self.run(|session, ctx| session.to_buy(ctx, terms))
    }

    pub fn start_downloading(&mut self, contract: DownloadContract) -> Result<()> {
        self.run(|session, ctx| session.start_downloading(ctx, contract))
    }

    pub fn start_uploading(
        &mut self,
        peer: PeerId,
        terms: BuyerTerms,
        contract: UploadContract,
    ) -> Result<()> {
        self.run(|session, ctx| session.start_uploading(ctx, peer, terms, contract))
    }

    /// Ask the transport to close the connection to `peer`
    pub fn drop_peer(&mut self, peer: PeerId) -> Result<()> {
        let conn = self
            .registry
            .lookup(&peer)
            .map_err(|_| CoordinatorError::PeerNotFound(peer))?
            .connection_id;

        info!(%peer, connection = %conn, "dropping peer on request");
        self.transport.drop_connection(conn, DropReason::Requested);
        Ok(())
    }

    pub fn set_interaction(&mut self, interaction: TransportInteraction) {
        info!(?interaction, "transport interaction changed");
        self.config.interaction = interaction;
        self.transport.set_interaction(interaction);
    }

    pub fn status_snapshot(&self) -> CoordinatorStatus {
        let engine = self.session.engine();

        let mut peers: Vec<PeerStatus> = self
            .registry
            .connections()
            .filter_map(|conn| {
                let peer = conn.peer_id?;
                Some(PeerStatus {
                    peer_id: peer.to_hex(),
                    endpoint: conn.endpoint,
                    outgoing: conn.outgoing,
                    state: conn.state,
                    bep10: conn.bep10,
                    payment: conn.payment,
                    engine: if conn.is_registered() {
                        engine.connection_status(&peer)
                    } else {
                        None
                    },
                })
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        CoordinatorStatus {
            info_hash: self.info_hash.to_string(),
            mode: self.session.mode().kind(),
            session_state: self.session.session_state(),
            interaction: self.config.interaction,
            peers,
            awaiting_handshake: self.registry.awaiting_count(),
            pending_loads: self.orchestrator.pending_load_count(),
            pending_arrivals: self.orchestrator.pending_arrival_count(),
            malformed_senders: self.bans.malformed_count(),
            misbehaved_peers: self.bans.misbehaved_count(),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn mode(&self) -> &OperatingMode {
        self.session.mode()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn bans(&self) -> &BanPolicy {
        &self.bans
    }

    pub fn orchestrator(&self) -> &PieceExchangeOrchestrator {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertKind;
    use crate::engine::{DisconnectCause, EngineRequest, SellerAllocation, SessionState};
    use crate::exchange::PieceAssignment;
    use crate::peer::{ConnectionKind, PeerState};
    use crate::testing::{EngineCall, EngineState, MemoryEngine, MemoryTransport, TransportState};
    use crate::transport::ExtendedHandshake;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        coordinator: Coordinator,
        alerts: AlertReceiver,
        transport: Arc<Mutex<TransportState>>,
        engine: Arc<Mutex<EngineState>>,
    }

    fn fixture(transport: MemoryTransport) -> Fixture {
        fixture_with(transport, CoordinatorConfig::default())
    }

    fn fixture_with(transport: MemoryTransport, config: CoordinatorConfig) -> Fixture {
        let engine = MemoryEngine::started();
        let transport_state = transport.handle();
        let engine_state = engine.handle();
        let (coordinator, alerts) = Coordinator::new(
            InfoHash([0xaa; 20]),
            config,
            Box::new(transport),
            Box::new(engine),
        );
        Fixture {
            coordinator,
            alerts,
            transport: transport_state,
            engine: engine_state,
        }
    }

    fn pid(n: u8) -> PeerId {
        PeerId::new([n; 20])
    }

    fn endpoint(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn seller_terms() -> SellerTerms {
        SellerTerms {
            min_price: 10,
            min_lock: 5,
            max_sellers: 3,
            min_contract_fee_per_kb: 1000,
            settlement_fee: 500,
        }
    }

    fn buyer_terms() -> BuyerTerms {
        BuyerTerms {
            max_price: 20,
            max_lock: 10,
            min_number_of_sellers: 1,
            max_contract_fee_per_kb: 2000,
        }
    }

    impl Fixture {
        /// Connect peer `n` on connection `n` and complete both handshakes
        fn connect_with(&mut self, n: u8, bep10: bool, payment: bool) -> PeerId {
            let id = ConnectionId(n as u64);
            let admission = self.coordinator.on_new_connection(NewConnection {
                id,
                endpoint: endpoint(n),
                kind: ConnectionKind::BitTorrent,
                outgoing: false,
            });
            assert_eq!(admission, Admission::Accepted);
            assert_eq!(
                self.coordinator.on_handshake_complete(id, pid(n)),
                Ok(HandshakeOutcome::Ok)
            );
            self.coordinator.on_extended_handshake(pid(n), bep10, payment);
            pid(n)
        }

        fn connect(&mut self, n: u8) -> PeerId {
            self.connect_with(n, true, true)
        }

        fn state_of(&self, peer: PeerId) -> PeerState {
            self.coordinator.registry().lookup(&peer).unwrap().state
        }

        fn calls(&self) -> Vec<EngineCall> {
            self.engine.lock().calls.clone()
        }

        fn clear_calls(&self) {
            self.engine.lock().calls.clear();
        }

        /// Queue engine requests and let the coordinator collect them
        fn engine_requests(&mut self, requests: Vec<EngineRequest>) {
            self.engine.lock().requests.extend(requests);
            self.coordinator.on_tick();
        }

        fn alerts(&mut self) -> Vec<AlertKind> {
            let mut kinds = Vec::new();
            while let Ok(alert) = self.alerts.try_recv() {
                kinds.push(alert.kind);
            }
            kinds
        }
    }

    #[test]
    fn test_web_seed_declined() {
        let mut fx = fixture(MemoryTransport::seeding(4, 16));
        let admission = fx.coordinator.on_new_connection(NewConnection {
            id: ConnectionId(1),
            endpoint: endpoint(1),
            kind: ConnectionKind::WebSeed,
            outgoing: true,
        });
        assert!(matches!(admission, Admission::Rejected(_)));
        assert_eq!(fx.coordinator.registry().awaiting_count(), 0);
    }

    #[test]
    fn test_peer_registered_once_mode_set() {
        let mut fx = fixture(MemoryTransport::seeding(4, 16));
        let a = fx.connect(1);
        assert_eq!(fx.state_of(a), PeerState::Active);

        fx.coordinator.to_sell(seller_terms()).unwrap();

        assert_eq!(fx.state_of(a), PeerState::Registered);
        assert!(fx.calls().contains(&EngineCall::AddConnection(a)));
        let alerts = fx.alerts();
        assert!(alerts.contains(&AlertKind::ModeChanged(ModeKind::Selling)));
        assert!(alerts.iter().any(|k| matches!(
            k,
            AlertKind::ConnectionAdded { peer, status: Some(_), .. } if *peer == a
        )));
    }

    #[test]
    fn test_peer_without_payment_support_stays_active() {
        let mut fx = fixture(MemoryTransport::seeding(4, 16));
        fx.coordinator.to_sell(seller_terms()).unwrap();
        let a = fx.connect_with(1, true, false);

        assert_eq!(fx.state_of(a), PeerState::Active);
        assert!(!fx.calls().contains(&EngineCall::AddConnection(a)));
    }

    #[test]
    fn test_to_sell_requires_full_storage() {
        let mut fx = fixture(MemoryTransport::downloading(4, 16));
        fx.connect(1);

        let err = fx.coordinator.to_sell(seller_terms()).unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::InvalidModeTransition { to: ModeKind::Selling, .. }
        ));
        assert_eq!(fx.coordinator.mode().kind(), ModeKind::NotSet);
        assert!(fx.calls().is_empty());
    }

    #[test]
    fn test_to_sell_passes_max_piece_index() {
        let mut fx = fixture(MemoryTransport::seeding(10, 16));
        fx.coordinator.to_sell(seller_terms()).unwrap();
        assert_eq!(
            fx.calls(),
            vec![EngineCall::ToSell {
                terms: seller_terms(),
                max_piece_index: 9
            }]
        );
    }

    #[test]
    fn test_to_buy_requires_metadata() {
        let mut fx = fixture(MemoryTransport::unresolved());
        let err = fx.coordinator.to_buy(buyer_terms()).unwrap_err();
        assert!(matches!(err, CoordinatorError::MetadataNotSet));
        assert_eq!(fx.coordinator.mode().kind(), ModeKind::NotSet);
    }

    #[test]
    fn test_to_buy_refused_when_seeding() {
        let mut fx = fixture(MemoryTransport::seeding(4, 16));
        fx.coordinator.to_observe();

        let err = fx.coordinator.to_buy(buyer_terms()).unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::InvalidModeTransition {
                from: ModeKind::Observing,
                to: ModeKind::Buying,
                ..
            }
        ));
        assert_eq!(fx.coordinator.mode().kind(), ModeKind::Observing);
    }

    #[test]
    fn test_to_buy_inventory_and_timeout() {
        let transport = MemoryTransport::downloading(4, 65_536);
        transport.handle().lock().have[1] = true;
        let mut fx = fixture(transport);

        fx.coordinator.to_buy(buyer_terms()).unwrap();

        let calls = fx.calls();
        let EngineCall::ToBuy {
            pieces,
            piece_timeout,
            ..
        } = &calls[0]
        else {
            panic!("expected buy mode call, got {calls:?}");
        };
        let downloaded: Vec<bool> = pieces.iter().map(|p| p.downloaded).collect();
        assert_eq!(downloaded, vec![false, true, false, false]);
        assert_eq!(*piece_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_piece_requests_share_one_read() {
        let transport = MemoryTransport::seeding(8, 16);
        transport.handle().lock().queue_reads = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        let b = fx.connect(2);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.engine_requests(vec![
            EngineRequest::LoadPiece { peer: a, index: 3 },
            EngineRequest::LoadPiece { peer: b, index: 3 },
        ]);
        assert_eq!(fx.transport.lock().reads, vec![3]);

        fx.coordinator
            .on_storage_read_complete(3, Ok(PieceData::from(vec![3; 16])));

        let calls = fx.calls();
        assert!(calls.contains(&EngineCall::PieceLoaded { peer: a, index: 3 }));
        assert!(calls.contains(&EngineCall::PieceLoaded { peer: b, index: 3 }));
        assert_eq!(fx.coordinator.orchestrator().pending_load_count(), 0);
    }

    #[test]
    fn test_synchronous_read_reaches_engine() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.engine_requests(vec![EngineRequest::LoadPiece { peer: a, index: 5 }]);

        assert!(fx.calls().contains(&EngineCall::PieceLoaded { peer: a, index: 5 }));
        assert_eq!(fx.coordinator.orchestrator().pending_load_count(), 0);
    }

    #[test]
    fn test_requests_raised_while_delivering_are_sent() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();
        let piece = PieceData::from(vec![5; 16]);
        fx.engine.lock().on_piece_loaded = vec![EngineRequest::Send {
            peer: a,
            message: WireMessage::FullPiece(piece.clone()),
        }];

        fx.engine_requests(vec![EngineRequest::LoadPiece { peer: a, index: 5 }]);

        assert_eq!(
            fx.transport.lock().sent,
            vec![(ConnectionId(1), WireMessage::FullPiece(piece))]
        );
    }

    #[test]
    fn test_storage_failure_reported_without_ban() {
        let transport = MemoryTransport::seeding(8, 16);
        transport.handle().lock().fail_reads = Some("bad sector".into());
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();
        fx.alerts();

        fx.engine_requests(vec![EngineRequest::LoadPiece { peer: a, index: 2 }]);

        assert!(fx
            .calls()
            .contains(&EngineCall::PieceLoadFailed { peer: a, index: 2 }));
        assert!(fx.alerts().iter().any(|k| matches!(
            k,
            AlertKind::PieceLoadFailed { index: 2, .. }
        )));
        assert_eq!(fx.coordinator.bans().misbehaved_count(), 0);
        assert_eq!(fx.state_of(a), PeerState::Registered);
        assert_eq!(fx.coordinator.mode().kind(), ModeKind::Selling);
    }

    #[test]
    fn test_observe_discards_pending_loads() {
        let transport = MemoryTransport::seeding(8, 16);
        transport.handle().lock().queue_reads = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        let b = fx.connect(2);
        fx.coordinator.to_sell(seller_terms()).unwrap();
        fx.engine_requests(vec![
            EngineRequest::LoadPiece { peer: a, index: 1 },
            EngineRequest::LoadPiece { peer: b, index: 2 },
        ]);
        assert_eq!(fx.coordinator.orchestrator().pending_load_count(), 2);

        fx.coordinator.to_observe();
        fx.clear_calls();
        fx.coordinator
            .on_storage_read_complete(1, Ok(PieceData::from(vec![1; 16])));
        fx.coordinator
            .on_storage_read_complete(2, Ok(PieceData::from(vec![2; 16])));

        assert!(fx.calls().is_empty());
        fx.coordinator.to_sell(seller_terms()).unwrap();
        assert_eq!(fx.coordinator.orchestrator().pending_load_count(), 0);
    }

    #[test]
    fn test_observe_removes_registered_peers_without_ban() {
        let mut fx = fixture(MemoryTransport::seeding(4, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();
        fx.alerts();

        fx.coordinator.to_observe();

        assert!(fx.calls().contains(&EngineCall::RemoveConnection(a)));
        assert_eq!(
            fx.transport.lock().dropped,
            vec![(ConnectionId(1), DropReason::RemovedFromSession)]
        );
        assert_eq!(fx.coordinator.bans().misbehaved_count(), 0);
        let alerts = fx.alerts();
        assert!(alerts.contains(&AlertKind::ConnectionRemoved {
            endpoint: endpoint(1),
            peer: a
        }));
        assert!(alerts.contains(&AlertKind::ModeChanged(ModeKind::Observing)));
    }

    #[test]
    fn test_sell_to_buy_keeps_registrations() {
        let transport = MemoryTransport::seeding(4, 16);
        let handle = transport.handle();
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        handle.lock().fully_stored = false;
        fx.coordinator.to_buy(buyer_terms()).unwrap();

        assert_eq!(fx.state_of(a), PeerState::Registered);
        assert!(!fx.calls().contains(&EngineCall::RemoveConnection(a)));
        assert!(handle.lock().dropped.is_empty());
    }

    #[test]
    fn test_engine_removal_purges_seller_state() {
        let transport = MemoryTransport::seeding(16, 16);
        transport.handle().lock().queue_reads = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        let b = fx.connect(2);
        fx.coordinator.to_sell(seller_terms()).unwrap();
        fx.engine_requests(vec![
            EngineRequest::LoadPiece { peer: a, index: 7 },
            EngineRequest::LoadPiece { peer: b, index: 7 },
        ]);

        fx.engine_requests(vec![EngineRequest::RemoveConnection {
            peer: a,
            cause: DisconnectCause::BuyerSentInvalidPayment,
        }]);

        let waiters = fx.coordinator.orchestrator().load_waiters(7).unwrap();
        assert!(!waiters.contains(&a));
        assert!(waiters.contains(&b));
        assert_eq!(fx.state_of(a), PeerState::Active);
        assert!(fx
            .transport
            .lock()
            .dropped
            .contains(&(ConnectionId(1), DropReason::RemovedFromSession)));
        assert!(!fx.coordinator.on_add_peer(endpoint(1)));
        assert!(fx.coordinator.on_add_peer(endpoint(2)));
    }

    #[test]
    fn test_engine_removal_purges_buyer_state() {
        let transport = MemoryTransport::downloading(16, 16);
        transport.handle().lock().queue_validations = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_buy(buyer_terms()).unwrap();
        fx.engine_requests(vec![EngineRequest::FullPieceArrived {
            peer: a,
            data: PieceData::from(vec![9; 16]),
            index: 9,
        }]);
        assert_eq!(fx.coordinator.orchestrator().arrival_owner(9), Some(a));

        fx.engine_requests(vec![EngineRequest::RemoveConnection {
            peer: a,
            cause: DisconnectCause::SellerServicingPieceHasTimedOut,
        }]);

        assert_eq!(fx.coordinator.orchestrator().arrival_owner(9), None);
        // timeouts are not misbehaviour
        assert!(fx.coordinator.on_add_peer(endpoint(1)));

        fx.clear_calls();
        fx.coordinator.on_piece_validated(9);
        assert_eq!(fx.calls(), vec![EngineCall::PieceDownloaded(9)]);
    }

    #[test]
    fn test_buyer_piece_arrival_validated() {
        let mut fx = fixture(MemoryTransport::downloading(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_buy(buyer_terms()).unwrap();
        fx.alerts();

        fx.engine_requests(vec![EngineRequest::FullPieceArrived {
            peer: a,
            data: PieceData::from(vec![3; 16]),
            index: 3,
        }]);

        let valid: Vec<_> = fx
            .alerts()
            .into_iter()
            .filter(|k| matches!(k, AlertKind::ValidPieceArrived { .. }))
            .collect();
        assert_eq!(
            valid,
            vec![AlertKind::ValidPieceArrived {
                endpoint: endpoint(1),
                peer: a,
                index: 3
            }]
        );
        assert!(fx.calls().contains(&EngineCall::ValidPiece { peer: a, index: 3 }));
        assert_eq!(fx.coordinator.orchestrator().pending_arrival_count(), 0);
    }

    #[test]
    fn test_arrival_of_held_piece_is_valid_without_storing() {
        let transport = MemoryTransport::downloading(8, 16);
        {
            let handle = transport.handle();
            let mut state = handle.lock();
            state.have[5] = true;
            state.queue_validations = true;
        }
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        let b = fx.connect(2);
        fx.coordinator.to_buy(buyer_terms()).unwrap();
        fx.alerts();

        fx.engine_requests(vec![
            EngineRequest::FullPieceArrived {
                peer: a,
                data: PieceData::from(vec![5; 16]),
                index: 5,
            },
            EngineRequest::FullPieceArrived {
                peer: b,
                data: PieceData::from(vec![5; 16]),
                index: 5,
            },
        ]);

        assert_eq!(fx.coordinator.orchestrator().pending_arrival_count(), 0);
        assert!(fx.transport.lock().added.is_empty());
        let alerts = fx.alerts();
        for (peer, id) in [(a, 1), (b, 2)] {
            assert!(alerts.contains(&AlertKind::ValidPieceArrived {
                endpoint: endpoint(id),
                peer,
                index: 5
            }));
            assert!(fx.calls().contains(&EngineCall::ValidPiece { peer, index: 5 }));
        }
        assert_eq!(fx.state_of(b), PeerState::Registered);
        assert!(fx.coordinator.on_add_peer(endpoint(2)));
    }

    #[test]
    fn test_failed_validation_does_not_ban() {
        let transport = MemoryTransport::downloading(8, 16);
        transport.handle().lock().queue_validations = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_buy(buyer_terms()).unwrap();
        fx.engine_requests(vec![EngineRequest::FullPieceArrived {
            peer: a,
            data: PieceData::from(vec![0; 16]),
            index: 2,
        }]);
        fx.alerts();

        fx.coordinator.on_piece_validation_failed(2);

        assert_eq!(
            fx.alerts(),
            vec![AlertKind::InvalidPieceArrived {
                endpoint: endpoint(1),
                peer: a,
                index: 2
            }]
        );
        assert!(fx.calls().contains(&EngineCall::InvalidPiece { peer: a, index: 2 }));
        assert_eq!(fx.coordinator.bans().misbehaved_count(), 0);
    }

    #[test]
    fn test_duplicate_arrival_removes_second_seller() {
        let transport = MemoryTransport::downloading(8, 16);
        transport.handle().lock().queue_validations = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        let b = fx.connect(2);
        fx.coordinator.to_buy(buyer_terms()).unwrap();

        fx.engine_requests(vec![
            EngineRequest::FullPieceArrived {
                peer: a,
                data: PieceData::from(vec![4; 16]),
                index: 4,
            },
            EngineRequest::FullPieceArrived {
                peer: b,
                data: PieceData::from(vec![4; 16]),
                index: 4,
            },
        ]);

        assert_eq!(fx.coordinator.orchestrator().arrival_owner(4), Some(a));
        assert_eq!(fx.transport.lock().added.len(), 1);
        assert_eq!(fx.state_of(b), PeerState::Active);
        assert!(!fx.coordinator.on_add_peer(endpoint(2)));
        assert!(fx
            .transport
            .lock()
            .dropped
            .contains(&(ConnectionId(2), DropReason::RemovedFromSession)));
    }

    #[test]
    fn test_requests_for_other_mode_ignored() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_observe();

        fx.engine_requests(vec![EngineRequest::LoadPiece { peer: a, index: 0 }]);

        assert!(fx.transport.lock().reads.is_empty());
    }

    #[test]
    fn test_send_resolves_live_connection() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.engine_requests(vec![
            EngineRequest::Send {
                peer: a,
                message: WireMessage::Observe,
            },
            EngineRequest::Send {
                peer: pid(99),
                message: WireMessage::Observe,
            },
        ]);

        assert_eq!(
            fx.transport.lock().sent,
            vec![(ConnectionId(1), WireMessage::Observe)]
        );
    }

    #[test]
    fn test_malformed_message_bans_endpoint() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.coordinator.on_extended_message(
            a,
            Err(MalformedMessage {
                reason: "truncated".into(),
            }),
        );

        assert_eq!(fx.state_of(a), PeerState::Active);
        assert!(fx
            .transport
            .lock()
            .dropped
            .contains(&(ConnectionId(1), DropReason::MalformedMessage)));

        fx.coordinator.on_disconnect(ConnectionId(1), "dropped");
        fx.coordinator.on_new_connection(NewConnection {
            id: ConnectionId(2),
            endpoint: endpoint(1),
            kind: ConnectionKind::BitTorrent,
            outgoing: true,
        });
        assert_eq!(
            fx.coordinator.on_handshake_complete(ConnectionId(2), a),
            Ok(HandshakeOutcome::Banned)
        );
        assert!(fx
            .transport
            .lock()
            .dropped
            .contains(&(ConnectionId(2), DropReason::Banned)));
        assert_eq!(fx.coordinator.registry().peer_count(), 0);
    }

    #[test]
    fn test_ban_check_can_be_disabled() {
        let mut config = CoordinatorConfig::default();
        config.ban.ban_malformed_senders = false;
        let mut fx = fixture_with(MemoryTransport::seeding(8, 16), config);
        let a = fx.connect(1);

        fx.coordinator.on_extended_message(
            a,
            Err(MalformedMessage {
                reason: "bad bencode".into(),
            }),
        );

        assert_eq!(fx.coordinator.bans().malformed_count(), 1);
        assert!(fx.coordinator.on_add_peer(endpoint(1)));
    }

    #[test]
    fn test_message_without_extension_protocol_is_misbehaviour() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect_with(1, false, false);

        fx.coordinator.on_extended_message(a, Ok(WireMessage::Observe));

        assert_eq!(fx.coordinator.bans().misbehaved_count(), 1);
        assert!(fx
            .transport
            .lock()
            .dropped
            .contains(&(ConnectionId(1), DropReason::ProtocolViolation)));
    }

    #[test]
    fn test_messages_forwarded_only_when_registered() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);

        fx.coordinator.on_extended_message(a, Ok(WireMessage::Observe));
        assert!(fx.calls().is_empty());

        fx.coordinator.to_sell(seller_terms()).unwrap();
        fx.coordinator.on_extended_message(a, Ok(WireMessage::Observe));
        assert!(fx
            .calls()
            .contains(&EngineCall::ProcessMessage(a, WireMessage::Observe)));
    }

    #[test]
    fn test_withdrawn_payment_support_unregisters() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.coordinator.on_extended_handshake(a, true, false);

        assert_eq!(fx.state_of(a), PeerState::Active);
        assert!(fx.calls().contains(&EngineCall::RemoveConnection(a)));
        assert!(fx.transport.lock().dropped.is_empty());
    }

    #[test]
    fn test_disconnect_unregisters_and_forgets() {
        let transport = MemoryTransport::seeding(8, 16);
        transport.handle().lock().queue_reads = true;
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();
        fx.engine_requests(vec![EngineRequest::LoadPiece { peer: a, index: 6 }]);
        fx.alerts();

        fx.coordinator.on_disconnect(ConnectionId(1), "eof");

        assert!(fx.calls().contains(&EngineCall::RemoveConnection(a)));
        assert_eq!(
            fx.alerts(),
            vec![AlertKind::ConnectionRemoved {
                endpoint: endpoint(1),
                peer: a
            }]
        );
        assert_eq!(fx.coordinator.registry().peer_count(), 0);
        assert!(fx.coordinator.orchestrator().load_waiters(6).unwrap().is_empty());
        assert!(fx.transport.lock().dropped.is_empty());
        assert_eq!(fx.coordinator.bans().misbehaved_count(), 0);
    }

    #[test]
    fn test_disconnect_before_handshake() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        fx.coordinator.on_new_connection(NewConnection {
            id: ConnectionId(4),
            endpoint: endpoint(4),
            kind: ConnectionKind::BitTorrent,
            outgoing: false,
        });

        fx.coordinator.on_disconnect(ConnectionId(4), "reset");

        assert_eq!(fx.coordinator.registry().awaiting_count(), 0);
    }

    #[test]
    fn test_stop_and_restart() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.coordinator.stop();

        assert_eq!(fx.state_of(a), PeerState::Active);
        assert_eq!(
            fx.transport.lock().handshakes,
            vec![(ConnectionId(1), ExtendedHandshake::Uninstall)]
        );
        assert!(fx.transport.lock().dropped.is_empty());
        assert!(fx.alerts().contains(&AlertKind::SessionStopped));

        fx.coordinator.start();

        assert_eq!(fx.state_of(a), PeerState::Registered);
        assert_eq!(
            fx.transport.lock().handshakes.last(),
            Some(&(ConnectionId(1), ExtendedHandshake::Install))
        );
        assert!(fx.alerts().contains(&AlertKind::SessionStarted));
    }

    #[test]
    fn test_stopped_session_defers_registration() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        fx.coordinator.stop();
        fx.coordinator.to_sell(seller_terms()).unwrap();

        let a = fx.connect(1);

        assert_eq!(fx.state_of(a), PeerState::Active);
        fx.coordinator.start();
        assert_eq!(fx.state_of(a), PeerState::Registered);
    }

    #[test]
    fn test_pause_keeps_connections() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        let a = fx.connect(1);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        fx.coordinator.pause();

        assert_eq!(fx.state_of(a), PeerState::Registered);
        assert_eq!(
            fx.coordinator.status_snapshot().session_state,
            SessionState::Paused
        );
        assert!(fx.alerts().contains(&AlertKind::SessionPaused));
    }

    #[test]
    fn test_terms_update_requires_matching_mode() {
        let mut fx = fixture(MemoryTransport::seeding(8, 16));
        fx.coordinator.to_observe();

        let err = fx.coordinator.update_seller_terms(seller_terms()).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ModeMismatch {
                expected: ModeKind::Selling,
                actual: ModeKind::Observing
            }
        ));

        fx.coordinator.to_sell(seller_terms()).unwrap();
        let mut terms = seller_terms();
        terms.min_price = 42;
        fx.coordinator.update_seller_terms(terms.clone()).unwrap();

        assert_eq!(fx.coordinator.mode(), &OperatingMode::Selling(terms.clone()));
        assert!(fx.calls().contains(&EngineCall::UpdateSellerTerms(terms.clone())));
        assert!(fx.alerts().contains(&AlertKind::SellerTermsUpdated(terms)));
        assert!(fx.coordinator.update_buyer_terms(buyer_terms()).is_err());
    }

    #[test]
    fn test_start_downloading_uses_priority_picker() {
        let transport = MemoryTransport::downloading(3, 16);
        transport.handle().lock().priorities = vec![1, 1, 5];
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_buy(buyer_terms()).unwrap();

        let contract = DownloadContract {
            transaction: vec![0xde, 0xad],
            sellers: BTreeMap::from([(
                a,
                SellerAllocation {
                    output_index: 0,
                    value: 1000,
                    contract_pk: vec![2; 33],
                    final_pk_hash: vec![3; 20],
                },
            )]),
        };
        fx.coordinator.start_downloading(contract).unwrap();

        let mut selector = fx.engine.lock().selector.take().unwrap();
        let pieces = [
            PieceAssignment::Unassigned,
            PieceAssignment::Assigned,
            PieceAssignment::Unassigned,
        ];
        assert_eq!(selector(&pieces[..]), Ok(2));
        assert!(fx
            .alerts()
            .contains(&AlertKind::DownloadStarted { sellers: vec![a] }));
    }

    #[test]
    fn test_picker_follows_priority_changes_after_start() {
        let transport = MemoryTransport::downloading(3, 16);
        transport.handle().lock().priorities = vec![1, 1, 5];
        let mut fx = fixture(transport);
        let a = fx.connect(1);
        fx.coordinator.to_buy(buyer_terms()).unwrap();
        let contract = DownloadContract {
            transaction: vec![0xbe, 0xef],
            sellers: BTreeMap::from([(
                a,
                SellerAllocation {
                    output_index: 0,
                    value: 500,
                    contract_pk: vec![2; 33],
                    final_pk_hash: vec![3; 20],
                },
            )]),
        };
        fx.coordinator.start_downloading(contract).unwrap();

        let mut selector = fx.engine.lock().selector.take().unwrap();
        let pieces = [
            PieceAssignment::Unassigned,
            PieceAssignment::Assigned,
            PieceAssignment::Unassigned,
        ];
        assert_eq!(selector(&pieces[..]), Ok(2));

        fx.transport.lock().priorities = vec![9, 1, 5];
        assert_eq!(selector(&pieces[..]), Ok(0));
    }

    #[test]
    fn test_start_downloading_requires_buy_mode() {
        let mut fx = fixture(MemoryTransport::seeding(3, 16));
        fx.coordinator.to_sell(seller_terms()).unwrap();
        let err = fx
            .coordinator
            .start_downloading(DownloadContract {
                transaction: vec![],
                sellers: BTreeMap::new(),
            })
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ModeMismatch { .. }));
    }

    #[test]
    fn test_start_uploading() {
        let mut fx = fixture(MemoryTransport::seeding(3, 16));
        let a = fx.connect(1);
        let contract = UploadContract {
            contract_key_pair: vec![1; 32],
            final_pk_hash: vec![2; 20],
        };

        assert!(matches!(
            fx.coordinator
                .start_uploading(a, buyer_terms(), contract.clone()),
            Err(CoordinatorError::ModeMismatch { .. })
        ));

        fx.coordinator.to_sell(seller_terms()).unwrap();
        assert!(matches!(
            fx.coordinator
                .start_uploading(pid(7), buyer_terms(), contract.clone()),
            Err(CoordinatorError::PeerNotFound(_))
        ));
        fx.coordinator
            .start_uploading(a, buyer_terms(), contract)
            .unwrap();
        assert!(fx.calls().contains(&EngineCall::StartUploading { peer: a }));
    }

    #[test]
    fn test_register_requires_mode() {
        let mut fx = fixture(MemoryTransport::seeding(3, 16));
        let a = fx.connect(1);
        let err = fx
            .coordinator
            .run(|session, ctx| session.register_connection(ctx, a))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ModeNotSet));
    }

    #[test]
    fn test_engine_refusal_leaves_peer_active() {
        let mut fx = fixture(MemoryTransport::seeding(3, 16));
        fx.engine.lock().reject_connections = true;
        let a = fx.connect(1);

        fx.coordinator.to_sell(seller_terms()).unwrap();

        assert_eq!(fx.state_of(a), PeerState::Active);
    }

    #[test]
    fn test_drop_peer() {
        let mut fx = fixture(MemoryTransport::seeding(3, 16));
        let a = fx.connect(1);

        assert!(matches!(
            fx.coordinator.drop_peer(pid(9)),
            Err(CoordinatorError::PeerNotFound(_))
        ));
        fx.coordinator.drop_peer(a).unwrap();
        assert_eq!(
            fx.transport.lock().dropped,
            vec![(ConnectionId(1), DropReason::Requested)]
        );
    }

    #[test]
    fn test_set_interaction() {
        let mut config = CoordinatorConfig::default();
        config.interaction = TransportInteraction::BlockDownloading;
        let mut fx = fixture_with(MemoryTransport::seeding(3, 16), config);
        assert_eq!(
            fx.transport.lock().interaction,
            TransportInteraction::BlockDownloading
        );

        fx.coordinator
            .set_interaction(TransportInteraction::BlockUploadingAndDownloading);

        assert_eq!(
            fx.transport.lock().interaction,
            TransportInteraction::BlockUploadingAndDownloading
        );
        assert_eq!(
            fx.coordinator.status_snapshot().interaction,
            TransportInteraction::BlockUploadingAndDownloading
        );
    }

    #[test]
    fn test_status_snapshot() {
        let mut fx = fixture(MemoryTransport::seeding(3, 16));
        let a = fx.connect(1);
        fx.connect_with(2, true, false);
        fx.coordinator.to_sell(seller_terms()).unwrap();

        let status = fx.coordinator.status_snapshot();

        assert_eq!(status.info_hash, "aa".repeat(20));
        assert_eq!(status.mode, ModeKind::Selling);
        assert_eq!(status.session_state, SessionState::Started);
        assert_eq!(status.peers.len(), 2);
        assert_eq!(status.registered_count(), 1);
        assert_eq!(status.peers[0].peer_id, a.to_hex());
        assert!(status.peers[0].engine.is_some());
        assert!(status.peers[1].engine.is_none());
    }
}
