use super::ban::BanPolicy;
use super::connection::{ConnectionKind, ExtensionSupport, NewConnection, PeerConnection, PeerState};
use crate::config::BanConfig;
use crate::error::RegistryError;
use crate::types::{ConnectionId, PeerId};
use std::collections::HashMap;
use tracing::{debug, info};

/// Outcome of a new transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Not a BitTorrent peer connection, e.g. a web seed
    NotBitTorrent(ConnectionKind),
}

/// Outcome of the BitTorrent handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Ok,
    /// Record removed; the caller must drop the connection
    Banned,
}

/// Owns every peer connection record for one torrent.
///
/// Connections start out keyed by their transport [`ConnectionId`] and move to
/// the [`PeerId`] index once the handshake is read. A peer id is never present
/// in both indices.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Connections whose handshake has not been read
    awaiting: HashMap<ConnectionId, PeerConnection>,

    /// Active and registered connections
    peers: HashMap<PeerId, PeerConnection>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new transport connection
    pub fn admit(&mut self, conn: &NewConnection) -> Admission {
        info!(
            endpoint = %conn.endpoint,
            id = %conn.id,
            outgoing = conn.outgoing,
            "new connection"
        );

        if conn.kind != ConnectionKind::BitTorrent {
            debug!(endpoint = %conn.endpoint, kind = ?conn.kind, "not a bittorrent peer, declining");
            return Admission::Rejected(RejectReason::NotBitTorrent(conn.kind));
        }

        self.awaiting.insert(conn.id, PeerConnection::new(conn));
        Admission::Accepted
    }

    /// Promote a connection once its peer id is known, unless its endpoint is banned
    pub fn complete_handshake(
        &mut self,
        id: ConnectionId,
        peer_id: PeerId,
        bans: &BanPolicy,
        policy: &BanConfig,
    ) -> Result<HandshakeOutcome, RegistryError> {
        if self.peers.contains_key(&peer_id) {
            return Err(RegistryError::DuplicatePeerId(peer_id));
        }

        let mut conn = self
            .awaiting
            .remove(&id)
            .ok_or(RegistryError::ConnectionNotFound(id))?;

        if bans.is_banned(&conn.endpoint, policy) {
            info!(endpoint = %conn.endpoint, peer = %peer_id, "dropping banned peer");
            return Ok(HandshakeOutcome::Banned);
        }

        debug!(endpoint = %conn.endpoint, peer = %peer_id, "connection active");
        conn.peer_id = Some(peer_id);
        conn.state = PeerState::Active;
        self.peers.insert(peer_id, conn);

        Ok(HandshakeOutcome::Ok)
    }

    /// Record extension support from the peer's extended handshake
    pub fn set_extension_support(
        &mut self,
        peer_id: &PeerId,
        bep10: ExtensionSupport,
        payment: ExtensionSupport,
    ) -> Result<(), RegistryError> {
        let conn = self.lookup_mut(peer_id)?;
        conn.bep10 = bep10;
        conn.payment = payment;
        Ok(())
    }

    pub fn mark_registered(&mut self, peer_id: &PeerId) -> Result<(), RegistryError> {
        self.lookup_mut(peer_id)?.state = PeerState::Registered;
        Ok(())
    }

    pub fn mark_unregistered(&mut self, peer_id: &PeerId) -> Result<(), RegistryError> {
        self.lookup_mut(peer_id)?.state = PeerState::Active;
        Ok(())
    }

    /// Forget a connection. Registered connections must be unregistered from
    /// the trading engine before this is called.
    pub fn remove(&mut self, id: ConnectionId) -> Option<PeerConnection> {
        if let Some(conn) = self.awaiting.remove(&id) {
            return Some(conn);
        }

        let peer_id = self
            .peers
            .iter()
            .find(|(_, c)| c.connection_id == id)
            .map(|(pid, _)| *pid)?;

        self.peers.remove(&peer_id)
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Result<&PeerConnection, RegistryError> {
        self.peers
            .get(peer_id)
            .ok_or(RegistryError::NotFound(*peer_id))
    }

    fn lookup_mut(&mut self, peer_id: &PeerId) -> Result<&mut PeerConnection, RegistryError> {
        self.peers
            .get_mut(peer_id)
            .ok_or(RegistryError::NotFound(*peer_id))
    }

    /// Find an active or registered connection by transport id
    pub fn find_by_connection(&self, id: ConnectionId) -> Option<&PeerConnection> {
        self.peers.values().find(|c| c.connection_id == id)
    }

    pub fn is_awaiting(&self, id: ConnectionId) -> bool {
        self.awaiting.contains_key(&id)
    }

    /// Peer ids in `state`, sorted for deterministic iteration
    pub fn peers_in_state(&self, state: PeerState) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, c)| c.state == state)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Active and registered connections
    pub fn connections(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
