use crate::types::{ConnectionId, PeerId};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::SystemTime;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    AwaitingHandshake,
    Active,
    Registered,
}

/// What a peer said about an extension in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ExtensionSupport {
    #[default]
    Unknown,
    Supported,
    NotSupported,
}

impl ExtensionSupport {
    pub fn from_flag(supported: bool) -> Self {
        if supported {
            ExtensionSupport::Supported
        } else {
            ExtensionSupport::NotSupported
        }
    }
}

/// Kind of transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    BitTorrent,
    WebSeed,
    HttpSeed,
}

/// A new connection as reported by the transport
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub id: ConnectionId,
    pub endpoint: SocketAddr,
    pub kind: ConnectionKind,
    pub outgoing: bool,
}

/// One transport connection for this torrent
#[derive(Debug, Clone)]
pub struct PeerConnection {
    /// Transport-assigned identity
    pub connection_id: ConnectionId,

    /// Remote endpoint
    pub endpoint: SocketAddr,

    /// Protocol peer id, once the handshake is read
    pub peer_id: Option<PeerId>,

    /// We dialed the peer
    pub outgoing: bool,

    /// Extension protocol (BEP10) support
    pub bep10: ExtensionSupport,

    /// Payment protocol extension support
    pub payment: ExtensionSupport,

    /// Lifecycle state
    pub state: PeerState,

    /// When the transport reported the connection
    pub connected_at: SystemTime,
}

impl PeerConnection {
    pub fn new(conn: &NewConnection) -> Self {
        Self {
            connection_id: conn.id,
            endpoint: conn.endpoint,
            peer_id: None,
            outgoing: conn.outgoing,
            bep10: ExtensionSupport::Unknown,
            payment: ExtensionSupport::Unknown,
            state: PeerState::AwaitingHandshake,
            connected_at: SystemTime::now(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == PeerState::Registered
    }

    pub fn supports_payment(&self) -> bool {
        self.payment == ExtensionSupport::Supported
    }

    /// Active, advertised payment support, not yet in the engine
    pub fn is_registrable(&self) -> bool {
        self.state == PeerState::Active && self.supports_payment()
    }
}
