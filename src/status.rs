use crate::config::TransportInteraction;
use crate::engine::{ConnectionStatus, SessionState};
use crate::peer::{ExtensionSupport, PeerState};
use crate::session::ModeKind;
use serde::Serialize;
use std::net::SocketAddr;

/// One tracked connection as seen by the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer_id: String,
    pub endpoint: SocketAddr,
    pub outgoing: bool,
    pub state: PeerState,
    pub bep10: ExtensionSupport,
    pub payment: ExtensionSupport,
    /// Engine's view, only for registered connections
    pub engine: Option<ConnectionStatus>,
}

/// Point-in-time view of one torrent's coordinator
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub info_hash: String,
    pub mode: ModeKind,
    pub session_state: SessionState,
    pub interaction: TransportInteraction,
    pub peers: Vec<PeerStatus>,
    pub awaiting_handshake: usize,
    pub pending_loads: usize,
    pub pending_arrivals: usize,
    pub malformed_senders: usize,
    pub misbehaved_peers: usize,
}

impl CoordinatorStatus {
    pub fn registered_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state == PeerState::Registered)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes() {
        let status = CoordinatorStatus {
            info_hash: "00".repeat(20),
            mode: ModeKind::Selling,
            session_state: SessionState::Started,
            interaction: TransportInteraction::BlockUploading,
            peers: vec![PeerStatus {
                peer_id: "11".repeat(20),
                endpoint: "10.0.0.1:6881".parse().unwrap(),
                outgoing: true,
                state: PeerState::Registered,
                bep10: ExtensionSupport::Supported,
                payment: ExtensionSupport::Supported,
                engine: None,
            }],
            awaiting_handshake: 0,
            pending_loads: 1,
            pending_arrivals: 0,
            malformed_senders: 0,
            misbehaved_peers: 2,
        };

        let json: serde_json::Value = serde_json::from_str(&status.to_json().unwrap()).unwrap();
        assert_eq!(json["mode"], "Selling");
        assert_eq!(json["interaction"], "block_uploading");
        assert_eq!(json["peers"][0]["state"], "Registered");
        assert_eq!(status.registered_count(), 1);
    }
}
