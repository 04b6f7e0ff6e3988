use crate::config::BanConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info};

/// Why an endpoint was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BanReason {
    MalformedMessage,
    Misbehavior,
}

#[derive(Debug, Clone, Serialize)]
pub struct BanEntry {
    pub endpoint: SocketAddr,
    pub reason: BanReason,
    /// Unix timestamp of the first offence
    pub recorded_at: i64,
}

/// Endpoints that misbehaved during this run.
///
/// Both sets only grow. Whether membership actually keeps a peer out is decided
/// per check by [`BanConfig`].
#[derive(Debug, Default)]
pub struct BanPolicy {
    /// Sent a malformed extended message, handshake included
    malformed: HashMap<SocketAddr, BanEntry>,

    /// Protocol violations and engine-initiated disconnects for cause
    misbehaved: HashMap<SocketAddr, BanEntry>,
}

impl BanPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_malformed_message(&mut self, endpoint: SocketAddr) {
        Self::record(&mut self.malformed, endpoint, BanReason::MalformedMessage);
    }

    pub fn record_misbehavior(&mut self, endpoint: SocketAddr) {
        Self::record(&mut self.misbehaved, endpoint, BanReason::Misbehavior);
    }

    fn record(set: &mut HashMap<SocketAddr, BanEntry>, endpoint: SocketAddr, reason: BanReason) {
        if set.contains_key(&endpoint) {
            debug!(%endpoint, ?reason, "endpoint already recorded");
            return;
        }
        info!(%endpoint, ?reason, "recording endpoint on ban list");
        set.insert(
            endpoint,
            BanEntry {
                endpoint,
                reason,
                recorded_at: chrono::Utc::now().timestamp(),
            },
        );
    }

    /// Check whether `endpoint` should be refused under `policy`
    pub fn is_banned(&self, endpoint: &SocketAddr, policy: &BanConfig) -> bool {
        if policy.ban_malformed_senders && self.malformed.contains_key(endpoint) {
            debug!(%endpoint, "peer has previously sent malformed extended message");
            return true;
        }
        if policy.ban_misbehaving_peers && self.misbehaved.contains_key(endpoint) {
            debug!(%endpoint, "peer has previously misbehaved");
            return true;
        }
        false
    }

    pub fn malformed_count(&self) -> usize {
        self.malformed.len()
    }

    pub fn misbehaved_count(&self) -> usize {
        self.misbehaved.len()
    }

    /// All recorded entries, malformed senders first
    pub fn entries(&self) -> Vec<BanEntry> {
        self.malformed
            .values()
            .chain(self.misbehaved.values())
            .cloned()
            .collect()
    }
}
