//! Notifications for the application layer.
//!
//! Alerts are fire-and-forget: a closed receiver only means nobody is listening.

use crate::engine::ConnectionStatus;
use crate::session::ModeKind;
use crate::types::{BuyerTerms, InfoHash, PeerId, SellerTerms};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    SessionStarted,
    SessionStopped,
    SessionPaused,
    ModeChanged(ModeKind),
    SellerTermsUpdated(SellerTerms),
    BuyerTermsUpdated(BuyerTerms),
    ConnectionAdded {
        endpoint: SocketAddr,
        peer: PeerId,
        status: Option<ConnectionStatus>,
    },
    ConnectionRemoved {
        endpoint: SocketAddr,
        peer: PeerId,
    },
    ValidPieceArrived {
        endpoint: SocketAddr,
        peer: PeerId,
        index: u32,
    },
    InvalidPieceArrived {
        endpoint: SocketAddr,
        peer: PeerId,
        index: u32,
    },
    PieceLoadFailed {
        endpoint: SocketAddr,
        peer: PeerId,
        index: u32,
        error: String,
    },
    PaymentReceived {
        endpoint: SocketAddr,
        peer: PeerId,
        increment: u64,
        total_payments: u64,
        total_amount: u64,
    },
    PaymentSent {
        endpoint: SocketAddr,
        peer: PeerId,
        increment: u64,
        total_payments: u64,
        total_amount: u64,
        index: u32,
    },
    LastPaymentReceived {
        endpoint: SocketAddr,
        peer: PeerId,
        settlement: Vec<u8>,
    },
    AnchorAnnounced {
        peer: PeerId,
        value: u64,
        anchor: Vec<u8>,
        contract_pk: Vec<u8>,
        final_pk_hash: Vec<u8>,
    },
    AllSellersGone,
    DownloadStarted {
        sellers: Vec<PeerId>,
    },
    UploadStarted {
        peer: PeerId,
        terms: BuyerTerms,
    },
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub info_hash: InfoHash,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
}

/// Sending half handed to the coordinator
#[derive(Debug, Clone)]
pub struct AlertSender {
    info_hash: InfoHash,
    tx: mpsc::UnboundedSender<Alert>,
}

pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

pub fn channel(info_hash: InfoHash) -> (AlertSender, AlertReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AlertSender { info_hash, tx }, rx)
}

impl AlertSender {
    pub fn emit(&self, kind: AlertKind) {
        trace!(info_hash = %self.info_hash, ?kind, "alert");
        let alert = Alert {
            info_hash: self.info_hash,
            timestamp: Utc::now(),
            kind,
        };
        // receiver gone: nobody is listening
        let _ = self.tx.send(alert);
    }
}
