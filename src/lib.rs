//! Per-torrent coordination between a BitTorrent transport engine and a
//! payment-channel trading engine.
//!
//! [`Coordinator`] is the entry point: feed it transport events and
//! application calls, read notifications from the [`AlertReceiver`] it hands
//! back.

pub mod alert;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod peer;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use alert::{Alert, AlertKind, AlertReceiver};
pub use config::{CoordinatorConfig, TransportInteraction};
pub use coordinator::Coordinator;
pub use engine::{EngineRequest, TradingEngine, WireMessage};
pub use error::{CoordinatorError, Result};
pub use session::{ModeKind, OperatingMode};
pub use status::CoordinatorStatus;
pub use transport::TransportEngine;
pub use types::{BuyerTerms, ConnectionId, InfoHash, PeerId, PieceData, SellerTerms};
