pub mod ban;
pub mod connection;
pub mod registry;

pub use ban::{BanEntry, BanPolicy, BanReason};
pub use connection::{ConnectionKind, ExtensionSupport, NewConnection, PeerConnection, PeerState};
pub use registry::{Admission, HandshakeOutcome, PeerRegistry, RejectReason};
