use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 20-byte protocol peer identifier, known once the BitTorrent handshake is read.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// Raw identity the transport assigns to a connection before the peer id is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Torrent info hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoHash(pub [u8; 20]);

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

/// Piece bytes, shared between every buyer waiting on the same read.
#[derive(Clone, PartialEq, Eq)]
pub struct PieceData(Arc<[u8]>);

impl PieceData {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PieceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceData({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for PieceData {
    fn from(v: Vec<u8>) -> Self {
        Self(v.into())
    }
}

/// Terms a seller advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerTerms {
    /// Minimum price per piece (satoshi)
    pub min_price: u64,

    /// Minimum refund lock time
    pub min_lock: u16,

    /// Maximum number of sellers the seller accepts in one contract
    pub max_sellers: u32,

    /// Minimum contract fee (satoshi per kB)
    pub min_contract_fee_per_kb: u64,

    /// Fee for the settlement transaction (satoshi)
    pub settlement_fee: u64,
}

/// Terms a buyer advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerTerms {
    /// Maximum price per piece (satoshi)
    pub max_price: u64,

    /// Maximum refund lock time
    pub max_lock: u16,

    /// Minimum number of sellers in a contract
    pub min_number_of_sellers: u32,

    /// Maximum contract fee (satoshi per kB)
    pub max_contract_fee_per_kb: u64,
}
