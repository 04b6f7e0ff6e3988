use crate::engine::EngineRequest;
use crate::types::{BuyerTerms, SellerTerms};
use serde::Serialize;

/// Operating mode without its terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModeKind {
    NotSet,
    Observing,
    Selling,
    Buying,
}

/// Economic role this node currently plays in the swarm
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OperatingMode {
    #[default]
    NotSet,
    Observing,
    Selling(SellerTerms),
    Buying(BuyerTerms),
}

impl OperatingMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            OperatingMode::NotSet => ModeKind::NotSet,
            OperatingMode::Observing => ModeKind::Observing,
            OperatingMode::Selling(_) => ModeKind::Selling,
            OperatingMode::Buying(_) => ModeKind::Buying,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, OperatingMode::NotSet)
    }

    /// Whether the hook behind `request` is wired in this mode.
    ///
    /// Requests for hooks of another mode are stale leftovers of a transition.
    pub fn accepts(&self, request: &EngineRequest) -> bool {
        match request {
            EngineRequest::Send { .. } | EngineRequest::RemoveConnection { .. } => self.is_set(),
            EngineRequest::LoadPiece { .. }
            | EngineRequest::ClaimLastPayment { .. }
            | EngineRequest::AnchorAnnounced { .. }
            | EngineRequest::ReceivedValidPayment { .. } => self.kind() == ModeKind::Selling,
            EngineRequest::FullPieceArrived { .. }
            | EngineRequest::SentPayment { .. }
            | EngineRequest::AllSellersGone => self.kind() == ModeKind::Buying,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    fn seller_terms() -> SellerTerms {
        SellerTerms {
            min_price: 1,
            min_lock: 1,
            max_sellers: 1,
            min_contract_fee_per_kb: 1,
            settlement_fee: 1,
        }
    }

    #[test]
    fn test_sell_hooks_only_wired_when_selling() {
        let load = EngineRequest::LoadPiece {
            peer: PeerId::new([1; 20]),
            index: 0,
        };
        assert!(OperatingMode::Selling(seller_terms()).accepts(&load));
        assert!(!OperatingMode::Observing.accepts(&load));
        assert!(!OperatingMode::NotSet.accepts(&load));
    }

    #[test]
    fn test_nothing_wired_before_mode_set() {
        assert!(!OperatingMode::NotSet.accepts(&EngineRequest::AllSellersGone));
        assert!(!OperatingMode::NotSet.accepts(&EngineRequest::Send {
            peer: PeerId::new([1; 20]),
            message: crate::engine::WireMessage::Observe,
        }));
    }
}
