pub mod orchestrator;
pub mod picker;

pub use orchestrator::{
    ArrivalOutcome, ArrivalSubmission, LoadDelivery, LoadRequest, PieceExchangeOrchestrator,
    PurgeSummary,
};
pub use picker::{pick, PieceAssignment};
