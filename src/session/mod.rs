pub mod controller;
pub mod mode;

pub use controller::{SessionContext, SessionModeController};
pub use mode::{ModeKind, OperatingMode};
