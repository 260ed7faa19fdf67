//! Checkout dialogue: validators, the pure state machine, and the engine that
//! drives it per user.

pub mod engine;
pub mod state;
pub mod validation;

pub use engine::{CheckoutEngine, SessionInfo};
pub use state::{CancelReason, CheckoutInput, CheckoutState, Termination};
