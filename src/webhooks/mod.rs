//! Inbound payment processor callbacks.

pub mod signature;

pub use signature::{verify, SignatureError};
