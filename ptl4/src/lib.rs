//! User-space runtime for one-sided messaging.
//!
//! The crate re-exports the engine ([`ptl4_core`]) and the wire codec
//! ([`ptl4_wire`]) under one roof. See `ptl4-core` for the state machines
//! and object model, `ptl4-wire` for the message formats.

#![warn(missing_docs)]

pub use ptl4_core::*;

/// Wire representation of messages.
pub mod wire {
    pub use ptl4_wire::*;
}
