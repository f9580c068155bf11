//! Wire representation of portals messages.
//!
//! Every multi-byte field is little-endian on the wire regardless of host
//! byte order; the codecs here are explicit about it. The crate is the
//! dependency-light base layer: it knows nothing about matching, events or
//! transports.

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod atom;
pub use atom::*;

mod hdr;
pub use hdr::*;

mod data;
pub use data::*;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before the message did.
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the field being decoded.
        need: usize,
        /// Bytes remaining in the buffer.
        have: usize,
    },
    /// A field holds a value outside its defined range.
    #[error("invalid {field} value {value}")]
    BadField {
        /// Name of the offending field.
        field: &'static str,
        /// The raw value found on the wire.
        value: u32,
    },
}

pub(crate) fn need(buf: &[u8], n: usize) -> Result<(), WireError> {
    if buf.len() < n {
        Err(WireError::Truncated {
            need: n,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}
