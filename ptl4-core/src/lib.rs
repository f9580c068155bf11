//! Request processing engine for one-sided messaging.
//!
//! The crate hosts the two state machines at the heart of the runtime: the
//! target side, which drives a received request through matching, data
//! motion, events and response emission, and the initiator side, which
//! drives an outgoing request through preparation, transmission and
//! completion. Around them live the portals table, the posted-element lists,
//! the event machinery and the per-peer connection gate.
//!
//! Transports are not implemented here. The engine talks to them through the
//! [`Transport`] capability trait and is re-entered by progress threads via
//! [`recv_request`], [`recv_response`], [`rdma_completion`],
//! [`send_completion`], [`desc_ready`] and [`connection_ready`].

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod error;
pub use error::PtlError;

mod mem;
pub use mem::{IoVec, Region};

mod event;
pub use event::{Ct, CtValue, Event, EventKind, EventQueue};

mod le;
pub use le::{le_append, le_search, le_unlink, Le, LeInit, LeOptions, SearchMode};

mod md;
pub use md::{Md, MdOptions};

mod pt;
pub use pt::{PtOptions, PtState};

mod conn;
pub use conn::{connection_failed, connection_ready, Conn, ConnState};

mod ni;
pub use ni::{Ni, NiBuilder, NiLimits};

mod buf;
pub use buf::{BufInner, DataDir, DmaChunk, MsgBuf};

mod matching;

mod atomic;

mod transport;
pub use transport::{
    drive_mem_dma, Connector, DescFetch, Dest, IndirectTarget, SendBuf, Transport, TransportKind,
};

mod tgt;
pub use tgt::{desc_ready, process_tgt, rdma_completion, recv_request};

mod init;
pub use init::{process_init, recv_response, send_completion, OpArgs};

pub use ptl4_wire::{AckReq, AtomOp, AtomType, NiFail, Operation, PtlList};

/// Wildcard node id accepted by identity filters.
pub const NID_ANY: u32 = u32::MAX;
/// Wildcard process id accepted by identity filters.
pub const PID_ANY: u32 = u32::MAX;
/// Wildcard rank accepted by identity filters on logical interfaces.
pub const RANK_ANY: u32 = u32::MAX;
/// Wildcard user id accepted by permission filters.
pub const UID_ANY: u32 = u32::MAX;

/// Identity of a process on the fabric.
///
/// Physical interfaces address peers by `{nid, pid}`; logical interfaces
/// carry the rank in the `nid` field and ignore `pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId {
    /// Node id, or rank on logical interfaces.
    pub nid: u32,
    /// Process id within the node.
    pub pid: u32,
}

impl ProcessId {
    /// A physical identity.
    pub fn new(nid: u32, pid: u32) -> Self {
        Self { nid, pid }
    }

    /// A logical identity.
    pub fn rank(rank: u32) -> Self {
        Self { nid: rank, pid: 0 }
    }

    /// The identity that matches any peer.
    pub fn any() -> Self {
        Self {
            nid: NID_ANY,
            pid: PID_ANY,
        }
    }
}
