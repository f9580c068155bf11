//! The transport capability surface.
//!
//! The engine never talks to a wire directly. Each connection carries a
//! [`Transport`] object the state machines call to allocate send buffers,
//! emit messages and move bulk data; progress threads call back into the
//! engine entry points when those asynchronous actions complete.

use std::io;
use std::sync::Arc;

use ptl4_wire::{MemIovec, Sge};

use crate::buf::{BufInner, DataDir, MsgBuf};
use crate::conn::Conn;
use crate::ni::Ni;
use crate::ProcessId;

/// Family of a transport, which decides how indirect descriptors are
/// fetched and whether data motion completes asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Remote-DMA capable fabric; bulk transfers and descriptor fetches
    /// complete asynchronously.
    Rdma,
    /// Shared or otherwise directly addressable memory; transfers complete
    /// in place.
    Mem,
}

/// Opaque destination addressing resolved at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dest(pub u64);

/// An outgoing message owned by the engine until handed to the transport.
#[derive(Debug, Default)]
pub struct SendBuf {
    /// The final wire image.
    pub bytes: Vec<u8>,
    /// Inline reply payload staged before the header is finalized.
    pub payload: Vec<u8>,
    /// Whether `payload` carries reply data.
    pub data_out: bool,
    /// Where to send the message.
    pub dest: Option<Dest>,
    /// Hint that the transport should inline the message if it can.
    pub inline_hint: bool,
    /// Request handle echoed in response headers.
    pub handle: u32,
}

impl SendBuf {
    /// An empty send buffer.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of an indirect-descriptor fetch.
#[derive(Debug)]
pub enum DescFetch {
    /// The descriptor block was read synchronously.
    Ready(Vec<u8>),
    /// The read was posted; [`desc_ready`](crate::desc_ready) will deliver
    /// the block.
    Pending,
}

/// The entry of an indirect data descriptor, pointing at a segment list in
/// the peer's memory.
#[derive(Debug, Clone, Copy)]
pub enum IndirectTarget {
    /// Scatter-gather entry of a remote-DMA transport.
    Sge(Sge),
    /// Segment of a shared-memory transport.
    Mem(MemIovec),
}

/// Capability object a connection uses to reach its peer.
pub trait Transport: Send + Sync {
    /// The transport family.
    fn kind(&self) -> TransportKind;

    /// Allocate a send buffer, possibly from a bounded pool.
    fn buf_alloc(&self) -> io::Result<SendBuf>;

    /// Apply transport-specific send flags; `inline_hint` asks the
    /// transport to avoid a completion round trip when the message is
    /// small.
    fn set_send_flags(&self, buf: &mut SendBuf, inline_hint: bool);

    /// Queue a message for transmission. When `signaled` is set the
    /// transport must eventually report the send completion via
    /// [`send_completion`](crate::send_completion).
    fn send_message(&self, buf: SendBuf, signaled: bool) -> io::Result<()>;

    /// Issue as much bulk data motion as the transport has room for against
    /// the residual of the current direction. Asynchronous completions are
    /// reported via [`rdma_completion`](crate::rdma_completion).
    fn post_tgt_dma(&self, buf: &Arc<MsgBuf>, inner: &mut BufInner) -> io::Result<()>;

    /// Read the segment list an indirect descriptor points at.
    fn fetch_remote_desc(
        &self,
        buf: &Arc<MsgBuf>,
        target: IndirectTarget,
    ) -> io::Result<DescFetch>;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport({:?})", self.kind())
    }
}

/// Connection management callbacks the engine invokes.
pub trait Connector: Send + Sync {
    /// Choose the transport for a peer when its connection object is first
    /// created.
    fn assign_transport(&self, peer: ProcessId) -> Arc<dyn Transport>;

    /// Start an outbound connection attempt. Completion is reported via
    /// [`connection_ready`](crate::connection_ready) or
    /// [`connection_failed`](crate::connection_failed).
    fn init_connect(&self, ni: &Arc<Ni>, conn: &Arc<Conn>) -> io::Result<()>;
}

/// Synchronously drain the current data phase of a directly addressable
/// transfer by copying between the peer's segments and the matched element.
///
/// A shared-memory transport's `post_tgt_dma` is exactly this call.
pub fn drive_mem_dma(inner: &mut BufInner) -> io::Result<()> {
    while inner.dma_resid() > 0 {
        let Some(chunk) = inner.next_dma_chunk(usize::MAX) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment list exhausted before transfer drained",
            ));
        };
        unsafe {
            match inner.dma_dir() {
                DataDir::In => std::ptr::copy_nonoverlapping(
                    chunk.remote as *const u8,
                    chunk.local,
                    chunk.len,
                ),
                DataDir::Out => std::ptr::copy_nonoverlapping(
                    chunk.local as *const u8,
                    chunk.remote as *mut u8,
                    chunk.len,
                ),
            }
        }
        inner.complete_dma_chunk(chunk.len as u64);
    }
    Ok(())
}
