//! Message buffers.
//!
//! A [`MsgBuf`] is the unit of work both state machines operate on. It is
//! created when a request is received (target side) or issued (initiator
//! side), holds every cursor and reference the machine needs across
//! suspensions, and is shared by reference with every list that may need to
//! revive it. The request header is immutable for the life of the buffer
//! and lives outside the lock so list walks can inspect it without taking
//! the buffer mutex.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ptl4_wire::{Data, MemIovec, NiFail, Operation, PtlList, ReqHdr, Sge};

use crate::conn::Conn;
use crate::event::EventQueue;
use crate::init::InitState;
use crate::le::Le;
use crate::md::Md;
use crate::tgt::TgtState;
use crate::transport::{Dest, SendBuf};
use crate::PtlError;

bitflags::bitflags! {
    /// Pending event work for one buffer.
    ///
    /// The target side uses the comm/ack/reply bits; the initiator side
    /// uses the send/ack/reply bits together with the latched option bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct EventMask: u32 {
        const COMM = 1 << 0;
        const CT_COMM = 1 << 1;
        const ACK = 1 << 2;
        const REPLY = 1 << 3;
        const SEND = 1 << 4;
        const CT_SEND = 1 << 5;
        const CT_ACK = 1 << 6;
        const CT_REPLY = 1 << 7;
        const RECV_EXPECTED = 1 << 8;
        const PUT_SUCCESS_DISABLE = 1 << 9;
        const GET_SUCCESS_DISABLE = 1 << 10;
        const PUT_CT_BYTES = 1 << 11;
        const GET_CT_BYTES = 1 << 12;
    }
}

/// Direction of the bulk-data phase currently being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDir {
    /// Initiator memory into the matched element.
    In,
    /// Matched element into initiator memory.
    Out,
}

/// Cursor over the peer-side segment list of a bulk transfer.
#[derive(Debug)]
pub(crate) enum RemoteCursor {
    Sge {
        list: Vec<Sge>,
        idx: usize,
        off: u64,
    },
    Mem {
        list: Vec<MemIovec>,
        idx: usize,
        off: u64,
    },
}

impl RemoteCursor {
    /// The address and length of the next runnable piece, clamped to `max`.
    /// Exhausted and zero-length entries are skipped.
    fn peek(&mut self, max: usize) -> Option<(usize, usize)> {
        loop {
            let (addr, avail) = match self {
                Self::Sge { list, idx, off } => {
                    let e = list.get(*idx)?;
                    (e.addr + *off, e.length as u64 - (*off).min(e.length as u64))
                }
                Self::Mem { list, idx, off } => {
                    let e = list.get(*idx)?;
                    (e.addr + *off, e.length - (*off).min(e.length))
                }
            };
            if avail == 0 {
                match self {
                    Self::Sge { idx, off, .. } | Self::Mem { idx, off, .. } => {
                        *idx += 1;
                        *off = 0;
                    }
                }
                continue;
            }
            return Some((addr as usize, (avail as usize).min(max)));
        }
    }

    fn advance(&mut self, mut n: u64) {
        loop {
            let avail = match self {
                Self::Sge { list, idx, off } => match list.get(*idx) {
                    Some(e) => e.length as u64 - *off,
                    None => return,
                },
                Self::Mem { list, idx, off } => match list.get(*idx) {
                    Some(e) => e.length - *off,
                    None => return,
                },
            };
            if n < avail {
                match self {
                    Self::Sge { off, .. } | Self::Mem { off, .. } => *off += n,
                }
                return;
            }
            n -= avail;
            match self {
                Self::Sge { idx, off, .. } | Self::Mem { idx, off, .. } => {
                    *idx += 1;
                    *off = 0;
                }
            }
            if n == 0 {
                return;
            }
        }
    }
}

/// One runnable piece of a bulk transfer.
#[derive(Debug, Clone, Copy)]
pub struct DmaChunk {
    /// Peer-side address of the piece.
    pub remote: usize,
    /// Local address inside the matched element.
    pub local: *mut u8,
    /// Length in bytes.
    pub len: usize,
}

/// A response ingested by the initiator side.
#[derive(Debug)]
pub(crate) struct RecvResponse {
    pub ni_fail: NiFail,
    pub mlength: u64,
    pub moffset: u64,
    pub payload: Option<Vec<u8>>,
}

/// Persistent state tag for re-entering a suspended machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SmState {
    Tgt(TgtState),
    Init(InitState),
}

/// The mutable half of a message buffer, protected by the buffer mutex.
#[derive(Debug)]
pub struct BufInner {
    pub(crate) state: SmState,
    pub(crate) operation: Operation,
    pub(crate) event_mask: EventMask,
    pub(crate) ni_fail: NiFail,

    // parsed data descriptors, named for the target's transfer directions
    pub(crate) data_in: Option<Data>,
    pub(crate) data_out: Option<Data>,

    // transfer bookkeeping
    pub(crate) mlength: u64,
    pub(crate) moffset: u64,
    pub(crate) put_resid: u64,
    pub(crate) get_resid: u64,
    pub(crate) cur_loc_iov_index: usize,
    pub(crate) cur_loc_iov_off: u64,
    pub(crate) start: Option<usize>,
    pub(crate) rdma_dir: DataDir,
    pub(crate) rem_cursor: Option<RemoteCursor>,
    pub(crate) indir_desc: Option<Vec<u8>>,
    pub(crate) desc_fetched: bool,

    // references picked up while processing
    pub(crate) pt_index: Option<u32>,
    pub(crate) eq: Option<Arc<EventQueue>>,
    pub(crate) le: Option<Arc<Le>>,
    pub(crate) matching_le: Option<Arc<Le>>,
    pub(crate) matching_list: PtlList,
    pub(crate) conn: Option<Arc<Conn>>,
    pub(crate) dest: Option<Dest>,
    pub(crate) send_buf: Option<SendBuf>,
    pub(crate) in_atomic: bool,

    // initiator side; the event targets are cached so descriptor
    // references can be released before their events post
    pub(crate) put_md: Option<Arc<Md>>,
    pub(crate) get_md: Option<Arc<Md>>,
    pub(crate) put_eq: Option<Arc<EventQueue>>,
    pub(crate) get_eq: Option<Arc<EventQueue>>,
    pub(crate) put_ct: Option<Arc<crate::event::Ct>>,
    pub(crate) get_ct: Option<Arc<crate::event::Ct>>,
    pub(crate) put_offset: u64,
    pub(crate) get_offset: u64,
    pub(crate) user_ptr: u64,
    pub(crate) signaled: bool,
    pub(crate) recv: Option<RecvResponse>,
    pub(crate) handle: Option<u32>,
    pub(crate) desc_backing: Option<Box<[u8]>>,
}

impl BufInner {
    fn new(state: SmState, operation: Operation) -> Self {
        Self {
            state,
            operation,
            event_mask: EventMask::empty(),
            ni_fail: NiFail::Ok,
            data_in: None,
            data_out: None,
            mlength: 0,
            moffset: 0,
            put_resid: 0,
            get_resid: 0,
            cur_loc_iov_index: 0,
            cur_loc_iov_off: 0,
            start: None,
            rdma_dir: DataDir::In,
            rem_cursor: None,
            indir_desc: None,
            desc_fetched: false,
            pt_index: None,
            eq: None,
            le: None,
            matching_le: None,
            matching_list: PtlList::Priority,
            conn: None,
            dest: None,
            send_buf: None,
            in_atomic: false,
            put_md: None,
            get_md: None,
            put_eq: None,
            get_eq: None,
            put_ct: None,
            get_ct: None,
            put_offset: 0,
            get_offset: 0,
            user_ptr: 0,
            signaled: false,
            recv: None,
            handle: None,
            desc_backing: None,
        }
    }

    /// Direction of the phase being driven.
    pub fn dma_dir(&self) -> DataDir {
        self.rdma_dir
    }

    /// Bytes left to move in the current direction.
    pub fn dma_resid(&self) -> u64 {
        match self.rdma_dir {
            DataDir::In => self.put_resid,
            DataDir::Out => self.get_resid,
        }
    }

    /// The next runnable piece of the current transfer, clamped to `max`
    /// bytes, or `None` when either side has nothing left.
    pub fn next_dma_chunk(&mut self, max: usize) -> Option<DmaChunk> {
        let resid = self.dma_resid();
        if resid == 0 {
            return None;
        }
        let le = self.le.clone()?;
        let max = max.min(resid as usize);
        let (remote, ravail) = self.rem_cursor.as_mut()?.peek(max)?;
        let (local, lavail) =
            le.region
                .chunk(self.cur_loc_iov_index, self.cur_loc_iov_off, max)?;
        Some(DmaChunk {
            remote,
            local,
            len: ravail.min(lavail),
        })
    }

    /// Advance both cursors and the residual after moving `n` bytes.
    pub fn complete_dma_chunk(&mut self, n: u64) {
        if let Some(cursor) = self.rem_cursor.as_mut() {
            cursor.advance(n);
        }
        if let Some(le) = self.le.clone() {
            le.region
                .advance(&mut self.cur_loc_iov_index, &mut self.cur_loc_iov_off, n);
        }
        match self.rdma_dir {
            DataDir::In => self.put_resid = self.put_resid.saturating_sub(n),
            DataDir::Out => self.get_resid = self.get_resid.saturating_sub(n),
        }
    }

    /// Map `moffset` onto the matched element: reset the local cursor and
    /// resolve the address of the first manipulated byte.
    pub(crate) fn init_local_offset(&mut self) -> Result<(), PtlError> {
        let le = self.le.clone().ok_or(PtlError::Fail)?;
        if self.mlength == 0 {
            // zero-length deliveries need no cursor; offsets past the end
            // of the element are legal here
            self.cur_loc_iov_index = 0;
            self.cur_loc_iov_off = 0;
            self.start = le.region.resolve(self.moffset);
            return Ok(());
        }
        let (idx, off) = le.region.cursor(self.moffset)?;
        self.cur_loc_iov_index = idx;
        self.cur_loc_iov_off = off;
        self.start = le.region.resolve(self.moffset);
        Ok(())
    }
}

/// The unit of work of both state machines.
///
/// One reference is held by the running machine; additional references are
/// taken by every wait list the buffer is parked on and dropped as it
/// leaves them.
#[derive(Debug)]
pub struct MsgBuf {
    req: ReqHdr,
    inner: Mutex<BufInner>,
    rdma_comp: AtomicU32,
    completed: AtomicBool,
}

impl MsgBuf {
    /// Wrap a received request for target-side processing.
    pub(crate) fn target(req: ReqHdr, data_in: Option<Data>, data_out: Option<Data>) -> Arc<Self> {
        let operation = req.operation;
        let mut inner = BufInner::new(SmState::Tgt(TgtState::Start), operation);
        inner.data_in = data_in;
        inner.data_out = data_out;
        Arc::new(Self {
            req,
            inner: Mutex::new(inner),
            rdma_comp: AtomicU32::new(0),
            completed: AtomicBool::new(false),
        })
    }

    /// Wrap an outgoing request for initiator-side processing.
    pub(crate) fn initiator(req: ReqHdr) -> Arc<Self> {
        let operation = req.operation;
        Arc::new(Self {
            req,
            inner: Mutex::new(BufInner::new(SmState::Init(InitState::Start), operation)),
            rdma_comp: AtomicU32::new(0),
            completed: AtomicBool::new(false),
        })
    }

    /// The immutable request header.
    pub(crate) fn req(&self) -> &ReqHdr {
        &self.req
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BufInner> {
        self.inner.lock().unwrap()
    }

    /// Outstanding asynchronous transfer completions.
    pub(crate) fn rdma_comp(&self) -> u32 {
        self.rdma_comp.load(Ordering::Acquire)
    }

    /// Record a posted asynchronous transfer.
    pub fn add_rdma_comp(&self) {
        self.rdma_comp.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sub_rdma_comp(&self) {
        self.rdma_comp.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}
