//! The target state machine.
//!
//! `process_tgt` drives a received request through matching, length and
//! offset computation, the connection gate, data motion, event delivery,
//! response emission and cleanup. The machine is a single dispatch over a
//! tagged state, run in a loop until it finishes or reaches a suspension
//! point (waiting for a connection, an indirect-descriptor fetch, bulk
//! transfer completions, or a late element append). Whichever thread
//! observes the awaited completion re-enters the machine with the same
//! buffer; the buffer mutex makes each pass exclusive.

use std::sync::{Arc, MutexGuard};

use ptl4_wire::{
    AckHdr, AckReq, AtomOp, Data, MemIovec, NiFail, Operation, PtlList, ReqHdr, Sge, REQ_HDR_LEN,
};

use crate::atomic::{apply_atomic, apply_swap};
use crate::buf::{BufInner, DataDir, EventMask, MsgBuf, RemoteCursor, SmState};
use crate::event::{Event, EventKind, EventQueue};
use crate::le::{self, LeOptions};
use crate::matching;
use crate::ni::Ni;
use crate::pt::PtState;
use crate::transport::{DescFetch, IndirectTarget};
use crate::{ProcessId, PtlError};

/// States of the target machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TgtState {
    Start,
    Drop,
    GetMatch,
    GetLength,
    WaitConn,
    Data,
    DataIn,
    Rdma,
    AtomicDataIn,
    SwapDataIn,
    DataOut,
    WaitRdmaDesc,
    ShmemDesc,
    CommEvent,
    SendAck,
    SendReply,
    OverflowEvent,
    WaitAppend,
    Cleanup,
    Cleanup2,
    Error,
    Done,
}

/// Hand a received request message to the target machine.
pub fn recv_request(ni: &Arc<Ni>, bytes: &[u8]) -> Result<(), PtlError> {
    let req = ReqHdr::decode(bytes)?;
    let mut at = REQ_HDR_LEN;

    // the request's data_in flag describes the initiator's inbound
    // direction, which is this side's outbound phase, and vice versa;
    // for two-descriptor operations the get descriptor comes first
    let mut tgt_data_out = None;
    let mut tgt_data_in = None;
    if req.data_in {
        let (d, used) = Data::decode(&bytes[at..])?;
        tgt_data_out = Some(d);
        at += used;
    }
    if req.data_out {
        let (d, _) = Data::decode(&bytes[at..])?;
        tgt_data_in = Some(d);
    }

    let buf = MsgBuf::target(req, tgt_data_in, tgt_data_out);
    process_tgt(ni, &buf)
}

/// Report completion of one asynchronous bulk transfer posted for `buf`.
pub fn rdma_completion(ni: &Arc<Ni>, buf: &Arc<MsgBuf>) {
    buf.sub_rdma_comp();
    let resume = {
        let inner = buf.lock();
        inner.state == SmState::Tgt(TgtState::Rdma)
    };
    if resume {
        let _ = process_tgt(ni, buf);
    }
}

/// Deliver a fetched indirect-descriptor block and resume the machine.
pub fn desc_ready(ni: &Arc<Ni>, buf: &Arc<MsgBuf>, bytes: Vec<u8>) {
    let resume = {
        let mut inner = buf.lock();
        inner.indir_desc = Some(bytes);
        inner.desc_fetched = true;
        inner.state == SmState::Tgt(TgtState::WaitRdmaDesc)
    };
    if resume {
        let _ = process_tgt(ni, buf);
    }
}

/// Run the target machine for `buf` until it completes or suspends.
pub fn process_tgt(ni: &Arc<Ni>, buf: &Arc<MsgBuf>) -> Result<(), PtlError> {
    let mut inner = buf.lock();
    let SmState::Tgt(mut state) = inner.state else {
        return Err(PtlError::InvalidArg("not a target buffer"));
    };

    let mut run = TgtRun {
        ni,
        buf,
        atomic_guard: None,
    };
    let mut err = Ok(());

    loop {
        ptl4_log::trace!(?state, "tgt state");
        state = match state {
            TgtState::Start => run.start(&mut inner),
            TgtState::Drop => run.request_drop(&mut inner),
            TgtState::GetMatch => run.get_match(&mut inner),
            TgtState::GetLength => run.get_length(&mut inner),
            TgtState::WaitConn => {
                let next = run.wait_conn(&mut inner);
                if next == TgtState::WaitConn {
                    debug_assert!(run.atomic_guard.is_none());
                    inner.state = SmState::Tgt(next);
                    return err;
                }
                next
            }
            TgtState::Data => run.data(&mut inner),
            TgtState::DataIn => run.data_in(&mut inner),
            TgtState::DataOut => run.data_out(&mut inner),
            TgtState::Rdma => {
                let next = run.rdma(&mut inner);
                if next == TgtState::Rdma {
                    debug_assert!(run.atomic_guard.is_none());
                    inner.state = SmState::Tgt(next);
                    return err;
                }
                next
            }
            TgtState::WaitRdmaDesc => {
                let next = run.wait_rdma_desc(&mut inner);
                if next == TgtState::WaitRdmaDesc {
                    debug_assert!(run.atomic_guard.is_none());
                    inner.state = SmState::Tgt(next);
                    return err;
                }
                next
            }
            TgtState::ShmemDesc => run.shmem_desc(&mut inner),
            TgtState::AtomicDataIn => run.atomic_data_in(&mut inner),
            TgtState::SwapDataIn => run.swap_data_in(&mut inner),
            TgtState::CommEvent => run.comm_event(&mut inner),
            TgtState::SendAck => run.send_ack(&mut inner),
            TgtState::SendReply => run.send_reply(&mut inner),
            TgtState::OverflowEvent => run.overflow_event(&mut inner),
            TgtState::WaitAppend => {
                let next = run.wait_append(&inner);
                if next == TgtState::WaitAppend {
                    inner.state = SmState::Tgt(next);
                    return err;
                }
                next
            }
            TgtState::Cleanup => run.cleanup(&mut inner),
            TgtState::Cleanup2 => {
                run.cleanup_2(&mut inner);
                inner.state = SmState::Tgt(TgtState::Done);
                return err;
            }
            TgtState::Error => {
                ptl4_log::warn!("target request failed");
                run.release_atomic(&mut inner);
                err = Err(PtlError::Fail);
                TgtState::Cleanup
            }
            TgtState::Done => return err,
        };
    }
}

struct TgtRun<'a> {
    ni: &'a Arc<Ni>,
    buf: &'a Arc<MsgBuf>,
    atomic_guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> TgtRun<'a> {
    fn release_atomic(&mut self, inner: &mut BufInner) {
        inner.in_atomic = false;
        self.atomic_guard = None;
    }

    fn post_target_event(
        &self,
        inner: &BufInner,
        eq: &EventQueue,
        kind: EventKind,
        user_ptr: u64,
        start: Option<usize>,
    ) {
        let req = self.buf.req();
        eq.push(Event {
            kind,
            ni_fail: inner.ni_fail,
            initiator: ProcessId::new(req.src_nid, req.src_pid),
            match_bits: req.match_bits,
            hdr_data: req.hdr_data,
            mlength: inner.mlength,
            moffset: inner.moffset,
            remote_offset: req.offset,
            start,
            user_ptr,
            pt_index: req.pt_index,
            uid: req.uid,
        });
    }

    /// Classify the operation, seed the event mask, resolve the peer
    /// connection, allocate the response buffer and charge the table
    /// entry.
    fn start(&mut self, inner: &mut BufInner) -> TgtState {
        let req = self.buf.req();

        match req.operation {
            Operation::Put | Operation::Atomic => {
                if req.ack_req != AckReq::NoAck {
                    inner.event_mask |= EventMask::ACK;
                }
            }
            Operation::Get | Operation::Fetch | Operation::Swap => {
                inner.event_mask |= EventMask::REPLY;
            }
            _ => return TgtState::Error,
        }

        let conn = self
            .ni
            .get_conn(ProcessId::new(req.src_nid, req.src_pid));
        inner.conn = Some(conn.clone());

        if inner
            .event_mask
            .intersects(EventMask::ACK | EventMask::REPLY)
        {
            match conn.transport().buf_alloc() {
                Ok(mut send_buf) => {
                    send_buf.handle = req.handle;
                    inner.send_buf = Some(send_buf);
                }
                Err(_) => return TgtState::Error,
            }
        }

        if req.pt_index >= self.ni.limits().max_pt_index {
            inner.ni_fail = NiFail::Dropped;
            return TgtState::Drop;
        }
        let Some(entry) = self.ni.pt(req.pt_index) else {
            inner.ni_fail = NiFail::Dropped;
            return TgtState::Drop;
        };

        // synchronize with the enable/disable and append APIs
        let mut pt = entry.lock();
        if !pt.in_use {
            inner.ni_fail = NiFail::Dropped;
            return TgtState::Drop;
        }
        if pt.state != PtState::Enabled {
            inner.ni_fail = NiFail::PtDisabled;
            return TgtState::Drop;
        }
        pt.num_tgt_active += 1;
        inner.eq = pt.eq.clone();
        drop(pt);
        inner.pt_index = Some(req.pt_index);

        TgtState::GetMatch
    }

    /// A dropped request still traverses the connect-and-send path when a
    /// response is owed, carrying its failure in the response header.
    fn request_drop(&mut self, inner: &mut BufInner) -> TgtState {
        inner.start = None;
        inner.put_resid = 0;
        inner.get_resid = 0;

        if inner
            .event_mask
            .intersects(EventMask::ACK | EventMask::REPLY)
        {
            TgtState::WaitConn
        } else {
            TgtState::Cleanup
        }
    }

    /// Walk the priority list, then the overflow list, under the table
    /// entry lock.
    fn get_match(&mut self, inner: &mut BufInner) -> TgtState {
        let req = self.buf.req();
        let entry = match inner.pt_index.and_then(|i| self.ni.pt(i)) {
            Some(entry) => entry,
            None => return TgtState::Error,
        };

        let mut pt = entry.lock();
        let found = pt
            .priority
            .iter()
            .chain(pt.overflow.iter())
            .find(|le| !self.ni.is_matching() || matching::check_match(self.ni, req, le))
            .cloned();

        let Some(le) = found else {
            if pt.options.contains(crate::PtOptions::FLOWCTRL) {
                pt.state = PtState::AutoDisabled;
                drop(pt);
                inner.ni_fail = NiFail::PtDisabled;
            } else {
                drop(pt);
                inner.ni_fail = NiFail::Dropped;
            }
            return TgtState::Drop;
        };

        if let Err(fail) = matching::check_perm(req, &le) {
            drop(pt);
            inner.ni_fail = fail;
            return TgtState::Drop;
        }

        if le.list() == PtlList::Overflow {
            // the unexpected-list entry holds its own buffer reference
            pt.unexpected.push_back(self.buf.clone());
        }
        inner.matching_list = le.list();
        inner.le = Some(le.clone());
        drop(pt);

        // the element decides the remaining event mask bits
        if inner.eq.is_some() && !le.options.contains(LeOptions::EVENT_COMM_DISABLE) {
            inner.event_mask |= EventMask::COMM;
        }
        if le.ct.is_some() && le.options.contains(LeOptions::EVENT_CT_COMM) {
            inner.event_mask |= EventMask::CT_COMM;
        }

        TgtState::GetLength
    }

    /// Compute the manipulated length and offset, advance locally managed
    /// elements, apply unlink rules and initialize the local cursor.
    fn get_length(&mut self, inner: &mut BufInner) -> TgtState {
        let req = self.buf.req();
        let le = match inner.le.clone() {
            Some(le) => le,
            None => return TgtState::Error,
        };
        let limits = self.ni.limits();

        let manage = le.options.contains(LeOptions::MANAGE_LOCAL);
        let offset = if manage {
            le.manage_offset()
        } else {
            req.offset
        };
        // requests starting outside the element truncate to zero bytes
        let length = if offset > le.region.len() {
            0
        } else {
            req.length.min(le.region.len() - offset)
        };

        let length = match inner.operation {
            Operation::Put => {
                let l = length.min(limits.max_msg_size);
                inner.put_resid = l;
                inner.get_resid = 0;
                l
            }
            Operation::Get => {
                let l = length.min(limits.max_msg_size);
                inner.put_resid = 0;
                inner.get_resid = l;
                l
            }
            Operation::Atomic => {
                let l = length.min(limits.max_atomic_size);
                inner.put_resid = l;
                inner.get_resid = 0;
                l
            }
            Operation::Fetch => {
                let l = length.min(limits.max_atomic_size);
                inner.put_resid = l;
                inner.get_resid = l;
                l
            }
            Operation::Swap => {
                let l = if req.atom_op == AtomOp::Swap {
                    length.min(limits.max_atomic_size)
                } else {
                    length.min(req.atom_type.size() as u64)
                };
                inner.put_resid = l;
                inner.get_resid = l;
                l
            }
            _ => return TgtState::Error,
        };

        inner.mlength = length;
        inner.moffset = offset;

        // reserve space on a locally managed element; the early states run
        // on one progress thread, so this cannot race another request
        if manage {
            le.offset
                .fetch_add(length, std::sync::atomic::Ordering::AcqRel);
        }

        if le.options.contains(LeOptions::USE_ONCE)
            || (manage
                && le.min_free != 0
                && le.region.len() - le.manage_offset() < le.min_free)
        {
            le::le_unlink(self.ni, &le, true);
        }

        if inner.init_local_offset().is_err() {
            return TgtState::Error;
        }

        let connected = inner.conn.as_ref().is_some_and(|c| c.is_ready());
        if connected {
            return TgtState::Data;
        }

        // a connection is needed to respond or to move non-immediate data
        let needs_conn = inner
            .event_mask
            .intersects(EventMask::ACK | EventMask::REPLY)
            || inner.data_out.is_some()
            || inner.data_in.as_ref().is_some_and(|d| !d.is_immediate());
        if needs_conn {
            TgtState::WaitConn
        } else {
            TgtState::Data
        }
    }

    /// Park on the connection wait list until the peer is reachable.
    fn wait_conn(&mut self, inner: &mut BufInner) -> TgtState {
        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return TgtState::Error,
        };
        if conn.is_ready() {
            return TgtState::Data;
        }
        match conn.park_waiter(self.ni, &conn, self.buf) {
            Ok(true) => TgtState::WaitConn,
            Ok(false) => TgtState::Data,
            Err(_) => TgtState::Error,
        }
    }

    /// Choose the first data phase. Atomic operations take the
    /// interface-wide atomic mutex here and hold it through their data-in
    /// state, serializing all atomics on the interface.
    fn data(&mut self, inner: &mut BufInner) -> TgtState {
        if let Some(conn) = &inner.conn {
            if conn.is_ready() {
                inner.dest = conn.dest();
            }
        }

        if inner.operation.is_atomic() {
            self.atomic_guard = Some(self.ni.atomic_lock());
            inner.in_atomic = true;
        }

        if inner.get_resid > 0 {
            TgtState::DataOut
        } else if inner.put_resid > 0 {
            if inner.operation == Operation::Atomic {
                TgtState::AtomicDataIn
            } else {
                TgtState::DataIn
            }
        } else {
            TgtState::CommEvent
        }
    }

    /// Outbound data for get, fetch and swap replies. Short data is copied
    /// into the response; long data is pushed by bulk transfer.
    fn data_out(&mut self, inner: &mut BufInner) -> TgtState {
        let data = match inner.data_out.clone() {
            Some(data) => data,
            None => return TgtState::Error,
        };
        inner.rdma_dir = DataDir::Out;

        // atomic payloads always fit the inline bound, so the reply of an
        // atomic never needs a bulk transfer
        if inner.mlength < self.ni.limits().max_inline_data || inner.in_atomic {
            let le = match inner.le.clone() {
                Some(le) => le,
                None => return TgtState::Error,
            };
            let mut payload = vec![0u8; inner.mlength as usize];
            if le.region.copy_out(inner.moffset, &mut payload).is_err() {
                return TgtState::Error;
            }
            let Some(send_buf) = inner.send_buf.as_mut() else {
                return TgtState::Error;
            };
            send_buf.payload = payload;
            send_buf.data_out = true;
            inner.get_resid = 0;

            if inner.put_resid > 0 {
                return match inner.operation {
                    Operation::Fetch => TgtState::AtomicDataIn,
                    Operation::Swap => {
                        if self.buf.req().atom_op == AtomOp::Swap {
                            TgtState::DataIn
                        } else {
                            TgtState::SwapDataIn
                        }
                    }
                    _ => TgtState::DataIn,
                };
            }
            return TgtState::CommEvent;
        }

        // atomic payloads are clamped below the inline bound
        debug_assert!(!inner.in_atomic);

        match data {
            Data::RdmaDma(sges) => {
                inner.rem_cursor = Some(RemoteCursor::Sge {
                    list: sges,
                    idx: 0,
                    off: 0,
                });
                TgtState::Rdma
            }
            Data::RdmaIndirect(_) => TgtState::WaitRdmaDesc,
            Data::MemDma(iovs) => {
                inner.rem_cursor = Some(RemoteCursor::Mem {
                    list: iovs,
                    idx: 0,
                    off: 0,
                });
                TgtState::Rdma
            }
            Data::MemIndirect(_) => TgtState::ShmemDesc,
            Data::Immediate(_) => TgtState::Error,
        }
    }

    /// Issue as much bulk data motion as the transport accepts; suspend
    /// while residual bytes or posted completions remain.
    fn rdma(&mut self, inner: &mut BufInner) -> TgtState {
        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return TgtState::Error,
        };
        if conn.transport().post_tgt_dma(self.buf, inner).is_err() {
            return TgtState::Error;
        }

        if inner.dma_resid() > 0 || self.buf.rdma_comp() > 0 {
            return TgtState::Rdma;
        }

        inner.indir_desc = None;
        inner.rem_cursor = None;
        inner.desc_fetched = false;

        // fetch and swap run their inbound phase after the outbound drains
        if inner.put_resid > 0 {
            if inner.init_local_offset().is_err() {
                return TgtState::Error;
            }
            return match inner.operation {
                Operation::Fetch => TgtState::AtomicDataIn,
                Operation::Swap => {
                    if self.buf.req().atom_op == AtomOp::Swap {
                        TgtState::DataIn
                    } else {
                        TgtState::SwapDataIn
                    }
                }
                _ => TgtState::DataIn,
            };
        }

        TgtState::CommEvent
    }

    /// The initiator supplied only a pointer to its segment list; read the
    /// list before the transfer can start.
    fn wait_rdma_desc(&mut self, inner: &mut BufInner) -> TgtState {
        if !inner.desc_fetched {
            let data = match inner.rdma_dir {
                DataDir::In => inner.data_in.clone(),
                DataDir::Out => inner.data_out.clone(),
            };
            let Some(Data::RdmaIndirect(sge)) = data else {
                return TgtState::Error;
            };
            let conn = match inner.conn.clone() {
                Some(conn) => conn,
                None => return TgtState::Error,
            };
            match conn
                .transport()
                .fetch_remote_desc(self.buf, IndirectTarget::Sge(sge))
            {
                Ok(DescFetch::Pending) => return TgtState::WaitRdmaDesc,
                Ok(DescFetch::Ready(bytes)) => {
                    inner.indir_desc = Some(bytes);
                    inner.desc_fetched = true;
                }
                Err(_) => return TgtState::Error,
            }
        }

        let Some(bytes) = inner.indir_desc.take() else {
            return TgtState::Error;
        };
        let Ok(sges) = Sge::decode_slice(&bytes) else {
            return TgtState::Error;
        };
        inner.rem_cursor = Some(RemoteCursor::Sge {
            list: sges,
            idx: 0,
            off: 0,
        });
        TgtState::Rdma
    }

    /// Shared-memory analogue of the indirect-descriptor fetch: the
    /// segment list is copied out of peer memory in place.
    fn shmem_desc(&mut self, inner: &mut BufInner) -> TgtState {
        let data = match inner.rdma_dir {
            DataDir::In => inner.data_in.clone(),
            DataDir::Out => inner.data_out.clone(),
        };
        let Some(Data::MemIndirect(iov)) = data else {
            return TgtState::Error;
        };
        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return TgtState::Error,
        };
        let bytes = match conn
            .transport()
            .fetch_remote_desc(self.buf, IndirectTarget::Mem(iov))
        {
            Ok(DescFetch::Ready(bytes)) => bytes,
            _ => return TgtState::Error,
        };
        let Ok(iovs) = MemIovec::decode_slice(&bytes) else {
            return TgtState::Error;
        };
        inner.rem_cursor = Some(RemoteCursor::Mem {
            list: iovs,
            idx: 0,
            off: 0,
        });
        TgtState::Rdma
    }

    /// Inbound data for put and plain swap.
    fn data_in(&mut self, inner: &mut BufInner) -> TgtState {
        inner.rdma_dir = DataDir::In;
        let data = match inner.data_in.clone() {
            Some(data) => data,
            None => return TgtState::Error,
        };

        let next = match data {
            Data::Immediate(bytes) => {
                let le = match inner.le.clone() {
                    Some(le) => le,
                    None => return TgtState::Error,
                };
                let n = inner.mlength as usize;
                if bytes.len() < n
                    || le.region.copy_in(inner.moffset, &bytes[..n]).is_err()
                {
                    return TgtState::Error;
                }
                inner.put_resid = 0;
                TgtState::CommEvent
            }
            Data::RdmaDma(sges) => {
                inner.rem_cursor = Some(RemoteCursor::Sge {
                    list: sges,
                    idx: 0,
                    off: 0,
                });
                TgtState::Rdma
            }
            Data::RdmaIndirect(_) => TgtState::WaitRdmaDesc,
            Data::MemDma(iovs) => {
                inner.rem_cursor = Some(RemoteCursor::Mem {
                    list: iovs,
                    idx: 0,
                    off: 0,
                });
                TgtState::Rdma
            }
            Data::MemIndirect(_) => TgtState::ShmemDesc,
        };

        // a plain swap lands here dressed as a put; its serialization ends
        // with the copy, not with an operator
        if inner.in_atomic {
            self.release_atomic(inner);
        }

        next
    }

    /// Element-wise atomic operators over immediate data.
    fn atomic_data_in(&mut self, inner: &mut BufInner) -> TgtState {
        let req = self.buf.req();
        let Some(Data::Immediate(bytes)) = inner.data_in.clone() else {
            return TgtState::Error;
        };
        if !req.atom_op.is_arithmetic() {
            return TgtState::Error;
        }
        let le = match inner.le.clone() {
            Some(le) => le,
            None => return TgtState::Error,
        };

        let n = inner.mlength as usize;
        if bytes.len() < n {
            return TgtState::Error;
        }
        // stage through scratch so operators never straddle an iovec
        // boundary mid-datum
        let mut scratch = vec![0u8; n];
        if le.region.copy_out(inner.moffset, &mut scratch).is_err()
            || apply_atomic(req.atom_op, req.atom_type, &mut scratch, &bytes[..n]).is_err()
            || le.region.copy_in(inner.moffset, &scratch).is_err()
        {
            return TgtState::Error;
        }
        inner.put_resid = 0;

        debug_assert!(inner.in_atomic);
        self.release_atomic(inner);

        TgtState::CommEvent
    }

    /// Conditional and masked swaps over a single datum.
    fn swap_data_in(&mut self, inner: &mut BufInner) -> TgtState {
        let req = self.buf.req();
        let Some(Data::Immediate(bytes)) = inner.data_in.clone() else {
            return TgtState::Error;
        };
        if !req.atom_op.is_swap_variant() {
            return TgtState::Error;
        }
        let le = match inner.le.clone() {
            Some(le) => le,
            None => return TgtState::Error,
        };

        let size = req.atom_type.size();
        if (inner.mlength as usize) < size || bytes.len() < size {
            return TgtState::Error;
        }
        // big enough for a double complex
        let mut scratch = [0u8; 16];
        if le.region.copy_out(inner.moffset, &mut scratch[..size]).is_err()
            || apply_swap(
                req.atom_op,
                req.atom_type,
                &mut scratch[..size],
                &bytes[..size],
                req.operand,
            )
            .is_err()
            || le.region.copy_in(inner.moffset, &scratch[..size]).is_err()
        {
            return TgtState::Error;
        }
        inner.put_resid = 0;

        debug_assert!(inner.in_atomic);
        self.release_atomic(inner);

        TgtState::CommEvent
    }

    /// Deliver the comm event and counting event, then pick the response.
    fn comm_event(&mut self, inner: &mut BufInner) -> TgtState {
        if inner.event_mask.contains(EventMask::COMM) {
            let le = inner.le.clone();
            let suppressed = inner.ni_fail.is_ok()
                && le
                    .as_ref()
                    .is_some_and(|le| le.options.contains(LeOptions::EVENT_SUCCESS_DISABLE));
            if !suppressed {
                if let (Some(eq), Some(le)) = (inner.eq.clone(), le) {
                    let kind = match inner.operation {
                        Operation::Put => EventKind::Put,
                        Operation::Get => EventKind::Get,
                        _ => EventKind::Atomic,
                    };
                    self.post_target_event(inner, &eq, kind, le.user_ptr, inner.start);
                }
            }
            inner.event_mask &= !EventMask::COMM;
        }

        if inner.event_mask.contains(EventMask::CT_COMM) {
            if let Some(le) = inner.le.clone() {
                if let Some(ct) = &le.ct {
                    let amount = if le.options.contains(LeOptions::EVENT_CT_BYTES) {
                        inner.mlength
                    } else {
                        1
                    };
                    ct.add(inner.ni_fail, amount);
                }
            }
            inner.event_mask &= !EventMask::CT_COMM;
        }

        if inner.event_mask.contains(EventMask::REPLY) {
            TgtState::SendReply
        } else if inner.event_mask.contains(EventMask::ACK) {
            TgtState::SendAck
        } else {
            TgtState::Cleanup
        }
    }

    fn send_ack(&mut self, inner: &mut BufInner) -> TgtState {
        inner.event_mask &= !EventMask::ACK;

        let operation = match self.buf.req().ack_req {
            AckReq::NoAck => return TgtState::Error,
            AckReq::Ack => Operation::Ack,
            AckReq::CtAck => Operation::CtAck,
            AckReq::OcAck => Operation::OcAck,
        };
        let operation = if inner
            .le
            .as_ref()
            .is_some_and(|le| le.options.contains(LeOptions::ACK_DISABLE))
        {
            Operation::NoAck
        } else {
            operation
        };

        self.send_response(inner, operation)
    }

    fn send_reply(&mut self, inner: &mut BufInner) -> TgtState {
        inner.event_mask &= !EventMask::REPLY;
        self.send_response(inner, Operation::Reply)
    }

    fn send_response(&mut self, inner: &mut BufInner, operation: Operation) -> TgtState {
        // a priority-matched element is released before the response
        // leaves; overflow matches stay pinned for the late append
        if inner
            .le
            .as_ref()
            .is_some_and(|le| le.list() == PtlList::Priority)
        {
            inner.le = None;
        }

        let Some(mut send_buf) = inner.send_buf.take() else {
            return TgtState::Error;
        };

        let carries_payload = operation == Operation::Reply && send_buf.data_out;
        let hdr = AckHdr {
            operation,
            ni_fail: inner.ni_fail,
            data_out: carries_payload,
            matching_list: inner.matching_list,
            handle: send_buf.handle,
            length: inner.mlength,
            offset: inner.moffset,
        };
        let mut bytes = Vec::with_capacity(
            AckHdr::encoded_len(operation) + send_buf.payload.len(),
        );
        hdr.encode(&mut bytes);
        if carries_payload {
            bytes.extend_from_slice(&send_buf.payload);
        }
        send_buf.bytes = bytes;
        send_buf.dest = inner.dest;

        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return TgtState::Error,
        };
        conn.transport().set_send_flags(&mut send_buf, true);
        if conn.transport().send_message(send_buf, false).is_err() {
            return TgtState::Error;
        }

        TgtState::Cleanup
    }

    /// Release the response buffer, discharge the table entry and decide
    /// whether the buffer waits for a late append.
    fn cleanup(&mut self, inner: &mut BufInner) -> TgtState {
        // a zero-length atomic never reaches a data-in state
        if inner.in_atomic {
            self.release_atomic(inner);
        }

        let next = if inner.matching_le.is_some() {
            TgtState::OverflowEvent
        } else if inner
            .le
            .as_ref()
            .is_some_and(|le| le.list() == PtlList::Overflow)
        {
            TgtState::WaitAppend
        } else {
            TgtState::Cleanup2
        };

        inner.send_buf = None;
        inner.indir_desc = None;
        inner.rem_cursor = None;

        if let Some(pt_index) = inner.pt_index.take() {
            if let Some(entry) = self.ni.pt(pt_index) {
                let mut pt = entry.lock();
                pt.num_tgt_active -= 1;
                if pt.state == PtState::AutoDisabled && pt.num_tgt_active == 0 {
                    pt.state = PtState::Disabled;
                    let eq = pt.eq.clone();
                    drop(pt);
                    if let Some(eq) = eq {
                        let user_ptr =
                            inner.matching_le.as_ref().map_or(0, |le| le.user_ptr);
                        self.post_target_event(
                            inner,
                            &eq,
                            EventKind::PtDisabled,
                            user_ptr,
                            None,
                        );
                    }
                }
            }
        }

        next
    }

    /// Parked on the unexpected list until an append or search matches.
    fn wait_append(&self, inner: &BufInner) -> TgtState {
        if inner.matching_le.is_some() {
            TgtState::OverflowEvent
        } else {
            TgtState::WaitAppend
        }
    }

    /// A later append or search claimed this buffered delivery; post the
    /// overflow event against the claiming element.
    fn overflow_event(&mut self, inner: &mut BufInner) -> TgtState {
        let Some(le) = inner.matching_le.take() else {
            return TgtState::Error;
        };

        if !le.options.contains(LeOptions::EVENT_OVER_DISABLE) {
            let kind = match inner.operation {
                Operation::Put => EventKind::PutOverflow,
                Operation::Get => EventKind::GetOverflow,
                Operation::Atomic => EventKind::AtomicOverflow,
                Operation::Fetch | Operation::Swap => EventKind::FetchAtomicOverflow,
                _ => return TgtState::Error,
            };
            if let Some(eq) = inner.eq.clone() {
                self.post_target_event(inner, &eq, kind, le.user_ptr, inner.start);
            }
            if le.options.contains(LeOptions::EVENT_CT_OVERFLOW) {
                if let Some(ct) = &le.ct {
                    ct.add(inner.ni_fail, inner.mlength);
                }
            }
        }

        TgtState::Cleanup2
    }

    /// Drop the element and connection references.
    fn cleanup_2(&mut self, inner: &mut BufInner) {
        inner.le = None;
        inner.conn = None;
    }
}
