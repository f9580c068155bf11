//! The initiator state machine and the operation entry points.
//!
//! Application threads enter through [`Ni::put`] and friends, which build
//! the request header, attach data descriptors and push the machine until
//! it suspends or completes. Send completions and responses re-enter it on
//! progress threads. Descriptor references are released before their
//! events post, so a handle observed through a completion event is free
//! for reuse.

use std::sync::Arc;

use ptl4_wire::{AckHdr, AckReq, AtomOp, AtomType, Data, MemIovec, Operation, ReqHdr, Sge};

use crate::buf::{BufInner, EventMask, MsgBuf, RecvResponse, SmState};
use crate::event::{Event, EventKind, EventQueue};
use crate::md::{Md, MdOptions};
use crate::ni::Ni;
use crate::transport::{SendBuf, TransportKind};
use crate::{NiFail, ProcessId, PtlError};

/// States of the initiator machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitState {
    Start,
    PrepReq,
    WaitConn,
    SendReq,
    WaitComp,
    SendError,
    EarlySendEvent,
    WaitRecv,
    DataIn,
    LateSendEvent,
    AckEvent,
    ReplyEvent,
    Cleanup,
    Error,
    Done,
}

/// Addressing and matching arguments shared by every operation.
#[derive(Debug, Clone, Copy)]
pub struct OpArgs {
    /// The peer to address.
    pub target: ProcessId,
    /// Table entry at the peer.
    pub pt_index: u32,
    /// Match bits presented to the peer's elements.
    pub match_bits: u64,
    /// Offset into the remote element, ignored by locally managed
    /// elements.
    pub remote_offset: u64,
    /// Opaque value delivered with this operation's initiator events.
    pub user_ptr: u64,
    /// Out-of-band data delivered with the peer's full events.
    pub hdr_data: u64,
}

impl OpArgs {
    /// Address `target`'s table entry `pt_index` with everything else
    /// zeroed.
    pub fn to(target: ProcessId, pt_index: u32) -> Self {
        Self {
            target,
            pt_index,
            match_bits: 0,
            remote_offset: 0,
            user_ptr: 0,
            hdr_data: 0,
        }
    }
}

fn check_md_range(md: &Md, offset: u64, length: u64) -> Result<(), PtlError> {
    if offset + length > md.region.len() {
        Err(PtlError::InvalidArg("length outside descriptor"))
    } else {
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn build_req(
    ni: &Ni,
    operation: Operation,
    length: u64,
    ack_req: AckReq,
    atom_op: AtomOp,
    atom_type: AtomType,
    operand: u64,
    args: &OpArgs,
) -> ReqHdr {
    ReqHdr {
        operation,
        ni_type: ni.is_logical() as u8,
        data_in: operation.has_get_data(),
        data_out: operation.has_put_data(),
        handle: 0,
        ack_req,
        atom_type,
        atom_op,
        dst_nid: args.target.nid,
        dst_pid: args.target.pid,
        src_nid: ni.id().nid,
        src_pid: ni.id().pid,
        match_bits: args.match_bits,
        hdr_data: args.hdr_data,
        operand,
        pt_index: args.pt_index,
        uid: ni.uid(),
        length,
        offset: args.remote_offset,
    }
}

fn launch(
    ni: &Arc<Ni>,
    req: ReqHdr,
    put_md: Option<(&Arc<Md>, u64)>,
    get_md: Option<(&Arc<Md>, u64)>,
    args: &OpArgs,
) -> Result<(), PtlError> {
    let buf = MsgBuf::initiator(req);
    {
        let mut inner = buf.lock();
        if let Some((md, offset)) = put_md {
            inner.put_md = Some(md.clone());
            inner.put_offset = offset;
        }
        if let Some((md, offset)) = get_md {
            inner.get_md = Some(md.clone());
            inner.get_offset = offset;
        }
        inner.user_ptr = args.user_ptr;
        inner.conn = Some(ni.get_conn(args.target));
        inner.handle = Some(ni.register_init_buf(&buf));
    }
    process_init(ni, &buf)
}

impl Ni {
    /// Move `length` bytes from `md` at `local_offset` into the matching
    /// element at the target.
    pub fn put(
        self: &Arc<Self>,
        md: &Arc<Md>,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        args: OpArgs,
    ) -> Result<(), PtlError> {
        check_md_range(md, local_offset, length)?;
        let req = build_req(
            self,
            Operation::Put,
            length,
            ack_req,
            AtomOp::Min,
            AtomType::Int8,
            0,
            &args,
        );
        launch(self, req, Some((md, local_offset)), None, &args)
    }

    /// Fetch `length` bytes from the matching element at the target into
    /// `md` at `local_offset`.
    pub fn get(
        self: &Arc<Self>,
        md: &Arc<Md>,
        local_offset: u64,
        length: u64,
        args: OpArgs,
    ) -> Result<(), PtlError> {
        check_md_range(md, local_offset, length)?;
        let req = build_req(
            self,
            Operation::Get,
            length,
            AckReq::NoAck,
            AtomOp::Min,
            AtomType::Int8,
            0,
            &args,
        );
        launch(self, req, None, Some((md, local_offset)), &args)
    }

    /// Apply an element-wise atomic operator at the target using operand
    /// data from `md`.
    #[allow(clippy::too_many_arguments)]
    pub fn atomic(
        self: &Arc<Self>,
        md: &Arc<Md>,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        atom_op: AtomOp,
        atom_type: AtomType,
        args: OpArgs,
    ) -> Result<(), PtlError> {
        if !atom_op.is_arithmetic() {
            return Err(PtlError::InvalidArg("not an element-wise operator"));
        }
        check_md_range(md, local_offset, length)?;
        let req = build_req(
            self,
            Operation::Atomic,
            length,
            ack_req,
            atom_op,
            atom_type,
            0,
            &args,
        );
        launch(self, req, Some((md, local_offset)), None, &args)
    }

    /// Like [`Ni::atomic`], additionally returning the element's prior
    /// contents into `get_md`.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_atomic(
        self: &Arc<Self>,
        get_md: &Arc<Md>,
        get_offset: u64,
        put_md: &Arc<Md>,
        put_offset: u64,
        length: u64,
        atom_op: AtomOp,
        atom_type: AtomType,
        args: OpArgs,
    ) -> Result<(), PtlError> {
        if !atom_op.is_arithmetic() {
            return Err(PtlError::InvalidArg("not an element-wise operator"));
        }
        check_md_range(get_md, get_offset, length)?;
        check_md_range(put_md, put_offset, length)?;
        let req = build_req(
            self,
            Operation::Fetch,
            length,
            AckReq::NoAck,
            atom_op,
            atom_type,
            0,
            &args,
        );
        launch(
            self,
            req,
            Some((put_md, put_offset)),
            Some((get_md, get_offset)),
            &args,
        )
    }

    /// Swap the element's contents with data from `put_md`, returning the
    /// prior contents into `get_md`. `operand` carries the compare value
    /// or mask of the conditional and masked variants.
    #[allow(clippy::too_many_arguments)]
    pub fn swap(
        self: &Arc<Self>,
        get_md: &Arc<Md>,
        get_offset: u64,
        put_md: &Arc<Md>,
        put_offset: u64,
        length: u64,
        operand: u64,
        atom_op: AtomOp,
        atom_type: AtomType,
        args: OpArgs,
    ) -> Result<(), PtlError> {
        if atom_op != AtomOp::Swap && !atom_op.is_swap_variant() {
            return Err(PtlError::InvalidArg("not a swap operator"));
        }
        check_md_range(get_md, get_offset, length)?;
        check_md_range(put_md, put_offset, length)?;
        let req = build_req(
            self,
            Operation::Swap,
            length,
            AckReq::NoAck,
            atom_op,
            atom_type,
            operand,
            &args,
        );
        launch(
            self,
            req,
            Some((put_md, put_offset)),
            Some((get_md, get_offset)),
            &args,
        )
    }
}

/// Report a signaled send completion for `buf`.
pub fn send_completion(ni: &Arc<Ni>, buf: &Arc<MsgBuf>) {
    buf.set_completed();
    let resume = {
        let inner = buf.lock();
        inner.state == SmState::Init(InitState::WaitComp)
    };
    if resume {
        let _ = process_init(ni, buf);
    }
}

/// Hand a received acknowledgement or reply to the initiator machine.
pub fn recv_response(ni: &Arc<Ni>, bytes: &[u8]) -> Result<(), PtlError> {
    let (ack, used) = AckHdr::decode(bytes)?;
    let payload = ack.data_out.then(|| bytes[used..].to_vec());

    let Some(buf) = ni.lookup_init_buf(ack.handle) else {
        return Err(PtlError::InvalidArg("response for unknown handle"));
    };
    let resume = {
        let mut inner = buf.lock();
        inner.recv = Some(RecvResponse {
            ni_fail: ack.ni_fail,
            mlength: ack.length,
            moffset: ack.offset,
            payload,
        });
        matches!(
            inner.state,
            SmState::Init(InitState::WaitRecv) | SmState::Init(InitState::WaitComp)
        )
    };
    if resume {
        process_init(ni, &buf)?;
    }
    Ok(())
}

/// Run the initiator machine for `buf` until it completes or suspends.
pub fn process_init(ni: &Arc<Ni>, buf: &Arc<MsgBuf>) -> Result<(), PtlError> {
    let mut inner = buf.lock();
    let SmState::Init(mut state) = inner.state else {
        return Err(PtlError::InvalidArg("not an initiator buffer"));
    };

    let run = InitRun { ni, buf };
    let mut err = Ok(());

    loop {
        ptl4_log::trace!(?state, "init state");
        state = match state {
            InitState::Start => run.start(&mut inner),
            InitState::PrepReq => run.prep_req(&mut inner),
            InitState::WaitConn => {
                let next = run.wait_conn(&mut inner);
                if next == InitState::WaitConn {
                    inner.state = SmState::Init(next);
                    return err;
                }
                next
            }
            InitState::SendReq => run.send_req(&mut inner),
            InitState::WaitComp => {
                let next = run.wait_comp(&inner);
                if next == InitState::WaitComp {
                    inner.state = SmState::Init(next);
                    return err;
                }
                next
            }
            InitState::SendError => run.send_error(&mut inner),
            InitState::EarlySendEvent => run.early_send_event(&mut inner),
            InitState::WaitRecv => {
                let next = run.wait_recv(&mut inner);
                if next == InitState::WaitRecv {
                    inner.state = SmState::Init(next);
                    return err;
                }
                next
            }
            InitState::DataIn => run.data_in(&mut inner),
            InitState::LateSendEvent => run.late_send_event(&mut inner),
            InitState::AckEvent => run.ack_event(&mut inner),
            InitState::ReplyEvent => run.reply_event(&mut inner),
            InitState::Error => {
                ptl4_log::warn!("initiator request failed");
                err = Err(PtlError::Fail);
                InitState::Cleanup
            }
            InitState::Cleanup => {
                run.cleanup(&mut inner);
                inner.state = SmState::Init(InitState::Done);
                return err;
            }
            InitState::Done => return err,
        };
    }
}

struct InitRun<'a> {
    ni: &'a Arc<Ni>,
    buf: &'a Arc<MsgBuf>,
}

impl InitRun<'_> {
    fn post_init_event(&self, inner: &BufInner, eq: &EventQueue, kind: EventKind) {
        let req = self.buf.req();
        eq.push(Event {
            kind,
            ni_fail: inner.ni_fail,
            initiator: ProcessId::new(req.dst_nid, req.dst_pid),
            match_bits: req.match_bits,
            hdr_data: req.hdr_data,
            mlength: inner.mlength,
            moffset: inner.moffset,
            remote_offset: req.offset,
            start: None,
            user_ptr: inner.user_ptr,
            pt_index: req.pt_index,
            uid: req.uid,
        });
    }

    /// Latch the descriptor options and decide which events this
    /// operation owes.
    fn start(&self, inner: &mut BufInner) -> InitState {
        let req = self.buf.req();

        if let Some(md) = &inner.put_md {
            if md.options.contains(MdOptions::EVENT_SUCCESS_DISABLE) {
                inner.event_mask |= EventMask::PUT_SUCCESS_DISABLE;
            }
            if md.options.contains(MdOptions::EVENT_CT_BYTES) {
                inner.event_mask |= EventMask::PUT_CT_BYTES;
            }
            inner.put_eq = md.eq.clone();
            inner.put_ct = md.ct.clone();
        }
        if let Some(md) = &inner.get_md {
            if md.options.contains(MdOptions::EVENT_SUCCESS_DISABLE) {
                inner.event_mask |= EventMask::GET_SUCCESS_DISABLE;
            }
            if md.options.contains(MdOptions::EVENT_CT_BYTES) {
                inner.event_mask |= EventMask::GET_CT_BYTES;
            }
            inner.get_eq = md.eq.clone();
            inner.get_ct = md.ct.clone();
        }

        match req.operation {
            Operation::Put | Operation::Atomic => {
                let Some(md) = inner.put_md.clone() else {
                    return InitState::Error;
                };
                if md.eq.is_some() {
                    inner.event_mask |= EventMask::SEND;
                }
                match req.ack_req {
                    AckReq::Ack => {
                        inner.event_mask |= EventMask::RECV_EXPECTED;
                        if md.eq.is_some() {
                            inner.event_mask |= EventMask::ACK;
                        }
                    }
                    AckReq::CtAck | AckReq::OcAck => {
                        inner.event_mask |= EventMask::RECV_EXPECTED;
                        if md.ct.is_some() && md.options.contains(MdOptions::EVENT_CT_ACK) {
                            inner.event_mask |= EventMask::CT_ACK;
                        }
                    }
                    AckReq::NoAck => {}
                }
                if md.ct.is_some() && md.options.contains(MdOptions::EVENT_CT_SEND) {
                    inner.event_mask |= EventMask::CT_SEND;
                }
            }
            Operation::Get => {
                inner.event_mask |= EventMask::RECV_EXPECTED;
                let Some(md) = inner.get_md.clone() else {
                    return InitState::Error;
                };
                if md.eq.is_some() {
                    inner.event_mask |= EventMask::REPLY;
                }
                if md.ct.is_some() && md.options.contains(MdOptions::EVENT_CT_REPLY) {
                    inner.event_mask |= EventMask::CT_REPLY;
                }
            }
            Operation::Fetch | Operation::Swap => {
                inner.event_mask |= EventMask::RECV_EXPECTED;
                let (Some(put_md), Some(get_md)) =
                    (inner.put_md.clone(), inner.get_md.clone())
                else {
                    return InitState::Error;
                };
                if put_md.eq.is_some() {
                    inner.event_mask |= EventMask::SEND;
                }
                if get_md.eq.is_some() {
                    inner.event_mask |= EventMask::REPLY;
                }
                if put_md.ct.is_some() && put_md.options.contains(MdOptions::EVENT_CT_SEND) {
                    inner.event_mask |= EventMask::CT_SEND;
                }
                if get_md.ct.is_some() && get_md.options.contains(MdOptions::EVENT_CT_REPLY) {
                    inner.event_mask |= EventMask::CT_REPLY;
                }
            }
            _ => return InitState::Error,
        }

        InitState::PrepReq
    }

    fn build_out_desc(&self, inner: &mut BufInner, kind: TransportKind) -> Result<Data, PtlError> {
        let md = inner.put_md.clone().ok_or(PtlError::Fail)?;
        let length = self.buf.req().length;
        let offset = inner.put_offset;

        if length <= self.ni.limits().max_inline_data {
            let mut bytes = vec![0u8; length as usize];
            md.region.copy_out(offset, &mut bytes)?;
            return Ok(Data::Immediate(bytes));
        }
        self.build_segment_desc(inner, &md, offset, length, kind)
    }

    fn build_in_desc(&self, inner: &mut BufInner, kind: TransportKind) -> Result<Data, PtlError> {
        let md = inner.get_md.clone().ok_or(PtlError::Fail)?;
        let length = self.buf.req().length;
        let offset = inner.get_offset;
        self.build_segment_desc(inner, &md, offset, length, kind)
    }

    /// Describe `[offset, offset + length)` of `md` as a segment list,
    /// spilling to an indirect descriptor when the list outgrows the
    /// request.
    fn build_segment_desc(
        &self,
        inner: &mut BufInner,
        md: &Md,
        offset: u64,
        length: u64,
        kind: TransportKind,
    ) -> Result<Data, PtlError> {
        let segs = md.region.segments(offset, length)?;
        let inline = segs.len() <= self.ni.limits().max_inline_sges;

        match kind {
            TransportKind::Rdma => {
                let sges: Vec<Sge> = segs
                    .iter()
                    .map(|&(addr, len)| Sge {
                        addr: addr as u64,
                        length: len as u32,
                        rkey: 0,
                    })
                    .collect();
                if inline {
                    Ok(Data::RdmaDma(sges))
                } else {
                    let mut block = Vec::with_capacity(sges.len() * 16);
                    for sge in &sges {
                        sge.encode(&mut block);
                    }
                    let block = block.into_boxed_slice();
                    let desc = Sge {
                        addr: block.as_ptr() as u64,
                        length: block.len() as u32,
                        rkey: 0,
                    };
                    inner.desc_backing = Some(block);
                    Ok(Data::RdmaIndirect(desc))
                }
            }
            TransportKind::Mem => {
                let iovs: Vec<MemIovec> = segs
                    .iter()
                    .map(|&(addr, len)| MemIovec {
                        addr: addr as u64,
                        length: len as u64,
                    })
                    .collect();
                if inline {
                    Ok(Data::MemDma(iovs))
                } else {
                    let mut block = Vec::with_capacity(iovs.len() * 16);
                    for iov in &iovs {
                        iov.encode(&mut block);
                    }
                    let block = block.into_boxed_slice();
                    let desc = MemIovec {
                        addr: block.as_ptr() as u64,
                        length: block.len() as u64,
                    };
                    inner.desc_backing = Some(block);
                    Ok(Data::MemIndirect(desc))
                }
            }
        }
    }

    /// Build the wire image: header, then the get descriptor, then the put
    /// descriptor.
    fn prep_req(&self, inner: &mut BufInner) -> InitState {
        let req = self.buf.req();
        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return InitState::Error,
        };
        let kind = conn.transport().kind();

        let get_desc = if req.data_in {
            match self.build_in_desc(inner, kind) {
                Ok(d) => Some(d),
                Err(_) => return InitState::Error,
            }
        } else {
            None
        };
        let put_desc = if req.data_out {
            match self.build_out_desc(inner, kind) {
                Ok(d) => Some(d),
                Err(_) => return InitState::Error,
            }
        } else {
            None
        };

        let mut hdr = req.clone();
        hdr.handle = inner.handle.unwrap_or(0);

        // ask for a response whenever the target will read local memory,
        // so the descriptor is not released while the transfer runs
        let put_is_immediate = put_desc.as_ref().is_some_and(|d| d.is_immediate());
        if put_desc.is_some()
            && !put_is_immediate
            && hdr.ack_req == AckReq::NoAck
            && inner
                .event_mask
                .intersects(EventMask::SEND | EventMask::CT_SEND)
        {
            hdr.ack_req = AckReq::Ack;
            inner.event_mask |= EventMask::RECV_EXPECTED;
        }

        // immediate payloads can deliver their send event as soon as the
        // transport confirms the send
        inner.signaled = put_is_immediate
            && inner
                .event_mask
                .intersects(EventMask::SEND | EventMask::CT_SEND);

        let mut bytes = Vec::new();
        hdr.encode(&mut bytes);
        if let Some(d) = &get_desc {
            d.encode(&mut bytes);
        }
        if let Some(d) = &put_desc {
            d.encode(&mut bytes);
        }

        inner.send_buf = Some(SendBuf {
            bytes,
            payload: Vec::new(),
            data_out: false,
            dest: None,
            inline_hint: false,
            handle: hdr.handle,
        });

        if conn.is_ready() {
            InitState::SendReq
        } else {
            InitState::WaitConn
        }
    }

    fn wait_conn(&self, inner: &mut BufInner) -> InitState {
        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return InitState::Error,
        };
        if conn.is_ready() {
            return InitState::SendReq;
        }
        match conn.park_waiter(self.ni, &conn, self.buf) {
            Ok(true) => InitState::WaitConn,
            Ok(false) => InitState::SendReq,
            Err(_) => InitState::Error,
        }
    }

    fn send_req(&self, inner: &mut BufInner) -> InitState {
        let conn = match inner.conn.clone() {
            Some(conn) => conn,
            None => return InitState::Error,
        };
        inner.dest = conn.dest();

        let Some(mut send_buf) = inner.send_buf.take() else {
            return InitState::Error;
        };
        send_buf.dest = inner.dest;

        let signaled = inner.signaled;
        if conn.transport().send_message(send_buf, signaled).is_err() {
            return InitState::SendError;
        }

        if signaled {
            if conn.transport().kind() == TransportKind::Rdma {
                InitState::WaitComp
            } else {
                InitState::EarlySendEvent
            }
        } else if inner.event_mask.contains(EventMask::RECV_EXPECTED) {
            InitState::WaitRecv
        } else {
            InitState::Cleanup
        }
    }

    /// The transport refused the request; owed events still fire, carrying
    /// the failure.
    fn send_error(&self, inner: &mut BufInner) -> InitState {
        inner.ni_fail = NiFail::Undeliverable;

        if inner
            .event_mask
            .intersects(EventMask::SEND | EventMask::CT_SEND)
        {
            InitState::LateSendEvent
        } else if inner
            .event_mask
            .intersects(EventMask::ACK | EventMask::CT_ACK)
        {
            InitState::AckEvent
        } else if inner
            .event_mask
            .intersects(EventMask::REPLY | EventMask::CT_REPLY)
        {
            InitState::ReplyEvent
        } else {
            InitState::Cleanup
        }
    }

    fn wait_comp(&self, inner: &BufInner) -> InitState {
        if self.buf.is_completed() || inner.recv.is_some() {
            InitState::EarlySendEvent
        } else {
            InitState::WaitComp
        }
    }

    fn post_send_events(&self, inner: &mut BufInner, ct_length: u64) {
        if inner.event_mask.contains(EventMask::SEND) {
            let visible = !inner.ni_fail.is_ok()
                || !inner.event_mask.contains(EventMask::PUT_SUCCESS_DISABLE);
            if visible {
                if let Some(eq) = inner.put_eq.clone() {
                    self.post_init_event(inner, &eq, EventKind::Send);
                }
            }
            inner.event_mask &= !EventMask::SEND;
        }
        if inner.event_mask.contains(EventMask::CT_SEND) {
            if let Some(ct) = inner.put_ct.clone() {
                let amount = if inner.event_mask.contains(EventMask::PUT_CT_BYTES) {
                    ct_length
                } else {
                    1
                };
                ct.add(inner.ni_fail, amount);
            }
            inner.event_mask &= !EventMask::CT_SEND;
        }
    }

    /// Send events before any response: the put descriptor is released
    /// first, and the counting event uses the requested length because the
    /// manipulated length is not known yet.
    fn early_send_event(&self, inner: &mut BufInner) -> InitState {
        inner.put_md = None;
        self.post_send_events(inner, self.buf.req().length);

        if inner.event_mask.contains(EventMask::RECV_EXPECTED)
            && inner.ni_fail != NiFail::Undeliverable
        {
            InitState::WaitRecv
        } else {
            InitState::Cleanup
        }
    }

    fn wait_recv(&self, inner: &mut BufInner) -> InitState {
        let (ni_fail, mlength, moffset, has_payload) = match &inner.recv {
            Some(r) => (r.ni_fail, r.mlength, r.moffset, r.payload.is_some()),
            None => return InitState::WaitRecv,
        };
        inner.ni_fail = ni_fail;
        inner.mlength = mlength;
        inner.moffset = moffset;
        if has_payload && inner.get_md.is_some() {
            InitState::DataIn
        } else if inner
            .event_mask
            .intersects(EventMask::SEND | EventMask::CT_SEND)
        {
            InitState::LateSendEvent
        } else if inner
            .event_mask
            .intersects(EventMask::ACK | EventMask::CT_ACK)
        {
            InitState::AckEvent
        } else if inner
            .event_mask
            .intersects(EventMask::REPLY | EventMask::CT_REPLY)
        {
            InitState::ReplyEvent
        } else {
            InitState::Cleanup
        }
    }

    /// Copy an immediate reply payload into the get descriptor.
    fn data_in(&self, inner: &mut BufInner) -> InitState {
        let Some(payload) = inner.recv.as_mut().and_then(|r| r.payload.take()) else {
            return InitState::Error;
        };
        let md = match inner.get_md.clone() {
            Some(md) => md,
            None => return InitState::Error,
        };

        let n = inner.mlength as usize;
        if payload.len() < n
            || md.region.copy_in(inner.get_offset, &payload[..n]).is_err()
        {
            return InitState::Error;
        }

        if inner
            .event_mask
            .intersects(EventMask::SEND | EventMask::CT_SEND)
        {
            InitState::LateSendEvent
        } else if inner
            .event_mask
            .intersects(EventMask::REPLY | EventMask::CT_REPLY)
        {
            InitState::ReplyEvent
        } else {
            InitState::Cleanup
        }
    }

    /// Send events after the response arrived; the counting event can use
    /// the manipulated length.
    fn late_send_event(&self, inner: &mut BufInner) -> InitState {
        inner.put_md = None;
        let ct_length = inner.mlength;
        self.post_send_events(inner, ct_length);

        if inner.ni_fail == NiFail::Undeliverable {
            InitState::Cleanup
        } else if inner
            .event_mask
            .intersects(EventMask::ACK | EventMask::CT_ACK)
        {
            InitState::AckEvent
        } else if inner
            .event_mask
            .intersects(EventMask::REPLY | EventMask::CT_REPLY)
        {
            InitState::ReplyEvent
        } else {
            InitState::Cleanup
        }
    }

    fn ack_event(&self, inner: &mut BufInner) -> InitState {
        inner.put_md = None;

        if inner.event_mask.contains(EventMask::ACK) {
            let visible = !inner.ni_fail.is_ok()
                || !inner.event_mask.contains(EventMask::PUT_SUCCESS_DISABLE);
            if visible {
                if let Some(eq) = inner.put_eq.clone() {
                    self.post_init_event(inner, &eq, EventKind::Ack);
                }
            }
            inner.event_mask &= !EventMask::ACK;
        }
        if inner.event_mask.contains(EventMask::CT_ACK) {
            if let Some(ct) = inner.put_ct.clone() {
                let amount = if inner.event_mask.contains(EventMask::PUT_CT_BYTES) {
                    inner.mlength
                } else {
                    1
                };
                ct.add(inner.ni_fail, amount);
            }
            inner.event_mask &= !EventMask::CT_ACK;
        }

        InitState::Cleanup
    }

    fn reply_event(&self, inner: &mut BufInner) -> InitState {
        inner.get_md = None;

        if inner.event_mask.contains(EventMask::REPLY) {
            let visible = !inner.ni_fail.is_ok()
                || !inner.event_mask.contains(EventMask::GET_SUCCESS_DISABLE);
            if visible {
                if let Some(eq) = inner.get_eq.clone() {
                    self.post_init_event(inner, &eq, EventKind::Reply);
                }
            }
            inner.event_mask &= !EventMask::REPLY;
        }
        if inner.event_mask.contains(EventMask::CT_REPLY) {
            if let Some(ct) = inner.get_ct.clone() {
                let amount = if inner.event_mask.contains(EventMask::GET_CT_BYTES) {
                    inner.mlength
                } else {
                    1
                };
                ct.add(inner.ni_fail, amount);
            }
            inner.event_mask &= !EventMask::CT_REPLY;
        }

        InitState::Cleanup
    }

    fn cleanup(&self, inner: &mut BufInner) {
        inner.put_md = None;
        inner.get_md = None;
        inner.recv = None;
        inner.desc_backing = None;
        inner.conn = None;
        if let Some(handle) = inner.handle.take() {
            self.ni.deregister_init_buf(handle);
        }
    }
}
