//! Message headers.
//!
//! A request header carries the full addressing, matching and atomic
//! information for one operation. Responses reuse the first common block and
//! append only the region fields the acknowledgement form actually needs:
//! a counting ack omits the offset, and the one-counter and no-ack forms omit
//! both offset and length.

use crate::{get_u32, get_u64, need, AtomOp, AtomType, WireError};

/// Wire protocol version carried in every header.
pub const HDR_VERSION: u8 = 1;

/// Length in bytes of an encoded request header.
pub const REQ_HDR_LEN: usize = 76;

/// Length in bytes of the common leading block shared by all headers.
pub const COMMON_HDR_LEN: usize = 8;

/// Operation code, a 4-bit header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Put request.
    Put = 1,
    /// Get request.
    Get = 2,
    /// Atomic request.
    Atomic = 3,
    /// Fetch-atomic request.
    Fetch = 4,
    /// Swap request.
    Swap = 5,
    /// Reply carrying get/fetch/swap results.
    Reply = 7,
    /// Full acknowledgement.
    Ack = 8,
    /// Counting acknowledgement; no offset on the wire.
    CtAck = 9,
    /// One-counter acknowledgement; no offset and no length.
    OcAck = 10,
    /// Synthetic acknowledgement sent when the matched element disabled
    /// acks; smallest form.
    NoAck = 11,
}

impl Operation {
    /// Whether this opcode names an initiator-to-target request.
    pub fn is_request(self) -> bool {
        (self as u8) <= Operation::Swap as u8
    }

    /// Whether this operation carries data toward the target.
    pub fn has_put_data(self) -> bool {
        matches!(self, Self::Put | Self::Atomic | Self::Fetch | Self::Swap)
    }

    /// Whether this operation returns data to the initiator.
    pub fn has_get_data(self) -> bool {
        matches!(self, Self::Get | Self::Fetch | Self::Swap)
    }

    /// Whether this operation is atomic with respect to other atomics on the
    /// same interface.
    pub fn is_atomic(self) -> bool {
        matches!(self, Self::Atomic | Self::Fetch | Self::Swap)
    }
}

impl TryFrom<u8> for Operation {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => Self::Put,
            2 => Self::Get,
            3 => Self::Atomic,
            4 => Self::Fetch,
            5 => Self::Swap,
            7 => Self::Reply,
            8 => Self::Ack,
            9 => Self::CtAck,
            10 => Self::OcAck,
            11 => Self::NoAck,
            v => {
                return Err(WireError::BadField {
                    field: "operation",
                    value: v as u32,
                });
            }
        })
    }
}

/// Packet format tag, a 4-bit header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktFmt {
    /// Request packet.
    Req = 0,
    /// Reply packet.
    Reply = 1,
    /// Acknowledgement packet.
    Ack = 2,
}

/// Acknowledgement requested by the initiator, a 4-bit header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckReq {
    /// No acknowledgement.
    NoAck = 0,
    /// Full acknowledgement.
    Ack = 1,
    /// Counting acknowledgement.
    CtAck = 2,
    /// One-counter acknowledgement.
    OcAck = 3,
}

impl TryFrom<u8> for AckReq {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::NoAck,
            1 => Self::Ack,
            2 => Self::CtAck,
            3 => Self::OcAck,
            v => {
                return Err(WireError::BadField {
                    field: "ack_req",
                    value: v as u32,
                });
            }
        })
    }
}

/// Per-operation delivery status, a 4-bit field in responses and a field of
/// every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NiFail {
    /// Success; also marks search hits.
    #[default]
    Ok = 0,
    /// No matching element, or the addressed table entry was absent.
    Dropped = 1,
    /// The table entry was disabled, or flow control tripped it.
    PtDisabled = 2,
    /// The uid filter rejected the request.
    PermViolation = 3,
    /// The operation is not permitted by the element options.
    OpViolation = 4,
    /// The request could not be delivered by the transport.
    Undeliverable = 5,
    /// Older dialect alias for the flow-control path.
    FlowCtrl = 6,
}

impl NiFail {
    /// Whether this status reports success.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl TryFrom<u8> for NiFail {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Dropped,
            2 => Self::PtDisabled,
            3 => Self::PermViolation,
            4 => Self::OpViolation,
            5 => Self::Undeliverable,
            6 => Self::FlowCtrl,
            v => {
                return Err(WireError::BadField {
                    field: "ni_fail",
                    value: v as u32,
                });
            }
        })
    }
}

/// Which matching list an element was found on, a 2-bit response field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PtlList {
    /// The priority list.
    #[default]
    Priority = 0,
    /// The overflow list.
    Overflow = 1,
}

/// A decoded request header.
#[derive(Debug, Clone)]
pub struct ReqHdr {
    /// Operation code; always a request opcode.
    pub operation: Operation,
    /// Interface type tag, opaque to the codec.
    pub ni_type: u8,
    /// Whether a descriptor for initiator-bound data follows the header.
    pub data_in: bool,
    /// Whether a descriptor for target-bound data follows the header.
    pub data_out: bool,
    /// Initiator-side handle identifying the originating request.
    pub handle: u32,
    /// Acknowledgement mode requested by the initiator.
    pub ack_req: AckReq,
    /// Atomic datatype; meaningful for atomic operations only.
    pub atom_type: AtomType,
    /// Atomic operator; meaningful for atomic operations only.
    pub atom_op: AtomOp,
    /// Destination node id, or rank on logical interfaces.
    pub dst_nid: u32,
    /// Destination process id.
    pub dst_pid: u32,
    /// Source node id, or rank on logical interfaces.
    pub src_nid: u32,
    /// Source process id.
    pub src_pid: u32,
    /// Match bits compared against posted elements.
    pub match_bits: u64,
    /// Out-of-band user data delivered with full events.
    pub hdr_data: u64,
    /// Operand for compare and masked swaps.
    pub operand: u64,
    /// Index of the addressed portals table entry.
    pub pt_index: u32,
    /// User id of the initiator, checked against element filters.
    pub uid: u32,
    /// Requested transfer length in bytes.
    pub length: u64,
    /// Requested offset into the remote element.
    pub offset: u64,
}

impl ReqHdr {
    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(HDR_VERSION | (self.operation as u8) << 4);
        out.push((self.data_in as u8) << 4 | (self.data_out as u8) << 5);
        out.push(0);
        out.push(self.ni_type & 0x0f | (PktFmt::Req as u8) << 4);
        out.extend_from_slice(&self.handle.to_le_bytes());

        out.push(self.ack_req as u8 | (self.atom_type as u8) << 4);
        out.push(self.atom_op as u8 & 0x1f);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.dst_nid.to_le_bytes());
        out.extend_from_slice(&self.dst_pid.to_le_bytes());
        out.extend_from_slice(&self.src_nid.to_le_bytes());
        out.extend_from_slice(&self.src_pid.to_le_bytes());

        out.extend_from_slice(&self.match_bits.to_le_bytes());
        out.extend_from_slice(&self.hdr_data.to_le_bytes());
        out.extend_from_slice(&self.operand.to_le_bytes());
        out.extend_from_slice(&self.pt_index.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());

        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }

    /// Decode a request header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, REQ_HDR_LEN)?;

        let version = buf[0] & 0x0f;
        if version != HDR_VERSION {
            return Err(WireError::BadField {
                field: "version",
                value: version as u32,
            });
        }
        let operation = Operation::try_from(buf[0] >> 4)?;
        if !operation.is_request() {
            return Err(WireError::BadField {
                field: "operation",
                value: operation as u32,
            });
        }

        Ok(Self {
            operation,
            ni_type: buf[3] & 0x0f,
            data_in: buf[1] & 0x10 != 0,
            data_out: buf[1] & 0x20 != 0,
            handle: get_u32(buf, 4),
            ack_req: AckReq::try_from(buf[8] & 0x0f)?,
            atom_type: AtomType::try_from(buf[8] >> 4)?,
            atom_op: AtomOp::try_from(buf[9] & 0x1f)?,
            dst_nid: get_u32(buf, 12),
            dst_pid: get_u32(buf, 16),
            src_nid: get_u32(buf, 20),
            src_pid: get_u32(buf, 24),
            match_bits: get_u64(buf, 28),
            hdr_data: get_u64(buf, 36),
            operand: get_u64(buf, 44),
            pt_index: get_u32(buf, 52),
            uid: get_u32(buf, 56),
            length: get_u64(buf, 60),
            offset: get_u64(buf, 68),
        })
    }
}

/// A decoded acknowledgement or reply header.
#[derive(Debug, Clone)]
pub struct AckHdr {
    /// Response opcode.
    pub operation: Operation,
    /// Delivery status of the acknowledged operation.
    pub ni_fail: NiFail,
    /// Whether inline reply data follows the header.
    pub data_out: bool,
    /// List the request matched on.
    pub matching_list: PtlList,
    /// Handle copied back from the request.
    pub handle: u32,
    /// Manipulated length; absent on the wire in the one-counter and no-ack
    /// forms.
    pub length: u64,
    /// Manipulated offset; absent on the wire in all but the full forms.
    pub offset: u64,
}

impl AckHdr {
    fn carries_length(operation: Operation) -> bool {
        matches!(operation, Operation::Reply | Operation::Ack | Operation::CtAck)
    }

    fn carries_offset(operation: Operation) -> bool {
        matches!(operation, Operation::Reply | Operation::Ack)
    }

    /// Encoded size in bytes of the response form for `operation`.
    pub fn encoded_len(operation: Operation) -> usize {
        COMMON_HDR_LEN
            + if Self::carries_length(operation) { 8 } else { 0 }
            + if Self::carries_offset(operation) { 8 } else { 0 }
    }

    /// Append the encoded header to `out`, using the minimal form for the
    /// response opcode.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let fmt = if self.operation == Operation::Reply {
            PktFmt::Reply
        } else {
            PktFmt::Ack
        };
        out.push(HDR_VERSION | (self.operation as u8) << 4);
        out.push(
            self.ni_fail as u8
                | (self.data_out as u8) << 5
                | (self.matching_list as u8) << 6,
        );
        out.push(0);
        out.push((fmt as u8) << 4);
        out.extend_from_slice(&self.handle.to_le_bytes());
        if Self::carries_length(self.operation) {
            out.extend_from_slice(&self.length.to_le_bytes());
        }
        if Self::carries_offset(self.operation) {
            out.extend_from_slice(&self.offset.to_le_bytes());
        }
    }

    /// Decode a response header from the front of `buf`, returning it along
    /// with its encoded size.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        need(buf, COMMON_HDR_LEN)?;
        let operation = Operation::try_from(buf[0] >> 4)?;
        if operation.is_request() {
            return Err(WireError::BadField {
                field: "operation",
                value: operation as u32,
            });
        }
        let len = Self::encoded_len(operation);
        need(buf, len)?;

        let mut at = COMMON_HDR_LEN;
        let mut length = 0;
        let mut offset = 0;
        if Self::carries_length(operation) {
            length = get_u64(buf, at);
            at += 8;
        }
        if Self::carries_offset(operation) {
            offset = get_u64(buf, at);
            at += 8;
        }
        debug_assert_eq!(at, len);

        Ok((
            Self {
                operation,
                ni_fail: NiFail::try_from(buf[1] & 0x0f)?,
                data_out: buf[1] & 0x20 != 0,
                matching_list: if buf[1] & 0x40 != 0 {
                    PtlList::Overflow
                } else {
                    PtlList::Priority
                },
                handle: get_u32(buf, 4),
                length,
                offset,
            },
            len,
        ))
    }
}

/// Read the operation code of an encoded message without decoding it.
pub fn peek_operation(buf: &[u8]) -> Result<Operation, WireError> {
    need(buf, 1)?;
    Operation::try_from(buf[0] >> 4)
}
