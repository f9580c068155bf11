//! Data descriptors.
//!
//! Requests carry zero, one or two descriptors directly after the header,
//! one per transfer direction. A descriptor either embeds the payload
//! (immediate), lists the initiator-side memory segments for the transport
//! to move directly, or points at a longer segment list held in initiator
//! memory (indirect).

use crate::{get_u32, get_u64, need, WireError};

/// Encoded size of one scatter-gather entry.
pub const SGE_LEN: usize = 16;

/// Encoded size of one plain memory segment entry.
pub const MEM_IOVEC_LEN: usize = 16;

/// One scatter-gather entry for a remote-DMA capable transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Virtual address of the segment in the owner's address space.
    pub addr: u64,
    /// Length of the segment in bytes.
    pub length: u32,
    /// Registration key the transport needs to access the segment.
    pub rkey: u32,
}

impl Sge {
    /// Append the encoded entry to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.rkey.to_le_bytes());
    }

    /// Decode a tightly packed array of entries.
    pub fn decode_slice(buf: &[u8]) -> Result<Vec<Sge>, WireError> {
        if buf.len() % SGE_LEN != 0 {
            return Err(WireError::Truncated {
                need: buf.len().next_multiple_of(SGE_LEN),
                have: buf.len(),
            });
        }
        Ok(buf
            .chunks_exact(SGE_LEN)
            .map(|c| Sge {
                addr: get_u64(c, 0),
                length: get_u32(c, 8),
                rkey: get_u32(c, 12),
            })
            .collect())
    }
}

/// One memory segment for a shared-memory transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemIovec {
    /// Address of the segment in the shared address space.
    pub addr: u64,
    /// Length of the segment in bytes.
    pub length: u64,
}

impl MemIovec {
    /// Append the encoded entry to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
    }

    /// Decode a tightly packed array of entries.
    pub fn decode_slice(buf: &[u8]) -> Result<Vec<MemIovec>, WireError> {
        if buf.len() % MEM_IOVEC_LEN != 0 {
            return Err(WireError::Truncated {
                need: buf.len().next_multiple_of(MEM_IOVEC_LEN),
                have: buf.len(),
            });
        }
        Ok(buf
            .chunks_exact(MEM_IOVEC_LEN)
            .map(|c| MemIovec {
                addr: get_u64(c, 0),
                length: get_u64(c, 8),
            })
            .collect())
    }
}

/// Format tag of an encoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataFmt {
    /// Payload bytes follow inline.
    Immediate = 1,
    /// Scatter-gather list for remote DMA follows inline.
    RdmaDma = 2,
    /// A single entry pointing at a scatter-gather list in remote memory.
    RdmaIndirect = 3,
    /// Memory segment list for a shared-memory transport follows inline.
    MemDma = 4,
    /// A single entry pointing at a segment list in peer memory.
    MemIndirect = 5,
}

/// A parsed data descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Payload carried in the message itself.
    Immediate(Vec<u8>),
    /// Segments to be moved by a remote-DMA transport.
    RdmaDma(Vec<Sge>),
    /// Pointer to a scatter-gather list in the initiator's memory.
    RdmaIndirect(Sge),
    /// Segments to be moved by a shared-memory transport.
    MemDma(Vec<MemIovec>),
    /// Pointer to a segment list in the peer's memory.
    MemIndirect(MemIovec),
}

impl Data {
    /// The format tag of this descriptor.
    pub fn fmt(&self) -> DataFmt {
        match self {
            Self::Immediate(_) => DataFmt::Immediate,
            Self::RdmaDma(_) => DataFmt::RdmaDma,
            Self::RdmaIndirect(_) => DataFmt::RdmaIndirect,
            Self::MemDma(_) => DataFmt::MemDma,
            Self::MemIndirect(_) => DataFmt::MemIndirect,
        }
    }

    /// Whether the payload travels inside the message.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate(_))
    }

    /// Append the encoded descriptor to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.fmt() as u8);
        out.extend_from_slice(&[0, 0, 0]);
        match self {
            Self::Immediate(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Self::RdmaDma(sges) => {
                out.extend_from_slice(&(sges.len() as u32).to_le_bytes());
                for sge in sges {
                    sge.encode(out);
                }
            }
            Self::RdmaIndirect(sge) => {
                out.extend_from_slice(&1u32.to_le_bytes());
                sge.encode(out);
            }
            Self::MemDma(iovs) => {
                out.extend_from_slice(&(iovs.len() as u32).to_le_bytes());
                for iov in iovs {
                    iov.encode(out);
                }
            }
            Self::MemIndirect(iov) => {
                out.extend_from_slice(&1u32.to_le_bytes());
                iov.encode(out);
            }
        }
    }

    /// Decode a descriptor from the front of `buf`, returning it along with
    /// its encoded size.
    pub fn decode(buf: &[u8]) -> Result<(Data, usize), WireError> {
        need(buf, 8)?;
        let count = get_u32(buf, 4) as usize;
        let body = &buf[8..];
        let (data, body_len) = match buf[0] {
            1 => {
                need(body, count)?;
                (Data::Immediate(body[..count].to_vec()), count)
            }
            2 => {
                let len = count * SGE_LEN;
                need(body, len)?;
                (Data::RdmaDma(Sge::decode_slice(&body[..len])?), len)
            }
            3 => {
                need(body, SGE_LEN)?;
                let sges = Sge::decode_slice(&body[..SGE_LEN])?;
                (Data::RdmaIndirect(sges[0]), SGE_LEN)
            }
            4 => {
                let len = count * MEM_IOVEC_LEN;
                need(body, len)?;
                (Data::MemDma(MemIovec::decode_slice(&body[..len])?), len)
            }
            5 => {
                need(body, MEM_IOVEC_LEN)?;
                let iovs = MemIovec::decode_slice(&body[..MEM_IOVEC_LEN])?;
                (Data::MemIndirect(iovs[0]), MEM_IOVEC_LEN)
            }
            v => {
                return Err(WireError::BadField {
                    field: "data_fmt",
                    value: v as u32,
                });
            }
        };
        Ok((data, 8 + body_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_roundtrip() {
        let data = Data::Immediate(vec![1, 2, 3, 4, 5]);
        let mut bytes = Vec::new();
        data.encode(&mut bytes);
        let (back, used) = Data::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(back, data);
    }

    #[test]
    fn sge_list_roundtrip() {
        let data = Data::RdmaDma(vec![
            Sge {
                addr: 0x1000,
                length: 64,
                rkey: 7,
            },
            Sge {
                addr: 0x2000,
                length: 128,
                rkey: 7,
            },
        ]);
        let mut bytes = Vec::new();
        data.encode(&mut bytes);
        let (back, used) = Data::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(back, data);
    }

    #[test]
    fn two_descriptors_in_sequence() {
        let first = Data::RdmaIndirect(Sge {
            addr: 0xabcd,
            length: 160,
            rkey: 1,
        });
        let second = Data::Immediate(vec![9; 16]);
        let mut bytes = Vec::new();
        first.encode(&mut bytes);
        second.encode(&mut bytes);

        let (a, used) = Data::decode(&bytes).unwrap();
        let (b, rest) = Data::decode(&bytes[used..]).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn truncated_immediate() {
        let data = Data::Immediate(vec![0; 32]);
        let mut bytes = Vec::new();
        data.encode(&mut bytes);
        bytes.truncate(bytes.len() - 1);
        assert!(Data::decode(&bytes).is_err());
    }
}
