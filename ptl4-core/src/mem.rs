//! Registered user memory.
//!
//! A [`Region`] describes application memory a posted element or descriptor
//! exposes to the engine: either one contiguous range or a vector of ranges.
//! The engine addresses a region by a logical byte offset; the iovec walk
//! that maps an offset onto a concrete range is done here so the state
//! machines and transports can stay oblivious to the backing layout.

use smallvec::SmallVec;

use crate::PtlError;

/// One mapped range of a vectored region.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    /// First byte of the range.
    pub base: *mut u8,
    /// Length of the range in bytes.
    pub len: usize,
}

/// A registered range of application memory.
///
/// # Safety contract
///
/// A `Region` does not own the memory it describes. The creator asserts that
/// every byte stays valid, writable and free of conflicting non-engine
/// access for as long as any engine object (element, descriptor, in-flight
/// request) can reach the region. This mirrors the ownership contract a
/// completion-based runtime places on buffers lent to the kernel.
#[derive(Debug, Clone)]
pub enum Region {
    /// One contiguous range.
    Contiguous {
        /// First byte of the range.
        base: *mut u8,
        /// Length of the range in bytes.
        len: usize,
    },
    /// An ordered vector of ranges forming one logical address space.
    Vectored(SmallVec<[IoVec; 4]>),
}

// SAFETY: the creator of a `Region` guarantees exclusive, stable access per
// the safety contract above; the engine itself serializes all mutation.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region over one contiguous range.
    ///
    /// # Safety
    ///
    /// See the type-level safety contract.
    pub unsafe fn contiguous(base: *mut u8, len: usize) -> Self {
        Self::Contiguous { base, len }
    }

    /// Create a region over an ordered set of ranges.
    ///
    /// # Safety
    ///
    /// See the type-level safety contract.
    pub unsafe fn vectored(iovs: impl IntoIterator<Item = IoVec>) -> Self {
        Self::Vectored(iovs.into_iter().collect())
    }

    /// A zero-length region.
    pub fn empty() -> Self {
        Self::Contiguous {
            base: std::ptr::null_mut(),
            len: 0,
        }
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Contiguous { len, .. } => *len as u64,
            Self::Vectored(iovs) => iovs.iter().map(|v| v.len as u64).sum(),
        }
    }

    /// Whether the region is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of backing ranges; zero means contiguous.
    pub fn num_iov(&self) -> usize {
        match self {
            Self::Contiguous { .. } => 0,
            Self::Vectored(iovs) => iovs.len(),
        }
    }

    /// Address of the byte at `offset`, or `None` when the offset is outside
    /// the region.
    pub fn resolve(&self, offset: u64) -> Option<usize> {
        match self {
            Self::Contiguous { base, len } => {
                (offset < *len as u64).then(|| *base as usize + offset as usize)
            }
            Self::Vectored(iovs) => {
                let mut rem = offset;
                for iov in iovs {
                    if rem < iov.len as u64 {
                        return Some(iov.base as usize + rem as usize);
                    }
                    rem -= iov.len as u64;
                }
                None
            }
        }
    }

    /// Map a logical offset onto a `(range index, offset in range)` cursor.
    ///
    /// Fails when the region advertises fewer bytes than the offset needs,
    /// which a well-formed element can only hit through a corrupt length.
    pub fn cursor(&self, offset: u64) -> Result<(usize, u64), PtlError> {
        match self {
            Self::Contiguous { len, .. } => {
                if offset > *len as u64 {
                    Err(PtlError::NoSpace("offset outside region"))
                } else {
                    Ok((0, offset))
                }
            }
            Self::Vectored(iovs) => {
                let mut rem = offset;
                for (i, iov) in iovs.iter().enumerate() {
                    if rem < iov.len as u64 {
                        return Ok((i, rem));
                    }
                    rem -= iov.len as u64;
                }
                if rem == 0 {
                    Ok((iovs.len(), 0))
                } else {
                    Err(PtlError::NoSpace("offset outside region"))
                }
            }
        }
    }

    /// The writable range at cursor `(iov_index, iov_off)`, clamped to `max`
    /// bytes. Returns `None` when the cursor sits at the end of the region.
    pub fn chunk(&self, iov_index: usize, iov_off: u64, max: usize) -> Option<(*mut u8, usize)> {
        match self {
            Self::Contiguous { base, len } => {
                let avail = (*len as u64).checked_sub(iov_off)?;
                if avail == 0 {
                    return None;
                }
                let n = (avail as usize).min(max);
                Some((unsafe { base.add(iov_off as usize) }, n))
            }
            Self::Vectored(iovs) => {
                let iov = iovs.get(iov_index)?;
                let avail = (iov.len as u64).checked_sub(iov_off)?;
                if avail == 0 {
                    // cursor parked on a range boundary
                    return self.chunk(iov_index + 1, 0, max);
                }
                let n = (avail as usize).min(max);
                Some((unsafe { iov.base.add(iov_off as usize) }, n))
            }
        }
    }

    /// Advance a cursor by `n` bytes.
    pub fn advance(&self, iov_index: &mut usize, iov_off: &mut u64, mut n: u64) {
        match self {
            Self::Contiguous { .. } => *iov_off += n,
            Self::Vectored(iovs) => {
                while n > 0 {
                    let Some(iov) = iovs.get(*iov_index) else {
                        *iov_off += n;
                        return;
                    };
                    let avail = iov.len as u64 - *iov_off;
                    if n < avail {
                        *iov_off += n;
                        return;
                    }
                    n -= avail;
                    *iov_index += 1;
                    *iov_off = 0;
                }
            }
        }
    }

    /// Copy `src` into the region starting at logical `offset`.
    pub fn copy_in(&self, offset: u64, src: &[u8]) -> Result<(), PtlError> {
        self.for_each_chunk(offset, src.len(), |at, ptr, n| unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(at), ptr, n);
        })
    }

    /// Copy bytes out of the region starting at logical `offset` into `dst`.
    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) -> Result<(), PtlError> {
        let dst_ptr = dst.as_mut_ptr();
        self.for_each_chunk(offset, dst.len(), |at, ptr, n| unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst_ptr.add(at), n);
        })
    }

    /// Collect the concrete `(address, length)` segments covering
    /// `[offset, offset + length)`, in order.
    pub fn segments(&self, offset: u64, length: u64) -> Result<Vec<(usize, usize)>, PtlError> {
        let mut out = Vec::new();
        self.for_each_chunk(offset, length as usize, |_, ptr, n| {
            out.push((ptr as usize, n));
        })?;
        Ok(out)
    }

    fn for_each_chunk(
        &self,
        offset: u64,
        length: usize,
        mut f: impl FnMut(usize, *mut u8, usize),
    ) -> Result<(), PtlError> {
        if offset + length as u64 > self.len() {
            return Err(PtlError::NoSpace("copy outside region"));
        }
        let (mut idx, mut off) = self.cursor(offset)?;
        let mut done = 0;
        while done < length {
            let (ptr, n) = self
                .chunk(idx, off, length - done)
                .ok_or(PtlError::NoSpace("copy outside region"))?;
            f(done, ptr, n);
            self.advance(&mut idx, &mut off, n as u64);
            done += n;
        }
        Ok(())
    }
}
