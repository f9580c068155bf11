//! Posted list elements.
//!
//! An LE describes one receive buffer posted on a portals table entry's
//! priority or overflow list. On matching interfaces the element carries
//! match/ignore bits and an identity filter (an ME); non-matching
//! interfaces deliver to the first element. Elements are unlinked when
//! consumed, when their locally managed free space runs out, or
//! explicitly; the object stays alive until its last holder drops it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ptl4_wire::{NiFail, PtlList};

use crate::buf::{MsgBuf, SmState};
use crate::event::{Ct, Event, EventKind};
use crate::matching;
use crate::mem::Region;
use crate::ni::Ni;
use crate::tgt::{self, TgtState};
use crate::{ProcessId, PtlError, UID_ANY};

bitflags::bitflags! {
    /// Options of a posted element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LeOptions: u32 {
        /// Accept put and atomic operations.
        const OP_PUT = 1 << 0;
        /// Accept get operations; fetch-atomic and swap need both.
        const OP_GET = 1 << 1;
        /// Unlink after the first match.
        const USE_ONCE = 1 << 2;
        /// The target manages the offset: deliveries append at the
        /// element's own cursor instead of the requested offset.
        const MANAGE_LOCAL = 1 << 3;
        /// Refuse requests that would not fit instead of truncating them.
        const NO_TRUNCATE = 1 << 4;
        /// Answer ack requests with the smallest synthetic form.
        const ACK_DISABLE = 1 << 5;
        /// Suppress comm events for this element.
        const EVENT_COMM_DISABLE = 1 << 6;
        /// Suppress successful comm events; failures still post.
        const EVENT_SUCCESS_DISABLE = 1 << 7;
        /// Suppress overflow events for this element.
        const EVENT_OVER_DISABLE = 1 << 8;
        /// Suppress the automatic unlink event.
        const EVENT_UNLINK_DISABLE = 1 << 9;
        /// Count communication operations on the attached counter.
        const EVENT_CT_COMM = 1 << 10;
        /// Count overflow deliveries on the attached counter.
        const EVENT_CT_OVERFLOW = 1 << 11;
        /// Count bytes instead of operations.
        const EVENT_CT_BYTES = 1 << 12;
    }
}

/// Arguments for posting an element.
#[derive(Debug)]
pub struct LeInit {
    /// The receive buffer.
    pub region: Region,
    /// Behavior options.
    pub options: LeOptions,
    /// Match bits compared against request headers.
    pub match_bits: u64,
    /// Bits excluded from the comparison.
    pub ignore_bits: u64,
    /// Identity filter; wildcards accept any peer.
    pub match_id: ProcessId,
    /// User id filter; [`UID_ANY`] accepts any user.
    pub uid: u32,
    /// Unlink a locally managed element once its free space falls below
    /// this many bytes.
    pub min_free: u64,
    /// Opaque value delivered with events about this element.
    pub user_ptr: u64,
    /// Counter receiving counting events for this element.
    pub ct: Option<Arc<Ct>>,
}

impl LeInit {
    /// An element accepting any peer and any user.
    pub fn new(region: Region, options: LeOptions) -> Self {
        Self {
            region,
            options,
            match_bits: 0,
            ignore_bits: 0,
            match_id: ProcessId::any(),
            uid: UID_ANY,
            min_free: 0,
            user_ptr: 0,
            ct: None,
        }
    }

    /// Set the match and ignore bits.
    pub fn match_bits(mut self, match_bits: u64, ignore_bits: u64) -> Self {
        self.match_bits = match_bits;
        self.ignore_bits = ignore_bits;
        self
    }

    /// Restrict matching to one peer identity.
    pub fn match_id(mut self, id: ProcessId) -> Self {
        self.match_id = id;
        self
    }

    /// Restrict matching to one user id.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Set the locally managed free-space threshold.
    pub fn min_free(mut self, min_free: u64) -> Self {
        self.min_free = min_free;
        self
    }

    /// Set the user pointer delivered with events.
    pub fn user_ptr(mut self, user_ptr: u64) -> Self {
        self.user_ptr = user_ptr;
        self
    }

    /// Attach a counting event.
    pub fn ct(mut self, ct: Arc<Ct>) -> Self {
        self.ct = Some(ct);
        self
    }
}

/// A posted element.
#[derive(Debug)]
pub struct Le {
    pub(crate) region: Region,
    pub(crate) options: LeOptions,
    pub(crate) match_bits: u64,
    pub(crate) ignore_bits: u64,
    pub(crate) match_id: ProcessId,
    pub(crate) uid: u32,
    pub(crate) min_free: u64,
    pub(crate) user_ptr: u64,
    pub(crate) ct: Option<Arc<Ct>>,
    pub(crate) pt_index: u32,
    pub(crate) list: PtlList,
    // cursor of a locally managed element; the early target states run on
    // one progress thread, so a plain atomic is enough
    pub(crate) offset: AtomicU64,
    pub(crate) linked: AtomicBool,
}

impl Le {
    fn from_init(init: LeInit, pt_index: u32, list: PtlList) -> Arc<Self> {
        Arc::new(Self {
            region: init.region,
            options: init.options,
            match_bits: init.match_bits,
            ignore_bits: init.ignore_bits,
            match_id: init.match_id,
            uid: init.uid,
            min_free: init.min_free,
            user_ptr: init.user_ptr,
            ct: init.ct,
            pt_index,
            list,
            offset: AtomicU64::new(0),
            linked: AtomicBool::new(false),
        })
    }

    /// Current cursor of a locally managed element.
    pub fn manage_offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Whether the element still sits on its list.
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// The user pointer of this element.
    pub fn user_ptr(&self) -> u64 {
        self.user_ptr
    }

    /// The list the element was posted on.
    pub fn list(&self) -> PtlList {
        self.list
    }
}

/// Post an element on a table entry's priority or overflow list.
///
/// Appending to the priority list first searches the unexpected list: each
/// buffered request the new element matches is revived to deliver its
/// overflow event, and a use-once element consumed this way is never
/// linked.
pub fn le_append(
    ni: &Arc<Ni>,
    pt_index: u32,
    init: LeInit,
    list: PtlList,
) -> Result<Arc<Le>, PtlError> {
    let entry = ni
        .pt(pt_index)
        .ok_or(PtlError::InvalidArg("pt index out of range"))?;
    let le = Le::from_init(init, pt_index, list);

    let mut pt = entry.lock();
    if !pt.in_use {
        return Err(PtlError::InvalidArg("pt entry not in use"));
    }

    if list == PtlList::Priority {
        let revived = matching::match_unexpected(ni, &mut pt, &le);
        if !revived.is_empty() {
            let consumed = le.options.contains(LeOptions::USE_ONCE);
            if !consumed {
                le.linked.store(true, Ordering::Release);
                pt.priority.push_back(le.clone());
            }
            drop(pt);
            for buf in revived {
                resume_overflow_match(ni, &buf, &le);
            }
            return Ok(le);
        }
        le.linked.store(true, Ordering::Release);
        pt.priority.push_back(le.clone());
    } else {
        le.linked.store(true, Ordering::Release);
        pt.overflow.push_back(le.clone());
    }
    Ok(le)
}

/// How a search treats the buffered requests it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Report the first match without consuming anything.
    Only,
    /// Consume every match, delivering its overflow event.
    Delete,
}

/// Search the unexpected list without posting the probe element.
///
/// A hit in [`SearchMode::Only`] posts a search event carrying a snapshot
/// of the first buffered match; a miss in either mode posts a search event
/// with an undeliverable status.
pub fn le_search(
    ni: &Arc<Ni>,
    pt_index: u32,
    init: LeInit,
    mode: SearchMode,
) -> Result<(), PtlError> {
    let entry = ni
        .pt(pt_index)
        .ok_or(PtlError::InvalidArg("pt index out of range"))?;
    let probe = Le::from_init(init, pt_index, PtlList::Priority);

    let mut pt = entry.lock();
    if !pt.in_use {
        return Err(PtlError::InvalidArg("pt entry not in use"));
    }
    let eq = pt.eq.clone();

    match mode {
        SearchMode::Only => {
            let found = pt.unexpected.iter().find(|buf| {
                (!ni.is_matching() || matching::check_match(ni, buf.req(), &probe))
                    && matching::check_perm(buf.req(), &probe).is_ok()
            });
            let found = found.cloned();
            drop(pt);

            if let Some(eq) = eq {
                match found {
                    Some(buf) => {
                        let inner = buf.lock();
                        let req = buf.req();
                        eq.push(Event {
                            kind: EventKind::Search,
                            ni_fail: NiFail::Ok,
                            initiator: ProcessId::new(req.src_nid, req.src_pid),
                            match_bits: req.match_bits,
                            hdr_data: req.hdr_data,
                            mlength: inner.mlength,
                            moffset: inner.moffset,
                            remote_offset: req.offset,
                            start: inner.start,
                            user_ptr: probe.user_ptr,
                            pt_index,
                            uid: req.uid,
                        });
                    }
                    None => eq.push(search_miss_event(&probe, pt_index)),
                }
            }
        }
        SearchMode::Delete => {
            let revived = matching::match_unexpected(ni, &mut pt, &probe);
            drop(pt);

            if revived.is_empty() {
                if let Some(eq) = eq {
                    eq.push(search_miss_event(&probe, pt_index));
                }
            } else {
                for buf in revived {
                    // the overflow event is attributed to the probe; the
                    // original element reference is dropped here
                    let mut inner = buf.lock();
                    inner.le = None;
                    drop(inner);
                    resume_overflow_match(ni, &buf, &probe);
                }
            }
        }
    }
    Ok(())
}

fn search_miss_event(probe: &Le, pt_index: u32) -> Event {
    Event {
        kind: EventKind::Search,
        ni_fail: NiFail::Undeliverable,
        initiator: ProcessId::any(),
        match_bits: 0,
        hdr_data: 0,
        mlength: 0,
        moffset: 0,
        remote_offset: 0,
        start: None,
        user_ptr: probe.user_ptr,
        pt_index,
        uid: UID_ANY,
    }
}

/// Hand a late-arrived element to a buffered request and re-enter its
/// state machine if it is parked waiting for one.
fn resume_overflow_match(ni: &Arc<Ni>, buf: &Arc<MsgBuf>, le: &Arc<Le>) {
    let mut inner = buf.lock();
    debug_assert!(inner.matching_le.is_none());
    inner.matching_le = Some(le.clone());
    let waiting = inner.state == SmState::Tgt(TgtState::WaitAppend);
    drop(inner);

    if waiting {
        let _ = tgt::process_tgt(ni, buf);
    }
}

/// Remove an element from its list. `auto_event` posts the automatic
/// unlink event unless the element disabled it; explicit unlinks pass
/// `false`.
pub fn le_unlink(ni: &Ni, le: &Arc<Le>, auto_event: bool) {
    if !le.linked.swap(false, Ordering::AcqRel) {
        return;
    }
    let Some(entry) = ni.pt(le.pt_index) else {
        return;
    };
    let mut pt = entry.lock();
    pt.remove_le(le);
    let eq = pt.eq.clone();
    drop(pt);

    if auto_event && !le.options.contains(LeOptions::EVENT_UNLINK_DISABLE) {
        if let Some(eq) = eq {
            eq.push(Event {
                kind: EventKind::AutoUnlink,
                ni_fail: NiFail::Ok,
                initiator: ProcessId::any(),
                match_bits: 0,
                hdr_data: 0,
                mlength: 0,
                moffset: 0,
                remote_offset: 0,
                start: None,
                user_ptr: le.user_ptr,
                pt_index: le.pt_index,
                uid: UID_ANY,
            });
        }
    }
}
