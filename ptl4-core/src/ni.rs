//! Network interfaces.
//!
//! An interface owns the portals table, the per-peer connection table, the
//! registry of in-flight initiator requests and the interface-wide atomic
//! mutex. It is the root object everything else hangs off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use slab::Slab;

use crate::buf::MsgBuf;
use crate::conn::Conn;
use crate::event::EventQueue;
use crate::pt::{PtEntry, PtOptions, PtState};
use crate::transport::Connector;
use crate::{ProcessId, PtlError, UID_ANY};

/// Implementation limits of an interface.
#[derive(Debug, Clone, Copy)]
pub struct NiLimits {
    /// Number of portals table entries.
    pub max_pt_index: u32,
    /// Largest put/get transfer in bytes.
    pub max_msg_size: u64,
    /// Largest atomic operation in bytes.
    pub max_atomic_size: u64,
    /// Largest payload carried inside a message instead of via bulk
    /// transfer. Atomic payloads must fit here.
    pub max_inline_data: u64,
    /// Largest scatter-gather list carried inside a request; longer lists
    /// go through an indirect descriptor.
    pub max_inline_sges: usize,
}

impl Default for NiLimits {
    fn default() -> Self {
        Self {
            max_pt_index: 64,
            max_msg_size: 1 << 31,
            max_atomic_size: 512,
            max_inline_data: 512,
            max_inline_sges: 16,
        }
    }
}

/// Builder for [`Ni`].
#[derive(Debug)]
pub struct NiBuilder {
    logical: bool,
    matching: bool,
    id: ProcessId,
    uid: u32,
    limits: NiLimits,
}

impl NiBuilder {
    /// Start from a physical, matching interface with default limits.
    pub fn new(id: ProcessId) -> Self {
        Self {
            logical: false,
            matching: true,
            id,
            uid: UID_ANY,
            limits: NiLimits::default(),
        }
    }

    /// Address peers by rank instead of `{nid, pid}`.
    pub fn logical(mut self, logical: bool) -> Self {
        self.logical = logical;
        self
    }

    /// Enable or disable match-bit matching; non-matching interfaces
    /// deliver to the first element with acceptable permissions.
    pub fn matching(mut self, matching: bool) -> Self {
        self.matching = matching;
        self
    }

    /// User id presented to remote permission filters.
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    /// Override the implementation limits.
    pub fn limits(mut self, limits: NiLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the interface with its connection management callbacks.
    pub fn build(self, connector: Box<dyn Connector>) -> Arc<Ni> {
        let mut limits = self.limits;
        // atomic payloads travel as immediate data
        limits.max_atomic_size = limits.max_atomic_size.min(limits.max_inline_data);

        let pts = (0..limits.max_pt_index).map(|_| PtEntry::vacant()).collect();
        Arc::new(Ni {
            logical: self.logical,
            matching: self.matching,
            id: self.id,
            uid: self.uid,
            limits,
            pts,
            conns: Mutex::new(ConnTable::default()),
            init_bufs: Mutex::new(Slab::new()),
            atomic_mutex: Mutex::new(()),
            connector,
        })
    }
}

#[derive(Debug, Default)]
struct ConnTable {
    by_peer: HashMap<ProcessId, usize>,
    conns: Slab<Arc<Conn>>,
}

/// A network interface.
pub struct Ni {
    logical: bool,
    matching: bool,
    id: ProcessId,
    uid: u32,
    limits: NiLimits,
    pts: Box<[PtEntry]>,
    conns: Mutex<ConnTable>,
    init_bufs: Mutex<Slab<Arc<MsgBuf>>>,
    // serializes atomic, fetch-atomic and swap data phases
    atomic_mutex: Mutex<()>,
    connector: Box<dyn Connector>,
}

impl std::fmt::Debug for Ni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ni")
            .field("id", &self.id)
            .field("logical", &self.logical)
            .field("matching", &self.matching)
            .finish_non_exhaustive()
    }
}

impl Ni {
    /// Start building an interface.
    pub fn builder(id: ProcessId) -> NiBuilder {
        NiBuilder::new(id)
    }

    /// Whether peers are addressed by rank.
    pub fn is_logical(&self) -> bool {
        self.logical
    }

    /// Whether match bits participate in matching.
    pub fn is_matching(&self) -> bool {
        self.matching
    }

    /// The identity of this interface.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The user id of this interface.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The implementation limits.
    pub fn limits(&self) -> &NiLimits {
        &self.limits
    }

    pub(crate) fn connector(&self) -> &dyn Connector {
        &*self.connector
    }

    pub(crate) fn pt(&self, index: u32) -> Option<&PtEntry> {
        self.pts.get(index as usize)
    }

    pub(crate) fn atomic_lock(&self) -> MutexGuard<'_, ()> {
        self.atomic_mutex.lock().unwrap()
    }

    /// Allocate a portals table entry, optionally at a caller-chosen index,
    /// and enable it.
    pub fn pt_alloc(
        &self,
        options: PtOptions,
        eq: Option<Arc<EventQueue>>,
        index: Option<u32>,
    ) -> Result<u32, PtlError> {
        let range: Vec<u32> = match index {
            Some(i) => {
                if i >= self.limits.max_pt_index {
                    return Err(PtlError::InvalidArg("pt index out of range"));
                }
                vec![i]
            }
            None => (0..self.limits.max_pt_index).collect(),
        };
        for i in range {
            let mut pt = self.pts[i as usize].lock();
            if pt.in_use {
                continue;
            }
            pt.in_use = true;
            pt.state = PtState::Enabled;
            pt.options = options;
            pt.eq = eq;
            pt.num_tgt_active = 0;
            return Ok(i);
        }
        Err(PtlError::NoSpace("portals table full"))
    }

    /// Release a portals table entry. Fails while target operations are
    /// still in flight on it.
    pub fn pt_free(&self, index: u32) -> Result<(), PtlError> {
        let pt = self
            .pt(index)
            .ok_or(PtlError::InvalidArg("pt index out of range"))?;
        let mut pt = pt.lock();
        if !pt.in_use {
            return Err(PtlError::InvalidArg("pt entry not in use"));
        }
        if pt.num_tgt_active != 0 || !pt.unexpected.is_empty() {
            return Err(PtlError::InvalidArg("pt entry busy"));
        }
        pt.in_use = false;
        pt.state = PtState::Disabled;
        pt.eq = None;
        pt.priority.clear();
        pt.overflow.clear();
        Ok(())
    }

    /// Re-enable a disabled entry.
    pub fn pt_enable(&self, index: u32) -> Result<(), PtlError> {
        let pt = self
            .pt(index)
            .ok_or(PtlError::InvalidArg("pt index out of range"))?;
        let mut pt = pt.lock();
        if !pt.in_use {
            return Err(PtlError::InvalidArg("pt entry not in use"));
        }
        pt.state = PtState::Enabled;
        Ok(())
    }

    /// Disable an entry; new requests are refused once in-flight ones
    /// drain.
    pub fn pt_disable(&self, index: u32) -> Result<(), PtlError> {
        let pt = self
            .pt(index)
            .ok_or(PtlError::InvalidArg("pt index out of range"))?;
        let mut pt = pt.lock();
        if !pt.in_use {
            return Err(PtlError::InvalidArg("pt entry not in use"));
        }
        pt.state = PtState::Disabled;
        Ok(())
    }

    /// Current lifecycle state of an entry.
    pub fn pt_state(&self, index: u32) -> Option<PtState> {
        self.pt(index).map(|pt| pt.lock().state)
    }

    /// The connection object for `peer`, created on first use.
    pub fn get_conn(&self, peer: ProcessId) -> Arc<Conn> {
        let mut table = self.conns.lock().unwrap();
        if let Some(&key) = table.by_peer.get(&peer) {
            return table.conns[key].clone();
        }
        let conn = Conn::new(peer, self.connector.assign_transport(peer));
        let key = table.conns.insert(conn.clone());
        table.by_peer.insert(peer, key);
        conn
    }

    /// The connection object for `peer` if one exists.
    pub fn peer_conn(&self, peer: ProcessId) -> Option<Arc<Conn>> {
        let table = self.conns.lock().unwrap();
        table.by_peer.get(&peer).map(|&key| table.conns[key].clone())
    }

    pub(crate) fn register_init_buf(&self, buf: &Arc<MsgBuf>) -> u32 {
        self.init_bufs.lock().unwrap().insert(buf.clone()) as u32
    }

    pub(crate) fn lookup_init_buf(&self, handle: u32) -> Option<Arc<MsgBuf>> {
        self.init_bufs.lock().unwrap().get(handle as usize).cloned()
    }

    pub(crate) fn deregister_init_buf(&self, handle: u32) {
        let mut bufs = self.init_bufs.lock().unwrap();
        if bufs.contains(handle as usize) {
            bufs.remove(handle as usize);
        }
    }
}
