//! Per-peer connections and the connection gate.
//!
//! Requests that need to respond or move bulk data suspend until the
//! connection to their peer reaches the connected state. Suspended buffers
//! sit on the connection's wait list holding one reference each; whichever
//! progress thread observes the connection outcome drains the list and
//! re-enters the state machines.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use ptl4_wire::NiFail;

use crate::buf::{MsgBuf, SmState};
use crate::ni::Ni;
use crate::transport::{Dest, Transport};
use crate::{init, tgt, ProcessId};

/// State of a per-peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// No connection exists or the last one went away.
    Disconnected = 0,
    /// Peer address resolution in progress.
    Resolving = 1,
    /// Connection establishment in progress.
    Connecting = 2,
    /// Ready to carry traffic.
    Connected = 3,
    /// Teardown in progress.
    Disconnecting = 4,
}

impl From<u8> for ConnState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Disconnected,
            1 => Self::Resolving,
            2 => Self::Connecting,
            3 => Self::Connected,
            _ => Self::Disconnecting,
        }
    }
}

/// A per-peer connection: state, transport capability and the wait list of
/// suspended buffers.
#[derive(Debug)]
pub struct Conn {
    peer: ProcessId,
    state: AtomicU8,
    // serializes state transitions and the connect attempt
    mutex: Mutex<()>,
    wait_list: Mutex<Vec<Arc<MsgBuf>>>,
    transport: Arc<dyn Transport>,
    dest: Mutex<Option<Dest>>,
}

impl Conn {
    pub(crate) fn new(peer: ProcessId, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            state: AtomicU8::new(ConnState::Disconnected as u8),
            mutex: Mutex::new(()),
            wait_list: Mutex::new(Vec::new()),
            transport,
            dest: Mutex::new(None),
        })
    }

    /// The peer this connection reaches.
    pub fn peer(&self) -> ProcessId {
        self.peer
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.state.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the connection carries traffic.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The transport capability assigned to this peer.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Destination addressing, available once connected.
    pub fn dest(&self) -> Option<Dest> {
        *self.dest.lock().unwrap()
    }

    /// Park a buffer until the connection outcome is known, starting a
    /// connect attempt if none is in flight. Returns `false` when the
    /// connection turned ready concurrently and the buffer was not parked.
    pub(crate) fn park_waiter(
        &self,
        ni: &Arc<Ni>,
        self_arc: &Arc<Conn>,
        buf: &Arc<MsgBuf>,
    ) -> Result<bool, crate::PtlError> {
        let _guard = self.mutex.lock().unwrap();
        if self.is_ready() {
            return Ok(false);
        }

        self.wait_list.lock().unwrap().push(buf.clone());

        if self.state() == ConnState::Disconnected {
            self.set_state(ConnState::Connecting);
            if let Err(e) = ni.connector().init_connect(ni, self_arc) {
                self.set_state(ConnState::Disconnected);
                self.wait_list
                    .lock()
                    .unwrap()
                    .retain(|b| !Arc::ptr_eq(b, buf));
                return Err(crate::PtlError::Transport(e));
            }
        }
        Ok(true)
    }

    fn take_waiters(&self) -> Vec<Arc<MsgBuf>> {
        std::mem::take(&mut *self.wait_list.lock().unwrap())
    }
}

/// Report a connection as established and resume every parked buffer.
pub fn connection_ready(ni: &Arc<Ni>, conn: &Arc<Conn>, dest: Dest) {
    {
        let _guard = conn.mutex.lock().unwrap();
        *conn.dest.lock().unwrap() = Some(dest);
        conn.set_state(ConnState::Connected);
    }
    ptl4_log::debug!(peer = ?conn.peer(), "connection ready");

    for buf in conn.take_waiters() {
        let role = {
            let inner = buf.lock();
            inner.state
        };
        match role {
            SmState::Tgt(_) => {
                let _ = tgt::process_tgt(ni, &buf);
            }
            SmState::Init(_) => {
                let _ = init::process_init(ni, &buf);
            }
        }
    }
}

/// Report a failed or lost connection: every parked buffer is resumed with
/// an undeliverable status so owed events still fire.
pub fn connection_failed(ni: &Arc<Ni>, conn: &Arc<Conn>) {
    {
        let _guard = conn.mutex.lock().unwrap();
        *conn.dest.lock().unwrap() = None;
        conn.set_state(ConnState::Disconnected);
    }
    ptl4_log::warn!(peer = ?conn.peer(), "connection failed");

    for buf in conn.take_waiters() {
        let mut inner = buf.lock();
        inner.ni_fail = NiFail::Undeliverable;
        let is_tgt = matches!(inner.state, SmState::Tgt(_));
        if is_tgt {
            // a response cannot be sent; skip straight to cleanup
            inner.state = SmState::Tgt(tgt::TgtState::Cleanup);
        } else {
            inner.state = SmState::Init(init::InitState::SendError);
        }
        drop(inner);
        if is_tgt {
            let _ = tgt::process_tgt(ni, &buf);
        } else {
            let _ = init::process_init(ni, &buf);
        }
    }
}
