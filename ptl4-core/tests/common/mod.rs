//! In-process loopback harness.
//!
//! Registers interfaces in a shared registry and carries messages between
//! them through a deferred work queue, standing in for the progress thread
//! a real transport would run. Bulk transfers complete synchronously the
//! way a shared-memory transport's do.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use ptl4_core::{
    connection_failed, connection_ready, drive_mem_dma, recv_request, recv_response, BufInner,
    Conn, Connector, DescFetch, Dest, EventQueue, IndirectTarget, Md, MdOptions, MsgBuf, Ni,
    NiLimits, ProcessId, PtOptions, Region, SendBuf, Transport, TransportKind,
};
use ptl4_wire::peek_operation;

enum Action {
    Deliver { dest: usize, bytes: Vec<u8> },
    Connect { ni: Arc<Ni>, conn: Arc<Conn> },
}

#[derive(Default)]
struct LoopState {
    nis: Vec<Arc<Ni>>,
    queue: VecDeque<Action>,
    hold_peer: Option<ProcessId>,
    held: Vec<(Arc<Ni>, Arc<Conn>)>,
}

/// A transport and connector delivering between registered interfaces.
pub struct Loopback {
    state: Mutex<LoopState>,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopState::default()),
        })
    }

    pub fn register(&self, ni: &Arc<Ni>) {
        self.state.lock().unwrap().nis.push(ni.clone());
    }

    /// Park connection attempts toward `peer` until [`release_held`]
    /// runs.
    ///
    /// [`release_held`]: Loopback::release_held
    pub fn hold_connects_to(&self, peer: ProcessId) {
        self.state.lock().unwrap().hold_peer = Some(peer);
    }

    pub fn release_held(&self) {
        let mut state = self.state.lock().unwrap();
        state.hold_peer = None;
        let held = std::mem::take(&mut state.held);
        for (ni, conn) in held {
            state.queue.push_back(Action::Connect { ni, conn });
        }
    }

    /// Drain the work queue, emulating the progress thread.
    pub fn run(&self) {
        loop {
            let action = {
                let mut state = self.state.lock().unwrap();
                state.queue.pop_front()
            };
            let Some(action) = action else { break };

            match action {
                Action::Deliver { dest, bytes } => {
                    let ni = self.state.lock().unwrap().nis[dest].clone();
                    let op = peek_operation(&bytes).expect("valid message");
                    if op.is_request() {
                        recv_request(&ni, &bytes).expect("target processing");
                    } else {
                        recv_response(&ni, &bytes).expect("initiator processing");
                    }
                }
                Action::Connect { ni, conn } => {
                    let dest = {
                        let state = self.state.lock().unwrap();
                        state.nis.iter().position(|n| n.id() == conn.peer())
                    };
                    match dest {
                        Some(dest) => connection_ready(&ni, &conn, Dest(dest as u64)),
                        None => connection_failed(&ni, &conn),
                    }
                }
            }
        }
    }
}

impl Transport for Loopback {
    fn kind(&self) -> TransportKind {
        TransportKind::Mem
    }

    fn buf_alloc(&self) -> io::Result<SendBuf> {
        Ok(SendBuf::new())
    }

    fn set_send_flags(&self, buf: &mut SendBuf, inline_hint: bool) {
        buf.inline_hint = inline_hint;
    }

    fn send_message(&self, buf: SendBuf, _signaled: bool) -> io::Result<()> {
        let Some(dest) = buf.dest else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no destination"));
        };
        self.state.lock().unwrap().queue.push_back(Action::Deliver {
            dest: dest.0 as usize,
            bytes: buf.bytes,
        });
        Ok(())
    }

    fn post_tgt_dma(&self, _buf: &Arc<MsgBuf>, inner: &mut BufInner) -> io::Result<()> {
        drive_mem_dma(inner)
    }

    fn fetch_remote_desc(
        &self,
        _buf: &Arc<MsgBuf>,
        target: IndirectTarget,
    ) -> io::Result<DescFetch> {
        let (addr, len) = match target {
            IndirectTarget::Sge(sge) => (sge.addr as usize, sge.length as usize),
            IndirectTarget::Mem(iov) => (iov.addr as usize, iov.length as usize),
        };
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec();
        Ok(DescFetch::Ready(bytes))
    }
}

pub struct LoopConnector(pub Arc<Loopback>);

impl Connector for LoopConnector {
    fn assign_transport(&self, _peer: ProcessId) -> Arc<dyn Transport> {
        self.0.clone()
    }

    fn init_connect(&self, ni: &Arc<Ni>, conn: &Arc<Conn>) -> io::Result<()> {
        let mut state = self.0.state.lock().unwrap();
        if state.hold_peer == Some(conn.peer()) {
            state.held.push((ni.clone(), conn.clone()));
        } else {
            state.queue.push_back(Action::Connect {
                ni: ni.clone(),
                conn: conn.clone(),
            });
        }
        Ok(())
    }
}

pub fn test_limits() -> NiLimits {
    NiLimits {
        max_pt_index: 16,
        max_msg_size: 1 << 20,
        max_atomic_size: 64,
        max_inline_data: 512,
        max_inline_sges: 4,
    }
}

/// One interface wired to a fresh loopback.
pub fn setup() -> (Arc<Loopback>, Arc<Ni>) {
    let lo = Loopback::new();
    let ni = Ni::builder(ProcessId::new(1, 1))
        .uid(7)
        .limits(test_limits())
        .build(Box::new(LoopConnector(lo.clone())));
    lo.register(&ni);
    (lo, ni)
}

/// A table entry with a fresh event queue attached.
pub fn pt_with_eq(ni: &Arc<Ni>, options: PtOptions) -> (u32, Arc<EventQueue>) {
    let eq = Arc::new(EventQueue::new(64));
    let pt = ni.pt_alloc(options, Some(eq.clone()), None).unwrap();
    (pt, eq)
}

pub fn region_of(buf: &mut Vec<u8>) -> Region {
    unsafe { Region::contiguous(buf.as_mut_ptr(), buf.len()) }
}

/// A descriptor over `buf` with a full-event queue attached.
pub fn md_with_eq(buf: &mut Vec<u8>) -> (Arc<Md>, Arc<EventQueue>) {
    let eq = Arc::new(EventQueue::new(64));
    let md = Md::bind_with_events(region_of(buf), MdOptions::empty(), Some(eq.clone()), None);
    (md, eq)
}
