//! Portals table entries.
//!
//! A table entry owns the three ordered lists the matching engine walks:
//! the priority list, the overflow list, and the unexpected list of buffered
//! requests awaiting a late append. All of an entry's mutable state sits
//! behind one lock, held briefly for list walks and state transitions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buf::MsgBuf;
use crate::event::EventQueue;
use crate::le::Le;

bitflags::bitflags! {
    /// Options of a portals table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PtOptions: u32 {
        /// Enable flow control: the first request that matches nothing
        /// trips the entry into [`PtState::AutoDisabled`].
        const FLOWCTRL = 1;
    }
}

/// Lifecycle state of a portals table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtState {
    /// Accepting requests.
    Enabled,
    /// Flow control tripped; in-flight requests drain, new ones are refused.
    AutoDisabled,
    /// Fully disabled.
    Disabled,
}

#[derive(Debug)]
pub(crate) struct PtEntry {
    inner: Mutex<PtInner>,
}

#[derive(Debug)]
pub(crate) struct PtInner {
    pub in_use: bool,
    pub state: PtState,
    pub options: PtOptions,
    pub eq: Option<Arc<EventQueue>>,
    pub priority: VecDeque<Arc<Le>>,
    pub overflow: VecDeque<Arc<Le>>,
    pub unexpected: VecDeque<Arc<MsgBuf>>,
    pub num_tgt_active: u32,
}

impl PtEntry {
    pub fn vacant() -> Self {
        Self {
            inner: Mutex::new(PtInner {
                in_use: false,
                state: PtState::Disabled,
                options: PtOptions::empty(),
                eq: None,
                priority: VecDeque::new(),
                overflow: VecDeque::new(),
                unexpected: VecDeque::new(),
                num_tgt_active: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PtInner> {
        self.inner.lock().unwrap()
    }
}

impl PtInner {
    /// Detach `le` from whichever list it sits on.
    pub fn remove_le(&mut self, le: &Arc<Le>) {
        self.priority.retain(|e| !Arc::ptr_eq(e, le));
        self.overflow.retain(|e| !Arc::ptr_eq(e, le));
    }
}
