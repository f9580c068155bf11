//! Initiator-side memory descriptors.

use std::sync::Arc;

use crate::event::{Ct, EventQueue};
use crate::mem::Region;

bitflags::bitflags! {
    /// Options of a memory descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MdOptions: u32 {
        /// Suppress successful full events for operations on this
        /// descriptor; failures are still delivered.
        const EVENT_SUCCESS_DISABLE = 1 << 0;
        /// Count bytes instead of operations on the attached counter.
        const EVENT_CT_BYTES = 1 << 1;
        /// Count send completions on the attached counter.
        const EVENT_CT_SEND = 1 << 2;
        /// Count acknowledgements on the attached counter.
        const EVENT_CT_ACK = 1 << 3;
        /// Count replies on the attached counter.
        const EVENT_CT_REPLY = 1 << 4;
    }
}

/// A registered initiator-side buffer operations read from or write into.
#[derive(Debug)]
pub struct Md {
    /// The registered memory.
    pub region: Region,
    /// Behavior options.
    pub options: MdOptions,
    /// Queue receiving full events for operations on this descriptor.
    pub eq: Option<Arc<EventQueue>>,
    /// Counter receiving counting events for operations on this descriptor.
    pub ct: Option<Arc<Ct>>,
}

impl Md {
    /// Bind a region into a descriptor with no event delivery.
    pub fn bind(region: Region, options: MdOptions) -> Arc<Self> {
        Arc::new(Self {
            region,
            options,
            eq: None,
            ct: None,
        })
    }

    /// Bind a region with full and/or counting event delivery attached.
    pub fn bind_with_events(
        region: Region,
        options: MdOptions,
        eq: Option<Arc<EventQueue>>,
        ct: Option<Arc<Ct>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            region,
            options,
            eq,
            ct,
        })
    }
}
