//! Service-loop events and peer handles
//!
//! `Host::service` reports connection lifecycle and received packets as
//! events. Peers are referred to through generation-checked handles rather
//! than references, so a handle held across a disconnect simply becomes
//! invalid instead of pointing at a recycled slot.

use rudp_protocol::Packet;

/// Stable reference to a peer slot
///
/// The generation is bumped every time the slot is recycled;
/// `Host::peer_mut` rejects handles from a previous occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub(crate) index: u16,
    pub(crate) generation: u32,
}

impl PeerHandle {
    /// The peer's slot index on this host
    pub fn index(&self) -> u16 {
        self.index
    }
}

/// Something that happened on a host since the last service call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection completed, either one we initiated or one a remote host
    /// requested. `data` is the value the remote passed to its connect call,
    /// or zero for connections we initiated.
    Connect { peer: PeerHandle, data: u32 },

    /// A connection ended: the remote disconnected, a local disconnect
    /// completed, or the peer timed out (`data` is zero for timeouts).
    /// The handle is no longer usable once this event is returned.
    Disconnect { peer: PeerHandle, data: u32 },

    /// A packet arrived on `channel_id`
    Receive {
        peer: PeerHandle,
        channel_id: u8,
        packet: Packet,
    },
}

impl Event {
    /// The peer this event concerns
    pub fn peer(&self) -> PeerHandle {
        match self {
            Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::Receive { peer, .. } => *peer,
        }
    }
}
