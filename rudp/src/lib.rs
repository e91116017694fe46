//! Reliable UDP Transport Engine
//!
//! A connection-oriented transport layered over UDP: hosts exchange
//! datagrams carrying batched protocol commands, peers negotiate channels at
//! connect time, and each channel delivers packets reliably in order,
//! unreliably in sequence, or unsequenced with duplicate suppression.
//! Everything runs single-threaded through [`Host::service`]; the engine
//! never spawns threads of its own.
//!
//! ```no_run
//! use rudp::{Address, Event, Host, HostConfig, Packet};
//!
//! rudp::initialize();
//! let mut client = Host::new(HostConfig::default())?;
//! let server_addr = Address::resolve("localhost", 7777)?;
//! let peer = client.connect(server_addr, 2, 0)?;
//!
//! loop {
//!     match client.service(10)? {
//!         Some(Event::Connect { peer, .. }) => {
//!             client.peer_mut(peer)?.send(0, Packet::reliable(b"hello"))?;
//!         }
//!         Some(Event::Receive { packet, .. }) => {
//!             println!("got {} bytes", packet.len());
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok::<(), rudp::Error>(())
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use rudp_io::SocketError;
use thiserror::Error;

mod address;
mod event;
mod host;
mod peer;

pub use address::Address;
pub use event::{Event, PeerHandle};
pub use host::{Host, HostConfig};
pub use peer::{Peer, PeerState};
pub use rudp_protocol::{Packet, PacketFlags};

/// Engine errors surfaced through the public API
#[derive(Error, Debug)]
pub enum Error {
    #[error("not ready: initialize the engine first, and enable host features before any traffic")]
    NotReady,

    #[error("failed to bind socket: {0}")]
    BindFailed(#[source] SocketError),

    #[error("peer table size out of range")]
    ResourceExhausted,

    #[error("no free peer slot available")]
    NoFreeSlot,

    #[error("channel id out of range for this connection")]
    ChannelOutOfRange,

    #[error("peer is not connected")]
    PeerNotConnected,

    #[error("hostname resolution failed: {0}")]
    Resolution(String),

    #[error("packet exceeds the maximum fragmentable size")]
    PacketTooLarge,

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Initialize the engine
///
/// Must be called before any host is created. Calls nest; each one must be
/// balanced by a [`deinitialize`].
pub fn initialize() {
    INIT_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Release one [`initialize`] call
pub fn deinitialize() {
    let _ = INIT_COUNT.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
        count.checked_sub(1)
    });
}

pub(crate) fn is_initialized() -> bool {
    INIT_COUNT.load(Ordering::SeqCst) > 0
}

/// Version of the engine this binary was built against
pub fn linked_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linked_version_is_semver() {
        let version = linked_version();
        assert_eq!(version.split('.').count(), 3);
    }

    // The counter is process-global and other tests may hold references, so
    // only net-zero sequences are safe to assert on here
    #[test]
    fn test_initialize_nests() {
        initialize();
        initialize();
        deinitialize();
        assert!(is_initialized());
        deinitialize();
    }
}
