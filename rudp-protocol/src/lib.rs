//! Protocol Core for the Reliable UDP Engine
//!
//! This crate implements the session-less pieces of the protocol: the wire
//! format, sequence number arithmetic, per-channel ordering and fragment
//! reassembly, retransmission tracking with round-trip estimation, the send
//! window, and optional datagram compression. Host and peer orchestration
//! live one crate up.

pub mod channel;
pub mod compress;
pub mod packet;
pub mod reliability;
pub mod sequence;
pub mod throttle;
pub mod wire;

pub use channel::{Channel, Delivery, ReceiveOutcome, UnsequencedWindow};
pub use compress::{Compressor, RangeCoder};
pub use packet::{Packet, PacketFlags};
pub use reliability::{ReliabilityTracker, RttEstimator};
pub use sequence::SeqNumber;
pub use throttle::SendWindow;
pub use wire::{
    Command, CommandKind, FragmentInfo, ProtocolCommand, ProtocolHeader, WireError,
};
