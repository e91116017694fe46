//! Application-facing packet type
//!
//! A `Packet` owns its payload and a set of delivery-mode flags. The payload
//! is copied into engine-owned storage at creation so the caller's buffer may
//! be reused immediately; the `NO_ALLOCATE` path wraps a caller-supplied
//! `Bytes` without copying.

use bytes::Bytes;
use std::fmt;

/// Delivery-mode flag set for a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(u32);

impl PacketFlags {
    /// The packet must be received by the target peer; resend attempts are
    /// made until it is acknowledged.
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);

    /// The packet bypasses ordering and is delivered as soon as it arrives.
    /// Not supported together with RELIABLE.
    pub const UNSEQUENCED: PacketFlags = PacketFlags(1 << 1);

    /// The caller retains ownership of the buffer; the engine wraps it
    /// without copying.
    pub const NO_ALLOCATE: PacketFlags = PacketFlags(1 << 2);

    /// A packet larger than the MTU is fragmented with unreliable sends
    /// instead of being promoted to reliable fragments.
    pub const UNRELIABLE_FRAGMENT: PacketFlags = PacketFlags(1 << 3);

    /// Set by the engine once the packet has left all send queues.
    pub const SENT: PacketFlags = PacketFlags(1 << 8);

    const KNOWN: u32 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 8);

    /// The empty flag set
    pub fn empty() -> Self {
        PacketFlags(0)
    }

    /// Check whether all flags in `other` are set
    #[inline]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`
    #[inline]
    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    /// Convert to raw bit representation
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Parse from raw bits, discarding unknown bits
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        PacketFlags(bits & Self::KNOWN)
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// A payload plus delivery-mode flags, immutable once submitted for sending
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    flags: PacketFlags,
}

impl Packet {
    /// Create a packet, copying the payload into engine-owned storage
    pub fn new(data: &[u8], flags: PacketFlags) -> Self {
        Packet {
            data: Bytes::copy_from_slice(data),
            flags,
        }
    }

    /// Create a packet from a caller-owned buffer without copying
    ///
    /// Sets the NO_ALLOCATE flag; the `Bytes` handle is shared, never cloned
    /// into fresh storage.
    pub fn from_bytes(data: Bytes, flags: PacketFlags) -> Self {
        Packet {
            data,
            flags: flags | PacketFlags::NO_ALLOCATE,
        }
    }

    /// Create a reliable packet
    pub fn reliable(data: &[u8]) -> Self {
        Packet::new(data, PacketFlags::RELIABLE)
    }

    /// Create an unreliable, sequenced packet
    pub fn unreliable(data: &[u8]) -> Self {
        Packet::new(data, PacketFlags::empty())
    }

    /// Create an unsequenced packet
    pub fn unsequenced(data: &[u8]) -> Self {
        Packet::new(data, PacketFlags::UNSEQUENCED)
    }

    /// Get the payload
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the payload out of the packet
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Get a shared handle to the payload
    pub fn payload(&self) -> Bytes {
        self.data.clone()
    }

    /// Get the flag set
    #[inline]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Mark the packet as having left all send queues
    pub fn mark_sent(&mut self) {
        self.flags.insert(PacketFlags::SENT);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}
