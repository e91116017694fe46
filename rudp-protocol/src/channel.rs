//! Per-channel ordering, reorder buffering, and fragment reassembly
//!
//! Each channel keeps independent outgoing and incoming sequence state. The
//! incoming side is a circular window indexed by sequence number: commands
//! arriving out of order wait in their slot until the sequence becomes
//! contiguous, and fragment groups are reassembled once every slice of the
//! group is present. Completed payloads move to a ready queue drained by the
//! host.

use crate::packet::PacketFlags;
use crate::sequence::SeqNumber;
use crate::wire::FragmentInfo;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::trace;

/// Reorder window size in sequence slots (power of 2)
pub const WINDOW_SIZE: usize = 1024;

/// Unsequenced dedupe window size in groups (power of 2)
pub const UNSEQUENCED_WINDOW_SIZE: u16 = 1024;

/// Ceiling on a reassembled payload, guarding against hostile fragment
/// headers declaring absurd totals
const MAX_TOTAL_LENGTH: u32 = 16 * 1024 * 1024;

/// Concurrent unreliable fragment groups kept per channel before the oldest
/// is discarded
const MAX_PARTIAL_UNRELIABLE: usize = 8;

/// Outcome of offering a reliable command to the incoming window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Stored (or delivered); the sender must be acknowledged
    Accepted,
    /// Already seen or stale; acknowledge again so the sender stops
    /// retransmitting, but do not store
    Duplicate,
    /// Too far ahead of the window; drop without acknowledgment so the
    /// sender retries once the window has advanced
    Overflow,
}

/// A payload that became deliverable, with the flags describing how it
/// travelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    pub flags: PacketFlags,
}

enum IncomingEntry {
    Whole(Bytes),
    Fragment(FragmentInfo),
}

struct PartialUnreliable {
    group: SeqNumber,
    count: u16,
    total_length: u32,
    received: u16,
    parts: Vec<Option<Bytes>>,
}

/// Ordering and reassembly state for one (peer, channel id) lane
pub struct Channel {
    outgoing_reliable_seq: SeqNumber,
    outgoing_unreliable_seq: SeqNumber,
    outgoing_fragment_group: SeqNumber,
    /// Next reliable sequence number expected for delivery
    incoming_reliable_seq: SeqNumber,
    /// Highest unreliable sequence number delivered so far
    incoming_unreliable_seq: SeqNumber,
    window: Vec<Option<IncomingEntry>>,
    partial_unreliable: VecDeque<PartialUnreliable>,
    ready: VecDeque<Delivery>,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            outgoing_reliable_seq: SeqNumber::ZERO,
            outgoing_unreliable_seq: SeqNumber::ZERO,
            outgoing_fragment_group: SeqNumber::ZERO,
            incoming_reliable_seq: SeqNumber::new(1),
            incoming_unreliable_seq: SeqNumber::ZERO,
            window: (0..WINDOW_SIZE).map(|_| None).collect(),
            partial_unreliable: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    /// Assign the next outgoing reliable sequence number
    pub fn next_reliable_seq(&mut self) -> SeqNumber {
        self.outgoing_reliable_seq.increment();
        self.outgoing_reliable_seq
    }

    /// Assign the next outgoing unreliable sequence number
    pub fn next_unreliable_seq(&mut self) -> SeqNumber {
        self.outgoing_unreliable_seq.increment();
        self.outgoing_unreliable_seq
    }

    /// Assign a group id for an unreliable fragment burst
    pub fn next_fragment_group(&mut self) -> SeqNumber {
        self.outgoing_fragment_group.increment();
        self.outgoing_fragment_group
    }

    #[inline]
    fn slot(seq: SeqNumber) -> usize {
        seq.as_raw() as usize & (WINDOW_SIZE - 1)
    }

    /// Offer a whole reliable payload to the incoming window
    pub fn receive_reliable(&mut self, seq: SeqNumber, payload: Bytes) -> ReceiveOutcome {
        self.receive_entry(seq, IncomingEntry::Whole(payload))
    }

    /// Offer a reliable fragment to the incoming window
    pub fn receive_fragment(&mut self, seq: SeqNumber, fragment: FragmentInfo) -> ReceiveOutcome {
        if !fragment_plausible(&fragment) || fragment.start_seq + fragment.index != seq {
            trace!(seq = %seq, "dropping malformed fragment");
            return ReceiveOutcome::Duplicate;
        }
        self.receive_entry(seq, IncomingEntry::Fragment(fragment))
    }

    fn receive_entry(&mut self, seq: SeqNumber, entry: IncomingEntry) -> ReceiveOutcome {
        if seq.lt(self.incoming_reliable_seq) {
            return ReceiveOutcome::Duplicate;
        }
        let distance = self.incoming_reliable_seq.distance_to(seq);
        if distance >= WINDOW_SIZE as i32 {
            return ReceiveOutcome::Overflow;
        }

        let idx = Self::slot(seq);
        if self.window[idx].is_some() {
            return ReceiveOutcome::Duplicate;
        }
        self.window[idx] = Some(entry);
        self.deliver_contiguous();
        ReceiveOutcome::Accepted
    }

    /// Deliver everything contiguous from the head of the window
    fn deliver_contiguous(&mut self) {
        loop {
            let idx = Self::slot(self.incoming_reliable_seq);
            match &self.window[idx] {
                None => break,
                Some(IncomingEntry::Whole(_)) => {
                    if let Some(IncomingEntry::Whole(payload)) = self.window[idx].take() {
                        self.ready.push_back(Delivery {
                            payload,
                            flags: PacketFlags::RELIABLE,
                        });
                    }
                    self.incoming_reliable_seq.increment();
                }
                Some(IncomingEntry::Fragment(_)) => {
                    if !self.try_assemble_at_head() {
                        break;
                    }
                }
            }
        }
    }

    /// Attempt to reassemble the fragment group whose slice sits at the head
    /// of the window; returns false when slices are still missing
    fn try_assemble_at_head(&mut self) -> bool {
        let head = self.incoming_reliable_seq;
        let (start_seq, count, total_length) = match &self.window[Self::slot(head)] {
            Some(IncomingEntry::Fragment(frag)) => {
                (frag.start_seq, frag.count, frag.total_length)
            }
            _ => return false,
        };

        // The head slice must open its group, otherwise an earlier slice was
        // lost past recovery; discard and move on rather than stall the lane.
        if start_seq != head {
            trace!(head = %head, start = %start_seq, "discarding orphaned fragment slice");
            self.window[Self::slot(head)] = None;
            self.incoming_reliable_seq.increment();
            return true;
        }

        for i in 0..count {
            match &self.window[Self::slot(start_seq + i)] {
                Some(IncomingEntry::Fragment(frag))
                    if frag.start_seq == start_seq && frag.index == i => {}
                _ => return false,
            }
        }

        let mut assembled = BytesMut::with_capacity(total_length as usize);
        assembled.resize(total_length as usize, 0);
        for i in 0..count {
            let idx = Self::slot(start_seq + i);
            if let Some(IncomingEntry::Fragment(frag)) = self.window[idx].take() {
                let offset = frag.offset as usize;
                let end = offset.saturating_add(frag.payload.len());
                if end <= assembled.len() {
                    assembled[offset..end].copy_from_slice(&frag.payload);
                }
            }
        }

        self.incoming_reliable_seq = start_seq + count;
        self.ready.push_back(Delivery {
            payload: assembled.freeze(),
            flags: PacketFlags::RELIABLE,
        });
        true
    }

    /// Offer an unreliable sequenced payload; stale sequences are dropped
    pub fn receive_unreliable(&mut self, seq: SeqNumber, payload: Bytes) {
        if seq.le(self.incoming_unreliable_seq) {
            trace!(seq = %seq, "dropping stale unreliable payload");
            return;
        }
        self.incoming_unreliable_seq = seq;
        self.ready.push_back(Delivery {
            payload,
            flags: PacketFlags::empty(),
        });
    }

    /// Offer one slice of an unreliable fragment group; delivers once the
    /// group completes, and sheds the oldest partial group under pressure
    pub fn receive_unreliable_fragment(&mut self, fragment: FragmentInfo) {
        if !fragment_plausible(&fragment) {
            return;
        }

        let group = fragment.start_seq;
        let position = match self
            .partial_unreliable
            .iter()
            .position(|partial| partial.group == group)
        {
            Some(position) => position,
            None => {
                if self.partial_unreliable.len() >= MAX_PARTIAL_UNRELIABLE {
                    self.partial_unreliable.pop_front();
                }
                self.partial_unreliable.push_back(PartialUnreliable {
                    group,
                    count: fragment.count,
                    total_length: fragment.total_length,
                    received: 0,
                    parts: (0..fragment.count).map(|_| None).collect(),
                });
                self.partial_unreliable.len() - 1
            }
        };

        let partial = &mut self.partial_unreliable[position];
        if partial.count != fragment.count
            || partial.total_length != fragment.total_length
            || fragment.index >= partial.count
        {
            return;
        }

        let index = fragment.index as usize;
        if partial.parts[index].is_none() {
            partial.parts[index] = Some(fragment.payload);
            partial.received += 1;
        }

        if partial.received == partial.count {
            let partial = self.partial_unreliable.remove(position).unwrap();
            let mut assembled = BytesMut::with_capacity(partial.total_length as usize);
            for part in partial.parts.into_iter().flatten() {
                assembled.extend_from_slice(&part);
            }
            self.ready.push_back(Delivery {
                payload: assembled.freeze(),
                flags: PacketFlags::UNRELIABLE_FRAGMENT,
            });
        }
    }

    /// Pop the next deliverable payload
    pub fn pop_ready(&mut self) -> Option<Delivery> {
        self.ready.pop_front()
    }

    /// Number of deliverable payloads waiting
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

fn fragment_plausible(fragment: &FragmentInfo) -> bool {
    fragment.count > 0
        && (fragment.count as usize) <= crate::wire::MAX_FRAGMENT_COUNT
        && fragment.index < fragment.count
        && fragment.total_length <= MAX_TOTAL_LENGTH
        && fragment.offset <= fragment.total_length
}

/// Sliding dedupe window for unsequenced groups
///
/// Tracks which groups inside the current window have already been seen.
/// Advancing past the window discards the old bitmask, so a very late
/// duplicate from a previous window may be re-delivered; that is the
/// at-most-once tradeoff for unsequenced traffic.
pub struct UnsequencedWindow {
    base: u16,
    bits: [u32; UNSEQUENCED_WINDOW_SIZE as usize / 32],
}

impl UnsequencedWindow {
    pub fn new() -> Self {
        UnsequencedWindow {
            base: 0,
            bits: [0; UNSEQUENCED_WINDOW_SIZE as usize / 32],
        }
    }

    /// Record a group arrival; returns true when the payload should be
    /// delivered, false for duplicates and stale groups
    pub fn receive(&mut self, group: u16) -> bool {
        let delta = group.wrapping_sub(self.base) as i16 as i32;
        if delta < 0 {
            return false;
        }

        let aligned = group.wrapping_sub(group % UNSEQUENCED_WINDOW_SIZE);
        if aligned != self.base {
            self.base = aligned;
            self.bits = [0; UNSEQUENCED_WINDOW_SIZE as usize / 32];
        }

        let index = (group % UNSEQUENCED_WINDOW_SIZE) as usize;
        let (word, bit) = (index / 32, index % 32);
        if self.bits[word] & (1 << bit) != 0 {
            return false;
        }
        self.bits[word] |= 1 << bit;
        true
    }
}

impl Default for UnsequencedWindow {
    fn default() -> Self {
        Self::new()
    }
}
