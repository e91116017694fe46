//! Retransmission tracking and round-trip estimation
//!
//! Every command sent with the acknowledgment bit set is held here until the
//! matching acknowledgment arrives. Commands past their retransmission
//! timeout are handed back for resending with an exponentially growing
//! timeout; a command that exhausts its attempts marks the connection as
//! failed.
//!
//! Timestamps are milliseconds from the host clock and wrap at `u32::MAX`.

use crate::sequence::SeqNumber;
use crate::wire::ProtocolCommand;
use std::collections::HashMap;
use tracing::trace;

/// Resend attempts before the connection is declared lost
pub const MAX_SEND_ATTEMPTS: u8 = 8;

/// Floor for the retransmission timeout in milliseconds
pub const MIN_RTO: u32 = 100;

/// Ceiling for the retransmission timeout in milliseconds
pub const MAX_RTO: u32 = 5_000;

/// Smoothed round-trip estimator (RFC 6298 style)
///
/// `srtt` is an exponentially weighted average of samples with gain 1/8;
/// `rttvar` tracks mean deviation with gain 1/4. The retransmission timeout
/// is `srtt + 4 * rttvar`, clamped to sane bounds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: u32,
    rttvar: u32,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: 500,
            rttvar: 250,
            has_sample: false,
        }
    }

    /// Feed a round-trip sample in milliseconds
    pub fn add_sample(&mut self, sample_ms: u32) {
        if !self.has_sample {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2;
            self.has_sample = true;
            return;
        }

        let deviation = self.srtt.abs_diff(sample_ms);
        self.rttvar = ((self.rttvar as i64)
            + (deviation as i64 - self.rttvar as i64).div_euclid(4))
        .max(0) as u32;
        self.srtt = ((self.srtt as i64) + (sample_ms as i64 - self.srtt as i64).div_euclid(8))
            .max(1) as u32;
    }

    /// Current smoothed round-trip time in milliseconds
    pub fn round_trip_time(&self) -> u32 {
        self.srtt
    }

    /// Current round-trip variance in milliseconds
    pub fn variance(&self) -> u32 {
        self.rttvar
    }

    /// Retransmission timeout derived from the current estimate
    pub fn rto(&self) -> u32 {
        (self.srtt + 4 * self.rttvar).clamp(MIN_RTO, MAX_RTO)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

struct Outstanding {
    command: ProtocolCommand,
    sent_at: u32,
    rto: u32,
    attempts: u8,
}

/// In-flight reliable commands awaiting acknowledgment, keyed by
/// (channel id, reliable sequence number)
pub struct ReliabilityTracker {
    outstanding: HashMap<(u8, SeqNumber), Outstanding>,
    rtt: RttEstimator,
}

impl ReliabilityTracker {
    pub fn new() -> Self {
        ReliabilityTracker {
            outstanding: HashMap::new(),
            rtt: RttEstimator::new(),
        }
    }

    /// Record a command that was just sent and must be acknowledged
    pub fn on_send(&mut self, command: ProtocolCommand, now_ms: u32) {
        let key = (command.channel_id, command.reliable_seq);
        let rto = self.rtt.rto();
        self.outstanding.insert(
            key,
            Outstanding {
                command,
                sent_at: now_ms,
                rto,
                attempts: 1,
            },
        );
    }

    /// Process an acknowledgment for (channel, sequence)
    ///
    /// `received_time` is the low 16 bits of our send timestamp echoed back
    /// by the remote; a round-trip sample is taken from it only for commands
    /// never retransmitted, so inflated samples from retries are excluded.
    /// Returns true when the acknowledgment matched an in-flight command.
    pub fn acknowledge(
        &mut self,
        channel_id: u8,
        seq: SeqNumber,
        received_time: u16,
        now_ms: u32,
    ) -> bool {
        match self.outstanding.remove(&(channel_id, seq)) {
            Some(entry) => {
                if entry.attempts == 1 {
                    let sample = (now_ms as u16).wrapping_sub(received_time) as u32;
                    self.rtt.add_sample(sample);
                }
                true
            }
            None => false,
        }
    }

    /// Collect commands whose retransmission timeout has elapsed
    ///
    /// Each returned command has its attempt count bumped and its timeout
    /// doubled. Commands that already burned through every attempt are left
    /// in place; `has_failed` reports them.
    pub fn collect_due(&mut self, now_ms: u32) -> Vec<ProtocolCommand> {
        let mut due = Vec::new();
        for entry in self.outstanding.values_mut() {
            if entry.attempts >= MAX_SEND_ATTEMPTS {
                continue;
            }
            if now_ms.wrapping_sub(entry.sent_at) >= entry.rto {
                entry.attempts += 1;
                entry.sent_at = now_ms;
                entry.rto = (entry.rto * 2).min(MAX_RTO);
                trace!(
                    channel = entry.command.channel_id,
                    seq = %entry.command.reliable_seq,
                    attempts = entry.attempts,
                    "retransmitting"
                );
                due.push(entry.command.clone());
            }
        }
        due
    }

    /// Check whether any command has exhausted its send attempts and is
    /// past its final timeout
    pub fn has_failed(&self, now_ms: u32) -> bool {
        self.outstanding.values().any(|entry| {
            entry.attempts >= MAX_SEND_ATTEMPTS
                && now_ms.wrapping_sub(entry.sent_at) >= entry.rto
        })
    }

    /// Number of commands still awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Drop all in-flight state, used when a peer is torn down
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }
}

impl Default for ReliabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Command;
    use bytes::Bytes;

    fn reliable_command(channel: u8, seq: u16) -> ProtocolCommand {
        ProtocolCommand {
            channel_id: channel,
            reliable_seq: SeqNumber::new(seq),
            wants_ack: true,
            command: Command::SendReliable {
                payload: Bytes::from_static(b"data"),
            },
        }
    }

    #[test]
    fn test_rtt_first_sample_seeds_estimate() {
        let mut rtt = RttEstimator::new();
        rtt.add_sample(80);
        assert_eq!(rtt.round_trip_time(), 80);
        assert_eq!(rtt.variance(), 40);
    }

    #[test]
    fn test_rtt_smooths_toward_samples() {
        let mut rtt = RttEstimator::new();
        rtt.add_sample(100);
        for _ in 0..50 {
            rtt.add_sample(20);
        }
        assert!(rtt.round_trip_time() < 30);
    }

    #[test]
    fn test_rto_clamped() {
        let mut rtt = RttEstimator::new();
        rtt.add_sample(1);
        for _ in 0..20 {
            rtt.add_sample(1);
        }
        assert_eq!(rtt.rto(), MIN_RTO);
    }

    #[test]
    fn test_ack_removes_in_flight() {
        let mut tracker = ReliabilityTracker::new();
        tracker.on_send(reliable_command(0, 1), 1_000);
        assert_eq!(tracker.in_flight(), 1);

        assert!(tracker.acknowledge(0, SeqNumber::new(1), 1_000u16, 1_050));
        assert_eq!(tracker.in_flight(), 0);

        // Second ack for the same command finds nothing
        assert!(!tracker.acknowledge(0, SeqNumber::new(1), 1_000u16, 1_060));
    }

    #[test]
    fn test_ack_takes_rtt_sample() {
        let mut tracker = ReliabilityTracker::new();
        tracker.on_send(reliable_command(0, 1), 1_000);
        tracker.acknowledge(0, SeqNumber::new(1), 1_000u16, 1_080);
        assert_eq!(tracker.rtt().round_trip_time(), 80);
    }

    #[test]
    fn test_retransmit_after_timeout() {
        let mut tracker = ReliabilityTracker::new();
        tracker.on_send(reliable_command(0, 1), 0);
        let rto = tracker.rtt().rto();

        assert!(tracker.collect_due(rto - 1).is_empty());
        let due = tracker.collect_due(rto);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reliable_seq, SeqNumber::new(1));

        // Timeout doubles; not due again immediately
        assert!(tracker.collect_due(rto + 1).is_empty());
    }

    #[test]
    fn test_no_rtt_sample_for_retransmitted() {
        let mut tracker = ReliabilityTracker::new();
        tracker.on_send(reliable_command(0, 1), 0);
        let rto = tracker.rtt().rto();
        tracker.collect_due(rto);

        let before = tracker.rtt().round_trip_time();
        tracker.acknowledge(0, SeqNumber::new(1), 0u16, rto + 10);
        assert_eq!(tracker.rtt().round_trip_time(), before);
    }

    #[test]
    fn test_failure_after_exhausted_attempts() {
        let mut tracker = ReliabilityTracker::new();
        tracker.on_send(reliable_command(0, 1), 0);

        let mut now = 0u32;
        for _ in 1..MAX_SEND_ATTEMPTS {
            now = now.wrapping_add(MAX_RTO);
            assert_eq!(tracker.collect_due(now).len(), 1);
        }

        // Attempts exhausted; nothing more to retransmit
        assert!(tracker.collect_due(now.wrapping_add(MAX_RTO)).is_empty());
        assert!(!tracker.has_failed(now));
        assert!(tracker.has_failed(now.wrapping_add(MAX_RTO)));
    }
}
