//! Property tests for sequence arithmetic and wire encoding

use bytes::BytesMut;
use proptest::prelude::*;
use rudp_protocol::wire::{Command, ProtocolCommand};
use rudp_protocol::{SeqNumber, UnsequencedWindow};

proptest! {
    #[test]
    fn prop_distance_antisymmetric(a in any::<u16>(), b in any::<u16>()) {
        let sa = SeqNumber::new(a);
        let sb = SeqNumber::new(b);
        let forward = sa.distance_to(sb);
        // The half-space boundary maps to itself under negation
        prop_assume!(forward != i16::MIN as i32);
        prop_assert_eq!(forward, -sb.distance_to(sa));
    }

    #[test]
    fn prop_ordering_exclusive(a in any::<u16>(), b in any::<u16>()) {
        let sa = SeqNumber::new(a);
        let sb = SeqNumber::new(b);
        prop_assume!(sa.distance_to(sb) != i16::MIN as i32);
        if a == b {
            prop_assert!(!sa.lt(sb) && !sa.gt(sb));
        } else {
            prop_assert_ne!(sa.lt(sb), sa.gt(sb));
        }
    }

    #[test]
    fn prop_add_preserves_distance(base in any::<u16>(), step in 0u16..0x7FFF) {
        let start = SeqNumber::new(base);
        let end = start + step;
        prop_assert_eq!(start.distance_to(end), step as i32);
    }

    #[test]
    fn prop_increment_advances_by_one(value in any::<u16>()) {
        let seq = SeqNumber::new(value);
        prop_assert_eq!(seq.distance_to(seq.next()), 1);
    }

    #[test]
    fn prop_unsequenced_never_delivers_twice(groups in proptest::collection::vec(any::<u16>(), 1..64)) {
        let mut window = UnsequencedWindow::new();
        let mut delivered = std::collections::HashSet::new();
        for group in groups {
            if window.receive(group) {
                // A delivery must be the first sighting of that group
                prop_assert!(delivered.insert(group));
            }
        }
    }

    #[test]
    fn prop_reliable_command_roundtrip(
        channel in any::<u8>(),
        seq in any::<u16>(),
        payload in proptest::collection::vec(any::<u8>(), 0..1200),
    ) {
        let command = ProtocolCommand {
            channel_id: channel,
            reliable_seq: SeqNumber::new(seq),
            wants_ack: true,
            command: Command::SendReliable { payload: payload.into() },
        };

        let mut buf = BytesMut::new();
        command.to_bytes(&mut buf);
        prop_assert_eq!(buf.len(), command.encoded_len());

        let mut bytes = buf.freeze();
        let decoded = ProtocolCommand::from_bytes(&mut bytes).unwrap();
        prop_assert_eq!(decoded, command);
    }
}
