//! Protocol-layer tests exercising the core crate through its public API

use bytes::{Bytes, BytesMut};
use rudp_protocol::channel::{Channel, ReceiveOutcome};
use rudp_protocol::compress::{Compressor, RangeCoder};
use rudp_protocol::wire::{
    decode_commands, encode_datagram, Command, FragmentInfo, ProtocolCommand, ProtocolHeader,
    PROTOCOL_HEADER_SIZE,
};
use rudp_protocol::{PacketFlags, ReliabilityTracker, SendWindow, SeqNumber};

fn reliable(channel: u8, seq: u16, payload: &'static [u8]) -> ProtocolCommand {
    ProtocolCommand {
        channel_id: channel,
        reliable_seq: SeqNumber::new(seq),
        wants_ack: true,
        command: Command::SendReliable {
            payload: Bytes::from_static(payload),
        },
    }
}

#[test]
fn test_mixed_datagram_roundtrip() {
    let header = ProtocolHeader {
        peer_id: 12,
        compressed: false,
        sent_time: 0xBEEF,
    };
    let commands = vec![
        ProtocolCommand {
            channel_id: 0,
            reliable_seq: SeqNumber::ZERO,
            wants_ack: false,
            command: Command::Acknowledge {
                received_seq: SeqNumber::new(9),
                received_time: 0x1111,
            },
        },
        reliable(0, 10, b"first"),
        ProtocolCommand {
            channel_id: 1,
            reliable_seq: SeqNumber::ZERO,
            wants_ack: false,
            command: Command::SendUnsequenced {
                group: 3,
                payload: Bytes::from_static(b"second"),
            },
        },
    ];

    let datagram = encode_datagram(header, &commands).freeze();
    let parsed_header = ProtocolHeader::from_bytes(&datagram).unwrap();
    assert_eq!(parsed_header, header);

    let parsed = decode_commands(datagram.slice(PROTOCOL_HEADER_SIZE..)).unwrap();
    assert_eq!(parsed, commands);
}

#[test]
fn test_channel_reorders_across_fragment_groups() {
    let mut channel = Channel::new();

    // A whole packet, then a two-slice group, arriving back to front
    let make_frag = |index: u16, offset: u32, data: &'static [u8]| FragmentInfo {
        start_seq: SeqNumber::new(2),
        index,
        count: 2,
        total_length: 8,
        offset,
        payload: Bytes::from_static(data),
    };

    assert_eq!(
        channel.receive_fragment(SeqNumber::new(3), make_frag(1, 4, b"tail")),
        ReceiveOutcome::Accepted
    );
    assert_eq!(
        channel.receive_fragment(SeqNumber::new(2), make_frag(0, 0, b"head")),
        ReceiveOutcome::Accepted
    );
    assert_eq!(channel.ready_count(), 0);

    assert_eq!(
        channel.receive_reliable(SeqNumber::new(1), Bytes::from_static(b"solo")),
        ReceiveOutcome::Accepted
    );

    let first = channel.pop_ready().unwrap();
    assert_eq!(first.payload, &b"solo"[..]);
    let second = channel.pop_ready().unwrap();
    assert_eq!(second.payload, &b"headtail"[..]);
    assert!(second.flags.contains(PacketFlags::RELIABLE));
}

#[test]
fn test_tracker_and_window_flow() {
    let mut tracker = ReliabilityTracker::new();
    let mut window = SendWindow::new(64);

    for seq in 1..=3u16 {
        tracker.on_send(reliable(0, seq, b"data"), 0);
        window.on_send();
    }
    assert_eq!(tracker.in_flight(), 3);
    assert_eq!(window.in_flight(), 3);

    assert!(tracker.acknowledge(0, SeqNumber::new(1), 0, 20));
    assert!(tracker.acknowledge(0, SeqNumber::new(2), 0, 22));
    window.on_ack(2);
    assert_eq!(tracker.in_flight(), 1);

    // The unacked command comes due (its timeout was fixed at send time)
    // and the window backs off
    let due = tracker.collect_due(10_000);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].reliable_seq, SeqNumber::new(3));

    let before = window.window();
    window.on_retransmit(10_000);
    assert!(window.window() < before);
}

#[test]
fn test_range_coder_on_command_section() {
    // Compress an actual encoded command section, the way a host would
    let commands: Vec<ProtocolCommand> = (1..=4)
        .map(|seq| reliable(0, seq, b"the same text repeats in every command payload"))
        .collect();
    let header = ProtocolHeader {
        peer_id: 1,
        compressed: false,
        sent_time: 0,
    };
    let datagram = encode_datagram(header, &commands).freeze();
    let section = datagram.slice(PROTOCOL_HEADER_SIZE..);

    let mut coder = RangeCoder::new();
    let coded = coder.compress(&section).expect("repetitive section should shrink");
    assert!(coded.len() < section.len());

    let restored = coder.decompress(&coded, section.len()).unwrap();
    assert_eq!(&restored[..], &section[..]);

    let reparsed = decode_commands(Bytes::from(restored)).unwrap();
    assert_eq!(reparsed, commands);
}

#[test]
fn test_truncated_datagram_rejected() {
    let datagram = encode_datagram(
        ProtocolHeader {
            peer_id: 0,
            compressed: false,
            sent_time: 0,
        },
        &[reliable(0, 1, b"payload")],
    );

    // Chop the payload short of its declared length
    let mut truncated = BytesMut::from(&datagram[..datagram.len() - 3]);
    let section = truncated.split_off(PROTOCOL_HEADER_SIZE).freeze();
    assert!(decode_commands(section).is_err());
}
