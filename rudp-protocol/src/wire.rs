//! Wire format: datagram header and command serialization
//!
//! Every datagram carries a 4-byte protocol header followed by one or more
//! commands. A command is a 4-byte command header (type byte with a
//! wants-acknowledge flag, channel id, reliable sequence number) plus a
//! type-specific body. All integers are network byte order.

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the per-datagram protocol header in bytes
pub const PROTOCOL_HEADER_SIZE: usize = 4;

/// Size of the per-command header in bytes
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Peer id placed in the header of connection-request datagrams, before the
/// receiver has assigned a slot
pub const PEER_ID_NONE: u16 = 0x7FFF;

/// Largest assignable peer id (15-bit; bit 15 of the header field is the
/// compressed flag)
pub const MAX_PEER_ID: u16 = 0x7FFE;

/// Channel id reserved for connection-level commands (connect, disconnect,
/// ping, and their acknowledgments)
pub const CONTROL_CHANNEL: u8 = 0xFF;

/// Default path MTU assumed for fragmentation decisions
pub const DEFAULT_MTU: usize = 1400;

/// Upper bound on fragments per packet; bounded by the reorder window so a
/// whole fragment group fits in the receiving channel
pub const MAX_FRAGMENT_COUNT: usize = 512;

const COMPRESSED_FLAG: u16 = 0x8000;
const WANTS_ACK_FLAG: u8 = 0x80;
const COMMAND_MASK: u8 = 0x7F;

/// Wire parsing and validation errors
#[derive(Error, Debug)]
pub enum WireError {
    #[error("truncated datagram: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown command type: {0:#x}")]
    UnknownCommand(u8),

    #[error("declared payload length {declared} exceeds remaining {remaining} bytes")]
    BadLength { declared: usize, remaining: usize },
}

/// Per-datagram protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Receiver's peer slot id, or PEER_ID_NONE for connection requests
    pub peer_id: u16,
    /// Whether the command section is range-coded
    pub compressed: bool,
    /// Low 16 bits of the sender's millisecond clock, echoed in
    /// acknowledgments for RTT measurement
    pub sent_time: u16,
}

impl ProtocolHeader {
    /// Serialize the header (network byte order)
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        let mut id = self.peer_id & !COMPRESSED_FLAG;
        if self.compressed {
            id |= COMPRESSED_FLAG;
        }
        buf.put_u16(id);
        buf.put_u16(self.sent_time);
    }

    /// Parse the header from the start of a datagram
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PROTOCOL_HEADER_SIZE {
            return Err(WireError::Truncated {
                expected: PROTOCOL_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..PROTOCOL_HEADER_SIZE];
        let raw = buf.get_u16();
        Ok(ProtocolHeader {
            peer_id: raw & !COMPRESSED_FLAG,
            compressed: raw & COMPRESSED_FLAG != 0,
            sent_time: buf.get_u16(),
        })
    }
}

/// Command type discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendUnsequenced = 8,
    SendFragment = 9,
    SendUnreliableFragment = 10,
    BandwidthLimit = 11,
}

impl CommandKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CommandKind::Acknowledge),
            2 => Some(CommandKind::Connect),
            3 => Some(CommandKind::VerifyConnect),
            4 => Some(CommandKind::Disconnect),
            5 => Some(CommandKind::Ping),
            6 => Some(CommandKind::SendReliable),
            7 => Some(CommandKind::SendUnreliable),
            8 => Some(CommandKind::SendUnsequenced),
            9 => Some(CommandKind::SendFragment),
            10 => Some(CommandKind::SendUnreliableFragment),
            11 => Some(CommandKind::BandwidthLimit),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One slice of a fragmented packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Sequence number of fragment index 0, identifying the group
    pub start_seq: SeqNumber,
    /// Index of this fragment within the group
    pub index: u16,
    /// Total number of fragments in the group
    pub count: u16,
    /// Total length of the reassembled payload
    pub total_length: u32,
    /// Byte offset of this fragment within the reassembled payload
    pub offset: u32,
    /// Fragment payload
    pub payload: Bytes,
}

/// Type-specific command body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Acknowledges the reliable command (channel, sequence) named in the
    /// command header of the acknowledged command; echoes its send time
    Acknowledge {
        received_seq: SeqNumber,
        received_time: u16,
    },
    /// Connection request (three-way handshake step 1)
    Connect {
        outgoing_peer_id: u16,
        connect_id: u32,
        channel_count: u8,
        mtu: u16,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        data: u32,
    },
    /// Connection response (three-way handshake step 2); the acknowledgment
    /// of this command completes the handshake
    VerifyConnect {
        outgoing_peer_id: u16,
        connect_id: u32,
        channel_count: u8,
        mtu: u16,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    /// Disconnect notification carrying user data
    Disconnect { data: u32 },
    /// Keepalive; refreshes the RTT estimate via its acknowledgment
    Ping,
    /// Ordered, acknowledged payload
    SendReliable { payload: Bytes },
    /// Ordered, best-effort payload; stale sequences are dropped
    SendUnreliable {
        unreliable_seq: SeqNumber,
        payload: Bytes,
    },
    /// Unordered, deduplicated, best-effort payload
    SendUnsequenced { group: u16, payload: Bytes },
    /// Reliable fragment of a packet exceeding the MTU
    SendFragment(FragmentInfo),
    /// Unreliable fragment; incomplete groups are eventually discarded
    SendUnreliableFragment(FragmentInfo),
    /// Advertises new bandwidth limits mid-connection
    BandwidthLimit { incoming: u32, outgoing: u32 },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Acknowledge { .. } => CommandKind::Acknowledge,
            Command::Connect { .. } => CommandKind::Connect,
            Command::VerifyConnect { .. } => CommandKind::VerifyConnect,
            Command::Disconnect { .. } => CommandKind::Disconnect,
            Command::Ping => CommandKind::Ping,
            Command::SendReliable { .. } => CommandKind::SendReliable,
            Command::SendUnreliable { .. } => CommandKind::SendUnreliable,
            Command::SendUnsequenced { .. } => CommandKind::SendUnsequenced,
            Command::SendFragment(_) => CommandKind::SendFragment,
            Command::SendUnreliableFragment(_) => CommandKind::SendUnreliableFragment,
            Command::BandwidthLimit { .. } => CommandKind::BandwidthLimit,
        }
    }
}

/// A command together with its command-header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCommand {
    /// Channel the command applies to, or CONTROL_CHANNEL
    pub channel_id: u8,
    /// Reliable sequence number; meaningful for acknowledged commands
    pub reliable_seq: SeqNumber,
    /// Whether the receiver must acknowledge this command
    pub wants_ack: bool,
    /// Type-specific body
    pub command: Command,
}

impl ProtocolCommand {
    /// Construct a connection-level command (control channel)
    pub fn control(command: Command, reliable_seq: SeqNumber, wants_ack: bool) -> Self {
        ProtocolCommand {
            channel_id: CONTROL_CHANNEL,
            reliable_seq,
            wants_ack,
            command,
        }
    }

    /// Encoded size in bytes, header included
    pub fn encoded_len(&self) -> usize {
        let body = match &self.command {
            Command::Acknowledge { .. } => 4,
            Command::Connect { .. } => 21,
            Command::VerifyConnect { .. } => 17,
            Command::Disconnect { .. } => 4,
            Command::Ping => 0,
            Command::SendReliable { payload } => 2 + payload.len(),
            Command::SendUnreliable { payload, .. } => 4 + payload.len(),
            Command::SendUnsequenced { payload, .. } => 4 + payload.len(),
            Command::SendFragment(frag) | Command::SendUnreliableFragment(frag) => {
                16 + frag.payload.len()
            }
            Command::BandwidthLimit { .. } => 8,
        };
        COMMAND_HEADER_SIZE + body
    }

    /// Serialize the command, header first (network byte order)
    pub fn to_bytes(&self, buf: &mut BytesMut) {
        let mut type_byte = self.command.kind().as_u8();
        if self.wants_ack {
            type_byte |= WANTS_ACK_FLAG;
        }
        buf.put_u8(type_byte);
        buf.put_u8(self.channel_id);
        buf.put_u16(self.reliable_seq.as_raw());

        match &self.command {
            Command::Acknowledge {
                received_seq,
                received_time,
            } => {
                buf.put_u16(received_seq.as_raw());
                buf.put_u16(*received_time);
            }
            Command::Connect {
                outgoing_peer_id,
                connect_id,
                channel_count,
                mtu,
                incoming_bandwidth,
                outgoing_bandwidth,
                data,
            } => {
                buf.put_u16(*outgoing_peer_id);
                buf.put_u32(*connect_id);
                buf.put_u8(*channel_count);
                buf.put_u16(*mtu);
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
                buf.put_u32(*data);
            }
            Command::VerifyConnect {
                outgoing_peer_id,
                connect_id,
                channel_count,
                mtu,
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.put_u16(*outgoing_peer_id);
                buf.put_u32(*connect_id);
                buf.put_u8(*channel_count);
                buf.put_u16(*mtu);
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
            }
            Command::Disconnect { data } => {
                buf.put_u32(*data);
            }
            Command::Ping => {}
            Command::SendReliable { payload } => {
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            Command::SendUnreliable {
                unreliable_seq,
                payload,
            } => {
                buf.put_u16(unreliable_seq.as_raw());
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            Command::SendUnsequenced { group, payload } => {
                buf.put_u16(*group);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
            Command::SendFragment(frag) | Command::SendUnreliableFragment(frag) => {
                buf.put_u16(frag.start_seq.as_raw());
                buf.put_u16(frag.index);
                buf.put_u16(frag.count);
                buf.put_u32(frag.total_length);
                buf.put_u32(frag.offset);
                buf.put_u16(frag.payload.len() as u16);
                buf.put_slice(&frag.payload);
            }
            Command::BandwidthLimit { incoming, outgoing } => {
                buf.put_u32(*incoming);
                buf.put_u32(*outgoing);
            }
        }
    }

    /// Parse one command from the front of `buf`, advancing it
    pub fn from_bytes(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.remaining() < COMMAND_HEADER_SIZE {
            return Err(WireError::Truncated {
                expected: COMMAND_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }

        let type_byte = buf.get_u8();
        let wants_ack = type_byte & WANTS_ACK_FLAG != 0;
        let kind = CommandKind::from_u8(type_byte & COMMAND_MASK)
            .ok_or(WireError::UnknownCommand(type_byte & COMMAND_MASK))?;
        let channel_id = buf.get_u8();
        let reliable_seq = SeqNumber::new(buf.get_u16());

        let command = match kind {
            CommandKind::Acknowledge => {
                need(buf, 4)?;
                Command::Acknowledge {
                    received_seq: SeqNumber::new(buf.get_u16()),
                    received_time: buf.get_u16(),
                }
            }
            CommandKind::Connect => {
                need(buf, 21)?;
                Command::Connect {
                    outgoing_peer_id: buf.get_u16(),
                    connect_id: buf.get_u32(),
                    channel_count: buf.get_u8(),
                    mtu: buf.get_u16(),
                    incoming_bandwidth: buf.get_u32(),
                    outgoing_bandwidth: buf.get_u32(),
                    data: buf.get_u32(),
                }
            }
            CommandKind::VerifyConnect => {
                need(buf, 17)?;
                Command::VerifyConnect {
                    outgoing_peer_id: buf.get_u16(),
                    connect_id: buf.get_u32(),
                    channel_count: buf.get_u8(),
                    mtu: buf.get_u16(),
                    incoming_bandwidth: buf.get_u32(),
                    outgoing_bandwidth: buf.get_u32(),
                }
            }
            CommandKind::Disconnect => {
                need(buf, 4)?;
                Command::Disconnect {
                    data: buf.get_u32(),
                }
            }
            CommandKind::Ping => Command::Ping,
            CommandKind::SendReliable => Command::SendReliable {
                payload: take_payload(buf)?,
            },
            CommandKind::SendUnreliable => {
                need(buf, 2)?;
                let unreliable_seq = SeqNumber::new(buf.get_u16());
                Command::SendUnreliable {
                    unreliable_seq,
                    payload: take_payload(buf)?,
                }
            }
            CommandKind::SendUnsequenced => {
                need(buf, 2)?;
                let group = buf.get_u16();
                Command::SendUnsequenced {
                    group,
                    payload: take_payload(buf)?,
                }
            }
            CommandKind::SendFragment | CommandKind::SendUnreliableFragment => {
                need(buf, 14)?;
                let frag = FragmentInfo {
                    start_seq: SeqNumber::new(buf.get_u16()),
                    index: buf.get_u16(),
                    count: buf.get_u16(),
                    total_length: buf.get_u32(),
                    offset: buf.get_u32(),
                    payload: take_payload(buf)?,
                };
                if kind == CommandKind::SendFragment {
                    Command::SendFragment(frag)
                } else {
                    Command::SendUnreliableFragment(frag)
                }
            }
            CommandKind::BandwidthLimit => {
                need(buf, 8)?;
                Command::BandwidthLimit {
                    incoming: buf.get_u32(),
                    outgoing: buf.get_u32(),
                }
            }
        };

        Ok(ProtocolCommand {
            channel_id,
            reliable_seq,
            wants_ack,
            command,
        })
    }
}

fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::Truncated {
            expected: len,
            actual: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn take_payload(buf: &mut Bytes) -> Result<Bytes, WireError> {
    need(buf, 2)?;
    let declared = buf.get_u16() as usize;
    if buf.remaining() < declared {
        return Err(WireError::BadLength {
            declared,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.split_to(declared))
}

/// Serialize a header plus command list into one datagram
pub fn encode_datagram(header: ProtocolHeader, commands: &[ProtocolCommand]) -> BytesMut {
    let size = PROTOCOL_HEADER_SIZE + commands.iter().map(|c| c.encoded_len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    header.to_bytes(&mut buf);
    for command in commands {
        command.to_bytes(&mut buf);
    }
    buf
}

/// Parse every command in a datagram's command section
pub fn decode_commands(section: Bytes) -> Result<Vec<ProtocolCommand>, WireError> {
    let mut buf = section;
    let mut commands = Vec::new();
    while buf.has_remaining() {
        commands.push(ProtocolCommand::from_bytes(&mut buf)?);
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: ProtocolCommand) {
        let mut buf = BytesMut::new();
        command.to_bytes(&mut buf);
        assert_eq!(buf.len(), command.encoded_len());

        let mut bytes = buf.freeze();
        let decoded = ProtocolCommand::from_bytes(&mut bytes).unwrap();
        assert_eq!(decoded, command);
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ProtocolHeader {
            peer_id: 42,
            compressed: true,
            sent_time: 0xBEEF,
        };

        let mut buf = BytesMut::new();
        header.to_bytes(&mut buf);
        let decoded = ProtocolHeader::from_bytes(&buf).unwrap();

        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_truncated() {
        assert!(matches!(
            ProtocolHeader::from_bytes(&[0, 1]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_acknowledge_roundtrip() {
        roundtrip(ProtocolCommand {
            channel_id: 3,
            reliable_seq: SeqNumber::new(77),
            wants_ack: false,
            command: Command::Acknowledge {
                received_seq: SeqNumber::new(76),
                received_time: 0x1234,
            },
        });
    }

    #[test]
    fn test_connect_roundtrip() {
        roundtrip(ProtocolCommand::control(
            Command::Connect {
                outgoing_peer_id: 5,
                connect_id: 0xDEAD_BEEF,
                channel_count: 4,
                mtu: 1400,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 56_000,
                data: 99,
            },
            SeqNumber::new(1),
            true,
        ));
    }

    #[test]
    fn test_verify_connect_roundtrip() {
        roundtrip(ProtocolCommand::control(
            Command::VerifyConnect {
                outgoing_peer_id: 9,
                connect_id: 7,
                channel_count: 2,
                mtu: 1400,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
            },
            SeqNumber::new(1),
            true,
        ));
    }

    #[test]
    fn test_send_reliable_roundtrip() {
        roundtrip(ProtocolCommand {
            channel_id: 0,
            reliable_seq: SeqNumber::new(10),
            wants_ack: true,
            command: Command::SendReliable {
                payload: Bytes::from_static(b"hello"),
            },
        });
    }

    #[test]
    fn test_fragment_roundtrip() {
        roundtrip(ProtocolCommand {
            channel_id: 1,
            reliable_seq: SeqNumber::new(11),
            wants_ack: true,
            command: Command::SendFragment(FragmentInfo {
                start_seq: SeqNumber::new(10),
                index: 1,
                count: 3,
                total_length: 4000,
                offset: 1362,
                payload: Bytes::from_static(&[7; 100]),
            }),
        });
    }

    #[test]
    fn test_datagram_with_multiple_commands() {
        let header = ProtocolHeader {
            peer_id: 1,
            compressed: false,
            sent_time: 500,
        };
        let commands = vec![
            ProtocolCommand {
                channel_id: 0,
                reliable_seq: SeqNumber::new(1),
                wants_ack: false,
                command: Command::Acknowledge {
                    received_seq: SeqNumber::new(8),
                    received_time: 499,
                },
            },
            ProtocolCommand {
                channel_id: 0,
                reliable_seq: SeqNumber::new(2),
                wants_ack: true,
                command: Command::SendReliable {
                    payload: Bytes::from_static(b"data"),
                },
            },
            ProtocolCommand::control(Command::Ping, SeqNumber::new(3), true),
        ];

        let datagram = encode_datagram(header, &commands);
        let parsed_header = ProtocolHeader::from_bytes(&datagram).unwrap();
        assert_eq!(parsed_header, header);

        let section = Bytes::copy_from_slice(&datagram[PROTOCOL_HEADER_SIZE..]);
        let decoded = decode_commands(section).unwrap();
        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = Bytes::from_static(&[0x7F, 0, 0, 0]);
        assert!(matches!(
            ProtocolCommand::from_bytes(&mut bytes),
            Err(WireError::UnknownCommand(0x7F))
        ));
    }

    #[test]
    fn test_bad_length_rejected() {
        // SendReliable declaring 100 payload bytes but carrying none
        let mut buf = BytesMut::new();
        buf.put_u8(CommandKind::SendReliable.as_u8());
        buf.put_u8(0);
        buf.put_u16(1);
        buf.put_u16(100);

        let mut bytes = buf.freeze();
        assert!(matches!(
            ProtocolCommand::from_bytes(&mut bytes),
            Err(WireError::BadLength { declared: 100, .. })
        ));
    }
}
