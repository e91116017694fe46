//! Peer connection state machine
//!
//! A `Peer` is one end of a connection as seen from its host: handshake
//! progress, the negotiated channel set, retransmission state, and queues of
//! commands waiting for the next service pass. All transport work happens in
//! `Host::service`; peer methods only queue commands and update state.
//!
//! Connection lifecycle:
//!
//! ```text
//! connect()            incoming Connect
//!    |                        |
//! Connecting          AcknowledgingConnect
//!    | VerifyConnect          | ack of VerifyConnect
//!    +----------> Connected <-+
//!                     |
//!      disconnect_later() -> DisconnectLater (drains queues)
//!                     |
//!      disconnect() -> Disconnecting -> Zombie (ack received)
//!      disconnect_now() / incoming Disconnect -> Zombie
//! ```
//!
//! Zombie peers get one final flush from the host, then their slot is freed.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use rudp_io::Timer;
use rudp_protocol::channel::{Channel, Delivery};
use rudp_protocol::wire::{
    Command, FragmentInfo, ProtocolCommand, COMMAND_HEADER_SIZE, CONTROL_CHANNEL,
    MAX_FRAGMENT_COUNT, PEER_ID_NONE, PROTOCOL_HEADER_SIZE,
};
use rudp_protocol::{
    Packet, PacketFlags, ReliabilityTracker, SendWindow, SeqNumber, UnsequencedWindow,
};
use tracing::{debug, trace};

use crate::{Address, Error};

/// Keepalive interval while connected, in milliseconds
pub(crate) const PING_INTERVAL_MS: u32 = 500;

/// Default total-silence timeout before a peer is declared lost
pub(crate) const DEFAULT_TIMEOUT_MS: u32 = 30_000;

/// Cap on reliable commands in flight; stays inside the receiver's reorder
/// window so nothing is dropped for being too far ahead
const SEND_WINDOW_LIMIT: u32 = 512;

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Slot is not associated with a connection
    Disconnected,
    /// We sent a Connect and are waiting for VerifyConnect
    Connecting,
    /// We answered a Connect with VerifyConnect and are waiting for its
    /// acknowledgment
    AcknowledgingConnect,
    /// Handshake complete; data flows
    Connected,
    /// Disconnect requested once all queued outgoing data drains
    DisconnectLater,
    /// Disconnect sent; waiting for its acknowledgment
    Disconnecting,
    /// Connection is over; the slot is freed after a final flush
    Zombie,
}

/// State transition surfaced to the host for event dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerChange {
    Connected { data: u32 },
    Disconnected { data: u32 },
}

/// One end of a connection
pub struct Peer {
    pub(crate) index: u16,
    /// Our slot index in the remote host's peer table
    pub(crate) remote_peer_id: u16,
    pub(crate) address: SocketAddr,
    connect_id: u32,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    unsequenced_window: UnsequencedWindow,
    outgoing_unsequenced_group: u16,
    outgoing_control_seq: SeqNumber,
    pub(crate) tracker: ReliabilityTracker,
    pub(crate) window: SendWindow,
    /// Fresh commands not yet handed to the socket
    pub(crate) outgoing: VecDeque<ProtocolCommand>,
    /// Acknowledgments owed to the remote; never rate limited
    pub(crate) pending_acks: Vec<ProtocolCommand>,
    /// Completed deliveries waiting to become Receive events
    received: VecDeque<(u8, Delivery)>,
    pub(crate) last_receive_time: u32,
    pub(crate) ping_timer: Timer,
    timeout_ms: u32,
    /// Sequence of our VerifyConnect; its ack completes the handshake
    verify_seq: Option<SeqNumber>,
    /// Sequence of our Disconnect; its ack finishes the teardown
    disconnect_seq: Option<SeqNumber>,
    /// Connect data from the remote, reported in our Connect event
    pub(crate) connect_data: u32,
    disconnect_data: u32,
    pub(crate) mtu: u16,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    app_data: Option<Bytes>,
}

impl Peer {
    pub(crate) fn new(
        index: u16,
        address: SocketAddr,
        connect_id: u32,
        channel_count: u8,
        mtu: u16,
        now_ms: u32,
    ) -> Self {
        Peer {
            index,
            remote_peer_id: PEER_ID_NONE,
            address,
            connect_id,
            state: PeerState::Disconnected,
            channels: (0..channel_count.max(1)).map(|_| Channel::new()).collect(),
            unsequenced_window: UnsequencedWindow::new(),
            outgoing_unsequenced_group: 0,
            outgoing_control_seq: SeqNumber::ZERO,
            tracker: ReliabilityTracker::new(),
            window: SendWindow::new(SEND_WINDOW_LIMIT),
            outgoing: VecDeque::new(),
            pending_acks: Vec::new(),
            received: VecDeque::new(),
            last_receive_time: now_ms,
            ping_timer: Timer::new(PING_INTERVAL_MS, now_ms),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verify_seq: None,
            disconnect_seq: None,
            connect_data: 0,
            disconnect_data: 0,
            mtu,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            app_data: None,
        }
    }

    // ---- public accessors ----

    /// Remote address of this connection
    pub fn address(&self) -> Address {
        self.address.into()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Randomized id negotiated at connect time, shared by both ends
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// Smoothed round-trip time in milliseconds
    pub fn round_trip_time(&self) -> u32 {
        self.tracker.rtt().round_trip_time()
    }

    /// Number of channels negotiated for this connection
    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    /// Override the total-silence timeout in milliseconds
    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    /// Attach arbitrary application data to this peer
    pub fn set_app_data(&mut self, data: Option<Bytes>) {
        self.app_data = data;
    }

    /// Application data previously attached, if any
    pub fn app_data(&self) -> Option<&Bytes> {
        self.app_data.as_ref()
    }

    // ---- sending ----

    /// Queue a packet for sending on `channel_id`
    ///
    /// Packets larger than one datagram are split into fragments: reliable
    /// fragments by default, unreliable ones when the packet asks for
    /// `UNRELIABLE_FRAGMENT` and is not reliable.
    pub fn send(&mut self, channel_id: u8, mut packet: Packet) -> Result<(), Error> {
        if self.state != PeerState::Connected {
            return Err(Error::PeerNotConnected);
        }
        if channel_id as usize >= self.channels.len() {
            return Err(Error::ChannelOutOfRange);
        }

        let payload = packet.payload();
        let flags = packet.flags();

        if payload.len() > self.fragment_length() {
            self.queue_fragments(channel_id, payload, flags)?;
        } else if flags.contains(PacketFlags::RELIABLE) {
            let seq = self.channels[channel_id as usize].next_reliable_seq();
            self.outgoing.push_back(ProtocolCommand {
                channel_id,
                reliable_seq: seq,
                wants_ack: true,
                command: Command::SendReliable { payload },
            });
        } else if flags.contains(PacketFlags::UNSEQUENCED) {
            self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
            self.outgoing.push_back(ProtocolCommand {
                channel_id,
                reliable_seq: SeqNumber::ZERO,
                wants_ack: false,
                command: Command::SendUnsequenced {
                    group: self.outgoing_unsequenced_group,
                    payload,
                },
            });
        } else {
            let seq = self.channels[channel_id as usize].next_unreliable_seq();
            self.outgoing.push_back(ProtocolCommand {
                channel_id,
                reliable_seq: SeqNumber::ZERO,
                wants_ack: false,
                command: Command::SendUnreliable {
                    unreliable_seq: seq,
                    payload,
                },
            });
        }

        packet.mark_sent();
        Ok(())
    }

    /// Largest payload that fits in one datagram alongside its headers
    fn fragment_length(&self) -> usize {
        // 16 bytes of fragment fields plus the 2-byte payload length prefix
        self.mtu as usize - PROTOCOL_HEADER_SIZE - COMMAND_HEADER_SIZE - 18
    }

    fn queue_fragments(
        &mut self,
        channel_id: u8,
        payload: Bytes,
        flags: PacketFlags,
    ) -> Result<(), Error> {
        let piece = self.fragment_length();
        let count = (payload.len() + piece - 1) / piece;
        if count > MAX_FRAGMENT_COUNT {
            return Err(Error::PacketTooLarge);
        }

        let total_length = payload.len() as u32;
        let unreliable = flags.contains(PacketFlags::UNRELIABLE_FRAGMENT)
            && !flags.contains(PacketFlags::RELIABLE);
        let channel = &mut self.channels[channel_id as usize];

        trace!(
            peer = self.index,
            channel = channel_id,
            count,
            total_length,
            unreliable,
            "fragmenting packet"
        );

        let mut start_seq = None;
        if unreliable {
            start_seq = Some(channel.next_fragment_group());
        }

        for index in 0..count {
            let offset = index * piece;
            let end = (offset + piece).min(payload.len());
            let slice = payload.slice(offset..end);

            if unreliable {
                self.outgoing.push_back(ProtocolCommand {
                    channel_id,
                    reliable_seq: SeqNumber::ZERO,
                    wants_ack: false,
                    command: Command::SendUnreliableFragment(FragmentInfo {
                        start_seq: start_seq.unwrap_or(SeqNumber::ZERO),
                        index: index as u16,
                        count: count as u16,
                        total_length,
                        offset: offset as u32,
                        payload: slice,
                    }),
                });
            } else {
                let seq = self.channels[channel_id as usize].next_reliable_seq();
                let group_start = *start_seq.get_or_insert(seq);
                self.outgoing.push_back(ProtocolCommand {
                    channel_id,
                    reliable_seq: seq,
                    wants_ack: true,
                    command: Command::SendFragment(FragmentInfo {
                        start_seq: group_start,
                        index: index as u16,
                        count: count as u16,
                        total_length,
                        offset: offset as u32,
                        payload: slice,
                    }),
                });
            }
        }
        Ok(())
    }

    // ---- disconnecting ----

    /// Request a graceful disconnect; completes with a local Disconnect
    /// event once the remote acknowledges
    pub fn disconnect(&mut self, data: u32) {
        if !matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return;
        }
        let seq = self.next_control_seq();
        self.disconnect_seq = Some(seq);
        self.disconnect_data = data;
        self.outgoing
            .push_back(ProtocolCommand::control(Command::Disconnect { data }, seq, true));
        self.state = PeerState::Disconnecting;
        debug!(peer = self.index, "disconnect requested");
    }

    /// Tear the connection down immediately
    ///
    /// A single best-effort Disconnect is sent; no local event is generated.
    pub fn disconnect_now(&mut self, data: u32) {
        if matches!(self.state, PeerState::Zombie | PeerState::Disconnected) {
            return;
        }
        self.outgoing.clear();
        self.tracker.clear();
        self.outgoing.push_back(ProtocolCommand::control(
            Command::Disconnect { data },
            SeqNumber::ZERO,
            false,
        ));
        self.state = PeerState::Zombie;
        debug!(peer = self.index, "immediate disconnect");
    }

    /// Disconnect once every queued outgoing packet has been delivered
    pub fn disconnect_later(&mut self, data: u32) {
        if self.state != PeerState::Connected {
            return;
        }
        if self.outgoing.is_empty() && self.tracker.in_flight() == 0 {
            self.disconnect(data);
        } else {
            self.disconnect_data = data;
            self.state = PeerState::DisconnectLater;
        }
    }

    // ---- host-side plumbing ----

    fn next_control_seq(&mut self) -> SeqNumber {
        self.outgoing_control_seq.increment();
        self.outgoing_control_seq
    }

    /// Queue the Connect command opening an outgoing handshake
    pub(crate) fn begin_connect(
        &mut self,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
        data: u32,
    ) {
        let seq = self.next_control_seq();
        self.outgoing.push_back(ProtocolCommand::control(
            Command::Connect {
                outgoing_peer_id: self.index,
                connect_id: self.connect_id,
                channel_count: self.channels.len() as u8,
                mtu: self.mtu,
                incoming_bandwidth,
                outgoing_bandwidth,
                data,
            },
            seq,
            true,
        ));
        self.state = PeerState::Connecting;
        debug!(peer = self.index, address = %self.address, "connecting");
    }

    /// Queue the VerifyConnect answering an incoming handshake
    pub(crate) fn begin_verify(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        let seq = self.next_control_seq();
        self.verify_seq = Some(seq);
        self.outgoing.push_back(ProtocolCommand::control(
            Command::VerifyConnect {
                outgoing_peer_id: self.index,
                connect_id: self.connect_id,
                channel_count: self.channels.len() as u8,
                mtu: self.mtu,
                incoming_bandwidth,
                outgoing_bandwidth,
            },
            seq,
            true,
        ));
        self.state = PeerState::AcknowledgingConnect;
        debug!(peer = self.index, address = %self.address, "verifying incoming connection");
    }

    /// Queue an acknowledgment for a command we just received
    pub(crate) fn queue_ack(&mut self, cmd: &ProtocolCommand, header_time: u16) {
        self.pending_acks.push(ProtocolCommand {
            channel_id: cmd.channel_id,
            reliable_seq: SeqNumber::ZERO,
            wants_ack: false,
            command: Command::Acknowledge {
                received_seq: cmd.reliable_seq,
                received_time: header_time,
            },
        });
    }

    /// Queue a keepalive ping
    pub(crate) fn queue_ping(&mut self) {
        let seq = self.next_control_seq();
        self.outgoing
            .push_back(ProtocolCommand::control(Command::Ping, seq, true));
    }

    /// Advertise new host bandwidth limits to the remote
    pub(crate) fn queue_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        let seq = self.next_control_seq();
        self.outgoing.push_back(ProtocolCommand::control(
            Command::BandwidthLimit { incoming, outgoing },
            seq,
            true,
        ));
    }

    /// Check whether the connection has gone silent or unrecoverable
    pub(crate) fn timed_out(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.last_receive_time) >= self.timeout_ms
            || self.tracker.has_failed(now_ms)
    }

    /// Convert a drained DisconnectLater into an actual disconnect
    pub(crate) fn check_disconnect_later(&mut self) {
        if self.state == PeerState::DisconnectLater
            && self.outgoing.is_empty()
            && self.pending_acks.is_empty()
            && self.tracker.in_flight() == 0
        {
            self.state = PeerState::Connected;
            self.disconnect(self.disconnect_data);
        }
    }

    /// Pop one completed delivery, as (channel id, delivery)
    pub(crate) fn take_received(&mut self) -> Option<(u8, Delivery)> {
        self.received.pop_front()
    }

    /// Process one command from a datagram addressed to this peer
    ///
    /// `header_time` is the sender's clock from the datagram header, echoed
    /// back in acknowledgments.
    pub(crate) fn handle_command(
        &mut self,
        cmd: &ProtocolCommand,
        header_time: u16,
        now_ms: u32,
    ) -> Option<PeerChange> {
        match &cmd.command {
            Command::Acknowledge {
                received_seq,
                received_time,
            } => self.handle_ack(cmd.channel_id, *received_seq, *received_time, now_ms),

            Command::VerifyConnect {
                outgoing_peer_id,
                connect_id,
                channel_count,
                mtu,
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                if cmd.wants_ack {
                    self.queue_ack(cmd, header_time);
                }
                if self.state != PeerState::Connecting || *connect_id != self.connect_id {
                    return None;
                }
                self.remote_peer_id = *outgoing_peer_id;
                let negotiated = (*channel_count as usize).clamp(1, self.channels.len());
                self.channels.truncate(negotiated);
                self.mtu = self.mtu.min(*mtu);
                self.incoming_bandwidth = *incoming_bandwidth;
                self.outgoing_bandwidth = *outgoing_bandwidth;
                self.state = PeerState::Connected;
                debug!(
                    peer = self.index,
                    channels = negotiated,
                    mtu = self.mtu,
                    "connection verified"
                );
                Some(PeerChange::Connected { data: 0 })
            }

            Command::Disconnect { data } => {
                if cmd.wants_ack {
                    self.queue_ack(cmd, header_time);
                }
                if self.state == PeerState::Zombie {
                    return None;
                }
                self.tracker.clear();
                self.outgoing.clear();
                self.state = PeerState::Zombie;
                debug!(peer = self.index, data, "remote disconnected");
                Some(PeerChange::Disconnected { data: *data })
            }

            Command::Ping => {
                if cmd.wants_ack {
                    self.queue_ack(cmd, header_time);
                }
                None
            }

            Command::BandwidthLimit { incoming, outgoing } => {
                if cmd.wants_ack {
                    self.queue_ack(cmd, header_time);
                }
                self.incoming_bandwidth = *incoming;
                self.outgoing_bandwidth = *outgoing;
                None
            }

            Command::SendReliable { .. } | Command::SendFragment(_) => {
                self.handle_reliable_data(cmd, header_time);
                None
            }

            Command::SendUnreliable {
                unreliable_seq,
                payload,
            } => {
                if self.accepts_data(cmd.channel_id) {
                    let idx = cmd.channel_id as usize;
                    self.channels[idx].receive_unreliable(*unreliable_seq, payload.clone());
                    self.collect_channel(idx);
                }
                None
            }

            Command::SendUnsequenced { group, payload } => {
                if self.accepts_data(cmd.channel_id) && self.unsequenced_window.receive(*group) {
                    self.received.push_back((
                        cmd.channel_id,
                        Delivery {
                            payload: payload.clone(),
                            flags: PacketFlags::UNSEQUENCED,
                        },
                    ));
                }
                None
            }

            Command::SendUnreliableFragment(frag) => {
                if self.accepts_data(cmd.channel_id) {
                    let idx = cmd.channel_id as usize;
                    self.channels[idx].receive_unreliable_fragment(frag.clone());
                    self.collect_channel(idx);
                }
                None
            }

            // Connect commands are handled at host level before routing
            Command::Connect { .. } => None,
        }
    }

    fn handle_ack(
        &mut self,
        channel_id: u8,
        received_seq: SeqNumber,
        received_time: u16,
        now_ms: u32,
    ) -> Option<PeerChange> {
        if !self
            .tracker
            .acknowledge(channel_id, received_seq, received_time, now_ms)
        {
            return None;
        }
        self.window.on_ack(1);

        if channel_id == CONTROL_CHANNEL {
            if self.state == PeerState::AcknowledgingConnect
                && self.verify_seq == Some(received_seq)
            {
                self.verify_seq = None;
                self.state = PeerState::Connected;
                debug!(peer = self.index, "handshake complete");
                return Some(PeerChange::Connected {
                    data: self.connect_data,
                });
            }
            if self.state == PeerState::Disconnecting
                && self.disconnect_seq == Some(received_seq)
            {
                self.state = PeerState::Zombie;
                debug!(peer = self.index, "disconnect acknowledged");
                return Some(PeerChange::Disconnected {
                    data: self.disconnect_data,
                });
            }
        }
        None
    }

    fn handle_reliable_data(&mut self, cmd: &ProtocolCommand, header_time: u16) {
        // Only processed commands are acknowledged; an ack for a discarded
        // payload would stop the sender's retries and lose it for good
        if !self.accepts_data(cmd.channel_id) {
            return;
        }

        let idx = cmd.channel_id as usize;
        let outcome = match &cmd.command {
            Command::SendReliable { payload } => {
                self.channels[idx].receive_reliable(cmd.reliable_seq, payload.clone())
            }
            Command::SendFragment(frag) => {
                self.channels[idx].receive_fragment(cmd.reliable_seq, frag.clone())
            }
            _ => return,
        };

        use rudp_protocol::channel::ReceiveOutcome;
        match outcome {
            ReceiveOutcome::Accepted | ReceiveOutcome::Duplicate => {
                self.queue_ack(cmd, header_time)
            }
            // No ack: the sender retries once our window has advanced
            ReceiveOutcome::Overflow => {}
        }
        self.collect_channel(idx);
    }

    fn accepts_data(&self, channel_id: u8) -> bool {
        matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) && (channel_id as usize) < self.channels.len()
    }

    fn collect_channel(&mut self, idx: usize) {
        while let Some(delivery) = self.channels[idx].pop_ready() {
            self.received.push_back((idx as u8, delivery));
        }
    }
}
