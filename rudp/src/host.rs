//! Host orchestration and the service loop
//!
//! A `Host` owns one UDP socket and a table of peer slots. All protocol work
//! happens inside [`Host::service`]: the send phase retires timed-out
//! connections, queues keepalives, then spends outgoing bandwidth in
//! priority order: acknowledgments (exempt from the cap) and due
//! retransmissions for every peer before any peer's fresh traffic, starting
//! from a slot index that rotates between passes so no peer is starved
//! under a saturated cap. The receive phase drains the socket and routes
//! each datagram's commands to its peer. One event is returned per call;
//! the rest wait in a queue for the next call.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rudp_io::{Clock, DatagramSocket, RateLimiter, RECV_BUFFER_SIZE};
use rudp_protocol::compress::{Compressor, RangeCoder};
use rudp_protocol::wire::{
    decode_commands, encode_datagram, Command, ProtocolCommand, ProtocolHeader, DEFAULT_MTU,
    MAX_PEER_ID, PEER_ID_NONE, PROTOCOL_HEADER_SIZE,
};
use rudp_protocol::Packet;
use tracing::{debug, info, trace};

use crate::event::{Event, PeerHandle};
use crate::peer::{Peer, PeerChange, PeerState};
use crate::{Address, Error};

/// Datagrams drained from the socket per service pass, bounding the time one
/// call can spend receiving
const MAX_RECEIVES_PER_PASS: usize = 256;

/// Floor for the negotiated MTU
const MIN_MTU: u16 = 576;

/// Host creation parameters
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address to bind; `None` binds an ephemeral port on all interfaces,
    /// which is the usual client configuration
    pub bind: Option<Address>,
    /// Peer slots to allocate
    pub max_peers: usize,
    /// Most channels any connection may negotiate
    pub channel_limit: u8,
    /// Advertised incoming bandwidth in bytes per second; zero is unlimited
    pub incoming_bandwidth: u32,
    /// Cap on outgoing bytes per second; zero is unlimited
    pub outgoing_bandwidth: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            bind: None,
            max_peers: 32,
            channel_limit: 8,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }
}

/// A socket plus the peers connected through it
pub struct Host {
    socket: DatagramSocket,
    clock: Clock,
    peers: Vec<Option<Peer>>,
    /// Bumped when a slot is freed, invalidating old handles
    generations: Vec<u32>,
    channel_limit: u8,
    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    limiter: RateLimiter,
    compressor: Option<Box<dyn Compressor>>,
    pending_events: VecDeque<Event>,
    connect_seed: u32,
    mtu: u16,
    /// First peer slot visited by the next send pass
    rotation: usize,
}

impl Host {
    /// Create a host; requires a prior [`crate::initialize`]
    pub fn new(config: HostConfig) -> Result<Self, Error> {
        if !crate::is_initialized() {
            return Err(Error::NotReady);
        }
        let max_peers = config.max_peers;
        if max_peers == 0 || max_peers > MAX_PEER_ID as usize {
            return Err(Error::ResourceExhausted);
        }

        let bind_addr: SocketAddr = config.bind.unwrap_or_else(|| Address::any(0)).into();
        let socket = DatagramSocket::bind(bind_addr).map_err(Error::BindFailed)?;
        let clock = Clock::new();
        let now = clock.now_ms();

        info!(
            address = %socket.local_addr()?,
            max_peers,
            channel_limit = config.channel_limit,
            "host created"
        );

        Ok(Host {
            socket,
            clock,
            peers: (0..max_peers).map(|_| None).collect(),
            generations: vec![0; max_peers],
            channel_limit: config.channel_limit.max(1),
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            limiter: RateLimiter::new(config.outgoing_bandwidth, now),
            compressor: None,
            pending_events: VecDeque::new(),
            connect_seed: 0x9E37_79B9,
            mtu: DEFAULT_MTU as u16,
            rotation: 0,
        })
    }

    /// Local address the host is bound to
    pub fn address(&self) -> Result<Address, Error> {
        Ok(self.socket.local_addr()?.into())
    }

    /// Number of occupied peer slots
    pub fn peer_count(&self) -> usize {
        self.peers.iter().filter(|slot| slot.is_some()).count()
    }

    /// Begin connecting to a remote host
    ///
    /// The handshake proceeds inside `service`; a Connect event reports
    /// completion, a Disconnect event reports failure.
    pub fn connect(
        &mut self,
        address: Address,
        channel_count: u8,
        data: u32,
    ) -> Result<PeerHandle, Error> {
        let index = self.free_slot().ok_or(Error::NoFreeSlot)?;
        let now = self.clock.now_ms();
        let connect_id = self.next_connect_id(now);

        let mut peer = Peer::new(
            index as u16,
            address.into(),
            connect_id,
            channel_count.clamp(1, self.channel_limit),
            self.mtu,
            now,
        );
        peer.begin_connect(self.incoming_bandwidth, self.outgoing_bandwidth, data);
        self.peers[index] = Some(peer);

        Ok(PeerHandle {
            index: index as u16,
            generation: self.generations[index],
        })
    }

    /// Resolve a handle to its peer
    pub fn peer(&self, handle: PeerHandle) -> Result<&Peer, Error> {
        let index = handle.index as usize;
        if index >= self.peers.len() || self.generations[index] != handle.generation {
            return Err(Error::PeerNotConnected);
        }
        self.peers[index].as_ref().ok_or(Error::PeerNotConnected)
    }

    /// Resolve a handle to its peer, mutably
    pub fn peer_mut(&mut self, handle: PeerHandle) -> Result<&mut Peer, Error> {
        let index = handle.index as usize;
        if index >= self.peers.len() || self.generations[index] != handle.generation {
            return Err(Error::PeerNotConnected);
        }
        self.peers[index].as_mut().ok_or(Error::PeerNotConnected)
    }

    /// Queue a packet to every connected peer
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for peer in self.peers.iter_mut().flatten() {
            if peer.state() == PeerState::Connected {
                let _ = peer.send(channel_id, packet.clone());
            }
        }
    }

    /// Compress outgoing datagrams with the built-in range coder
    ///
    /// Must be enabled before any peer exists. Both ends must enable
    /// compression; an end without it drops compressed datagrams.
    pub fn compress_with_range_coder(&mut self) -> Result<(), Error> {
        if self.peer_count() > 0 {
            return Err(Error::NotReady);
        }
        self.compressor = Some(Box::new(RangeCoder::new()));
        Ok(())
    }

    /// Change bandwidth limits and advertise them to connected peers
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        let now = self.clock.now_ms();
        self.limiter.set_rate(outgoing, now);
        for peer in self.peers.iter_mut().flatten() {
            if peer.state() == PeerState::Connected {
                peer.queue_bandwidth_limit(incoming, outgoing);
            }
        }
    }

    /// Run the protocol and return the next event, waiting up to
    /// `timeout_ms` for one to occur
    ///
    /// A timeout of zero polls: one send/receive pass, then return. Call in
    /// a loop; only one event is returned per call even when several are
    /// ready.
    pub fn service(&mut self, timeout_ms: u32) -> Result<Option<Event>, Error> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if let Some(event) = self.pending_events.pop_front() {
                return Ok(Some(event));
            }

            self.send_outgoing()?;
            self.receive_incoming()?;
            self.dispatch_deliveries();

            if let Some(event) = self.pending_events.pop_front() {
                return Ok(Some(event));
            }
            if timeout_ms == 0 || Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Push queued commands out without receiving or dispatching events
    pub fn flush(&mut self) -> Result<(), Error> {
        self.send_outgoing()
    }

    // ---- send phase ----

    fn send_outgoing(&mut self) -> Result<(), Error> {
        let now = self.clock.now_ms();
        let count = self.peers.len();
        let start = self.rotation;
        self.rotation = (start + 1) % count;

        // Priority pass: housekeeping, acknowledgments, and due
        // retransmissions for every peer before any fresh traffic can
        // spend bandwidth budget
        for step in 0..count {
            let index = (start + step) % count;
            let Some(peer) = self.peers[index].as_mut() else {
                continue;
            };

            // Zombies get one final flush for their goodbye, then the slot
            // is recycled; the teardown notice is not throttled
            if peer.state() == PeerState::Zombie {
                let mut commands: Vec<ProtocolCommand> = std::mem::take(&mut peer.pending_acks);
                commands.extend(peer.outgoing.drain(..));
                if !commands.is_empty() {
                    Self::transmit(
                        &self.socket,
                        &mut self.limiter,
                        &mut self.compressor,
                        peer,
                        commands,
                        now,
                        false,
                    )?;
                }
                debug!(peer = index, "slot freed");
                self.release_slot(index);
                continue;
            }

            if peer.timed_out(now) {
                debug!(peer = index, state = ?peer.state(), "peer timed out");
                self.pending_events.push_back(Event::Disconnect {
                    peer: PeerHandle {
                        index: index as u16,
                        generation: self.generations[index],
                    },
                    data: 0,
                });
                self.release_slot(index);
                continue;
            }

            peer.check_disconnect_later();

            if peer.state() == PeerState::Connected && peer.ping_timer.try_fire(now) {
                peer.queue_ping();
            }

            let acks = std::mem::take(&mut peer.pending_acks);
            if !acks.is_empty() {
                Self::transmit(
                    &self.socket,
                    &mut self.limiter,
                    &mut self.compressor,
                    peer,
                    acks,
                    now,
                    false,
                )?;
            }

            let due = peer.tracker.collect_due(now);
            if !due.is_empty() {
                peer.window.on_retransmit(now);
                Self::transmit(
                    &self.socket,
                    &mut self.limiter,
                    &mut self.compressor,
                    peer,
                    due,
                    now,
                    true,
                )?;
            }
        }

        // Fresh traffic, same rotation
        for step in 0..count {
            let index = (start + step) % count;
            let Some(peer) = self.peers[index].as_mut() else {
                continue;
            };

            let mut commands: Vec<ProtocolCommand> = Vec::new();
            while let Some(front) = peer.outgoing.front() {
                if front.wants_ack && !peer.window.can_send() {
                    break;
                }
                let cmd = peer.outgoing.pop_front().expect("front checked");
                if cmd.wants_ack {
                    peer.tracker.on_send(cmd.clone(), now);
                    peer.window.on_send();
                }
                commands.push(cmd);
            }

            if commands.is_empty() {
                continue;
            }
            Self::transmit(
                &self.socket,
                &mut self.limiter,
                &mut self.compressor,
                peer,
                commands,
                now,
                true,
            )?;
        }
        Ok(())
    }

    /// Pack commands into MTU-sized datagrams and send them
    fn transmit(
        socket: &DatagramSocket,
        limiter: &mut RateLimiter,
        compressor: &mut Option<Box<dyn Compressor>>,
        peer: &Peer,
        commands: Vec<ProtocolCommand>,
        now: u32,
        throttled: bool,
    ) -> Result<(), Error> {
        let mtu = peer.mtu as usize;
        let mut batch: Vec<ProtocolCommand> = Vec::new();
        let mut batch_len = PROTOCOL_HEADER_SIZE;

        for cmd in commands {
            let len = cmd.encoded_len();
            if !batch.is_empty() && batch_len + len > mtu {
                Self::send_datagram(socket, limiter, compressor, peer, &batch, now, throttled)?;
                batch.clear();
                batch_len = PROTOCOL_HEADER_SIZE;
            }
            batch_len += len;
            batch.push(cmd);
        }
        if !batch.is_empty() {
            Self::send_datagram(socket, limiter, compressor, peer, &batch, now, throttled)?;
        }
        Ok(())
    }

    fn send_datagram(
        socket: &DatagramSocket,
        limiter: &mut RateLimiter,
        compressor: &mut Option<Box<dyn Compressor>>,
        peer: &Peer,
        commands: &[ProtocolCommand],
        now: u32,
        throttled: bool,
    ) -> Result<(), Error> {
        let header = ProtocolHeader {
            peer_id: peer.remote_peer_id,
            compressed: false,
            sent_time: now as u16,
        };
        let mut datagram = encode_datagram(header, commands);

        if let Some(compressor) = compressor {
            let section = &datagram[PROTOCOL_HEADER_SIZE..];
            if let Some(coded) = compressor.compress(section) {
                // Worth it only if it beats the raw form including the
                // original-length prefix
                if coded.len() + 2 < section.len() {
                    let original_len = section.len() as u16;
                    let mut buf =
                        BytesMut::with_capacity(PROTOCOL_HEADER_SIZE + 2 + coded.len());
                    ProtocolHeader {
                        compressed: true,
                        ..header
                    }
                    .to_bytes(&mut buf);
                    buf.put_u16(original_len);
                    buf.put_slice(&coded);
                    datagram = buf;
                }
            }
        }

        if throttled && !limiter.consume(datagram.len(), now) {
            // Reliable commands are tracked and will retransmit; the rest
            // are best-effort anyway
            trace!(peer = peer.index, len = datagram.len(), "bandwidth cap hit; datagram dropped");
            return Ok(());
        }

        match socket.send_to(&datagram, peer.address) {
            Ok(Some(_)) => {}
            Ok(None) => trace!(peer = peer.index, "socket backpressure; datagram dropped"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    // ---- receive phase ----

    fn receive_incoming(&mut self) -> Result<(), Error> {
        for _ in 0..MAX_RECEIVES_PER_PASS {
            let Some((data, from)) = self.socket.recv_from()? else {
                break;
            };
            let now = self.clock.now_ms();
            self.process_datagram(data, from, now);
        }
        Ok(())
    }

    fn process_datagram(&mut self, data: Vec<u8>, from: SocketAddr, now: u32) {
        let bytes = Bytes::from(data);
        let header = match ProtocolHeader::from_bytes(&bytes) {
            Ok(header) => header,
            Err(error) => {
                trace!(%from, %error, "dropping undersized datagram");
                return;
            }
        };
        let mut section = bytes.slice(PROTOCOL_HEADER_SIZE..);

        if header.compressed {
            let Some(compressor) = self.compressor.as_mut() else {
                trace!(%from, "compressed datagram but no compressor installed");
                return;
            };
            if section.len() < 2 {
                return;
            }
            let original_len = u16::from_be_bytes([section[0], section[1]]) as usize;
            if original_len == 0 || original_len > RECV_BUFFER_SIZE {
                return;
            }
            match compressor.decompress(&section[2..], original_len) {
                Some(decoded) => section = Bytes::from(decoded),
                None => return,
            }
        }

        let commands = match decode_commands(section) {
            Ok(commands) => commands,
            Err(error) => {
                trace!(%from, %error, "dropping malformed datagram");
                return;
            }
        };

        if header.peer_id == PEER_ID_NONE {
            for cmd in &commands {
                if matches!(cmd.command, Command::Connect { .. }) {
                    self.handle_connect(cmd, from, header.sent_time, now);
                }
            }
            return;
        }

        let index = header.peer_id as usize;
        let Some(peer) = self.peers.get_mut(index).and_then(|slot| slot.as_mut()) else {
            trace!(%from, peer = index, "datagram for unknown peer");
            return;
        };
        if peer.address != from {
            trace!(%from, peer = index, "datagram source does not match peer");
            return;
        }
        peer.last_receive_time = now;
        // Traffic counts as keepalive; ping only after silence
        peer.ping_timer.reset(now);

        let handle = PeerHandle {
            index: index as u16,
            generation: self.generations[index],
        };
        for cmd in &commands {
            if let Some(change) = peer.handle_command(cmd, header.sent_time, now) {
                self.pending_events.push_back(match change {
                    PeerChange::Connected { data } => Event::Connect { peer: handle, data },
                    PeerChange::Disconnected { data } => Event::Disconnect { peer: handle, data },
                });
            }
        }
    }

    /// Answer a connection request arriving outside any established peer
    fn handle_connect(
        &mut self,
        cmd: &ProtocolCommand,
        from: SocketAddr,
        header_time: u16,
        now: u32,
    ) {
        let Command::Connect {
            outgoing_peer_id,
            connect_id,
            channel_count,
            mtu,
            incoming_bandwidth,
            outgoing_bandwidth,
            data,
        } = cmd.command
        else {
            return;
        };

        // A retransmitted Connect must not allocate a second slot; re-ack
        // from the peer it already created
        for peer in self.peers.iter_mut().flatten() {
            if peer.address == from && peer.connect_id() == connect_id {
                if cmd.wants_ack {
                    peer.queue_ack(cmd, header_time);
                }
                return;
            }
        }

        let Some(index) = self.free_slot() else {
            trace!(%from, "connection request dropped; no free slot");
            return;
        };

        let mut peer = Peer::new(
            index as u16,
            from,
            connect_id,
            channel_count.clamp(1, self.channel_limit),
            self.mtu.min(mtu).max(MIN_MTU),
            now,
        );
        peer.remote_peer_id = outgoing_peer_id;
        peer.connect_data = data;
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;
        if cmd.wants_ack {
            peer.queue_ack(cmd, header_time);
        }
        peer.begin_verify(self.incoming_bandwidth, self.outgoing_bandwidth);

        debug!(%from, slot = index, "incoming connection request");
        self.peers[index] = Some(peer);
    }

    // ---- bookkeeping ----

    fn dispatch_deliveries(&mut self) {
        for index in 0..self.peers.len() {
            let generation = self.generations[index];
            let Some(peer) = self.peers[index].as_mut() else {
                continue;
            };
            while let Some((channel_id, delivery)) = peer.take_received() {
                self.pending_events.push_back(Event::Receive {
                    peer: PeerHandle {
                        index: index as u16,
                        generation,
                    },
                    channel_id,
                    packet: Packet::from_bytes(delivery.payload, delivery.flags),
                });
            }
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.peers.iter().position(|slot| slot.is_none())
    }

    fn release_slot(&mut self, index: usize) {
        self.peers[index] = None;
        self.generations[index] = self.generations[index].wrapping_add(1);
    }

    fn next_connect_id(&mut self, now: u32) -> u32 {
        self.connect_seed = self
            .connect_seed
            .wrapping_mul(0x0019_660D)
            .wrapping_add(0x3C6E_F35F);
        now.rotate_left(16) ^ self.connect_seed
    }
}
