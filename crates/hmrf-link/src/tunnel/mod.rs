// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP raw-frame tunnel.
//!
//! Exposes the module's frame stream to exactly one remote peer. The peer
//! opens a session with Connect, enables forwarding with StartTunnel and
//! must keep the session alive; both sides send KeepAlive once per second
//! and a session silent for longer than the keepalive timeout is dropped.
//!
//! Session fields are independent atomics: the UDP loop writes them, the
//! link's receive thread reads them when forwarding frames.

pub mod packet;

pub use packet::{Packet, PacketError, PacketType, MAX_FRAME_PAYLOAD, PROTOCOL_VERSION};

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::config::TunnelConfig;
use crate::error::{LinkError, Result};
use crate::link::{FrameHandler, ModuleLink};

/// Receive buffer, larger than any valid datagram
const RECV_BUFFER_SIZE: usize = 2048;

struct Inner {
    link: Arc<ModuleLink>,
    config: TunnelConfig,
    socket: ArcSwapOption<UdpSocket>,
    running: AtomicBool,

    remote_address: AtomicU32,
    remote_port: AtomicU16,
    connected: AtomicBool,
    counter: AtomicU8,
    /// Microseconds since `epoch`
    last_keepalive: AtomicU64,
    epoch: Instant,
}

impl Inner {
    fn micros(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_micros() as u64
    }

    fn is_peer(&self, from: SocketAddr) -> bool {
        match from {
            SocketAddr::V4(v4) => {
                u32::from(*v4.ip()) == self.remote_address.load(Ordering::Acquire)
                    && v4.port() == self.remote_port.load(Ordering::Acquire)
            }
            SocketAddr::V6(_) => false,
        }
    }

    fn clear_session(&self) {
        self.remote_port.store(0, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.remote_address.store(0, Ordering::Release);
    }

    fn handle_packet(&self, data: &[u8], from: SocketAddr) -> std::result::Result<(), PacketError> {
        if data.len() < packet::PACKET_OVERHEAD {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[0] != PacketType::Connect as u8 && !self.is_peer(from) {
            return Err(PacketError::InvalidAddress(from));
        }
        Packet::verify_crc(data)?;

        self.last_keepalive
            .store(self.micros(Instant::now()), Ordering::Release);

        let packet = Packet::parse(data)?;
        log::trace!("[TUNNEL] rx {:?} seq={} from {}", packet.kind, packet.seq, from);

        match packet.kind {
            PacketType::Connect => {
                if data.len() != packet::CONNECT_REQUEST_LEN {
                    return Err(PacketError::InvalidLength {
                        kind: PacketType::Connect,
                        len: data.len(),
                    });
                }
                let version = packet.payload[0];
                if version != PROTOCOL_VERSION {
                    log::warn!("[TUNNEL] {} uses unsupported protocol version {}", from, version);
                    return Ok(());
                }
                let SocketAddr::V4(peer) = from else {
                    return Err(PacketError::InvalidAddress(from));
                };

                self.remote_port.store(0, Ordering::Release);
                self.connected.store(false, Ordering::Release);
                self.remote_address
                    .store(u32::from(*peer.ip()), Ordering::Release);
                self.remote_port.store(peer.port(), Ordering::Release);

                self.link.set_led(true, true, false);
                self.send_message(PacketType::Connect, &[PROTOCOL_VERSION, packet.seq]);
                log::info!("[TUNNEL] session opened by {}", peer);
            }
            PacketType::Disconnect => {
                self.clear_session();
                self.link.set_led(false, false, false);
                log::info!("[TUNNEL] session closed by {}", from);
            }
            PacketType::KeepAlive => {}
            PacketType::SetLed => {
                let bits = packet.payload[0];
                self.link
                    .set_led(bits & 0x01 != 0, bits & 0x02 != 0, bits & 0x04 != 0);
            }
            PacketType::Reset => self.link.reset_module(),
            PacketType::StartTunnel => self.connected.store(true, Ordering::Release),
            PacketType::StopTunnel => self.connected.store(false, Ordering::Release),
            PacketType::Frame => {
                if let Err(e) = self.link.send_frame(packet.payload) {
                    log::warn!("[TUNNEL] cannot forward frame to module: {}", e);
                }
            }
        }

        Ok(())
    }

    fn send_message(&self, kind: PacketType, payload: &[u8]) {
        let port = self.remote_port.load(Ordering::Acquire);
        let address = self.remote_address.load(Ordering::Acquire);
        if port == 0 {
            return;
        }
        let Some(socket) = self.socket.load_full() else {
            return;
        };

        let seq = self.counter.fetch_add(1, Ordering::AcqRel);
        let datagram = packet::encode(kind, seq, payload);
        let to = SocketAddrV4::new(Ipv4Addr::from(address), port);
        if let Err(e) = socket.send_to(&datagram, to) {
            log::debug!("[TUNNEL] send {:?} to {} failed: {}", kind, to, e);
        }
    }

    fn forward_frame(&self, frame: &[u8]) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        if frame.len() > MAX_FRAME_PAYLOAD {
            log::error!(
                "[TUNNEL] oversized frame from radio module ({} bytes), dropped",
                frame.len()
            );
            return;
        }
        self.send_message(PacketType::Frame, frame);
    }

    /// Timeout check and keepalive pacing, run after every receive attempt.
    fn tick(&self, now: Instant, next_keepalive: &mut Instant) {
        if self.remote_port.load(Ordering::Acquire) == 0 {
            return;
        }

        let timeout = self.config.keepalive_timeout().as_micros() as u64;
        if self.micros(now) > self.last_keepalive.load(Ordering::Acquire) + timeout {
            self.clear_session();
            self.link.set_led(true, false, false);
            log::warn!("[TUNNEL] connection timed out");
        }

        if now >= *next_keepalive {
            *next_keepalive = now + self.config.keepalive_interval();
            self.send_message(PacketType::KeepAlive, &[]);
        }
    }
}

/// Forwards link frames to the session without keeping it alive.
struct TunnelHandler(Weak<Inner>);

impl FrameHandler for TunnelHandler {
    fn handle_frame(&self, frame: &[u8]) {
        if let Some(inner) = self.0.upgrade() {
            inner.forward_frame(frame);
        }
    }
}

/// Single-peer UDP tunnel in front of a [`ModuleLink`].
pub struct TunnelSession {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelSession {
    pub fn new(link: Arc<ModuleLink>, config: &TunnelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                config: config.clone(),
                socket: ArcSwapOption::empty(),
                running: AtomicBool::new(false),
                remote_address: AtomicU32::new(0),
                remote_port: AtomicU16::new(0),
                connected: AtomicBool::new(false),
                counter: AtomicU8::new(0),
                last_keepalive: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Bind the socket, take over the link's frame stream and start the
    /// session loop.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(LinkError::AlreadyStarted);
        }

        let socket = match bind_socket(&self.inner.config) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.inner.socket.store(Some(socket.clone()));

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name("hmrf-tunnel".into())
            .spawn(move || session_loop(&inner, &socket));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.socket.store(None);
                self.inner.running.store(false, Ordering::Release);
                return Err(LinkError::Spawn(e.to_string()));
            }
        };
        *self.thread.lock() = Some(handle);

        let handler: Arc<dyn FrameHandler> = Arc::new(TunnelHandler(Arc::downgrade(&self.inner)));
        self.inner.link.set_frame_handler(Some(handler), false);

        log::info!("[TUNNEL] listening on {}", self.inner.config.bind_addr());
        Ok(())
    }

    /// Release the link's frame stream and stop the session loop.
    pub fn stop(&self) {
        if !self.inner.running.load(Ordering::Acquire) {
            return;
        }

        self.inner.link.set_frame_handler(None, false);
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!("[TUNNEL] session thread panicked");
            }
        }
        self.inner.socket.store(None);
        self.inner.clear_session();

        log::info!("[TUNNEL] stopped");
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .socket
            .load_full()
            .and_then(|s| s.local_addr().ok())
    }

    /// Peer of the current session, if any.
    pub fn connected_remote_address(&self) -> Option<SocketAddrV4> {
        let port = self.inner.remote_port.load(Ordering::Acquire);
        let address = self.inner.remote_address.load(Ordering::Acquire);
        (port != 0).then(|| SocketAddrV4::new(Ipv4Addr::from(address), port))
    }

    /// Whether module frames are currently forwarded to the peer.
    pub fn is_tunneling(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_socket(config: &TunnelConfig) -> Result<UdpSocket> {
    let addr: SocketAddr = config.bind_addr().into();
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(config.poll_interval()))?;
    Ok(socket)
}

fn session_loop(inner: &Inner, socket: &UdpSocket) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut next_keepalive = Instant::now();

    while inner.running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if let Err(e) = inner.handle_packet(&buf[..len], from) {
                    log::warn!("[TUNNEL] dropped packet from {}: {}", from, e);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                log::warn!("[TUNNEL] receive failed: {}", e);
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        inner.tick(Instant::now(), &mut next_keepalive);
    }

    log::debug!("[TUNNEL] session loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::led::RgbLed;
    use crate::testutil::{MockResetLine, MockUart};
    use crate::uart::UartEvent;

    const PEER_A: &str = "192.0.2.1:4000";
    const PEER_B: &str = "192.0.2.2:5000";

    struct Fixture {
        uart: MockUart,
        reset: MockResetLine,
        leds: RgbLed,
        link: Arc<ModuleLink>,
    }

    fn fixture() -> Fixture {
        let mut config = BridgeConfig::default();
        config.detection.enabled = false;
        config.reset.pulse_ms = 1;
        let uart = MockUart::new();
        let reset = MockResetLine::default();
        let leds = RgbLed::logging().unwrap();
        let link = Arc::new(ModuleLink::new(
            &config,
            Box::new(uart.clone()),
            Box::new(reset.clone()),
            leds.clone(),
        ));
        link.start().unwrap();
        Fixture {
            uart,
            reset,
            leds,
            link,
        }
    }

    fn loopback_config() -> TunnelConfig {
        TunnelConfig {
            bind_address: Ipv4Addr::LOCALHOST,
            port: 0,
            ..TunnelConfig::default()
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn connect(session: &TunnelSession, from: &str) {
        let pkt = packet::encode(PacketType::Connect, 7, &[PROTOCOL_VERSION]);
        session.inner.handle_packet(&pkt, addr(from)).unwrap();
    }

    #[test]
    fn test_connect_opens_session() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());

        assert_eq!(session.connected_remote_address(), None);
        connect(&session, PEER_A);

        assert_eq!(session.connected_remote_address(), Some("192.0.2.1:4000".parse().unwrap()));
        assert!(!session.is_tunneling());
        assert_eq!(fx.leds.get(), (true, true, false));
    }

    #[test]
    fn test_connect_with_wrong_version_ignored() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());

        let pkt = packet::encode(PacketType::Connect, 0, &[PROTOCOL_VERSION + 1]);
        assert!(session.inner.handle_packet(&pkt, addr(PEER_A)).is_ok());
        assert_eq!(session.connected_remote_address(), None);
    }

    #[test]
    fn test_new_peer_replaces_session() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());

        connect(&session, PEER_A);
        let start = packet::encode(PacketType::StartTunnel, 1, &[]);
        session.inner.handle_packet(&start, addr(PEER_A)).unwrap();
        assert!(session.is_tunneling());

        connect(&session, PEER_B);
        assert_eq!(session.connected_remote_address(), Some("192.0.2.2:5000".parse().unwrap()));
        assert!(!session.is_tunneling());

        fx.uart.clear_written();
        let frame = packet::encode(PacketType::Frame, 2, &[0xFD, 0x00, 0x00, 0x01, 0x02]);
        assert_eq!(
            session.inner.handle_packet(&frame, addr(PEER_A)),
            Err(PacketError::InvalidAddress(addr(PEER_A)))
        );
        assert!(fx.uart.written().is_empty());

        session.inner.handle_packet(&frame, addr(PEER_B)).unwrap();
        assert_eq!(fx.uart.written(), vec![0xFD, 0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_check_order() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());

        assert_eq!(
            session.inner.handle_packet(&[2, 0, 0], addr(PEER_A)),
            Err(PacketError::TooShort(3))
        );

        // Address is checked before the CRC
        let mut bad = packet::encode(PacketType::KeepAlive, 0, &[]);
        bad[3] ^= 0xFF;
        assert_eq!(
            session.inner.handle_packet(&bad, addr(PEER_A)),
            Err(PacketError::InvalidAddress(addr(PEER_A)))
        );

        connect(&session, PEER_A);
        assert!(matches!(
            session.inner.handle_packet(&bad, addr(PEER_A)),
            Err(PacketError::CrcMismatch { .. })
        ));

        // A well-formed CRC refreshes the keepalive even for a bad length
        session.inner.last_keepalive.store(0, Ordering::Release);
        let reset = packet::encode(PacketType::Reset, 0, &[0x00]);
        assert!(matches!(
            session.inner.handle_packet(&reset, addr(PEER_A)),
            Err(PacketError::InvalidLength { .. })
        ));
        assert!(session.inner.last_keepalive.load(Ordering::Acquire) > 0);
    }

    #[test]
    fn test_inbound_connect_must_be_a_request() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());

        // An acknowledge-shaped Connect decodes but never opens a session
        let ack = packet::encode(PacketType::Connect, 3, &[PROTOCOL_VERSION, 3]);
        assert!(Packet::decode(&ack).is_ok());
        assert_eq!(
            session.inner.handle_packet(&ack, addr(PEER_A)),
            Err(PacketError::InvalidLength {
                kind: PacketType::Connect,
                len: packet::CONNECT_ACK_LEN
            })
        );
        assert_eq!(session.connected_remote_address(), None);
    }

    /// Session with a bound socket but no loop thread, so the test drives
    /// `tick` alone.
    fn manual_session(fx: &Fixture) -> TunnelSession {
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        session.inner.socket.store(Some(Arc::new(socket)));
        session
    }

    #[test]
    fn test_tick_sends_keepalive_once_per_interval() {
        let fx = fixture();
        let session = manual_session(&fx);
        let peer = peer_socket();

        let pkt = packet::encode(PacketType::Connect, 9, &[PROTOCOL_VERSION]);
        session
            .inner
            .handle_packet(&pkt, peer.local_addr().unwrap())
            .unwrap();
        assert!(recv_kind(&peer, PacketType::Connect, 5).is_some());

        let now = Instant::now();
        let mut next = now;
        session.inner.tick(now, &mut next);
        assert_eq!(next, now + session.inner.config.keepalive_interval());
        let keepalive = recv_kind(&peer, PacketType::KeepAlive, 5).unwrap();
        assert!(Packet::decode(&keepalive).unwrap().payload.is_empty());

        // Not due yet: nothing more on the wire
        session.inner.tick(now + Duration::from_millis(500), &mut next);
        assert!(recv_kind(&peer, PacketType::KeepAlive, 2).is_none());
        assert!(session.connected_remote_address().is_some());
    }

    #[test]
    fn test_tick_without_session_sends_nothing() {
        let fx = fixture();
        let session = manual_session(&fx);
        let peer = peer_socket();

        let now = Instant::now();
        let mut next = now;
        session.inner.tick(now, &mut next);
        assert_eq!(next, now);

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        assert!(peer.recv(&mut buf).is_err());
    }

    #[test]
    fn test_control_packets() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());
        connect(&session, PEER_A);
        let from = addr(PEER_A);

        let led = packet::encode(PacketType::SetLed, 1, &[0b101]);
        session.inner.handle_packet(&led, from).unwrap();
        assert_eq!(fx.leds.get(), (true, false, true));

        let before = fx.reset.levels().len();
        let reset = packet::encode(PacketType::Reset, 2, &[]);
        session.inner.handle_packet(&reset, from).unwrap();
        assert_eq!(fx.reset.levels()[before..], [true, false]);

        let start = packet::encode(PacketType::StartTunnel, 3, &[]);
        session.inner.handle_packet(&start, from).unwrap();
        assert!(session.is_tunneling());
        let stop = packet::encode(PacketType::StopTunnel, 4, &[]);
        session.inner.handle_packet(&stop, from).unwrap();
        assert!(!session.is_tunneling());

        let bye = packet::encode(PacketType::Disconnect, 5, &[]);
        session.inner.handle_packet(&bye, from).unwrap();
        assert_eq!(session.connected_remote_address(), None);
        assert_eq!(fx.leds.get(), (false, false, false));
    }

    #[test]
    fn test_keepalive_timeout() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());
        connect(&session, PEER_A);
        let start = packet::encode(PacketType::StartTunnel, 1, &[]);
        session.inner.handle_packet(&start, addr(PEER_A)).unwrap();

        let now = Instant::now();
        let mut next = now + Duration::from_secs(60);

        session.inner.tick(now + Duration::from_millis(1000), &mut next);
        assert!(session.connected_remote_address().is_some());

        session.inner.tick(now + Duration::from_millis(1600), &mut next);
        assert_eq!(session.connected_remote_address(), None);
        assert!(!session.is_tunneling());
        assert_eq!(fx.leds.get(), (true, false, false));
    }

    fn peer_socket() -> UdpSocket {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        peer
    }

    /// Next datagram of `kind`, skipping keepalives and other traffic.
    fn recv_kind(peer: &UdpSocket, kind: PacketType, attempts: usize) -> Option<Vec<u8>> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        for _ in 0..attempts {
            if let Ok(len) = peer.recv(&mut buf) {
                let data = buf[..len].to_vec();
                if Packet::decode(&data).map(|p| p.kind) == Ok(kind) {
                    return Some(data);
                }
            }
        }
        None
    }

    #[test]
    fn test_frames_over_udp() {
        let fx = fixture();
        let session = TunnelSession::new(fx.link.clone(), &loopback_config());
        session.start().unwrap();
        let server = session.local_addr().unwrap();

        let peer = peer_socket();
        peer.send_to(&packet::encode(PacketType::Connect, 0x33, &[PROTOCOL_VERSION]), server)
            .unwrap();
        let ack = recv_kind(&peer, PacketType::Connect, 10).unwrap();
        assert_eq!(Packet::decode(&ack).unwrap().payload, &[PROTOCOL_VERSION, 0x33]);

        // Not forwarded before StartTunnel
        let frame = vec![0xFD, 0x00, 0x01, 0x42, 0x00, 0x00];
        fx.uart.inject(UartEvent::Data(frame.clone()));
        assert!(recv_kind(&peer, PacketType::Frame, 3).is_none());

        peer.send_to(&packet::encode(PacketType::StartTunnel, 1, &[]), server)
            .unwrap();
        while !session.is_tunneling() {
            std::thread::sleep(Duration::from_millis(5));
        }

        fx.uart.inject(UartEvent::Data(frame.clone()));
        let pkt = recv_kind(&peer, PacketType::Frame, 10).unwrap();
        assert_eq!(Packet::decode(&pkt).unwrap().payload, frame.as_slice());

        let oversized = vec![0x11; MAX_FRAME_PAYLOAD + 1];
        session.inner.forward_frame(&oversized);
        session.inner.forward_frame(&[0x22; MAX_FRAME_PAYLOAD]);
        let pkt = recv_kind(&peer, PacketType::Frame, 10).unwrap();
        assert_eq!(Packet::decode(&pkt).unwrap().payload.len(), MAX_FRAME_PAYLOAD);

        session.stop();
        assert_eq!(session.connected_remote_address(), None);
    }
}
