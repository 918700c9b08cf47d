//! Per-connection session state (spec.md §3 "Session", §4.4 state machine).
//!
//! This module is transport-agnostic: it holds the data a connected node accumulates and the
//! phase it is in, plus the pure rules for which phase transitions and which admin messages are
//! legal in which phase. Actually performing I/O (reading frames, writing replies, running the
//! TLS handshake, invoking the PKI) is `reflector-server`'s job; this module only tells it what
//! is and isn't allowed to happen next.

use reflector_net::udp::ReplayTracker;
use reflector_proto::{RxStatus, TxStatus};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Opaque handle into a `ClientRegistry`'s session slab. Stable for the lifetime of one
/// connection; never reused while the session it names is still live.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionHandle(pub(crate) usize);

/// Session phase, driven by inbound frames (spec.md §4.4).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    ExpectProtoVer,
    ExpectStartEncryption,
    ExpectSslConnReady,
    ExpectCsr,
    ExpectAuthResponse,
    Connected,
    ExpectDisconnect,
}

impl Phase {
    /// Whether the session has finished authenticating and may participate in talk groups,
    /// telemetry and node-info exchange (spec.md §8 invariant 6).
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, Phase::Connected)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProtoVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtoVersion {
    #[inline]
    pub fn is_legacy(self) -> bool {
        self.major < 3
    }

    /// Whether talker-start/stop notifications should be sent to a session of this version
    /// (spec.md §4.7: filtered by protocol version >= 2.0).
    #[inline]
    pub fn at_least_v2(self) -> bool {
        self.major >= 2
    }
}

/// One connected node's state (spec.md §3). Owned exclusively by the `ClientRegistry`.
#[derive(Debug)]
pub struct Session {
    pub client_id: u16,
    pub tcp_peer: SocketAddr,
    pub proto: Option<ProtoVersion>,
    pub callsign: String,
    pub phase: Phase,
    /// Set once the TLS/legacy handshake resolves the peer's identity but before `Connected`;
    /// tracks whether a protocol-version downgrade notice has already been sent, per spec.md §8
    /// boundary behavior (a second over-version `MsgProtoVer` after the downgrade is fatal).
    pub downgrade_sent: bool,

    pub udp_peer: Option<SocketAddr>,
    pub udp_key: [u8; 16],
    pub udp_iv_rand: [u8; 5],
    pub udp_tx_counter: u32,
    pub udp_replay: ReplayTracker,

    pub last_tcp_rx: Instant,
    pub last_tcp_tx: Instant,
    pub last_udp_rx: Option<Instant>,
    pub last_udp_tx: Option<Instant>,

    pub blocked_until: Option<Instant>,

    pub current_tg: u32,
    pub monitored_tgs: HashSet<u32>,

    pub rx_status: HashMap<u8, RxStatus>,
    pub tx_status: HashMap<u8, TxStatus>,
    pub node_info: Option<String>,

    /// Deadline at which the peer's client certificate should be considered due for renewal.
    /// `None` until a certificate has actually been issued to this peer.
    pub cert_renew_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: u16, tcp_peer: SocketAddr, now: Instant) -> Self {
        Session {
            client_id,
            tcp_peer,
            proto: None,
            callsign: String::new(),
            phase: Phase::ExpectProtoVer,
            downgrade_sent: false,
            udp_peer: None,
            udp_key: [0u8; 16],
            udp_iv_rand: [0u8; 5],
            udp_tx_counter: 0,
            udp_replay: ReplayTracker::new(),
            last_tcp_rx: now,
            last_tcp_tx: now,
            last_udp_rx: None,
            last_udp_tx: None,
            blocked_until: None,
            current_tg: 0,
            monitored_tgs: HashSet::new(),
            rx_status: HashMap::new(),
            tx_status: HashMap::new(),
            node_info: None,
            cert_renew_at: None,
        }
    }

    #[inline]
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.map_or(false, |deadline| now < deadline)
    }

    #[inline]
    pub fn block_for(&mut self, now: Instant, duration: Duration) {
        self.blocked_until = Some(now + duration);
    }

    pub const TCP_HEARTBEAT_AFTER: Duration = Duration::from_secs(10);
    pub const TCP_DEAD_AFTER: Duration = Duration::from_secs(15);
    pub const UDP_HEARTBEAT_AFTER: Duration = Duration::from_secs(15);
    pub const UDP_DEAD_AFTER: Duration = Duration::from_secs(120);

    #[inline]
    pub fn mark_tcp_rx(&mut self, now: Instant) {
        self.last_tcp_rx = now;
    }

    #[inline]
    pub fn mark_tcp_tx(&mut self, now: Instant) {
        self.last_tcp_tx = now;
    }

    #[inline]
    pub fn mark_udp_rx(&mut self, now: Instant) {
        self.last_udp_rx = Some(now);
    }

    #[inline]
    pub fn mark_udp_tx(&mut self, now: Instant) {
        self.last_udp_tx = Some(now);
    }

    #[inline]
    pub fn tcp_heartbeat_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_tcp_tx) >= Self::TCP_HEARTBEAT_AFTER
    }

    #[inline]
    pub fn tcp_is_dead(&self, now: Instant) -> bool {
        now.duration_since(self.last_tcp_rx) >= Self::TCP_DEAD_AFTER
    }

    #[inline]
    pub fn udp_heartbeat_due(&self, now: Instant) -> bool {
        self.last_udp_tx
            .map_or(true, |t| now.duration_since(t) >= Self::UDP_HEARTBEAT_AFTER)
    }

    /// A missed UDP register is tolerated (spec.md §4.4): if UDP never bound, it is never
    /// considered dead.
    #[inline]
    pub fn udp_is_dead(&self, now: Instant) -> bool {
        self.last_udp_rx
            .map_or(false, |t| now.duration_since(t) >= Self::UDP_DEAD_AFTER)
    }
}

/// Which admin message types (spec.md §4.3) are legal to *receive* in a given phase. User-level
/// messages (type >= 100) are only legal once `Connected`.
pub fn admin_message_allowed(phase: Phase, msg_type: u16) -> bool {
    use reflector_proto::types::*;

    match phase {
        Phase::ExpectProtoVer => msg_type == PROTO_VER,
        Phase::ExpectStartEncryption => matches!(msg_type, CA_BUNDLE_REQUEST | START_ENCRYPTION_REQUEST),
        Phase::ExpectSslConnReady => false, // driven by TLS handshake completion, not a frame
        Phase::ExpectCsr => msg_type == CLIENT_CSR,
        Phase::ExpectAuthResponse => msg_type == AUTH_RESPONSE,
        // A CONNECTED client may also re-submit a certificate signing request (spec.md §4.5
        // client cert renewal, S6), outside the otherwise-user-level (>=100) message range.
        Phase::Connected => msg_type >= 100 || msg_type == HEARTBEAT || msg_type == CLIENT_CSR,
        Phase::ExpectDisconnect => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_never_considered_dead_before_first_datagram() {
        let session = Session::new(1, "127.0.0.1:1000".parse().unwrap(), Instant::now());
        assert!(!session.udp_is_dead(Instant::now() + Duration::from_secs(1000)));
    }

    #[test]
    fn tcp_heartbeat_and_dead_thresholds() {
        let now = Instant::now();
        let mut session = Session::new(1, "127.0.0.1:1000".parse().unwrap(), now);
        assert!(!session.tcp_heartbeat_due(now));
        assert!(session.tcp_heartbeat_due(now + Duration::from_secs(11)));
        assert!(!session.tcp_is_dead(now + Duration::from_secs(11)));
        assert!(session.tcp_is_dead(now + Duration::from_secs(16)));
        session.mark_tcp_rx(now + Duration::from_secs(11));
        assert!(!session.tcp_is_dead(now + Duration::from_secs(20)));
    }

    #[test]
    fn blocked_session_expires() {
        let now = Instant::now();
        let mut session = Session::new(1, "127.0.0.1:1000".parse().unwrap(), now);
        session.block_for(now, Duration::from_secs(60));
        assert!(session.is_blocked(now));
        assert!(session.is_blocked(now + Duration::from_secs(59)));
        assert!(!session.is_blocked(now + Duration::from_secs(60)));
    }

    #[test]
    fn admin_message_gating_per_phase() {
        use reflector_proto::types;
        assert!(admin_message_allowed(Phase::ExpectProtoVer, types::PROTO_VER));
        assert!(!admin_message_allowed(Phase::ExpectProtoVer, types::CLIENT_CSR));
        assert!(admin_message_allowed(Phase::Connected, types::SELECT_TG));
        assert!(!admin_message_allowed(Phase::ExpectCsr, types::SELECT_TG));
    }
}
