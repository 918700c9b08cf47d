//! Central owner of mutable server state (spec.md §5). One `Hub`, shared as `Rc<RefCell<Hub>>`
//! across every task spawned onto the single-threaded `LocalSet`, mirroring the teacher's single
//! `mio::Poll`-driven reactor owning all channel state without internal locking — there is
//! exactly one thread, so a `RefCell` borrow can never contend.

use crate::pki_manager::PkiManager;
use reflector_core::{
    ClientRegistry, ConfigChange, ConfigError, DispatchEffect, Dispatcher, DynamicConfig, Filter,
    SessionHandle, TalkGroupConfig, UserDirectory,
};
use reflector_proto::Message;
use regex::Regex;
use slog::{warn, Logger};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub type SharedHub = Rc<RefCell<Hub>>;

/// Something a connection task should do that didn't originate from its own inbound frame —
/// a broadcast fan-out landed on it, or the reactor wants it gone.
pub enum OutboundEvent {
    Tcp(Message),
    Disconnect,
}

pub struct Hub {
    pub registry: ClientRegistry,
    pub dispatcher: Dispatcher,
    pub config: DynamicConfig,
    pub users: UserDirectory,
    pub pki: PkiManager,
    pub logger: Logger,
    /// One outbound channel per live session, so a broadcast fan-out (running on whichever task
    /// triggered it) can hand a message to the task that actually owns that session's socket —
    /// grounded on the `mpsc::UnboundedSender` fan-out pattern used for transport events in
    /// `secure-legion-core::network::tor`.
    outboxes: HashMap<SessionHandle, mpsc::UnboundedSender<OutboundEvent>>,
    /// Set once by `main` after the UDP socket task is spawned; lets dispatch-effect handling
    /// (flush-samples) hand pre-encrypted datagrams to the single task that owns the UDP socket.
    udp_tx: Option<mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>>,
    /// Callsign a pending CSR was filed under while its owning session waits on operator sign-off
    /// (`CA SIGN`), so the console task can find the right session to hand `MsgClientCert` to
    /// once `sign_pending` returns (spec.md §4.5 S6, §4.10).
    pending_csr_sessions: HashMap<String, SessionHandle>,
    /// Advertised in `MsgServerInfo` (spec.md §4.4 post-authentication flow). Set once from
    /// `Global::codecs` at startup; not runtime-mutable.
    pub codecs: Vec<String>,
}

impl Hub {
    pub fn new(
        dispatcher: Dispatcher,
        users: UserDirectory,
        pki: PkiManager,
        logger: Logger,
        codecs: Vec<String>,
    ) -> SharedHub {
        Rc::new(RefCell::new(Hub {
            registry: ClientRegistry::new(),
            dispatcher,
            config: DynamicConfig::new(),
            users,
            pki,
            logger,
            outboxes: HashMap::new(),
            udp_tx: None,
            pending_csr_sessions: HashMap::new(),
            codecs,
        }))
    }

    pub fn set_udp_sender(&mut self, tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>) {
        self.udp_tx = Some(tx);
    }

    pub fn record_pending_csr_session(&mut self, cn: String, handle: SessionHandle) {
        self.pending_csr_sessions.insert(cn, handle);
    }

    pub fn take_pending_csr_session(&mut self, cn: &str) -> Option<SessionHandle> {
        self.pending_csr_sessions.remove(cn)
    }

    pub fn register_outbox(&mut self, handle: SessionHandle, tx: mpsc::UnboundedSender<OutboundEvent>) {
        self.outboxes.insert(handle, tx);
    }

    pub fn unregister_outbox(&mut self, handle: SessionHandle) {
        self.outboxes.remove(&handle);
    }

    pub fn send_to(&self, handle: SessionHandle, msg: Message) {
        if let Some(tx) = self.outboxes.get(&handle) {
            let _ = tx.send(OutboundEvent::Tcp(msg));
        }
    }

    pub fn disconnect(&self, handle: SessionHandle) {
        if let Some(tx) = self.outboxes.get(&handle) {
            let _ = tx.send(OutboundEvent::Disconnect);
        }
    }

    /// Iterates the registry once via `reflector_core::broadcast`, handing a clone of `msg` to
    /// every matching session's outbox (spec.md §4.8 `broadcastMsg`).
    pub fn broadcast_tcp(&self, filter: &Filter, msg: Message) {
        reflector_core::broadcast(&self.registry, filter, |handle, _session| {
            self.send_to(handle, msg.clone());
        });
    }

    /// Turns dispatcher output into actual outbound traffic (spec.md §4.7/§4.8). This is the
    /// only place that knows how a `DispatchEffect` maps onto wire messages; callers (the TCP
    /// session task handling `MsgSelectTg`/`MsgRequestQsy`, the UDP task handling audio, the 1Hz
    /// timer) just forward whatever the dispatcher returned.
    pub fn apply_dispatch_effects(&mut self, effects: Vec<DispatchEffect>) {
        for effect in effects {
            match effect {
                DispatchEffect::TalkerStarted { tg, callsign, is_v1_default_tg } => {
                    let filter = Filter::Tg(tg)
                        .or(Filter::MonitoringTg(tg))
                        .and(Filter::ProtoVersionAtLeast { major: 2 });
                    self.broadcast_tcp(&filter, Message::TalkerStart { tg, callsign: callsign.clone() });
                    if is_v1_default_tg {
                        let v1_filter = Filter::Tg(tg).and(Filter::ProtoVersionInRange { min_major: 1, max_major: 1 });
                        self.broadcast_tcp(&v1_filter, Message::TalkerStartV1 { callsign });
                    }
                }
                DispatchEffect::TalkerStopped { tg, callsign, is_v1_default_tg } => {
                    let filter = Filter::Tg(tg)
                        .or(Filter::MonitoringTg(tg))
                        .and(Filter::ProtoVersionAtLeast { major: 2 });
                    self.broadcast_tcp(&filter, Message::TalkerStop { tg, callsign: callsign.clone() });
                    if is_v1_default_tg {
                        let v1_filter = Filter::Tg(tg).and(Filter::ProtoVersionInRange { min_major: 1, max_major: 1 });
                        self.broadcast_tcp(&v1_filter, Message::TalkerStopV1 { callsign });
                    }
                }
                DispatchEffect::FlushSamples { tg } => self.flush_udp_samples(tg),
                DispatchEffect::RequestQsy { src_tg, target_tg } => {
                    let filter = Filter::Tg(src_tg).and(Filter::ProtoVersionAtLeast { major: 2 });
                    self.broadcast_tcp(&filter, Message::RequestQsy { tg: target_tg });
                }
                DispatchEffect::Block { handle, duration } => {
                    if let Some(session) = self.registry.get_mut(handle) {
                        session.block_for(Instant::now(), duration);
                    }
                }
            }
        }
    }

    /// Sends `MsgUdpFlushSamples` (UDP type 102) to every member of `tg` that has a bound UDP
    /// peer, encrypted (or legacy-framed) per that member's own negotiated transport.
    fn flush_udp_samples(&mut self, tg: u32) {
        let members: Vec<SessionHandle> = self.dispatcher.members(tg).collect();
        for handle in members {
            self.send_udp_to(handle, reflector_proto::types::UDP_FLUSH_SAMPLES, &[]);
        }
    }

    /// Encodes and sends one UDP payload to `handle`'s bound peer address, if any. `payload` is
    /// everything after the `u16` UDP type code.
    pub fn send_udp_to(&mut self, handle: SessionHandle, udp_type: u16, payload: &[u8]) {
        let Some(udp_tx) = self.udp_tx.clone() else { return };
        let session = match self.registry.get_mut(handle) {
            Some(s) => s,
            None => return,
        };
        let Some(peer) = session.udp_peer else { return };

        let mut plaintext = Vec::with_capacity(2 + payload.len());
        plaintext.extend_from_slice(&udp_type.to_be_bytes());
        plaintext.extend_from_slice(payload);

        let datagram = if session.proto.map_or(false, |p| p.is_legacy()) {
            let sequence = session.udp_tx_counter as u16;
            session.udp_tx_counter = session.udp_tx_counter.wrapping_add(1);
            reflector_net::udp::LegacyHeader { client_id: session.client_id, sequence }.write(&plaintext)
        } else {
            let counter = session.udp_tx_counter;
            session.udp_tx_counter += 1;
            let iv = reflector_net::udp::compose_iv(&session.udp_iv_rand, session.client_id, counter);
            reflector_net::udp::encrypt(&session.udp_key, &iv, counter, &[], &plaintext)
        };
        session.mark_udp_tx(Instant::now());

        let _ = udp_tx.send((peer, datagram));
    }

    /// Forwards one talker's audio samples to every other member of `tg` (spec.md §4.7 "no
    /// mixing" — only the current talker's stream is ever relayed). `except` is the talker's own
    /// handle so it never receives its own audio back.
    pub fn broadcast_udp_audio(&mut self, tg: u32, except: SessionHandle, samples: &[u8]) {
        let members: Vec<SessionHandle> = self.dispatcher.members(tg).filter(|h| *h != except).collect();
        for handle in members {
            self.send_udp_to(handle, reflector_proto::types::UDP_AUDIO, samples);
        }
    }

    /// Applies one `CFG <section> <tag> <value>` operator command (spec.md §4.10), routing
    /// typed changes through to the dispatcher as needed. Unrecognized tags are still recorded
    /// in `config` (read back via `CFG <section> <tag>` with no value) but have no runtime
    /// effect.
    pub fn apply_config(&mut self, section: &str, tag: &str, value: &str) -> Result<(), ConfigError> {
        let change = self.config.set(section, tag, value)?;
        match change {
            ConfigChange::SqlTimeout(d) => self.dispatcher.sql_timeout = d,
            ConfigChange::SqlTimeoutBlocktime(d) => self.dispatcher.sql_timeout_blocktime = d,
            ConfigChange::RandomQsyRange { lo, count } => self.dispatcher.reshape_qsy_pool(lo, count),
            ConfigChange::TgForV1Clients(tg) => self.dispatcher.v1_default_tg = tg,
            ConfigChange::TalkGroupTag { tg, tag, value } => self.apply_tg_tag(tg, &tag, &value),
            ConfigChange::AcceptCallsign(pattern) => {
                if let Err(e) = self.pki.set_accept_pattern(&pattern) {
                    warn!(self.logger, "invalid ACCEPT_CALLSIGN regex"; "error" => %e);
                }
            }
            ConfigChange::RejectCallsign(pattern) => {
                if let Err(e) = self.pki.set_reject_pattern(&pattern) {
                    warn!(self.logger, "invalid REJECT_CALLSIGN regex"; "error" => %e);
                }
            }
            ConfigChange::ListenPort(_) | ConfigChange::Unrecognized => {}
        }
        Ok(())
    }

    fn apply_tg_tag(&mut self, tg: u32, tag: &str, value: &str) {
        match tag {
            "ALLOW" => match Regex::new(value) {
                Ok(allow) => {
                    let mut cfg = self.dispatcher.tg_config(tg);
                    cfg.allow = allow;
                    self.dispatcher.set_tg_config(tg, cfg);
                }
                Err(e) => warn!(self.logger, "invalid ALLOW regex for TG"; "tg" => tg, "error" => %e),
            },
            "AUTO_QSY_AFTER" => match value.parse::<u64>() {
                Ok(secs) => {
                    let mut cfg = self.dispatcher.tg_config(tg);
                    cfg.auto_qsy_after = Some(Duration::from_secs(secs));
                    self.dispatcher.set_tg_config(tg, cfg);
                }
                Err(_) => warn!(self.logger, "invalid AUTO_QSY_AFTER value"; "tg" => tg, "value" => value),
            },
            "SHOW_ACTIVITY" => {
                let mut cfg = self.dispatcher.tg_config(tg);
                cfg.show_activity = value.eq_ignore_ascii_case("true") || value == "1";
                self.dispatcher.set_tg_config(tg, cfg);
            }
            _ => {}
        }
    }

    /// Seeds the dispatcher's per-TG config from the on-disk `[tg.<n>]` sections at startup
    /// (spec.md §6), before any operator `CFG` command has run.
    pub fn load_tg_settings(&mut self, tgs: &std::collections::HashMap<String, crate::settings::TgSettings>) {
        for (key, settings) in tgs {
            let tg: u32 = match key.parse() {
                Ok(tg) => tg,
                Err(_) => {
                    warn!(self.logger, "ignoring non-numeric [tg.*] section"; "key" => key);
                    continue;
                }
            };
            let allow = Regex::new(&settings.allow).unwrap_or_else(|_| Regex::new(".*").unwrap());
            self.dispatcher.set_tg_config(
                tg,
                TalkGroupConfig {
                    allow,
                    auto_qsy_after: settings.auto_qsy_after.map(Duration::from_secs),
                    show_activity: settings.show_activity,
                },
            );
        }
    }
}
