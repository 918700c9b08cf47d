//! Process entry point (spec.md §5). Builds every long-lived service once, then drives TCP
//! accept, UDP I/O, 1Hz housekeeping and the operator console from a single current-thread tokio
//! runtime plus `LocalSet`, mirroring the teacher's single `mio::Poll`-driven reactor: one thread
//! owns all mutable state, so nothing here needs a lock.

mod cli;
mod conn;
mod pki_manager;
mod session_task;
mod settings;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use pki_manager::PkiManager;
use reflector_core::{Dispatcher, Session, SessionHandle, UserDirectory};
use reflector_net::{logging, tls, udp};
use reflector_proto::UdpMessage;
use settings::Settings;
use slog::{info, warn, Logger};
use state::{Hub, SharedHub};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let settings = Settings::load(&cli.config).context("loading config file")?;

    let logger = match &cli.logfile {
        Some(path) => logging::init_file(&settings.global.log_level, path),
        None => logging::init(&settings.global.log_level, true),
    };

    if let Some(pidfile) = &cli.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id())).context("writing pidfile")?;
    }
    if cli.daemon {
        warn!(logger, "--daemon is not implemented; run this binary under a supervisor instead");
    }
    if let Some(user) = &cli.user {
        warn!(logger, "--user privilege drop is not implemented"; "user" => user);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(settings, logger))
}

async fn run(settings: Settings, logger: Logger) -> Result<()> {
    let server_cn = settings
        .server_cert
        .common_name
        .clone()
        .unwrap_or_else(|| "reflector".to_string());
    let pki = PkiManager::bootstrap(&settings, &server_cn, &logger).context("bootstrapping PKI")?;

    let trusted_ca = pki.trusted_ca_for_tls().context("loading trusted CA for TLS")?;
    let (cert_chain, key) = pki.server_cert_chain_for_tls().context("loading server TLS identity")?;
    let tls_config = tls::server_config(cert_chain, key, &trusted_ca).context("building TLS server config")?;
    let tls_acceptor = Arc::new(TlsAcceptor::from(tls_config));

    let mut users = UserDirectory::new();
    for (callsign, group) in &settings.users {
        users.set_user_group(callsign.clone(), group.clone());
    }
    for (group, secret) in &settings.passwords {
        users.set_group_secret(group.clone(), secret.clone());
    }

    let (qsy_lo, qsy_count) = parse_qsy_range(&settings.global.random_qsy_range)?;
    let mut dispatcher = Dispatcher::new(qsy_lo, qsy_count);
    dispatcher.sql_timeout = Duration::from_secs(settings.global.sql_timeout);
    dispatcher.sql_timeout_blocktime = Duration::from_secs(settings.global.sql_timeout_blocktime);
    dispatcher.v1_default_tg = settings.global.tg_for_v1_clients;

    let hub = Hub::new(dispatcher, users, pki, logger.clone(), settings.global.codecs.clone());
    hub.borrow_mut().load_tg_settings(&settings.tg);

    let listen_addr: SocketAddr = ("0.0.0.0", settings.global.listen_port)
        .to_socket_addrs_single()
        .context("resolving listen address")?;

    let tcp_listener = TcpListener::bind(listen_addr).await.context("binding TCP listener")?;
    let udp_socket = Arc::new(UdpSocket::bind(listen_addr).await.context("binding UDP socket")?);

    info!(logger, "reflector-server listening"; "addr" => %listen_addr);

    let (udp_tx, udp_rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();
    hub.borrow_mut().set_udp_sender(udp_tx);

    tokio::task::spawn_local(udp_writer_task(udp_socket.clone(), udp_rx));
    tokio::task::spawn_local(udp_reader_task(hub.clone(), udp_socket, logger.clone()));
    tokio::task::spawn_local(tick_task(hub.clone()));
    tokio::task::spawn_local(console_task(hub.clone()));

    accept_loop(hub, tcp_listener, tls_acceptor, logger).await
}

/// `addr:port` parsing has to go through a single fallible step since `"0.0.0.0"` as a `&str`
/// doesn't directly implement `ToSocketAddrs` the way a formatted string does.
trait SingleSocketAddr {
    fn to_socket_addrs_single(&self) -> std::io::Result<SocketAddr>;
}

impl SingleSocketAddr for (&str, u16) {
    fn to_socket_addrs_single(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        (self.0, self.1)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved"))
    }
}

fn parse_qsy_range(raw: &str) -> Result<(u32, u32)> {
    let (lo, count) = raw
        .split_once(':')
        .with_context(|| format!("RANDOM_QSY_RANGE {:?} must be formatted as `lo:count`", raw))?;
    Ok((
        lo.parse().context("RANDOM_QSY_RANGE lo")?,
        count.parse().context("RANDOM_QSY_RANGE count")?,
    ))
}

/// Accepts TCP connections forever, handing each one a freshly allocated client id and handle
/// before spawning its session task (spec.md §4.4, §4.6). Runs until the listener itself fails.
async fn accept_loop(
    hub: SharedHub,
    listener: TcpListener,
    tls_acceptor: Arc<TlsAcceptor>,
    logger: Logger,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accepting TCP connection")?;
        let _ = stream.set_nodelay(true);

        let client_id = {
            let hub_ref = hub.borrow();
            hub_ref.registry.allocate_client_id(&mut rand::thread_rng())
        };
        let client_id = match client_id {
            Ok(id) => id,
            Err(e) => {
                warn!(logger, "rejecting connection, client id space exhausted"; "peer" => %peer, "error" => %e);
                continue;
            }
        };

        let handle = {
            let mut hub_ref = hub.borrow_mut();
            hub_ref.registry.insert(Session::new(client_id, peer, Instant::now()))
        };

        let (tx, rx) = mpsc::unbounded_channel();
        hub.borrow_mut().register_outbox(handle, tx);

        info!(logger, "accepted connection"; "peer" => %peer, "client_id" => client_id);

        let hub = hub.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::task::spawn_local(async move {
            session_task::run(hub, handle, stream, peer, tls_acceptor, rx).await;
        });
    }
}

async fn udp_writer_task(socket: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
    while let Some((addr, datagram)) = rx.recv().await {
        let _ = socket.send_to(&datagram, addr).await;
    }
}

/// Reads every inbound UDP datagram and routes it to the session it belongs to, binding that
/// session's `(ip, port)` the first time one arrives (spec.md §4.2, §4.6).
async fn udp_reader_task(hub: SharedHub, socket: Arc<UdpSocket>, logger: Logger) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(logger, "udp recv error"; "error" => %e);
                continue;
            }
        };
        handle_udp_datagram(&hub, peer, &buf[..len]).await;
    }
}

async fn handle_udp_datagram(hub: &SharedHub, peer: SocketAddr, datagram: &[u8]) {
    let now = Instant::now();

    let bound = hub.borrow().registry.get_by_udp_addr(peer);
    let (handle, plaintext) = match bound {
        Some(handle) => {
            let legacy = hub
                .borrow()
                .registry
                .get(handle)
                .map_or(true, |s| s.proto.map_or(true, |p| p.is_legacy()));

            let plaintext = if legacy {
                match udp::LegacyHeader::read(datagram) {
                    Some((_hdr, payload)) => payload.to_vec(),
                    None => return,
                }
            } else {
                match decrypt_bound(hub, handle, datagram) {
                    Some(pt) => pt,
                    None => return,
                }
            };
            (handle, plaintext)
        }
        None => match locate_and_decrypt_unbound(hub, peer, datagram) {
            Some(pair) => pair,
            None => return,
        },
    };

    if plaintext.len() < 2 {
        return;
    }
    let msg_type = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    let body = &plaintext[2..];
    let msg = match UdpMessage::decode(msg_type, body) {
        Ok(m) => m,
        Err(_) => return,
    };

    if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
        session.mark_udp_rx(now);
    }

    match msg {
        UdpMessage::Heartbeat => {}
        UdpMessage::Audio { samples } => {
            let tg = hub.borrow().registry.get(handle).map(|s| s.current_tg).unwrap_or(0);
            if tg == 0 {
                return;
            }
            let mut hub_ref = hub.borrow_mut();
            let effects = hub_ref.dispatcher.handle_audio(&hub_ref.registry, handle, tg, now);
            hub_ref.apply_dispatch_effects(effects);
            if hub_ref.dispatcher.current_talker(tg) == Some(handle) {
                hub_ref.broadcast_udp_audio(tg, handle, &samples);
            }
        }
        UdpMessage::SignalStrengthValues { rxs } => {
            if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
                for rx in rxs {
                    session.rx_status.insert(rx.id, rx);
                }
            }
        }
        // Flush/all-flushed are server-to-client only (spec.md §4.7); a peer sending one back is
        // ignored rather than treated as an error.
        UdpMessage::FlushSamples | UdpMessage::AllSamplesFlushed => {}
    }
}

/// Already-bound session: the counter is read straight off the wire and checked against the
/// session's `ReplayTracker` (spec.md §4.2).
fn decrypt_bound(hub: &SharedHub, handle: SessionHandle, datagram: &[u8]) -> Option<Vec<u8>> {
    if datagram.len() < 4 {
        return None;
    }
    let counter = u32::from_be_bytes(datagram[0..4].try_into().ok()?);

    let (key, iv) = {
        let hub_ref = hub.borrow();
        let session = hub_ref.registry.get(handle)?;
        (session.udp_key, udp::compose_iv(&session.udp_iv_rand, session.client_id, counter))
    };

    let (counter, plaintext) = udp::decrypt(&key, &iv, datagram, &[]).ok()?;

    let mut hub_ref = hub.borrow_mut();
    let session = hub_ref.registry.get_mut(handle)?;
    match session.udp_replay.observe(counter) {
        udp::ReplayOutcome::Stale => None,
        udp::ReplayOutcome::InOrder | udp::ReplayOutcome::Gap { .. } => Some(plaintext),
    }
}

/// A datagram from an address the registry doesn't recognize. Legacy framing carries the client
/// id in plaintext, so that lookup is direct. The v3 AEAD envelope never puts the client id on
/// the wire (`reflector_net::udp::encrypt` only ever serializes `counter || ciphertext || tag`):
/// it's folded into the authenticated-but-unserialized AAD instead, so the registration datagram
/// is located by trying it against every session that has UDP key material but hasn't bound an
/// address yet, using that candidate's own client id as the AAD, until one authenticates
/// (spec.md §4.2 "the server can locate the session before (ip, port) has been bound to it").
fn locate_and_decrypt_unbound(hub: &SharedHub, peer: SocketAddr, datagram: &[u8]) -> Option<(SessionHandle, Vec<u8>)> {
    if let Some((hdr, payload)) = udp::LegacyHeader::read(datagram) {
        let legacy_handle = {
            let hub_ref = hub.borrow();
            hub_ref.registry.get_by_client_id(hdr.client_id).filter(|&h| {
                hub_ref.registry.get(h).map_or(false, |s| s.proto.map_or(false, |p| p.is_legacy()))
            })
        };
        if let Some(handle) = legacy_handle {
            let _ = hub.borrow_mut().registry.bind_udp_addr(handle, peer);
            return Some((handle, payload.to_vec()));
        }
    }

    let candidate = {
        let hub_ref = hub.borrow();
        hub_ref.registry.iter().find_map(|(h, s)| {
            if s.udp_peer.is_some() || s.proto.map_or(true, |p| p.is_legacy()) {
                return None;
            }
            let iv = udp::compose_iv(&s.udp_iv_rand, s.client_id, 0);
            let aad = s.client_id.to_be_bytes();
            udp::decrypt(&s.udp_key, &iv, datagram, &aad).ok().map(|(counter, plain)| (h, counter, plain))
        })
    };
    let (handle, counter, plaintext) = candidate?;

    let mut hub_ref = hub.borrow_mut();
    hub_ref.registry.bind_udp_addr(handle, peer).ok()?;
    if let Some(session) = hub_ref.registry.get_mut(handle) {
        session.udp_replay.observe(counter);
    }

    Some((handle, plaintext))
}

/// Central 1Hz housekeeping: talk-group timeouts, UDP liveness sweep, PKI renewal warnings
/// (spec.md §5 "wall-clock timers").
async fn tick_task(hub: SharedHub) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_renewal_check = Instant::now() - Duration::from_secs(3600);

    loop {
        interval.tick().await;
        let now = Instant::now();

        let effects = {
            let hub_ref = hub.borrow();
            hub_ref.dispatcher.tick(&hub_ref.registry, now)
        };
        hub.borrow_mut().apply_dispatch_effects(effects);

        sweep_udp_liveness(&hub, now);

        if now.duration_since(last_renewal_check) >= Duration::from_secs(60) {
            last_renewal_check = now;
            check_pki_renewal(&hub);
        }
    }
}

fn sweep_udp_liveness(hub: &SharedHub, now: Instant) {
    let candidates: Vec<SessionHandle> = {
        let hub_ref = hub.borrow();
        hub_ref.registry.iter().filter(|(_, s)| s.udp_peer.is_some()).map(|(h, _)| h).collect()
    };

    for handle in candidates {
        let (due, dead) = {
            let hub_ref = hub.borrow();
            match hub_ref.registry.get(handle) {
                Some(s) => (s.udp_heartbeat_due(now), s.udp_is_dead(now)),
                None => continue,
            }
        };

        if dead {
            hub.borrow().disconnect(handle);
        } else if due {
            hub.borrow_mut().send_udp_to(handle, reflector_proto::types::UDP_HEARTBEAT, &[]);
        }
    }
}

fn check_pki_renewal(hub: &SharedHub) {
    let hub_ref = hub.borrow();
    let due = hub_ref.pki.due_for_renewal(time::OffsetDateTime::now_utc());
    if !due.is_empty() {
        warn!(hub_ref.logger, "certificate(s) due for renewal, restart to regenerate"; "which" => due.join(","));
    }
}

/// Operator control surface (spec.md §4.10): one line in, one `OK`/`ERR:<reason>` line out.
async fn console_task(hub: SharedHub) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return,
        };
        let response = handle_console_line(&hub, line.trim()).await;
        println!("{}", response);
    }
}

async fn handle_console_line(hub: &SharedHub, line: &str) -> String {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["CFG", section, tag] => match hub.borrow().config.get(section, tag) {
            Some(value) => format!("OK:{}", value),
            None => "ERR:not set".to_string(),
        },
        ["CFG", section, tag, rest @ ..] => {
            let value = rest.join(" ");
            match hub.borrow_mut().apply_config(section, tag, &value) {
                Ok(()) => "OK".to_string(),
                Err(e) => format!("ERR:{}", e),
            }
        }
        ["CA", "SIGN", cn] => sign_csr(hub, cn).await,
        ["CA", "RM", cn] => match hub.borrow().pki.remove_cert(cn) {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERR:{}", e),
        },
        ["CA", "LS"] => match hub.borrow().pki.signed_common_names() {
            Ok(names) => format!("OK:{}", names.join(",")),
            Err(e) => format!("ERR:{}", e),
        },
        ["CA", "PENDING"] => match hub.borrow().pki.pending_common_names() {
            Ok(names) => format!("OK:{}", names.join(",")),
            Err(e) => format!("ERR:{}", e),
        },
        [] => "ERR:empty command".to_string(),
        _ => "ERR:unrecognized command".to_string(),
    }
}

/// Signs a pending CSR and, if a session is still waiting on it, hands it the resulting chain
/// (spec.md §4.5 S6, §4.10). `hook_path` is cloned out before the `await` so the external hook
/// (up to five minutes) never holds a borrow of the shared `Hub` open.
async fn sign_csr(hub: &SharedHub, cn: &str) -> String {
    let chain_pem = match hub.borrow().pki.sign_pending(cn) {
        Ok(pem) => pem,
        Err(e) => return format!("ERR:{}", e),
    };

    let (hook_path, logger) = {
        let hub_ref = hub.borrow();
        (hub_ref.pki.hook_path().to_string(), hub_ref.logger.clone())
    };
    let _ = reflector_pki::hook::invoke(&logger, &hook_path, reflector_pki::CaOp::CsrSigned, None, Some(&chain_pem)).await;

    if let Some(handle) = hub.borrow_mut().take_pending_csr_session(cn) {
        hub.borrow().send_to(handle, reflector_proto::Message::ClientCert { pem: chain_pem });
    }

    "OK".to_string()
}
