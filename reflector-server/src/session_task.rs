//! Per-connection state machine (spec.md §4.4). One task per accepted TCP connection, spawned
//! onto the reactor's `LocalSet` by `main`'s accept loop. Owns its own `FramedTransport<Conn>`
//! and inbox; everything it needs to share with the rest of the server goes through the `Hub`.

use crate::conn::Conn;
use crate::state::{OutboundEvent, SharedHub};
use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use reflector_core::{Phase, SessionHandle};
use reflector_net::framing::{FrameLimit, FramedTransport};
use reflector_net::tls;
use reflector_proto::{types, Message};
use slog::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

const LOCAL_PROTO_MAJOR: u16 = 3;
const LOCAL_PROTO_MINOR: u16 = 0;

/// What the caller should do after handling one inbound frame. Most frames are fully handled in
/// place; starting TLS needs to replace the transport's underlying stream, which only the owner
/// of `transport` (this function's caller) can do.
enum Next {
    Continue,
    BeginTls,
}

/// Drives one session from accept to disconnect. Never panics on a misbehaving peer: every
/// protocol/transport error just ends this task and lets `teardown` clean up the registry.
pub async fn run(
    hub: SharedHub,
    handle: SessionHandle,
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Arc<TlsAcceptor>,
    inbox: mpsc::UnboundedReceiver<OutboundEvent>,
) {
    let transport = FramedTransport::new(Conn::Plain(stream));
    let outcome = drive(&hub, handle, transport, peer, &tls_acceptor, inbox).await;

    if let Err(e) = &outcome {
        warn!(hub.borrow().logger, "session ended"; "peer" => %peer, "error" => %e);
    }

    teardown(&hub, handle, peer).await;
}

async fn drive(
    hub: &SharedHub,
    handle: SessionHandle,
    mut transport: FramedTransport<Conn>,
    peer: SocketAddr,
    tls_acceptor: &Arc<TlsAcceptor>,
    mut inbox: mpsc::UnboundedReceiver<OutboundEvent>,
) -> Result<()> {
    let mut challenge: Option<[u8; 20]> = None;
    let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let _ = peer;

    loop {
        let phase = match hub.borrow().registry.get(handle) {
            Some(s) => s.phase,
            None => return Ok(()),
        };

        if phase == Phase::ExpectDisconnect {
            return Ok(());
        }

        let limit = frame_limit_for(phase);

        let next = tokio::select! {
            frame = transport.read_frame(limit) => {
                let frame = frame.context("reading frame")?;
                mark_tcp_rx(hub, handle);
                handle_frame(hub, handle, &mut transport, &mut challenge, phase, &frame).await?
            }
            event = inbox.recv() => {
                match event {
                    Some(OutboundEvent::Tcp(msg)) => {
                        transport.write_frame(&msg.encode()?).await?;
                        mark_tcp_tx(hub, handle);
                        Next::Continue
                    }
                    Some(OutboundEvent::Disconnect) | None => return Ok(()),
                }
            }
            _ = heartbeat.tick() => {
                check_heartbeat(hub, handle, &mut transport).await?;
                Next::Continue
            }
        };

        if let Next::BeginTls = next {
            transport = upgrade_to_tls(hub, handle, transport, tls_acceptor).await?;
        }
    }
}

fn frame_limit_for(phase: Phase) -> FrameLimit {
    match phase {
        Phase::ExpectProtoVer => FrameLimit::PreAuth,
        Phase::ExpectStartEncryption => FrameLimit::PreTlsSetup,
        Phase::ExpectSslConnReady | Phase::ExpectCsr | Phase::ExpectAuthResponse => FrameLimit::PostTlsSetup,
        Phase::Connected => FrameLimit::PostAuth,
        Phase::ExpectDisconnect => FrameLimit::PreAuth,
    }
}

fn mark_tcp_rx(hub: &SharedHub, handle: SessionHandle) {
    if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
        session.mark_tcp_rx(Instant::now());
    }
}

fn mark_tcp_tx(hub: &SharedHub, handle: SessionHandle) {
    if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
        session.mark_tcp_tx(Instant::now());
    }
}

async fn check_heartbeat(hub: &SharedHub, handle: SessionHandle, transport: &mut FramedTransport<Conn>) -> Result<()> {
    let now = Instant::now();
    let (due, dead) = {
        let hub_ref = hub.borrow();
        match hub_ref.registry.get(handle) {
            Some(s) => (s.tcp_heartbeat_due(now), s.tcp_is_dead(now)),
            None => return Ok(()),
        }
    };

    if dead {
        bail!("tcp heartbeat timeout");
    }
    if due {
        transport.write_frame(&Message::Heartbeat.encode()?).await?;
        mark_tcp_tx(hub, handle);
    }
    Ok(())
}

fn msg_type_and_body(frame: &[u8]) -> Result<(u16, &[u8])> {
    if frame.len() < 2 {
        bail!("frame shorter than a message type code");
    }
    Ok((u16::from_be_bytes([frame[0], frame[1]]), &frame[2..]))
}

async fn handle_frame(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    challenge: &mut Option<[u8; 20]>,
    phase: Phase,
    frame: &[u8],
) -> Result<Next> {
    let (msg_type, body) = msg_type_and_body(frame)?;

    if msg_type == types::ERROR {
        if let Message::Error { message } = Message::decode(msg_type, body, false)? {
            info!(hub.borrow().logger, "peer reported error"; "message" => message);
        }
        bail!("peer sent MsgError");
    }

    if !reflector_core::admin_message_allowed(phase, msg_type) {
        bail!("message type {} not permitted in current phase", msg_type);
    }

    match phase {
        Phase::ExpectProtoVer => {
            handle_proto_ver(hub, handle, transport, body, challenge).await?;
            Ok(Next::Continue)
        }
        Phase::ExpectStartEncryption => handle_pre_tls(hub, transport, msg_type, body).await,
        Phase::ExpectCsr => {
            handle_csr_phase(hub, handle, transport, body, challenge).await?;
            Ok(Next::Continue)
        }
        Phase::ExpectAuthResponse => {
            handle_auth_response(hub, handle, transport, body, challenge).await?;
            Ok(Next::Continue)
        }
        Phase::Connected => {
            handle_connected(hub, handle, transport, msg_type, body).await?;
            Ok(Next::Continue)
        }
        Phase::ExpectSslConnReady | Phase::ExpectDisconnect => {
            bail!("no inbound frames are legal in this phase")
        }
    }
}

async fn handle_proto_ver(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    body: &[u8],
    challenge: &mut Option<[u8; 20]>,
) -> Result<()> {
    let (major, minor) = match Message::decode(types::PROTO_VER, body, false)? {
        Message::ProtoVer { major, minor } => (major, minor),
        _ => unreachable!(),
    };

    let already_downgraded = hub.borrow().registry.get(handle).map_or(false, |s| s.downgrade_sent);

    if major > LOCAL_PROTO_MAJOR {
        if already_downgraded {
            bail!("client re-sent an unsupported protocol version after downgrade notice");
        }
        transport
            .write_frame(&Message::ProtoVerDowngrade { major: LOCAL_PROTO_MAJOR, minor: LOCAL_PROTO_MINOR }.encode()?)
            .await?;
        if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
            session.downgrade_sent = true;
        }
        return Ok(());
    }

    if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
        session.proto = Some(reflector_core::ProtoVersion { major, minor });
    }

    if major >= 3 {
        set_phase(hub, handle, Phase::ExpectStartEncryption);
        send_ca_info(hub, transport).await?;
    } else {
        set_phase(hub, handle, Phase::ExpectAuthResponse);
        let bytes = issue_challenge();
        *challenge = Some(bytes);
        transport.write_frame(&Message::AuthChallenge { challenge: bytes }.encode()?).await?;
    }

    Ok(())
}

fn issue_challenge() -> [u8; 20] {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

async fn send_ca_info(hub: &SharedHub, transport: &mut FramedTransport<Conn>) -> Result<()> {
    let (size, digest) = {
        let hub_ref = hub.borrow();
        (hub_ref.pki.bundle.size(), hub_ref.pki.bundle.digest.to_vec())
    };
    transport.write_frame(&Message::CaInfo { size, digest }.encode()?).await?;
    Ok(())
}

async fn handle_pre_tls(
    hub: &SharedHub,
    transport: &mut FramedTransport<Conn>,
    msg_type: u16,
    body: &[u8],
) -> Result<Next> {
    match msg_type {
        types::CA_BUNDLE_REQUEST => {
            let _ = Message::decode(msg_type, body, false)?;
            let (ca_pem, sig, cert_pem) = {
                let hub_ref = hub.borrow();
                (hub_ref.pki.bundle.pem.clone(), hub_ref.pki.bundle.signature.clone(), hub_ref.pki.server_chain_pem())
            };
            transport.write_frame(&Message::CaBundle { ca_pem, sig, cert_pem }.encode()?).await?;
            Ok(Next::Continue)
        }
        types::START_ENCRYPTION_REQUEST => {
            let _ = Message::decode(msg_type, body, false)?;
            transport.write_frame(&Message::StartEncryption.encode()?).await?;
            Ok(Next::BeginTls)
        }
        _ => unreachable!("admin_message_allowed already restricted this phase"),
    }
}

/// Performs the TLS handshake in place and resolves the next phase (spec.md §4.4
/// `EXPECT_SSL_CON_READY`). `transport` is consumed and a new one wrapping the upgraded stream
/// is returned, since swapping the enum variant inside an existing `FramedTransport` would need
/// a meaningless placeholder value to move the old stream out from under a live reference.
async fn upgrade_to_tls(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: FramedTransport<Conn>,
    tls_acceptor: &Arc<TlsAcceptor>,
) -> Result<FramedTransport<Conn>> {
    let tcp = match transport.into_inner() {
        Conn::Plain(tcp) => tcp,
        Conn::Tls(_) => bail!("already upgraded to TLS"),
    };

    let tls_stream = tls_acceptor.accept(tcp).await.context("TLS handshake failed")?;
    let peer_certs = tls_stream.get_ref().1.peer_certificates().map(|c| c.to_vec());
    let mut transport = FramedTransport::new(Conn::Tls(Box::new(tls_stream)));

    match tls::peer_common_name(peer_certs.as_deref()) {
        Some(cn) => enter_connected(hub, handle, &mut transport, cn).await?,
        None => {
            set_phase(hub, handle, Phase::ExpectCsr);
            transport.write_frame(&Message::ClientCsrRequest.encode()?).await?;
        }
    }

    Ok(transport)
}

async fn enter_connected(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    callsign: String,
) -> Result<()> {
    {
        let mut hub_ref = hub.borrow_mut();
        hub_ref.registry.register_callsign(handle, callsign.clone())?;
        hub_ref.registry.get_mut(handle).unwrap().phase = Phase::Connected;
    }
    send_post_auth_greeting(hub, handle, transport, callsign).await
}

async fn handle_csr_phase(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    body: &[u8],
    challenge: &mut Option<[u8; 20]>,
) -> Result<()> {
    let pem = match Message::decode(types::CLIENT_CSR, body, false)? {
        Message::ClientCsr { pem } => pem,
        _ => unreachable!(),
    };

    match intake_client_csr(hub, handle, &pem).await? {
        Some(chain_pem) => {
            transport.write_frame(&Message::ClientCert { pem: chain_pem }.encode()?).await?;
            set_phase(hub, handle, Phase::ExpectDisconnect);
        }
        None => {
            set_phase(hub, handle, Phase::ExpectAuthResponse);
            let bytes = issue_challenge();
            *challenge = Some(bytes);
            transport.write_frame(&Message::AuthChallenge { challenge: bytes }.encode()?).await?;
        }
    }
    Ok(())
}

/// Shared CSR intake logic (spec.md §4.5), used both by `EXPECT_CSR` (bootstrap, no cert yet) and
/// by an already-`CONNECTED` session resubmitting a CSR (S6). Returns `Some(chain_pem)` when the
/// submission exactly matches an already-signed certificate (send it back immediately); `None`
/// when it was filed as a new or updated pending request.
async fn intake_client_csr(hub: &SharedHub, handle: SessionHandle, pem: &str) -> Result<Option<String>> {
    let cn = reflector_pki::common_name(pem).map_err(|_| anyhow!("CSR could not be parsed"))?;

    let (outcome, logger) = {
        let hub_ref = hub.borrow();
        (hub_ref.pki.intake_csr(&cn, pem)?, hub_ref.logger.clone())
    };

    if outcome == reflector_pki::IntakeOutcome::Unchanged {
        return Ok(hub.borrow().pki.client_cert_pem(&cn).ok());
    }

    let op = match outcome {
        reflector_pki::IntakeOutcome::Created => reflector_pki::CaOp::PendingCsrCreate,
        reflector_pki::IntakeOutcome::Updated => reflector_pki::CaOp::PendingCsrUpdate,
        reflector_pki::IntakeOutcome::Unchanged => unreachable!(),
    };

    let hook_path = hub.borrow().pki.hook_path().to_string();
    hub.borrow_mut().record_pending_csr_session(cn, handle);
    reflector_pki::hook::invoke(&logger, &hook_path, op, Some(pem), None).await;

    Ok(None)
}

async fn handle_auth_response(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    body: &[u8],
    challenge: &mut Option<[u8; 20]>,
) -> Result<()> {
    let (callsign, digest) = match Message::decode(types::AUTH_RESPONSE, body, false)? {
        Message::AuthResponse { callsign, digest } => (callsign, digest),
        _ => unreachable!(),
    };

    let expected = challenge.ok_or_else(|| anyhow!("auth response received with no outstanding challenge"))?;
    let verified = hub.borrow().users.verify(&callsign, &expected, &digest);

    if !verified {
        transport
            .write_frame(&Message::Error { message: "authentication failed".to_string() }.encode()?)
            .await?;
        set_phase(hub, handle, Phase::ExpectDisconnect);
        bail!("authentication failed for {:?}", callsign);
    }

    enter_connected(hub, handle, transport, callsign).await?;
    transport.write_frame(&Message::AuthOk.encode()?).await?;
    Ok(())
}

async fn send_post_auth_greeting(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    callsign: String,
) -> Result<()> {
    let (client_id, nodes, codecs) = {
        let hub_ref = hub.borrow();
        let client_id = hub_ref.registry.get(handle).map(|s| s.client_id).unwrap_or(0);
        let nodes: Vec<String> = hub_ref
            .registry
            .iter()
            .filter(|(h, s)| *h != handle && s.phase.is_connected())
            .map(|(_, s)| s.callsign.clone())
            .collect();
        (client_id, nodes, hub_ref.codecs.clone())
    };

    transport.write_frame(&Message::ServerInfo { client_id, nodes, codecs }.encode()?).await?;

    let filter = reflector_core::Filter::Except(handle);
    hub.borrow().broadcast_tcp(&filter, Message::NodeJoined { callsign });

    Ok(())
}

async fn handle_connected(
    hub: &SharedHub,
    handle: SessionHandle,
    transport: &mut FramedTransport<Conn>,
    msg_type: u16,
    body: &[u8],
) -> Result<()> {
    if msg_type == types::HEARTBEAT {
        return Ok(());
    }

    if msg_type == types::CLIENT_CSR {
        if let Message::ClientCsr { pem } = Message::decode(msg_type, body, false)? {
            if let Some(chain_pem) = intake_client_csr(hub, handle, &pem).await? {
                transport.write_frame(&Message::ClientCert { pem: chain_pem }.encode()?).await?;
            }
        }
        return Ok(());
    }

    let legacy = hub.borrow().registry.get(handle).map_or(false, |s| s.proto.map_or(false, |p| p.is_legacy()));
    let msg = Message::decode(msg_type, body, legacy)?;

    match msg {
        Message::SelectTg { tg } => {
            let now = Instant::now();
            let mut hub_ref = hub.borrow_mut();
            if let Ok(effects) = hub_ref.dispatcher.switch_to(&mut hub_ref.registry, handle, tg, now) {
                hub_ref.apply_dispatch_effects(effects);
            }
        }
        Message::TgMonitor { tgs } => {
            if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
                session.monitored_tgs = tgs.into_iter().collect();
            }
        }
        Message::RequestQsy { tg } => {
            let now = Instant::now();
            let mut hub_ref = hub.borrow_mut();
            let src_tg = hub_ref.registry.get(handle).map(|s| s.current_tg).unwrap_or(0);
            let effects = hub_ref.dispatcher.request_qsy(src_tg, tg, now);
            hub_ref.apply_dispatch_effects(effects);
        }
        Message::NodeInfo { udp_iv_rand, udp_key, json } => {
            if udp_key.len() != reflector_net::udp::KEY_SIZE || udp_iv_rand.len() != reflector_net::udp::IV_RAND_SIZE {
                bail!("malformed NodeInfo UDP key material");
            }
            if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
                session.udp_key.copy_from_slice(&udp_key);
                session.udp_iv_rand.copy_from_slice(&udp_iv_rand);
                session.node_info = Some(json);
            }
            transport.write_frame(&Message::StartUdpEncryption.encode()?).await?;
        }
        Message::NodeInfoV2 { json } => {
            if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
                session.node_info = Some(json);
            }
        }
        Message::SignalStrengthValues { rxs } => {
            if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
                for rx in rxs {
                    session.rx_status.insert(rx.id, rx);
                }
            }
        }
        Message::TxStatus { txs } => {
            if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
                for tx in txs {
                    session.tx_status.insert(tx.id, tx);
                }
            }
        }
        other => {
            warn!(hub.borrow().logger, "unexpected message in CONNECTED phase"; "type" => other.msg_type());
        }
    }

    Ok(())
}

fn set_phase(hub: &SharedHub, handle: SessionHandle, phase: Phase) {
    if let Some(session) = hub.borrow_mut().registry.get_mut(handle) {
        session.phase = phase;
    }
}

/// Removes the session from the registry, notifies remaining members of its former talk group
/// and of the server as a whole, and lets the dispatcher clear any talker state it held
/// (spec.md §5 "removal must precede session destruction").
async fn teardown(hub: &SharedHub, handle: SessionHandle, peer: SocketAddr) {
    let (callsign, old_tg, was_connected) = {
        let mut hub_ref = hub.borrow_mut();
        let Some(session) = hub_ref.registry.get(handle) else { return };
        let callsign = session.callsign.clone();
        let old_tg = session.current_tg;
        let was_connected = session.phase.is_connected();
        hub_ref.unregister_outbox(handle);
        (callsign, old_tg, was_connected)
    };

    if old_tg != 0 {
        let now = Instant::now();
        let mut hub_ref = hub.borrow_mut();
        if let Ok(effects) = hub_ref.dispatcher.switch_to(&mut hub_ref.registry, handle, 0, now) {
            hub_ref.apply_dispatch_effects(effects);
        }
    }

    hub.borrow_mut().registry.remove(handle);

    if was_connected && !callsign.is_empty() {
        hub.borrow().broadcast_tcp(&reflector_core::Filter::All, Message::NodeLeft { callsign: callsign.clone() });
    }

    info!(hub.borrow().logger, "session closed"; "peer" => %peer, "callsign" => callsign);
}
