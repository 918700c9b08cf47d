//! TCP control-plane messages: one `Message` variant per wire type (spec.md §4.3 / §6).
//! `Message::decode` is handed a type code already stripped off by the framed-transport layer
//! and the remaining frame payload; `Message::encode` produces the `u16 type || body` bytes
//! that go inside one framed-transport frame.

use crate::error::{CodecError, CodecResult};
use crate::types;
use crate::wire::*;
use std::io::Cursor;

/// One receiver's status, as reported in `MsgSignalStrengthValues`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxStatus {
    pub id: u8,
    pub siglev: u8,
    pub enabled: bool,
    pub squelch_open: bool,
    pub active: bool,
}

const RX_BIT_ENABLED: u8 = 1 << 0;
const RX_BIT_SQL_OPEN: u8 = 1 << 1;
const RX_BIT_ACTIVE: u8 = 1 << 2;

impl RxStatus {
    fn read<R: std::io::Read>(r: &mut R) -> CodecResult<Self> {
        let id = read_bytes_fixed(r, 1)?[0];
        let siglev = read_bytes_fixed(r, 1)?[0];
        let flags = read_bytes_fixed(r, 1)?[0];
        Ok(RxStatus {
            id,
            siglev,
            enabled: flags & RX_BIT_ENABLED != 0,
            squelch_open: flags & RX_BIT_SQL_OPEN != 0,
            active: flags & RX_BIT_ACTIVE != 0,
        })
    }

    fn write<W: std::io::Write>(&self, w: &mut W) -> CodecResult<()> {
        let mut flags = 0u8;
        if self.enabled {
            flags |= RX_BIT_ENABLED;
        }
        if self.squelch_open {
            flags |= RX_BIT_SQL_OPEN;
        }
        if self.active {
            flags |= RX_BIT_ACTIVE;
        }
        w.write_all(&[self.id, self.siglev, flags])
            .map_err(|_| CodecError::Truncated)
    }
}

/// One transmitter's status, as reported in `MsgTxStatus`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxStatus {
    pub id: u8,
    pub transmit: bool,
}

const TX_BIT_TRANSMIT: u8 = 1 << 0;

impl TxStatus {
    fn read<R: std::io::Read>(r: &mut R) -> CodecResult<Self> {
        let id = read_bytes_fixed(r, 1)?[0];
        let flags = read_bytes_fixed(r, 1)?[0];
        Ok(TxStatus {
            id,
            transmit: flags & TX_BIT_TRANSMIT != 0,
        })
    }

    fn write<W: std::io::Write>(&self, w: &mut W) -> CodecResult<()> {
        let flags = if self.transmit { TX_BIT_TRANSMIT } else { 0 };
        w.write_all(&[self.id, flags]).map_err(|_| CodecError::Truncated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Heartbeat,
    ProtoVer { major: u16, minor: u16 },
    ProtoVerDowngrade { major: u16, minor: u16 },
    AuthChallenge { challenge: [u8; 20] },
    AuthResponse { callsign: String, digest: [u8; 20] },
    AuthOk,
    Error { message: String },
    StartEncryptionRequest,
    StartEncryption,
    ClientCsrRequest,
    ClientCsr { pem: String },
    ClientCert { pem: String },
    CaInfo { size: u32, digest: Vec<u8> },
    CaBundleRequest,
    CaBundle { ca_pem: String, sig: Vec<u8>, cert_pem: String },
    ServerInfo { client_id: u16, nodes: Vec<String>, codecs: Vec<String> },
    NodeList { nodes: Vec<String> },
    NodeJoined { callsign: String },
    NodeLeft { callsign: String },
    /// Protocol >= 2.0 variant, carries the talk group.
    TalkerStart { tg: u32, callsign: String },
    /// Protocol 1 variant, no talk-group field (implied by the V1-default TG).
    TalkerStartV1 { callsign: String },
    TalkerStop { tg: u32, callsign: String },
    TalkerStopV1 { callsign: String },
    SelectTg { tg: u32 },
    TgMonitor { tgs: Vec<u32> },
    RequestQsy { tg: u32 },
    StateEvent { src: String, name: String, msg: String },
    NodeInfo { udp_iv_rand: Vec<u8>, udp_key: Vec<u8>, json: String },
    /// Legacy (protocol < 3) variant: JSON blob only, no UDP key material (key exchange happens
    /// out of band for those clients).
    NodeInfoV2 { json: String },
    SignalStrengthValues { rxs: Vec<RxStatus> },
    TxStatus { txs: Vec<TxStatus> },
    StartUdpEncryption,
}

impl Message {
    pub fn msg_type(&self) -> u16 {
        match self {
            Message::Heartbeat => types::HEARTBEAT,
            Message::ProtoVer { .. } => types::PROTO_VER,
            Message::ProtoVerDowngrade { .. } => types::PROTO_VER_DOWNGRADE,
            Message::AuthChallenge { .. } => types::AUTH_CHALLENGE,
            Message::AuthResponse { .. } => types::AUTH_RESPONSE,
            Message::AuthOk => types::AUTH_OK,
            Message::Error { .. } => types::ERROR,
            Message::StartEncryptionRequest => types::START_ENCRYPTION_REQUEST,
            Message::StartEncryption => types::START_ENCRYPTION,
            Message::ClientCsrRequest => types::CLIENT_CSR_REQUEST,
            Message::ClientCsr { .. } => types::CLIENT_CSR,
            Message::ClientCert { .. } => types::CLIENT_CERT,
            Message::CaInfo { .. } => types::CA_INFO,
            Message::CaBundleRequest => types::CA_BUNDLE_REQUEST,
            Message::CaBundle { .. } => types::CA_BUNDLE,
            Message::ServerInfo { .. } => types::SERVER_INFO,
            Message::NodeList { .. } => types::NODE_LIST,
            Message::NodeJoined { .. } => types::NODE_JOINED,
            Message::NodeLeft { .. } => types::NODE_LEFT,
            Message::TalkerStart { .. } | Message::TalkerStartV1 { .. } => types::TALKER_START,
            Message::TalkerStop { .. } | Message::TalkerStopV1 { .. } => types::TALKER_STOP,
            Message::SelectTg { .. } => types::SELECT_TG,
            Message::TgMonitor { .. } => types::TG_MONITOR,
            Message::RequestQsy { .. } => types::REQUEST_QSY,
            Message::StateEvent { .. } => types::STATE_EVENT,
            Message::NodeInfo { .. } | Message::NodeInfoV2 { .. } => types::NODE_INFO,
            Message::SignalStrengthValues { .. } => types::SIGNAL_STRENGTH_VALUES,
            Message::TxStatus { .. } => types::TX_STATUS,
            Message::StartUdpEncryption => types::START_UDP_ENCRYPTION,
        }
    }

    /// Encodes `u16 type || body` as one framed-transport payload.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        write_u16(&mut out, self.msg_type())?;
        self.encode_body(&mut out)?;
        Ok(out)
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> CodecResult<()> {
        match self {
            Message::Heartbeat
            | Message::AuthOk
            | Message::StartEncryptionRequest
            | Message::StartEncryption
            | Message::ClientCsrRequest
            | Message::CaBundleRequest
            | Message::StartUdpEncryption => {}
            Message::ProtoVer { major, minor } | Message::ProtoVerDowngrade { major, minor } => {
                write_u16(out, *major)?;
                write_u16(out, *minor)?;
            }
            Message::AuthChallenge { challenge } => out.extend_from_slice(challenge),
            Message::AuthResponse { callsign, digest } => {
                write_string(out, callsign)?;
                out.extend_from_slice(digest);
            }
            Message::Error { message } => write_string(out, message)?,
            Message::ClientCsr { pem } | Message::ClientCert { pem } => write_string(out, pem)?,
            Message::CaInfo { size, digest } => {
                write_u32(out, *size)?;
                write_bytes(out, digest)?;
            }
            Message::CaBundle { ca_pem, sig, cert_pem } => {
                write_string(out, ca_pem)?;
                write_bytes(out, sig)?;
                write_string(out, cert_pem)?;
            }
            Message::ServerInfo { client_id, nodes, codecs } => {
                write_u16(out, 0)?; // reserved
                write_u16(out, *client_id)?;
                write_string_vec(out, nodes)?;
                write_string_vec(out, codecs)?;
            }
            Message::NodeList { nodes } => write_string_vec(out, nodes)?,
            Message::NodeJoined { callsign } | Message::NodeLeft { callsign } => {
                write_string(out, callsign)?
            }
            Message::TalkerStart { tg, callsign } | Message::TalkerStop { tg, callsign } => {
                write_u32(out, *tg)?;
                write_string(out, callsign)?;
            }
            Message::TalkerStartV1 { callsign } | Message::TalkerStopV1 { callsign } => {
                write_string(out, callsign)?
            }
            Message::SelectTg { tg } | Message::RequestQsy { tg } => write_u32(out, *tg)?,
            Message::TgMonitor { tgs } => write_u32_vec(out, tgs)?,
            Message::StateEvent { src, name, msg } => {
                write_string(out, src)?;
                write_string(out, name)?;
                write_string(out, msg)?;
            }
            Message::NodeInfo { udp_iv_rand, udp_key, json } => {
                write_bytes(out, udp_iv_rand)?;
                write_bytes(out, udp_key)?;
                write_string(out, json)?;
            }
            Message::NodeInfoV2 { json } => write_string(out, json)?,
            Message::SignalStrengthValues { rxs } => {
                write_u16(out, rxs.len() as u16)?;
                for rx in rxs {
                    rx.write(out)?;
                }
            }
            Message::TxStatus { txs } => {
                write_u16(out, txs.len() as u16)?;
                for tx in txs {
                    tx.write(out)?;
                }
            }
        }
        Ok(())
    }

    /// Decodes a message body given its type code. `legacy` selects the protocol-<3 variants for
    /// type codes that are ambiguous between a legacy and current body shape (`NODE_INFO`); the
    /// V1 TalkerStart/Stop variants are selected the same way by the caller re-dispatching on the
    /// peer's negotiated protocol major version, since both share a type code with the v2+ form
    /// and only differ in the presence of the `tg` field — which this decoder cannot tell apart
    /// from a truncated frame, so callers of a pre-2.0 session must use
    /// `decode_talker_start_v1`/`decode_talker_stop_v1` directly instead of `decode`.
    pub fn decode(msg_type: u16, body: &[u8], legacy: bool) -> CodecResult<Message> {
        let mut cur = Cursor::new(body);
        let msg = match msg_type {
            types::HEARTBEAT => Message::Heartbeat,
            types::PROTO_VER => Message::ProtoVer {
                major: read_u16(&mut cur)?,
                minor: read_u16(&mut cur)?,
            },
            types::PROTO_VER_DOWNGRADE => Message::ProtoVerDowngrade {
                major: read_u16(&mut cur)?,
                minor: read_u16(&mut cur)?,
            },
            types::AUTH_CHALLENGE => {
                let raw = read_bytes_fixed(&mut cur, 20)?;
                let mut challenge = [0u8; 20];
                challenge.copy_from_slice(&raw);
                Message::AuthChallenge { challenge }
            }
            types::AUTH_RESPONSE => {
                let callsign = read_string(&mut cur)?;
                let raw = read_bytes_fixed(&mut cur, 20)?;
                let mut digest = [0u8; 20];
                digest.copy_from_slice(&raw);
                Message::AuthResponse { callsign, digest }
            }
            types::AUTH_OK => Message::AuthOk,
            types::ERROR => Message::Error { message: read_string(&mut cur)? },
            types::START_ENCRYPTION_REQUEST => Message::StartEncryptionRequest,
            types::START_ENCRYPTION => Message::StartEncryption,
            types::CLIENT_CSR_REQUEST => Message::ClientCsrRequest,
            types::CLIENT_CSR => Message::ClientCsr { pem: read_string(&mut cur)? },
            types::CLIENT_CERT => Message::ClientCert { pem: read_string(&mut cur)? },
            types::CA_INFO => Message::CaInfo {
                size: read_u32(&mut cur)?,
                digest: read_bytes(&mut cur)?,
            },
            types::CA_BUNDLE_REQUEST => Message::CaBundleRequest,
            types::CA_BUNDLE => Message::CaBundle {
                ca_pem: read_string(&mut cur)?,
                sig: read_bytes(&mut cur)?,
                cert_pem: read_string(&mut cur)?,
            },
            types::SERVER_INFO => {
                let _reserved = read_u16(&mut cur)?;
                let client_id = read_u16(&mut cur)?;
                let nodes = read_string_vec(&mut cur)?;
                let codecs = read_string_vec(&mut cur)?;
                Message::ServerInfo { client_id, nodes, codecs }
            }
            types::NODE_LIST => Message::NodeList { nodes: read_string_vec(&mut cur)? },
            types::NODE_JOINED => Message::NodeJoined { callsign: read_string(&mut cur)? },
            types::NODE_LEFT => Message::NodeLeft { callsign: read_string(&mut cur)? },
            types::TALKER_START => Message::TalkerStart {
                tg: read_u32(&mut cur)?,
                callsign: read_string(&mut cur)?,
            },
            types::TALKER_STOP => Message::TalkerStop {
                tg: read_u32(&mut cur)?,
                callsign: read_string(&mut cur)?,
            },
            types::SELECT_TG => Message::SelectTg { tg: read_u32(&mut cur)? },
            types::TG_MONITOR => Message::TgMonitor { tgs: read_u32_vec(&mut cur)? },
            types::REQUEST_QSY => Message::RequestQsy { tg: read_u32(&mut cur)? },
            types::STATE_EVENT => Message::StateEvent {
                src: read_string(&mut cur)?,
                name: read_string(&mut cur)?,
                msg: read_string(&mut cur)?,
            },
            types::NODE_INFO if legacy => Message::NodeInfoV2 { json: read_string(&mut cur)? },
            types::NODE_INFO => Message::NodeInfo {
                udp_iv_rand: read_bytes(&mut cur)?,
                udp_key: read_bytes(&mut cur)?,
                json: read_string(&mut cur)?,
            },
            types::SIGNAL_STRENGTH_VALUES => {
                let count = read_u16(&mut cur)?;
                let mut rxs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rxs.push(RxStatus::read(&mut cur)?);
                }
                Message::SignalStrengthValues { rxs }
            }
            types::TX_STATUS => {
                let count = read_u16(&mut cur)?;
                let mut txs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    txs.push(TxStatus::read(&mut cur)?);
                }
                Message::TxStatus { txs }
            }
            types::START_UDP_ENCRYPTION => Message::StartUdpEncryption,
            other => return Err(CodecError::UnknownType(other)),
        };

        expect_exhausted(&cur)?;
        Ok(msg)
    }

    /// Decodes the protocol-1 TalkerStart variant (no `tg` field).
    pub fn decode_talker_start_v1(body: &[u8]) -> CodecResult<Message> {
        let mut cur = Cursor::new(body);
        let callsign = read_string(&mut cur)?;
        expect_exhausted(&cur)?;
        Ok(Message::TalkerStartV1 { callsign })
    }

    /// Decodes the protocol-1 TalkerStop variant (no `tg` field).
    pub fn decode_talker_stop_v1(body: &[u8]) -> CodecResult<Message> {
        let mut cur = Cursor::new(body);
        let callsign = read_string(&mut cur)?;
        expect_exhausted(&cur)?;
        Ok(Message::TalkerStopV1 { callsign })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode().unwrap();
        let msg_type = u16::from_be_bytes([encoded[0], encoded[1]]);
        let decoded = Message::decode(msg_type, &encoded[2..], false).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn proto_ver_roundtrip() {
        roundtrip(Message::ProtoVer { major: 3, minor: 0 });
    }

    #[test]
    fn auth_response_roundtrip() {
        roundtrip(Message::AuthResponse {
            callsign: "NODE1".to_string(),
            digest: [7u8; 20],
        });
    }

    #[test]
    fn server_info_roundtrip() {
        roundtrip(Message::ServerInfo {
            client_id: 42,
            nodes: vec!["NODE1".to_string(), "NODE2".to_string()],
            codecs: vec!["Opus".to_string()],
        });
    }

    #[test]
    fn talker_start_roundtrip() {
        roundtrip(Message::TalkerStart { tg: 42, callsign: "NODE1".to_string() });
    }

    #[test]
    fn talker_start_v1_has_no_tg_field() {
        let msg = Message::TalkerStartV1 { callsign: "NODE1".to_string() };
        let mut body = Vec::new();
        write_string(&mut body, "NODE1").unwrap();
        let decoded = Message::decode_talker_start_v1(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn tg_monitor_roundtrip() {
        roundtrip(Message::TgMonitor { tgs: vec![1, 42, 100] });
    }

    #[test]
    fn node_info_v3_roundtrip() {
        roundtrip(Message::NodeInfo {
            udp_iv_rand: vec![1, 2, 3, 4, 5],
            udp_key: vec![0u8; 16],
            json: "{}".to_string(),
        });
    }

    #[test]
    fn node_info_legacy_decodes_json_only() {
        let mut body = Vec::new();
        write_string(&mut body, "{\"v\":1}").unwrap();
        let decoded = Message::decode(types::NODE_INFO, &body, true).unwrap();
        assert_eq!(decoded, Message::NodeInfoV2 { json: "{\"v\":1}".to_string() });
    }

    #[test]
    fn signal_strength_values_roundtrip() {
        roundtrip(Message::SignalStrengthValues {
            rxs: vec![RxStatus {
                id: b'A',
                siglev: 200,
                enabled: true,
                squelch_open: false,
                active: true,
            }],
        });
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            Message::decode(9999, &[], false).unwrap_err(),
            CodecError::UnknownType(9999)
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err = Message::decode(types::HEARTBEAT, &[1, 2, 3], false).unwrap_err();
        assert_eq!(err, CodecError::TrailingBytes);
    }
}
