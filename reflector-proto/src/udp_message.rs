//! UDP media-plane messages (spec.md §4.3 / §6). These are the plaintext payload carried inside
//! the AEAD envelope from `reflector_net::udp` (or, for legacy protocol < 3 sessions, inside the
//! unencrypted `LegacyHeader` framing) — this module only knows about `u16 type || body`.

use crate::error::{CodecError, CodecResult};
use crate::message::RxStatus;
use crate::types;
use crate::wire::*;
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq)]
pub enum UdpMessage {
    Heartbeat,
    Audio { samples: Vec<u8> },
    FlushSamples,
    AllSamplesFlushed,
    SignalStrengthValues { rxs: Vec<RxStatus> },
}

impl UdpMessage {
    pub fn msg_type(&self) -> u16 {
        match self {
            UdpMessage::Heartbeat => types::UDP_HEARTBEAT,
            UdpMessage::Audio { .. } => types::UDP_AUDIO,
            UdpMessage::FlushSamples => types::UDP_FLUSH_SAMPLES,
            UdpMessage::AllSamplesFlushed => types::UDP_ALL_SAMPLES_FLUSHED,
            UdpMessage::SignalStrengthValues { .. } => types::UDP_SIGNAL_STRENGTH_VALUES,
        }
    }

    /// Encodes `u16 type || body`. This is the plaintext handed to `reflector_net::udp::encrypt`.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        write_u16(&mut out, self.msg_type())?;
        match self {
            UdpMessage::Heartbeat | UdpMessage::FlushSamples | UdpMessage::AllSamplesFlushed => {}
            UdpMessage::Audio { samples } => out.extend_from_slice(samples),
            UdpMessage::SignalStrengthValues { rxs } => {
                write_u16(&mut out, rxs.len() as u16)?;
                for rx in rxs {
                    let mut flags = 0u8;
                    if rx.enabled {
                        flags |= 1;
                    }
                    if rx.squelch_open {
                        flags |= 2;
                    }
                    if rx.active {
                        flags |= 4;
                    }
                    out.push(rx.id);
                    out.push(rx.siglev);
                    out.push(flags);
                }
            }
        }
        Ok(out)
    }

    /// Decodes a UDP plaintext payload given its type code, as produced by
    /// `reflector_net::udp::decrypt`.
    pub fn decode(msg_type: u16, body: &[u8]) -> CodecResult<UdpMessage> {
        let mut cur = Cursor::new(body);
        let msg = match msg_type {
            types::UDP_HEARTBEAT => UdpMessage::Heartbeat,
            types::UDP_AUDIO => UdpMessage::Audio { samples: body.to_vec() },
            types::UDP_FLUSH_SAMPLES => UdpMessage::FlushSamples,
            types::UDP_ALL_SAMPLES_FLUSHED => UdpMessage::AllSamplesFlushed,
            types::UDP_SIGNAL_STRENGTH_VALUES => {
                let count = read_u16(&mut cur)?;
                let mut rxs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = read_bytes_fixed(&mut cur, 1)?[0];
                    let siglev = read_bytes_fixed(&mut cur, 1)?[0];
                    let flags = read_bytes_fixed(&mut cur, 1)?[0];
                    rxs.push(RxStatus {
                        id,
                        siglev,
                        enabled: flags & 1 != 0,
                        squelch_open: flags & 2 != 0,
                        active: flags & 4 != 0,
                    });
                }
                UdpMessage::SignalStrengthValues { rxs }
            }
            other => return Err(CodecError::UnknownType(other)),
        };

        if msg_type != types::UDP_AUDIO {
            expect_exhausted(&cur)?;
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_roundtrip() {
        let msg = UdpMessage::Audio { samples: vec![1, 2, 3, 4] };
        let encoded = msg.encode().unwrap();
        let decoded = UdpMessage::decode(types::UDP_AUDIO, &encoded[2..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let encoded = UdpMessage::Heartbeat.encode().unwrap();
        assert_eq!(encoded.len(), 2);
        let decoded = UdpMessage::decode(types::UDP_HEARTBEAT, &[]).unwrap();
        assert_eq!(decoded, UdpMessage::Heartbeat);
    }

    #[test]
    fn signal_strength_roundtrip() {
        let msg = UdpMessage::SignalStrengthValues {
            rxs: vec![RxStatus { id: b'A', siglev: 10, enabled: true, squelch_open: true, active: false }],
        };
        let encoded = msg.encode().unwrap();
        let decoded = UdpMessage::decode(types::UDP_SIGNAL_STRENGTH_VALUES, &encoded[2..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_udp_type_is_rejected() {
        assert_eq!(
            UdpMessage::decode(9999, &[]).unwrap_err(),
            CodecError::UnknownType(9999)
        );
    }
}
