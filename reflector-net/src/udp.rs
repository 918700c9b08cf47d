//! Authenticated UDP transport (spec.md §4.2): AES-128-GCM datagrams with an explicit
//! IV composition and a monotonic per-session replay counter.
//!
//! Wire layout: `u32 aad_counter` (also used as the AAD) || ciphertext || 8-byte tag. The
//! registration datagram (counter == 0) carries an extended AAD that additionally contains the
//! client id, so the server can locate the session before (ip, port) has been bound to it.

use aes_gcm::aead::generic_array::typenum::{U12, U8};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::AesGcm;
use byteorder::{BigEndian, ByteOrder};

/// AES-128-GCM with an 8-byte (rather than the default 16-byte) authentication tag, per the
/// wire format in spec.md §6.
type Aes128Gcm8 = AesGcm<aes_gcm::Aes128, U12, U8>;

pub const KEY_SIZE: usize = 16;
pub const TAG_SIZE: usize = 8;
pub const IV_SIZE: usize = 12;
/// Size of the client-chosen random prefix that makes up the first 5 bytes of the IV.
pub const IV_RAND_SIZE: usize = 5;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum UdpError {
    #[error("datagram shorter than the minimum frame overhead")]
    Truncated,
    #[error("AEAD authentication failed")]
    Crypto,
}

/// Composes the 12-byte IV from the client's random prefix, its 16-bit client id and the
/// 32-bit send counter, as specified in spec.md §4.2: `rand(5) || client_id(2) || counter(4)`.
#[inline]
pub fn compose_iv(rand_prefix: &[u8; IV_RAND_SIZE], client_id: u16, counter: u32) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv[..IV_RAND_SIZE].copy_from_slice(rand_prefix);
    BigEndian::write_u16(&mut iv[IV_RAND_SIZE..IV_RAND_SIZE + 2], client_id);
    BigEndian::write_u32(&mut iv[IV_RAND_SIZE + 2..], counter);
    iv
}

/// Encrypts `plaintext` in place, returning `counter_be(4) || ciphertext || tag(8)`.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    counter: u32,
    extra_aad: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = Aes128Gcm8::new(key.into());

    let mut aad = [0u8; 4];
    BigEndian::write_u32(&mut aad, counter);
    let mut aad_full = Vec::with_capacity(4 + extra_aad.len());
    aad_full.extend_from_slice(&aad);
    aad_full.extend_from_slice(extra_aad);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(iv.into(), &aad_full, &mut buffer)
        .expect("AES-128-GCM encryption cannot fail for valid-size buffers");

    let mut out = Vec::with_capacity(4 + buffer.len() + TAG_SIZE);
    out.extend_from_slice(&aad);
    out.extend_from_slice(&buffer);
    out.extend_from_slice(&tag);
    out
}

/// Decrypts a datagram produced by [`encrypt`]. `extra_aad` must match what was supplied on
/// encryption (empty for ordinary datagrams, the client id for the registration datagram).
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    datagram: &[u8],
    extra_aad: &[u8],
) -> Result<(u32, Vec<u8>), UdpError> {
    if datagram.len() < 4 + TAG_SIZE {
        return Err(UdpError::Truncated);
    }

    let counter = BigEndian::read_u32(&datagram[..4]);
    let body_len = datagram.len() - 4 - TAG_SIZE;
    let ciphertext = &datagram[4..4 + body_len];
    let tag = &datagram[4 + body_len..];

    let mut aad_full = Vec::with_capacity(4 + extra_aad.len());
    aad_full.extend_from_slice(&datagram[..4]);
    aad_full.extend_from_slice(extra_aad);

    let cipher = Aes128Gcm8::new(key.into());
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(iv.into(), &aad_full, &mut buffer, tag.into())
        .map_err(|_| UdpError::Crypto)?;

    Ok((counter, buffer))
}

/// Result of checking an inbound datagram's counter against the session's expectation, per the
/// replay/ordering policy in spec.md §4.2.
#[derive(Debug, Eq, PartialEq)]
pub enum ReplayOutcome {
    /// Counter was below the expected value: drop silently.
    Stale,
    /// Counter matched the expected value exactly.
    InOrder,
    /// Counter was ahead of expectation: accepted, but a gap was detected.
    Gap { skipped: u32 },
}

/// Tracks the next expected receive counter for one session's UDP stream.
#[derive(Debug, Default)]
pub struct ReplayTracker {
    next_rx_counter: u32,
}

impl ReplayTracker {
    #[inline]
    pub fn new() -> Self {
        ReplayTracker { next_rx_counter: 0 }
    }

    /// Applies the ordering policy from spec.md §4.2 and advances `next_rx_counter` when the
    /// datagram is accepted.
    pub fn observe(&mut self, counter: u32) -> ReplayOutcome {
        if counter < self.next_rx_counter {
            return ReplayOutcome::Stale;
        }

        let outcome = if counter == self.next_rx_counter {
            ReplayOutcome::InOrder
        } else {
            ReplayOutcome::Gap {
                skipped: counter - self.next_rx_counter,
            }
        };

        self.next_rx_counter = counter + 1;
        outcome
    }
}

/// Legacy (protocol < 3) UDP header: unencrypted, explicit 16-bit client id and 16-bit sequence
/// number. Coexists with the AEAD framing above; a session's protocol version at handshake time
/// picks which one is used for its lifetime (spec.md Open Questions: counters are independent
/// per direction and per framing generation, not shared with the v3 AEAD counter).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LegacyHeader {
    pub client_id: u16,
    pub sequence: u16,
}

pub const LEGACY_HEADER_SIZE: usize = 4;

impl LegacyHeader {
    #[inline]
    pub fn read(datagram: &[u8]) -> Option<(LegacyHeader, &[u8])> {
        if datagram.len() < LEGACY_HEADER_SIZE {
            return None;
        }
        let client_id = BigEndian::read_u16(&datagram[0..2]);
        let sequence = BigEndian::read_u16(&datagram[2..4]);
        Some((LegacyHeader { client_id, sequence }, &datagram[LEGACY_HEADER_SIZE..]))
    }

    #[inline]
    pub fn write(self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEGACY_HEADER_SIZE + payload.len());
        let mut hdr = [0u8; LEGACY_HEADER_SIZE];
        BigEndian::write_u16(&mut hdr[0..2], self.client_id);
        BigEndian::write_u16(&mut hdr[2..4], self.sequence);
        out.extend_from_slice(&hdr);
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; KEY_SIZE];
        let rand_prefix = [1, 2, 3, 4, 5];
        let iv = compose_iv(&rand_prefix, 42, 1);

        let datagram = encrypt(&key, &iv, 1, &[], b"hello audio");
        let (counter, plain) = decrypt(&key, &iv, &datagram, &[]).unwrap();

        assert_eq!(counter, 1);
        assert_eq!(plain, b"hello audio");
    }

    #[test]
    fn registration_datagram_uses_extended_aad() {
        let key = [9u8; KEY_SIZE];
        let rand_prefix = [5, 5, 5, 5, 5];
        let iv = compose_iv(&rand_prefix, 7, 0);

        let mut client_id_aad = [0u8; 2];
        BigEndian::write_u16(&mut client_id_aad, 7);

        let datagram = encrypt(&key, &iv, 0, &client_id_aad, b"register");
        let (counter, plain) = decrypt(&key, &iv, &datagram, &client_id_aad).unwrap();

        assert_eq!(counter, 0);
        assert_eq!(plain, b"register");

        // Decrypting with the wrong AAD (as if the client id were omitted) must fail.
        assert_eq!(decrypt(&key, &iv, &datagram, &[]).unwrap_err(), UdpError::Crypto);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = [3u8; KEY_SIZE];
        let iv = compose_iv(&[0, 0, 0, 0, 0], 1, 5);
        let mut datagram = encrypt(&key, &iv, 5, &[], b"payload");
        let last = datagram.len() - 1;
        datagram[last] ^= 0xFF;

        assert_eq!(decrypt(&key, &iv, &datagram, &[]).unwrap_err(), UdpError::Crypto);
    }

    #[test]
    fn legacy_header_roundtrip() {
        let hdr = LegacyHeader { client_id: 99, sequence: 12345 };
        let wire = hdr.write(b"audio");
        let (parsed, payload) = LegacyHeader::read(&wire).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(payload, b"audio");
    }

    #[test]
    fn replay_tracker_orders_and_drops() {
        let mut tracker = ReplayTracker::new();

        assert_eq!(tracker.observe(0), ReplayOutcome::InOrder);
        assert_eq!(tracker.observe(1), ReplayOutcome::InOrder);
        assert_eq!(tracker.observe(1), ReplayOutcome::Stale);
        assert_eq!(tracker.observe(5), ReplayOutcome::Gap { skipped: 3 });
        assert_eq!(tracker.observe(5), ReplayOutcome::Stale);
        assert_eq!(tracker.observe(6), ReplayOutcome::InOrder);
    }
}
