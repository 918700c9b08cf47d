//! Legacy (protocol < 3) challenge/response authentication (spec.md §4.4, §8 S2): the server
//! hands out a 20-byte random challenge, the client replies with `HMAC-SHA1(secret, challenge)`
//! plus its callsign, and the secret is resolved group-indirected: `USERS` maps callsign to
//! group, `PASSWORDS` maps group to the shared secret. Digest comparison is constant-time so a
//! timing side channel can't narrow down a correct prefix.

use hmac::{Hmac, Mac, NewMac};
use sha1::Sha1;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

pub const CHALLENGE_LEN: usize = 20;
pub const DIGEST_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// The `USERS` / `PASSWORDS` config sections (spec.md §6), kept as two flat maps rather than one
/// callsign-to-secret table so an operator can rotate a group's shared secret without touching
/// every member's entry.
#[derive(Debug, Default, Clone)]
pub struct UserDirectory {
    users: HashMap<String, String>,
    passwords: HashMap<String, String>,
}

impl UserDirectory {
    pub fn new() -> Self {
        UserDirectory::default()
    }

    pub fn set_user_group(&mut self, callsign: String, group: String) {
        self.users.insert(callsign, group);
    }

    pub fn set_group_secret(&mut self, group: String, secret: String) {
        self.passwords.insert(group, secret);
    }

    fn secret_for(&self, callsign: &str) -> Option<&str> {
        let group = self.users.get(callsign)?;
        self.passwords.get(group).map(|s| s.as_str())
    }

    /// Verifies a `MsgAuthResponse` digest against the callsign's group secret in constant time.
    /// Returns `false` (never errors) for an unknown callsign, matching spec.md §7's "unknown
    /// callsign" authentication-error kind, which the caller turns into a disconnect.
    pub fn verify(&self, callsign: &str, challenge: &[u8; CHALLENGE_LEN], digest: &[u8; DIGEST_LEN]) -> bool {
        let secret = match self.secret_for(callsign) {
            Some(s) => s,
            None => return false,
        };

        let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(challenge);
        let expected = mac.finalize().into_bytes();

        expected.ct_eq(digest).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_for(secret: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; DIGEST_LEN] {
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(challenge);
        let bytes = mac.finalize().into_bytes();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&bytes);
        out
    }

    #[test]
    fn correct_digest_verifies_through_group_indirection() {
        let mut dir = UserDirectory::new();
        dir.set_user_group("NODE1".to_string(), "GRP1".to_string());
        dir.set_group_secret("GRP1".to_string(), "s3cret".to_string());

        let challenge = [7u8; CHALLENGE_LEN];
        let digest = digest_for("s3cret", &challenge);

        assert!(dir.verify("NODE1", &challenge, &digest));
    }

    #[test]
    fn wrong_digest_is_rejected() {
        let mut dir = UserDirectory::new();
        dir.set_user_group("NODE1".to_string(), "GRP1".to_string());
        dir.set_group_secret("GRP1".to_string(), "s3cret".to_string());

        let challenge = [7u8; CHALLENGE_LEN];
        let bad_digest = [0u8; DIGEST_LEN];

        assert!(!dir.verify("NODE1", &challenge, &bad_digest));
    }

    #[test]
    fn unknown_callsign_never_verifies() {
        let dir = UserDirectory::new();
        let challenge = [1u8; CHALLENGE_LEN];
        let digest = [2u8; DIGEST_LEN];
        assert!(!dir.verify("GHOST", &challenge, &digest));
    }
}
