//! Broadcast engine (spec.md §4.8, "C8 Broadcast engine"). Pure fan-out: iterate the registry
//! once and invoke a callback for every session that both matches the filter and has reached
//! `Phase::Connected` (spec.md §8 invariant 8). Actually writing bytes to a socket — TCP frame,
//! or AEAD-encrypted UDP datagram — is `reflector-server`'s job, since it alone owns the
//! per-session transport handles; this module only decides *who* receives a message.

use crate::filter::Filter;
use crate::registry::ClientRegistry;
use crate::session::{Session, SessionHandle};

/// Iterates the registry exactly once, invoking `send` for every `Connected` session matching
/// `filter`. Returns the number of sessions the callback was invoked for.
pub fn broadcast<F: FnMut(SessionHandle, &Session)>(
    registry: &ClientRegistry,
    filter: &Filter,
    mut send: F,
) -> usize {
    let mut delivered = 0;
    for (handle, session) in registry.iter() {
        if session.phase.is_connected() && filter.matches(handle, session) {
            send(handle, session);
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Phase, ProtoVersion, Session};
    use std::time::Instant;

    fn connected_session(tg: u32) -> Session {
        let mut s = Session::new(1, "127.0.0.1:1".parse().unwrap(), Instant::now());
        s.phase = Phase::Connected;
        s.current_tg = tg;
        s.proto = Some(ProtoVersion { major: 2, minor: 0 });
        s
    }

    #[test]
    fn only_connected_matching_sessions_are_delivered_to() {
        let mut reg = ClientRegistry::new();
        let mut s1 = connected_session(42);
        s1.client_id = 1;
        let mut s2 = connected_session(42);
        s2.client_id = 2;
        s2.phase = Phase::ExpectAuthResponse; // not connected yet
        let mut s3 = connected_session(99);
        s3.client_id = 3;

        reg.insert(s1);
        reg.insert(s2);
        reg.insert(s3);

        let mut hit = Vec::new();
        let delivered = broadcast(&reg, &Filter::Tg(42), |_h, s| hit.push(s.client_id));

        assert_eq!(delivered, 1);
        assert_eq!(hit, vec![1]);
    }

    #[test]
    fn broadcast_iterates_exactly_once_per_session() {
        let mut reg = ClientRegistry::new();
        for id in 1..=5u16 {
            let mut s = connected_session(7);
            s.client_id = id;
            reg.insert(s);
        }

        let mut count = 0;
        broadcast(&reg, &Filter::All, |_h, _s| count += 1);
        assert_eq!(count, 5);
    }
}
