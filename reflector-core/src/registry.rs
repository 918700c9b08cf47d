//! Client registry (spec.md §3 "ClientRegistry", §4.6). Owns every `Session` in a slab, the
//! same `Vec<Option<T>> + free list` shape as the teacher's
//! `neutronium::net::endpoint::Endpoint` (`channels: Vec<Channel>` / `free: Vec<ChannelId>`),
//! and keeps three lookup indices in sync with it: client-id, (peer-ip, peer-udp-port) and
//! callsign. The callsign index only ever contains sessions that have reached `Phase::Connected`
//! (spec.md §8 invariant 6).

use crate::error::{RegistryError, RegistryResult};
use crate::session::{Phase, Session, SessionHandle};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Default)]
pub struct ClientRegistry {
    slots: Vec<Option<Session>>,
    free: Vec<usize>,
    by_client_id: HashMap<u16, usize>,
    by_udp_addr: HashMap<SocketAddr, usize>,
    by_callsign: HashMap<String, usize>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry::default()
    }

    /// Allocates a fresh, collision-free 16-bit client id uniformly at random in `[1, 65535]`
    /// (spec.md §4.6). Bounded retry loop so a pathologically full registry still terminates
    /// (spec.md §8 boundary behavior) rather than spinning forever.
    pub fn allocate_client_id<R: Rng>(&self, rng: &mut R) -> RegistryResult<u16> {
        const MAX_CLIENT_ID: u32 = u16::MAX as u32;

        if self.by_client_id.len() as u32 >= MAX_CLIENT_ID {
            return Err(RegistryError::ClientIdSpaceExhausted);
        }

        const RANDOM_ATTEMPTS: u32 = 64;
        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = rng.gen_range(1..=MAX_CLIENT_ID) as u16;
            if !self.by_client_id.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        // Fall back to a deterministic linear scan; guaranteed to terminate since we already
        // know the space isn't full.
        (1..=u16::MAX)
            .find(|id| !self.by_client_id.contains_key(id))
            .ok_or(RegistryError::ClientIdSpaceExhausted)
    }

    /// Inserts a freshly constructed session (already carrying its allocated `client_id`) and
    /// returns a stable handle to it.
    pub fn insert(&mut self, session: Session) -> SessionHandle {
        let client_id = session.client_id;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(session);
                index
            }
            None => {
                let index = self.slots.len();
                self.slots.push(Some(session));
                index
            }
        };

        self.by_client_id.insert(client_id, index);
        SessionHandle(index)
    }

    #[inline]
    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots.get(handle.0).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots.get_mut(handle.0).and_then(|s| s.as_mut())
    }

    pub fn get_by_client_id(&self, client_id: u16) -> Option<SessionHandle> {
        self.by_client_id.get(&client_id).map(|&i| SessionHandle(i))
    }

    pub fn get_by_udp_addr(&self, addr: SocketAddr) -> Option<SessionHandle> {
        self.by_udp_addr.get(&addr).map(|&i| SessionHandle(i))
    }

    pub fn get_by_callsign(&self, callsign: &str) -> Option<SessionHandle> {
        self.by_callsign.get(callsign).map(|&i| SessionHandle(i))
    }

    /// Binds a session's UDP source address, per spec.md §4.6: only meaningful once the UDP
    /// source has actually been observed.
    pub fn bind_udp_addr(&mut self, handle: SessionHandle, addr: SocketAddr) -> RegistryResult<()> {
        let index = handle.0;
        if self.slots.get(index).map_or(true, |s| s.is_none()) {
            return Err(RegistryError::StaleHandle);
        }

        if let Some(session) = self.get(handle) {
            if let Some(old) = session.udp_peer {
                self.by_udp_addr.remove(&old);
            }
        }

        self.by_udp_addr.insert(addr, index);
        if let Some(session) = self.get_mut(handle) {
            session.udp_peer = Some(addr);
        }
        Ok(())
    }

    /// Registers a session's callsign once it has reached `Phase::Connected` (spec.md §8
    /// invariant 6: a session that has not reached CONNECTED never sets a callsign in the
    /// registry).
    pub fn register_callsign(&mut self, handle: SessionHandle, callsign: String) -> RegistryResult<()> {
        let index = handle.0;
        let session = self.slots.get(index).and_then(|s| s.as_ref()).ok_or(RegistryError::StaleHandle)?;
        if !session.phase.is_connected() {
            return Err(RegistryError::StaleHandle);
        }

        self.by_callsign.insert(callsign.clone(), index);
        self.get_mut(handle).unwrap().callsign = callsign;
        Ok(())
    }

    /// Removes a session and every index entry that referenced it. Per spec.md §5 this must
    /// happen (or be scheduled to happen) before the `Session` itself is dropped, so in-flight
    /// broadcast iteration never observes a dangling handle.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        let index = handle.0;
        let session = self.slots.get_mut(index)?.take()?;

        self.by_client_id.remove(&session.client_id);
        if let Some(addr) = session.udp_peer {
            self.by_udp_addr.remove(&addr);
        }
        if !session.callsign.is_empty() {
            self.by_callsign.remove(&session.callsign);
        }
        self.free.push(index);
        Some(session)
    }

    /// Iterates every live session and its handle, in slab order (spec.md §8 invariant 8:
    /// `broadcastMsg` iterates the registry exactly once).
    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &Session)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SessionHandle(i), s)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SessionHandle, &mut Session)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (SessionHandle(i), s)))
    }

    pub fn len(&self) -> usize {
        self.by_client_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Debug/test helper: verifies the three-map consistency invariant (spec.md §8 invariant 2).
    #[cfg(test)]
    fn maps_consistent(&self) -> bool {
        for (client_id, &idx) in &self.by_client_id {
            match &self.slots[idx] {
                Some(s) if s.client_id == *client_id => {}
                _ => return false,
            }
        }
        for (addr, &idx) in &self.by_udp_addr {
            match &self.slots[idx] {
                Some(s) if s.udp_peer == Some(*addr) => {}
                _ => return false,
            }
        }
        for (callsign, &idx) in &self.by_callsign {
            match &self.slots[idx] {
                Some(s) if &s.callsign == callsign && s.phase.is_connected() => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Phase;
    use std::time::Instant;

    fn new_session(client_id: u16, port: u16) -> Session {
        Session::new(client_id, format!("127.0.0.1:{}", port).parse().unwrap(), Instant::now())
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut reg = ClientRegistry::new();
        let handle = reg.insert(new_session(1, 1000));
        assert_eq!(reg.get(handle).unwrap().client_id, 1);
        assert_eq!(reg.get_by_client_id(1), Some(handle));
        assert!(reg.maps_consistent());

        let removed = reg.remove(handle).unwrap();
        assert_eq!(removed.client_id, 1);
        assert!(reg.get(handle).is_none());
        assert_eq!(reg.get_by_client_id(1), None);
    }

    #[test]
    fn free_slot_is_reused() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(new_session(1, 1000));
        reg.remove(h1);
        let h2 = reg.insert(new_session(2, 1001));
        assert_eq!(h2, h1);
    }

    #[test]
    fn callsign_registered_only_when_connected() {
        let mut reg = ClientRegistry::new();
        let handle = reg.insert(new_session(1, 1000));

        assert!(reg.register_callsign(handle, "NODE1".to_string()).is_err());

        reg.get_mut(handle).unwrap().phase = Phase::Connected;
        assert!(reg.register_callsign(handle, "NODE1".to_string()).is_ok());
        assert_eq!(reg.get_by_callsign("NODE1"), Some(handle));
        assert!(reg.maps_consistent());
    }

    #[test]
    fn udp_addr_rebinding_moves_the_index_entry() {
        let mut reg = ClientRegistry::new();
        let handle = reg.insert(new_session(1, 1000));
        let addr_a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.1:5001".parse().unwrap();

        reg.bind_udp_addr(handle, addr_a).unwrap();
        assert_eq!(reg.get_by_udp_addr(addr_a), Some(handle));

        reg.bind_udp_addr(handle, addr_b).unwrap();
        assert_eq!(reg.get_by_udp_addr(addr_a), None);
        assert_eq!(reg.get_by_udp_addr(addr_b), Some(handle));
    }

    #[test]
    fn client_id_allocation_avoids_collisions() {
        let mut reg = ClientRegistry::new();
        let mut rng = rand::thread_rng();
        let mut seen = std::collections::HashSet::new();
        for port in 0..200u16 {
            let id = reg.allocate_client_id(&mut rng).unwrap();
            assert!(seen.insert(id));
            reg.insert(new_session(id, port));
        }
    }

    #[test]
    fn iteration_visits_every_live_session_once() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(new_session(1, 1000));
        let h2 = reg.insert(new_session(2, 1001));
        reg.remove(h1);
        let h3 = reg.insert(new_session(3, 1002));

        let mut ids: Vec<_> = reg.iter().map(|(_, s)| s.client_id).collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
        assert!(reg.get(h2).is_some());
        assert!(reg.get(h3).is_some());
    }
}
