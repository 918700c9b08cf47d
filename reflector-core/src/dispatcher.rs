//! Talk-group dispatcher (spec.md §3 "TalkGroup", §4.7 "C7 Talk-group dispatcher"). Owns TG
//! membership and talker arbitration; resolves sessions through the registry by handle rather
//! than holding owning references (spec.md §9 "cyclic references").
//!
//! Every public method here returns a list of [`DispatchEffect`]s describing what must be
//! broadcast as a result, rather than sending anything itself — actually encoding and writing
//! `reflector_proto::Message`s is `reflector-server`'s job via `reflector_core::broadcast`.

use crate::error::{DispatchError, DispatchResult};
use crate::registry::ClientRegistry;
use crate::session::SessionHandle;
use crate::qsy::QsyPool;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub const TALKER_AUDIO_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SQL_TIMEOUT_BLOCKTIME: Duration = Duration::from_secs(60);

/// Per-TG configuration (spec.md §4.7, §6 `TG#<n>` config section).
#[derive(Debug, Clone)]
pub struct TalkGroupConfig {
    pub allow: Regex,
    pub auto_qsy_after: Option<Duration>,
    pub show_activity: bool,
}

impl Default for TalkGroupConfig {
    fn default() -> Self {
        TalkGroupConfig {
            allow: Regex::new(".*").unwrap(),
            auto_qsy_after: None,
            show_activity: true,
        }
    }
}

struct TalkGroup {
    members: HashSet<SessionHandle>,
    talker: Option<SessionHandle>,
    last_audio: Instant,
    talker_since: Instant,
    next_qsy_deadline: Option<Instant>,
}

impl TalkGroup {
    fn new(now: Instant) -> Self {
        TalkGroup {
            members: HashSet::new(),
            talker: None,
            last_audio: now,
            talker_since: now,
            next_qsy_deadline: None,
        }
    }
}

/// Effects the dispatcher wants broadcast or applied, for the caller (`reflector-server`) to
/// turn into actual `reflector_proto::Message`/`UdpMessage` traffic and session-state writes.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEffect {
    /// A new talker started on `tg`. `is_v1_default_tg` tells the caller whether to *also* send
    /// the field-less V1 variant to protocol-1 clients (spec.md §4.7).
    TalkerStarted { tg: u32, callsign: String, is_v1_default_tg: bool },
    TalkerStopped { tg: u32, callsign: String, is_v1_default_tg: bool },
    /// Drain jitter buffers on every remaining member of `tg` (the departing talker is excluded
    /// by virtue of no longer being a member).
    FlushSamples { tg: u32 },
    RequestQsy { src_tg: u32, target_tg: u32 },
    Block { handle: SessionHandle, duration: Duration },
}

pub struct Dispatcher {
    talk_groups: HashMap<u32, TalkGroup>,
    tg_configs: HashMap<u32, TalkGroupConfig>,
    qsy_pool: QsyPool,
    pub sql_timeout: Duration,
    pub sql_timeout_blocktime: Duration,
    pub v1_default_tg: u32,
}

impl Dispatcher {
    pub fn new(qsy_lo: u32, qsy_count: u32) -> Self {
        Dispatcher {
            talk_groups: HashMap::new(),
            tg_configs: HashMap::new(),
            qsy_pool: QsyPool::new(qsy_lo, qsy_count),
            sql_timeout: Duration::from_secs(0),
            sql_timeout_blocktime: DEFAULT_SQL_TIMEOUT_BLOCKTIME,
            v1_default_tg: 0,
        }
    }

    pub fn set_tg_config(&mut self, tg: u32, config: TalkGroupConfig) {
        self.tg_configs.insert(tg, config);
    }

    pub fn reshape_qsy_pool(&mut self, lo: u32, count: u32) {
        self.qsy_pool.reshape(lo, count);
    }

    fn config_for(&self, tg: u32) -> TalkGroupConfig {
        self.tg_configs.get(&tg).cloned().unwrap_or_default()
    }

    /// Current config for `tg`, or the default if none has been set yet. Lets a caller read-modify-
    /// write a single tag (`CFG TG#<n> ALLOW ...`) without clobbering the rest (spec.md §4.10).
    pub fn tg_config(&self, tg: u32) -> TalkGroupConfig {
        self.config_for(tg)
    }

    fn is_v1_default(&self, tg: u32) -> bool {
        self.v1_default_tg != 0 && tg == self.v1_default_tg
    }

    pub fn member_count(&self, tg: u32) -> usize {
        self.talk_groups.get(&tg).map_or(0, |g| g.members.len())
    }

    pub fn current_talker(&self, tg: u32) -> Option<SessionHandle> {
        self.talk_groups.get(&tg).and_then(|g| g.talker)
    }

    /// Members of `tg`, for the caller to fan out `MsgUdpFlushSamples` (spec.md §4.7 "Flush on
    /// TG change") without the dispatcher itself touching the network.
    pub fn members(&self, tg: u32) -> impl Iterator<Item = SessionHandle> + '_ {
        self.talk_groups.get(&tg).into_iter().flat_map(|g| g.members.iter().copied())
    }

    /// Moves `handle` from its current TG (if any) to `tg` (`0` = leave with no new TG), per
    /// spec.md §4.7 "Switch". Idempotent: calling twice with the same `tg` is a no-op the second
    /// time (spec.md §8).
    pub fn switch_to(
        &mut self,
        registry: &mut ClientRegistry,
        handle: SessionHandle,
        tg: u32,
        now: Instant,
    ) -> DispatchResult<Vec<DispatchEffect>> {
        let session = registry.get(handle).ok_or(DispatchError::StaleHandle)?;
        let old_tg = session.current_tg;
        let callsign = session.callsign.clone();

        if old_tg == tg {
            return Ok(Vec::new());
        }

        if tg != 0 {
            let config = self.config_for(tg);
            if !config.allow.is_match(&callsign) {
                return Err(DispatchError::NotAllowed(callsign, tg));
            }
        }

        let mut effects = Vec::new();

        if old_tg != 0 {
            effects.extend(self.leave(handle, old_tg, &callsign, now));
        }

        if tg != 0 {
            let group = self.talk_groups.entry(tg).or_insert_with(|| TalkGroup::new(now));
            group.members.insert(handle);
        }

        registry.get_mut(handle).unwrap().current_tg = tg;
        Ok(effects)
    }

    fn leave(&mut self, handle: SessionHandle, tg: u32, callsign: &str, now: Instant) -> Vec<DispatchEffect> {
        let mut effects = Vec::new();
        let mut destroy = false;

        if let Some(group) = self.talk_groups.get_mut(&tg) {
            group.members.remove(&handle);

            if group.talker == Some(handle) {
                group.talker = None;
                effects.push(DispatchEffect::TalkerStopped {
                    tg,
                    callsign: callsign.to_string(),
                    is_v1_default_tg: self.is_v1_default(tg),
                });
                effects.push(DispatchEffect::FlushSamples { tg });
                self.arm_auto_qsy(tg, now);
            }

            destroy = group.members.is_empty();
        }

        if destroy {
            self.talk_groups.remove(&tg);
        }

        effects
    }

    /// Talker arbitration on an inbound audio datagram (spec.md §4.7 "Talker arbitration").
    /// Returns `true` via the effects list only when a *new* talker started; repeated audio from
    /// the existing talker just resets its timers and produces no effect.
    pub fn handle_audio(
        &mut self,
        registry: &ClientRegistry,
        handle: SessionHandle,
        tg: u32,
        now: Instant,
    ) -> Vec<DispatchEffect> {
        let callsign = match registry.get(handle) {
            Some(session) => session.callsign.clone(),
            None => return Vec::new(),
        };

        let group = self.talk_groups.entry(tg).or_insert_with(|| TalkGroup::new(now));

        match group.talker {
            None => {
                group.talker = Some(handle);
                group.talker_since = now;
                group.last_audio = now;
                group.next_qsy_deadline = None;
                vec![DispatchEffect::TalkerStarted { tg, callsign, is_v1_default_tg: self.is_v1_default(tg) }]
            }
            Some(current) if current == handle => {
                group.last_audio = now;
                Vec::new()
            }
            Some(_other) => Vec::new(), // no mixing: drop
        }
    }

    fn arm_auto_qsy(&mut self, tg: u32, now: Instant) {
        let auto_qsy_after = match self.config_for(tg).auto_qsy_after {
            Some(d) => d,
            None => return,
        };
        if let Some(group) = self.talk_groups.get_mut(&tg) {
            group.next_qsy_deadline = Some(now + auto_qsy_after);
        }
    }

    /// 1Hz housekeeping: audio-silence timeout, configured squelch timeout, auto-QSY deadlines
    /// (spec.md §4.7 "Timeouts"). Takes the registry read-only, solely to resolve the talker's
    /// callsign for the `MsgTalkerStop` effect it produces.
    pub fn tick(&mut self, registry: &ClientRegistry, now: Instant) -> Vec<DispatchEffect> {
        let mut effects = Vec::new();
        let tgs: Vec<u32> = self.talk_groups.keys().copied().collect();

        for tg in tgs {
            effects.extend(self.tick_tg(registry, tg, now));
        }

        effects
    }

    fn tick_tg(&mut self, registry: &ClientRegistry, tg: u32, now: Instant) -> Vec<DispatchEffect> {
        let mut effects = Vec::new();

        // Borrow scoped tightly so `arm_auto_qsy`/`request_qsy` below can re-borrow `self`.
        let (talker, silence_timed_out, squelch_timed_out) = {
            let group = match self.talk_groups.get(&tg) {
                Some(g) => g,
                None => return effects,
            };
            let talker = group.talker;
            let silence = talker.is_some() && now.duration_since(group.last_audio) >= TALKER_AUDIO_TIMEOUT;
            let squelch = talker.is_some()
                && self.sql_timeout > Duration::ZERO
                && now.duration_since(group.talker_since) >= self.sql_timeout;
            (talker, silence, squelch)
        };

        if let Some(handle) = talker {
            if silence_timed_out || squelch_timed_out {
                let callsign = registry.get(handle).map(|s| s.callsign.clone()).unwrap_or_default();
                if let Some(group) = self.talk_groups.get_mut(&tg) {
                    group.talker = None;
                }
                effects.push(DispatchEffect::TalkerStopped {
                    tg,
                    callsign,
                    is_v1_default_tg: self.is_v1_default(tg),
                });
                effects.push(DispatchEffect::FlushSamples { tg });
                self.arm_auto_qsy(tg, now);

                if squelch_timed_out {
                    effects.push(DispatchEffect::Block { handle, duration: self.sql_timeout_blocktime });
                }
            }
        } else {
            let deadline = self.talk_groups.get(&tg).and_then(|g| g.next_qsy_deadline);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    effects.extend(self.request_qsy_internal(tg, 0, now));
                    self.arm_auto_qsy(tg, now);
                }
            }
        }

        effects
    }

    /// `MsgRequestQsy` handling (spec.md §4.8 `requestQsy`). `requested_tg == 0` triggers random
    /// allocation from the configured pool, skipping TGs that already have members.
    pub fn request_qsy(&mut self, src_tg: u32, requested_tg: u32, now: Instant) -> Vec<DispatchEffect> {
        self.request_qsy_internal(src_tg, requested_tg, now)
    }

    fn request_qsy_internal(&mut self, src_tg: u32, requested_tg: u32, _now: Instant) -> Vec<DispatchEffect> {
        let target = if requested_tg == 0 {
            let talk_groups = &self.talk_groups;
            match self.qsy_pool.allocate(|tg| talk_groups.get(&tg).map_or(false, |g| !g.members.is_empty())) {
                Some(tg) => tg,
                None => return Vec::new(),
            }
        } else {
            requested_tg
        };

        vec![DispatchEffect::RequestQsy { src_tg, target_tg: target }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Phase, ProtoVersion, Session};
    use std::net::SocketAddr;

    fn connected(id: u16, callsign: &str) -> Session {
        let mut s = Session::new(id, format!("127.0.0.1:{}", 1000 + id).parse::<SocketAddr>().unwrap(), Instant::now());
        s.phase = Phase::Connected;
        s.callsign = callsign.to_string();
        s.proto = Some(ProtoVersion { major: 2, minor: 0 });
        s
    }

    #[test]
    fn switch_to_is_idempotent() {
        let mut reg = ClientRegistry::new();
        let h = reg.insert(connected(1, "NODE1"));
        let mut disp = Dispatcher::new(100, 10);
        let now = Instant::now();

        disp.switch_to(&mut reg, h, 42, now).unwrap();
        let effects_again = disp.switch_to(&mut reg, h, 42, now).unwrap();
        assert!(effects_again.is_empty());
        assert_eq!(disp.member_count(42), 1);
    }

    #[test]
    fn allow_regex_rejects_disallowed_callsign() {
        let mut reg = ClientRegistry::new();
        let h = reg.insert(connected(1, "NODE1"));
        let mut disp = Dispatcher::new(100, 10);
        disp.set_tg_config(42, TalkGroupConfig {
            allow: Regex::new("^OTHER").unwrap(),
            auto_qsy_after: None,
            show_activity: true,
        });

        let err = disp.switch_to(&mut reg, h, 42, Instant::now()).unwrap_err();
        assert!(matches!(err, DispatchError::NotAllowed(_, 42)));
    }

    #[test]
    fn first_audio_becomes_talker_second_is_no_mixing() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(connected(1, "NODE1"));
        let h2 = reg.insert(connected(2, "NODE2"));
        let mut disp = Dispatcher::new(100, 10);
        let now = Instant::now();

        disp.switch_to(&mut reg, h1, 42, now).unwrap();
        disp.switch_to(&mut reg, h2, 42, now).unwrap();

        let effects = disp.handle_audio(&reg, h1, 42, now);
        assert_eq!(effects, vec![DispatchEffect::TalkerStarted { tg: 42, callsign: "NODE1".into(), is_v1_default_tg: false }]);
        assert_eq!(disp.current_talker(42), Some(h1));

        let effects2 = disp.handle_audio(&reg, h2, 42, now);
        assert!(effects2.is_empty());
        assert_eq!(disp.current_talker(42), Some(h1));
    }

    #[test]
    fn silence_timeout_clears_talker_and_flushes() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(connected(1, "NODE1"));
        let mut disp = Dispatcher::new(100, 10);
        let now = Instant::now();

        disp.switch_to(&mut reg, h1, 42, now).unwrap();
        disp.handle_audio(&reg, h1, 42, now);

        let effects = disp.tick(&reg, now + Duration::from_secs(4));
        assert!(effects.contains(&DispatchEffect::TalkerStopped { tg: 42, callsign: "NODE1".into(), is_v1_default_tg: false }));
        assert!(effects.contains(&DispatchEffect::FlushSamples { tg: 42 }));
        assert_eq!(disp.current_talker(42), None);
    }

    #[test]
    fn squelch_timeout_blocks_the_talker() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(connected(1, "NODE1"));
        let mut disp = Dispatcher::new(100, 10);
        disp.sql_timeout = Duration::from_secs(30);
        let now = Instant::now();

        disp.switch_to(&mut reg, h1, 42, now).unwrap();
        disp.handle_audio(&reg, h1, 42, now);
        // keep refreshing last_audio so only the squelch timer (not silence) fires
        let t = now + Duration::from_secs(31);
        disp.handle_audio(&reg, h1, 42, t - Duration::from_secs(1));

        let effects = disp.tick(&reg, t);
        assert!(effects.iter().any(|e| matches!(e, DispatchEffect::Block { handle, duration } if *handle == h1 && *duration == DEFAULT_SQL_TIMEOUT_BLOCKTIME)));
    }

    #[test]
    fn empty_tg_is_destroyed() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(connected(1, "NODE1"));
        let mut disp = Dispatcher::new(100, 10);
        let now = Instant::now();

        disp.switch_to(&mut reg, h1, 42, now).unwrap();
        assert_eq!(disp.member_count(42), 1);
        disp.switch_to(&mut reg, h1, 0, now).unwrap();
        assert_eq!(disp.member_count(42), 0);
    }

    #[test]
    fn request_qsy_random_skips_occupied_tgs() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(connected(1, "NODE1"));
        let h2 = reg.insert(connected(2, "NODE2"));
        let mut disp = Dispatcher::new(100, 4);
        let now = Instant::now();

        disp.switch_to(&mut reg, h1, 100, now).unwrap();
        disp.switch_to(&mut reg, h2, 101, now).unwrap();

        let effects = disp.request_qsy(100, 0, now);
        assert_eq!(effects, vec![DispatchEffect::RequestQsy { src_tg: 100, target_tg: 102 }]);
    }

    #[test]
    fn leaving_while_talker_stops_talk_and_flushes() {
        let mut reg = ClientRegistry::new();
        let h1 = reg.insert(connected(1, "NODE1"));
        let mut disp = Dispatcher::new(100, 10);
        let now = Instant::now();

        disp.switch_to(&mut reg, h1, 42, now).unwrap();
        disp.handle_audio(&reg, h1, 42, now);
        let effects = disp.switch_to(&mut reg, h1, 0, now).unwrap();

        assert!(effects.contains(&DispatchEffect::TalkerStopped { tg: 42, callsign: "NODE1".into(), is_v1_default_tg: false }));
        assert!(effects.contains(&DispatchEffect::FlushSamples { tg: 42 }));
    }
}
