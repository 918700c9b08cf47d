//! Session filters (spec.md §3 "Filter"), composable predicates used by the broadcast engine.

use crate::session::{Session, SessionHandle};

#[derive(Debug, Clone)]
pub enum Filter {
    All,
    Except(SessionHandle),
    ProtoVersionAtLeast { major: u16 },
    ProtoVersionInRange { min_major: u16, max_major: u16 },
    Tg(u32),
    MonitoringTg(u32),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, handle: SessionHandle, session: &Session) -> bool {
        match self {
            Filter::All => true,
            Filter::Except(other) => handle != *other,
            Filter::ProtoVersionAtLeast { major } => {
                session.proto.map_or(false, |p| p.major >= *major)
            }
            Filter::ProtoVersionInRange { min_major, max_major } => session
                .proto
                .map_or(false, |p| p.major >= *min_major && p.major <= *max_major),
            Filter::Tg(tg) => session.current_tg == *tg,
            Filter::MonitoringTg(tg) => session.monitored_tgs.contains(tg),
            Filter::And(a, b) => a.matches(handle, session) && b.matches(handle, session),
            Filter::Or(a, b) => a.matches(handle, session) || b.matches(handle, session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ProtoVersion, Session};
    use std::time::Instant;

    fn session_with(tg: u32, major: u16) -> Session {
        let mut s = Session::new(1, "127.0.0.1:1".parse().unwrap(), Instant::now());
        s.current_tg = tg;
        s.proto = Some(ProtoVersion { major, minor: 0 });
        s
    }

    #[test]
    fn and_or_compose() {
        let s = session_with(42, 2);
        let handle = SessionHandle(0);

        let f = Filter::Tg(42).and(Filter::ProtoVersionAtLeast { major: 2 });
        assert!(f.matches(handle, &s));

        let f = Filter::Tg(99).or(Filter::ProtoVersionAtLeast { major: 2 });
        assert!(f.matches(handle, &s));

        let f = Filter::Tg(99).and(Filter::ProtoVersionAtLeast { major: 2 });
        assert!(!f.matches(handle, &s));
    }

    #[test]
    fn except_excludes_only_the_named_handle() {
        let s = session_with(0, 1);
        assert!(!Filter::Except(SessionHandle(3)).matches(SessionHandle(3), &s));
        assert!(Filter::Except(SessionHandle(3)).matches(SessionHandle(4), &s));
    }
}
