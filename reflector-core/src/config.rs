//! Dynamic config (spec.md §3.11 "C11 Dynamic config"): a hierarchical `section/tag -> value`
//! store. Per spec.md "the config layer parses then calls typed setters on the
//! dispatcher/PKI/registry rather than the config store pushing blind string mutations", `set`
//! both records the raw string (so the store stays introspectable/dumpable) and, for the
//! recognized runtime-mutable keys (spec.md §4.11), returns a typed [`ConfigChange`] the caller
//! applies to the relevant service.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("malformed value {0:?} for {1}/{2}")]
    Malformed(String, String, String),
}

/// A recognized config mutation, ready for the caller to apply to the service it affects.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    SqlTimeout(Duration),
    SqlTimeoutBlocktime(Duration),
    RandomQsyRange { lo: u32, count: u32 },
    TgForV1Clients(u32),
    AcceptCallsign(String),
    RejectCallsign(String),
    ListenPort(u16),
    /// A `TG#<n>/<tag>` write; the dispatcher owns per-TG config so this is handed back whole.
    TalkGroupTag { tg: u32, tag: String, value: String },
    /// Recognized section/tag with no typed effect (e.g. informational); recorded but ignored.
    Unrecognized,
}

#[derive(Default)]
pub struct DynamicConfig {
    raw: HashMap<(String, String), String>,
}

impl DynamicConfig {
    pub fn new() -> Self {
        DynamicConfig::default()
    }

    pub fn get(&self, section: &str, tag: &str) -> Option<&str> {
        self.raw.get(&(section.to_string(), tag.to_string())).map(|s| s.as_str())
    }

    /// Parses and records `section/tag = value`. Always stores the raw string; additionally
    /// returns a typed [`ConfigChange`] for the keys spec.md §4.11 names as runtime-mutable.
    pub fn set(&mut self, section: &str, tag: &str, value: &str) -> Result<ConfigChange, ConfigError> {
        let change = Self::interpret(section, tag, value)?;
        self.raw
            .insert((section.to_string(), tag.to_string()), value.to_string());
        Ok(change)
    }

    fn interpret(section: &str, tag: &str, value: &str) -> Result<ConfigChange, ConfigError> {
        let malformed = || ConfigError::Malformed(value.to_string(), section.to_string(), tag.to_string());

        if section.starts_with("TG#") {
            return Ok(ConfigChange::TalkGroupTag {
                tg: section[3..].parse::<u32>().map_err(|_| malformed())?,
                tag: tag.to_string(),
                value: value.to_string(),
            });
        }

        if section != "GLOBAL" {
            return Ok(ConfigChange::Unrecognized);
        }

        match tag {
            "SQL_TIMEOUT" => {
                let secs: u64 = value.parse().map_err(|_| malformed())?;
                Ok(ConfigChange::SqlTimeout(Duration::from_secs(secs)))
            }
            "SQL_TIMEOUT_BLOCKTIME" => {
                let secs: u64 = value.parse().map_err(|_| malformed())?;
                Ok(ConfigChange::SqlTimeoutBlocktime(Duration::from_secs(secs)))
            }
            "RANDOM_QSY_RANGE" => {
                let (lo_str, count_str) = value.split_once(':').ok_or_else(malformed)?;
                let lo: u32 = lo_str.parse().map_err(|_| malformed())?;
                let count: u32 = count_str.parse().map_err(|_| malformed())?;
                if lo < 1 || count < 1 {
                    return Err(malformed());
                }
                Ok(ConfigChange::RandomQsyRange { lo, count })
            }
            "TG_FOR_V1_CLIENTS" => {
                let tg: u32 = value.parse().map_err(|_| malformed())?;
                Ok(ConfigChange::TgForV1Clients(tg))
            }
            "ACCEPT_CALLSIGN" => Ok(ConfigChange::AcceptCallsign(value.to_string())),
            "REJECT_CALLSIGN" => Ok(ConfigChange::RejectCallsign(value.to_string())),
            "LISTEN_PORT" => {
                let port: u16 = value.parse().map_err(|_| malformed())?;
                Ok(ConfigChange::ListenPort(port))
            }
            _ => Ok(ConfigChange::Unrecognized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_timeout_parses_to_duration() {
        let mut cfg = DynamicConfig::new();
        let change = cfg.set("GLOBAL", "SQL_TIMEOUT", "45").unwrap();
        assert_eq!(change, ConfigChange::SqlTimeout(Duration::from_secs(45)));
        assert_eq!(cfg.get("GLOBAL", "SQL_TIMEOUT"), Some("45"));
    }

    #[test]
    fn random_qsy_range_parses_lo_and_count() {
        let mut cfg = DynamicConfig::new();
        let change = cfg.set("GLOBAL", "RANDOM_QSY_RANGE", "100:4").unwrap();
        assert_eq!(change, ConfigChange::RandomQsyRange { lo: 100, count: 4 });
    }

    #[test]
    fn random_qsy_range_rejects_zero_count() {
        let mut cfg = DynamicConfig::new();
        assert!(cfg.set("GLOBAL", "RANDOM_QSY_RANGE", "100:0").is_err());
    }

    #[test]
    fn tg_section_routes_to_talk_group_tag() {
        let mut cfg = DynamicConfig::new();
        let change = cfg.set("TG#42", "ALLOW", "^NODE.*$").unwrap();
        assert_eq!(
            change,
            ConfigChange::TalkGroupTag { tg: 42, tag: "ALLOW".to_string(), value: "^NODE.*$".to_string() }
        );
    }

    #[test]
    fn unknown_global_tag_is_recorded_but_unrecognized() {
        let mut cfg = DynamicConfig::new();
        let change = cfg.set("GLOBAL", "SOME_FUTURE_KEY", "x").unwrap();
        assert_eq!(change, ConfigChange::Unrecognized);
        assert_eq!(cfg.get("GLOBAL", "SOME_FUTURE_KEY"), Some("x"));
    }
}
