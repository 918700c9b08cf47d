//! On-disk config format (spec.md §6 "Config file", SPEC_FULL.md §4.12). TOML, loaded with
//! `serdeconv::from_toml_file`, matching the teacher's `GameConfig::load`. The INI-style
//! section/tag naming from spec.md §11 maps onto TOML tables: `GLOBAL` -> `[global]`,
//! `TG#<n>` -> `[tg.<n>]`, `USERS`/`PASSWORDS` -> flat string-keyed tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub global: Global,
    #[serde(default)]
    pub root_ca: CaSettings,
    #[serde(default)]
    pub issuing_ca: CaSettings,
    #[serde(default)]
    pub server_cert: ServerCertSettings,
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default)]
    pub passwords: HashMap<String, String>,
    #[serde(default)]
    pub tg: HashMap<String, TgSettings>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Global {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub sql_timeout: u64,
    #[serde(default = "default_sql_timeout_blocktime")]
    pub sql_timeout_blocktime: u64,
    #[serde(default = "default_random_qsy_range")]
    pub random_qsy_range: String,
    #[serde(default)]
    pub tg_for_v1_clients: u32,
    #[serde(default = "default_accept")]
    pub accept_callsign: String,
    #[serde(default = "default_reject")]
    pub reject_callsign: String,
    #[serde(default)]
    pub cert_ca_hook: String,
    #[serde(default = "default_pki_root")]
    pub pki_root: String,
    #[serde(default = "default_codecs")]
    pub codecs: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    5300
}
fn default_sql_timeout_blocktime() -> u64 {
    60
}
fn default_random_qsy_range() -> String {
    "100:100".to_string()
}
fn default_accept() -> String {
    ".*".to_string()
}
fn default_reject() -> String {
    "^$".to_string()
}
fn default_pki_root() -> String {
    "./pki".to_string()
}
fn default_codecs() -> Vec<String> {
    vec!["Opus".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CaSettings {
    #[serde(default)]
    pub common_name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerCertSettings {
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub subject_alt_name: Vec<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TgSettings {
    #[serde(default = "default_accept")]
    pub allow: String,
    #[serde(default)]
    pub auto_qsy_after: Option<u64>,
    #[serde(default = "default_true")]
    pub show_activity: bool,
}

fn default_true() -> bool {
    true
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Settings> {
        serdeconv::from_toml_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to load config {:?}: {}", path.as_ref(), e))
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            global: Global {
                listen_port: default_listen_port(),
                sql_timeout: 0,
                sql_timeout_blocktime: default_sql_timeout_blocktime(),
                random_qsy_range: default_random_qsy_range(),
                tg_for_v1_clients: 0,
                accept_callsign: default_accept(),
                reject_callsign: default_reject(),
                cert_ca_hook: String::new(),
                pki_root: default_pki_root(),
                codecs: default_codecs(),
                log_level: default_log_level(),
            },
            root_ca: CaSettings::default(),
            issuing_ca: CaSettings::default(),
            server_cert: ServerCertSettings::default(),
            users: HashMap::new(),
            passwords: HashMap::new(),
            tg: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_minimal_toml() {
        let toml = "[global]\n";
        let settings: Settings = serdeconv::from_toml_str(toml).unwrap();
        assert_eq!(settings.global.listen_port, 5300);
        assert_eq!(settings.global.sql_timeout_blocktime, 60);
    }

    #[test]
    fn tg_section_parses_by_numeric_key() {
        let toml = "[global]\n[tg.42]\nallow = \"^NODE\"\nauto_qsy_after = 300\n";
        let settings: Settings = serdeconv::from_toml_str(toml).unwrap();
        let tg = settings.tg.get("42").unwrap();
        assert_eq!(tg.allow, "^NODE");
        assert_eq!(tg.auto_qsy_after, Some(300));
        assert!(tg.show_activity);
    }
}
