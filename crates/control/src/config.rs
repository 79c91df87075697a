use std::{collections::HashMap, env, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Static topology of the controlled apparatus: subsystems and the
/// applications below them. Loaded once; the node tree is built from it and
/// never restructured afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct ApparatusConfig {
    pub apparatus_id: String,
    #[serde(default, rename = "subsystem")]
    pub subsystems: Vec<SubsystemConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubsystemConfig {
    pub name: String,
    #[serde(default, rename = "app")]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ApparatusConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("failed to parse apparatus configuration")
    }

    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read apparatus configuration '{}'", path.display()))?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listener_port: u16,
    pub command_timeout: Duration,
    pub snapshot_dir: PathBuf,
    pub answer_host: Option<String>,
    pub proxy: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listener_port: 56789,
            command_timeout: Duration::from_secs(10),
            snapshot_dir: "./snapshots".into(),
            answer_host: None,
            proxy: None,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("controller.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Ok(v) = env::var("RC_LISTENER_PORT") {
        if let Ok(parsed) = v.parse::<u16>() {
            settings.listener_port = parsed;
        }
    }
    if let Ok(v) = env::var("RC_COMMAND_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.command_timeout = Duration::from_secs(parsed);
        }
    }
    if let Ok(v) = env::var("RC_SNAPSHOT_DIR") {
        settings.snapshot_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("RC_ANSWER_HOST") {
        settings.answer_host = Some(v);
    }
    if let Ok(v) = env::var("RC_PROXY") {
        settings.proxy = Some(v);
    }

    settings
}

fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("listener_port").and_then(toml::Value::as_integer) {
        settings.listener_port = v as u16;
    }
    if let Some(v) = file_cfg
        .get("command_timeout_secs")
        .and_then(toml::Value::as_integer)
    {
        settings.command_timeout = Duration::from_secs(v as u64);
    }
    if let Some(v) = file_cfg.get("snapshot_dir").and_then(toml::Value::as_str) {
        settings.snapshot_dir = PathBuf::from(v);
    }
    if let Some(v) = file_cfg.get("answer_host").and_then(toml::Value::as_str) {
        settings.answer_host = Some(v.to_string());
    }
    if let Some(v) = file_cfg.get("proxy").and_then(toml::Value::as_str) {
        settings.proxy = Some(v.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apparatus_id = "teststand"

[[subsystem]]
name = "readout"

  [[subsystem.app]]
  name = "ru01"
  host = "localhost"
  port = 3333

  [[subsystem.app]]
  name = "ru02"
  host = "localhost"
  port = 3334

[[subsystem]]
name = "trigger"

  [[subsystem.app]]
  name = "tr01"
  host = "localhost"
  port = 3401
"#;

    #[test]
    fn parses_apparatus_topology() {
        let config = ApparatusConfig::from_toml_str(SAMPLE).expect("parse");
        assert_eq!(config.apparatus_id, "teststand");
        assert_eq!(config.subsystems.len(), 2);
        assert_eq!(config.subsystems[0].name, "readout");
        assert_eq!(config.subsystems[0].apps.len(), 2);
        assert_eq!(config.subsystems[1].apps[0].name, "tr01");
        assert_eq!(config.subsystems[1].apps[0].port, 3401);
    }

    #[test]
    fn rejects_malformed_topology() {
        assert!(ApparatusConfig::from_toml_str("apparatus_id = 12").is_err());
    }

    #[test]
    fn file_overrides_replace_defaults() {
        let mut settings = Settings::default();
        apply_file_overrides(
            &mut settings,
            r#"
listener_port = 57123
command_timeout_secs = 30
snapshot_dir = "/tmp/runs"
answer_host = "ctl.example.org"
"#,
        );
        assert_eq!(settings.listener_port, 57123);
        assert_eq!(settings.command_timeout, Duration::from_secs(30));
        assert_eq!(settings.snapshot_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(settings.answer_host.as_deref(), Some("ctl.example.org"));
        assert_eq!(settings.proxy, None);
    }

    #[test]
    fn unreadable_overrides_keep_defaults() {
        let mut settings = Settings::default();
        apply_file_overrides(&mut settings, "listener_port = [not, a, port]");
        assert_eq!(settings.listener_port, Settings::default().listener_port);
    }
}
