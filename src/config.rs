//! Persisted agent defaults and process-wide environment knobs.
//!
//! The agent stores its flag values in `$HOME/.ngopen/config.toml` so a
//! tunnel can be re-opened without retyping the token and addresses. CLI
//! flags always override stored values.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable selecting dev mode (`DEV` disables the expectation
/// of an upstream TLS terminator; the ingress itself always speaks plain
/// HTTP).
pub const MODE_ENV: &str = "NGOPEN_MODE";

/// Environment variable overriding the hostname suffix.
pub const SUFFIX_ENV: &str = "NGOPEN_HOSTNAME_SUFFIX";

/// Environment variable controlling the log filter.
pub const LOG_LEVEL_ENV: &str = "NGOPEN_LOG_LEVEL";

pub fn dev_mode() -> bool {
    std::env::var(MODE_ENV).is_ok_and(|mode| mode == "DEV")
}

/// Stored agent defaults; every field mirrors a `tunnel` flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Humantime duration string, e.g. `5s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_ip: Option<bool>,
}

/// `$HOME/.ngopen`, created `0700` on first use.
pub fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set")?;
    let dir = PathBuf::from(home).join(".ngopen");
    if !dir.exists() {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&dir)
            .with_context(|| format!("failed to create config directory {dir:?}"))?;
    }
    Ok(dir)
}

fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

impl StoredConfig {
    pub fn load() -> Result<Self> {
        let path = config_file()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        toml::from_str(&contents).context("failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let path = config_file()?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write config file {path:?}"))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match key {
            "auth" => self.auth.clone(),
            "hostname" => self.hostname.clone(),
            "local" => self.local.clone(),
            "server" => self.server.clone(),
            "reconnect-delay" => self.reconnect_delay.clone(),
            "preserve-ip" => self.preserve_ip.map(|v| v.to_string()),
            _ => bail!("unknown config key: {key}"),
        })
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "auth" => self.auth = Some(value.to_string()),
            "hostname" => self.hostname = Some(value.to_string()),
            "local" => self.local = Some(value.to_string()),
            "server" => self.server = Some(value.to_string()),
            "reconnect-delay" => {
                humantime::parse_duration(value)
                    .with_context(|| format!("invalid duration: {value}"))?;
                self.reconnect_delay = Some(value.to_string());
            }
            "preserve-ip" => {
                self.preserve_ip =
                    Some(value.parse().with_context(|| format!("invalid bool: {value}"))?);
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    /// Key/value view of the populated fields, for `config list`.
    pub fn entries(&self) -> BTreeMap<&'static str, String> {
        let mut entries = BTreeMap::new();
        if let Some(v) = &self.auth {
            entries.insert("auth", v.clone());
        }
        if let Some(v) = &self.hostname {
            entries.insert("hostname", v.clone());
        }
        if let Some(v) = &self.local {
            entries.insert("local", v.clone());
        }
        if let Some(v) = &self.server {
            entries.insert("server", v.clone());
        }
        if let Some(v) = &self.reconnect_delay {
            entries.insert("reconnect-delay", v.clone());
        }
        if let Some(v) = self.preserve_ip {
            entries.insert("preserve-ip", v.to_string());
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip_keeps_populated_fields_only() {
        let mut cfg = StoredConfig::default();
        cfg.set("auth", "tok").unwrap();
        cfg.set("preserve-ip", "false").unwrap();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(!text.contains("hostname"));
        let back: StoredConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.auth.as_deref(), Some("tok"));
        assert_eq!(back.preserve_ip, Some(false));
    }

    #[test]
    fn set_validates_typed_keys() {
        let mut cfg = StoredConfig::default();
        assert!(cfg.set("reconnect-delay", "not-a-duration").is_err());
        assert!(cfg.set("preserve-ip", "maybe").is_err());
        assert!(cfg.set("no-such-key", "x").is_err());
        cfg.set("reconnect-delay", "5s").unwrap();
        assert_eq!(cfg.get("reconnect-delay").unwrap().as_deref(), Some("5s"));
    }

    #[test]
    fn get_unknown_key_errors() {
        assert!(StoredConfig::default().get("bogus").is_err());
    }
}
