//! On-disk JSON configuration file: `{version, port, allowedDirs, aiCommands, auth}`.
//!
//! Structurally this follows the load/save/validate idiom used for this
//! codebase's own daemon configuration, ported from TOML to JSON and with
//! a field set matching the wire contract this crate exposes over
//! `GET`/`PUT /api/config`. `auth` is persisted here (it is, after all,
//! one JSON file) but is never returned by the config endpoints — the
//! token store is the only thing that reads or writes it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 3456;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiCommand {
    pub id: Uuid,
    pub name: String,
    pub cmd: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AuthSection {
    #[serde(rename = "tokenHash", skip_serializing_if = "Option::is_none")]
    pub token_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    pub port: u16,
    #[serde(rename = "allowedDirs", default)]
    pub allowed_dirs: Vec<PathBuf>,
    #[serde(rename = "aiCommands", default)]
    pub ai_commands: Vec<AiCommand>,
    #[serde(default)]
    pub auth: AuthSection,
}

impl Config {
    /// Defaults seeded from `PORT`, `AI_COMMAND`, `ALLOWED_DIRS` (as
    /// described in the env-var table), used the first time the config
    /// file is created.
    pub fn defaults_from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let ai_command_cmd = std::env::var("AI_COMMAND").unwrap_or_else(|_| "claude".to_string());

        let allowed_dirs = std::env::var("ALLOWED_DIRS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Config {
            version: "1.0.0".to_string(),
            port,
            allowed_dirs,
            ai_commands: vec![AiCommand {
                id: Uuid::new_v4(),
                name: "claude".to_string(),
                cmd: ai_command_cmd,
                enabled: true,
            }],
            auth: AuthSection::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be nonzero");
        }
        for dir in &self.allowed_dirs {
            if !dir.is_absolute() {
                anyhow::bail!("allowedDirs entries must be absolute paths: {dir:?}");
            }
        }
        Ok(())
    }

    /// Load from `path`, creating it (seeded from environment) if absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::defaults_from_env();
            config.save(path)?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path:?}"))?;
        let config: Config =
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {parent:?}"))?;
        }
        let pretty = serde_json::to_string_pretty(self)?;
        std::fs::write(path, pretty).with_context(|| format!("writing config file {path:?}"))?;
        Ok(())
    }

    /// The subset exposed over `GET`/`PUT /api/config` — `auth` is
    /// deliberately excluded.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "port": self.port,
            "allowedDirs": self.allowed_dirs,
            "aiCommands": self.ai_commands,
        })
    }

    /// Apply a public-facing patch (the same shape as `public_view`),
    /// leaving `auth` untouched.
    pub fn apply_patch(&mut self, patch: serde_json::Value) -> Result<()> {
        if let Some(port) = patch.get("port").and_then(|v| v.as_u64()) {
            self.port = u16::try_from(port).context("port out of range")?;
        }
        if let Some(dirs) = patch.get("allowedDirs") {
            self.allowed_dirs = serde_json::from_value(dirs.clone())
                .context("allowedDirs must be an array of absolute paths")?;
        }
        if let Some(cmds) = patch.get("aiCommands") {
            self.ai_commands = serde_json::from_value(cmds.clone())
                .context("aiCommands must be an array of command objects")?;
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_creates_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(path.exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::defaults_from_env();
        config.port = 9999;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.port, 9999);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = Config::defaults_from_env();
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_allowed_dir() {
        let mut config = Config::defaults_from_env();
        config.allowed_dirs.push(PathBuf::from("relative/path"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn public_view_excludes_auth() {
        let mut config = Config::defaults_from_env();
        config.auth.token_hash = Some("deadbeef".to_string());
        let view = config.public_view();
        assert!(view.get("auth").is_none());
    }

    #[test]
    fn apply_patch_updates_port_only() {
        let mut config = Config::defaults_from_env();
        config
            .apply_patch(serde_json::json!({"port": 4000}))
            .unwrap();
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn env_seeding_reads_allowed_dirs() {
        std::env::set_var("ALLOWED_DIRS", "/tmp,/srv/data");
        let config = Config::defaults_from_env();
        assert_eq!(
            config.allowed_dirs,
            vec![PathBuf::from("/tmp"), PathBuf::from("/srv/data")]
        );
        std::env::remove_var("ALLOWED_DIRS");
    }
}
