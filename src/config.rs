//! Configuration management for the Agent Chat daemon
//!
//! Per-handle configuration is JSON (the same dialect the relay speaks).
//! Environment overrides are captured exactly once at startup into
//! [`EnvOverrides`] and passed explicitly from there on; nothing below the
//! supervisor reads the process environment.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default relay root used when neither the environment nor the config file
/// names one.
pub const DEFAULT_RELAY: &str = "https://relay.agentchat.dev";

/// Per-handle local configuration (`<data dir>/<handle>/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    pub handle: String,
    pub relay: String,
    /// Optional messenger thread routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    /// AI sink binary, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openclaw_path: Option<PathBuf>,
    /// Deliver content-free receipts for blind messages to the AI sink.
    #[serde(default)]
    pub blind_receipts: bool,
    /// Collapse both sinks into the human channel.
    #[serde(default)]
    pub unified_channel: bool,
}

impl LocalConfig {
    /// Load from `config.json` in the handle directory. A missing file
    /// yields defaults so a freshly provisioned handle can run.
    pub fn load(handle_dir: &Path, handle: &str) -> Result<Self> {
        let path = handle_dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default_for(handle));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", path.display())))?;
        let config: LocalConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::InvalidFormat(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_for(handle: &str) -> Self {
        Self {
            handle: handle.to_string(),
            relay: DEFAULT_RELAY.to_string(),
            thread_id: None,
            openclaw_path: None,
            blind_receipts: false,
            unified_channel: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.handle.trim().is_empty() {
            return Err(ConfigError::MissingRequired("handle".to_string()).into());
        }
        if self.relay.trim().is_empty() {
            return Err(ConfigError::MissingRequired("relay".to_string()).into());
        }
        Ok(())
    }

    /// Relay root with the environment override applied.
    pub fn resolved_relay(&self, env: &EnvOverrides) -> String {
        env.relay.clone().unwrap_or_else(|| self.relay.clone())
    }

    /// Messenger thread id with the environment fallback applied.
    pub fn resolved_thread_id(&self, env: &EnvOverrides) -> Option<i64> {
        self.thread_id.or(env.thread_id)
    }
}

/// Environment overrides recognized by the daemon, captured once.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub relay: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub keys_dir: Option<PathBuf>,
    pub handle: Option<String>,
    pub deliver_cmd: Option<PathBuf>,
    pub openclaw_path: Option<PathBuf>,
    pub lakera_guard_key: Option<String>,
    pub verbose: bool,
    pub thread_id: Option<i64>,
}

impl EnvOverrides {
    /// Snapshot the process environment. Called once at startup.
    pub fn from_env() -> Self {
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            relay: get("AGENT_CHAT_RELAY"),
            data_dir: get("AGENT_CHAT_DIR").map(PathBuf::from),
            keys_dir: get("AGENT_CHAT_KEYS_DIR").map(PathBuf::from),
            handle: get("AGENT_CHAT_HANDLE"),
            deliver_cmd: get("AGENT_DELIVER_CMD").map(PathBuf::from),
            openclaw_path: get("OPENCLAW_PATH").map(PathBuf::from),
            lakera_guard_key: get("LAKERA_GUARD_KEY"),
            verbose: matches!(
                get("AGENT_CHAT_VERBOSE").as_deref(),
                Some("1") | Some("true")
            ),
            thread_id: get("AGENT_CHAT_THREAD_ID").and_then(|v| v.parse().ok()),
        }
    }

    /// Root data directory (`AGENT_CHAT_DIR` or `~/.agent-chat`).
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| home_dir().join(".agent-chat"))
    }

    /// Key material directory (`AGENT_CHAT_KEYS_DIR` or `<data>/keys`).
    pub fn resolved_keys_dir(&self) -> PathBuf {
        self.keys_dir
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join("keys"))
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Messenger bot credentials, split by sensitivity: `messenger.json` holds
/// recipient identifiers, `messenger.token` holds the bot token.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessengerFile {
    chat_id: String,
    #[serde(default)]
    thread_id: Option<i64>,
    /// Present only in the legacy single-file layout.
    #[serde(default)]
    bot_token: Option<String>,
}

impl MessengerConfig {
    /// Layered load: split files first, then the legacy single-file layout
    /// where the token sat inline in `messenger.json`. Returns `None` when
    /// no messenger is configured at all.
    pub fn load(handle_dir: &Path) -> Result<Option<Self>> {
        let json_path = handle_dir.join("messenger.json");
        if !json_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&json_path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", json_path.display())))?;
        let file: MessengerFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::InvalidFormat(format!("{}: {e}", json_path.display())))?;

        let token_path = handle_dir.join("messenger.token");
        let bot_token = if token_path.exists() {
            std::fs::read_to_string(&token_path)
                .map_err(|e| ConfigError::FileNotFound(format!("{}: {e}", token_path.display())))?
                .trim()
                .to_string()
        } else if let Some(token) = file.bot_token {
            token
        } else {
            return Err(ConfigError::MissingRequired(format!(
                "{} exists but no bot token found",
                json_path.display()
            ))
            .into());
        };

        if bot_token.is_empty() {
            return Err(ConfigError::MissingRequired("messenger bot token".to_string()).into());
        }

        Ok(Some(Self {
            bot_token,
            chat_id: file.chat_id,
            thread_id: file.thread_id,
        }))
    }
}

/// Contacts book used by the auto-trust-on-invite rule: a JSON array of
/// handles in `contacts.json`. Missing file means an empty book.
pub fn load_contacts(handle_dir: &Path) -> Vec<String> {
    let path = handle_dir.join("contacts.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed contacts book {}: {e}", path.display());
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = LocalConfig::load(dir.path(), "alice").unwrap();
        assert_eq!(config.handle, "alice");
        assert_eq!(config.relay, DEFAULT_RELAY);
        assert!(!config.blind_receipts);
        assert!(!config.unified_channel);
    }

    #[test]
    fn config_round_trip() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "handle": "alice",
                "relay": "https://relay.example.com",
                "threadId": 42,
                "blindReceipts": true
            }"#,
        )
        .unwrap();

        let config = LocalConfig::load(dir.path(), "alice").unwrap();
        assert_eq!(config.relay, "https://relay.example.com");
        assert_eq!(config.thread_id, Some(42));
        assert!(config.blind_receipts);
        assert!(!config.unified_channel);
    }

    #[test]
    fn env_relay_wins_over_config() {
        let config = LocalConfig::default_for("alice");
        let env = EnvOverrides {
            relay: Some("https://other.example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_relay(&env), "https://other.example.com");
        assert_eq!(config.resolved_relay(&EnvOverrides::default()), DEFAULT_RELAY);
    }

    #[test]
    fn thread_id_falls_back_to_env() {
        let config = LocalConfig::default_for("alice");
        let env = EnvOverrides { thread_id: Some(7), ..Default::default() };
        assert_eq!(config.resolved_thread_id(&env), Some(7));

        let mut pinned = config.clone();
        pinned.thread_id = Some(3);
        assert_eq!(pinned.resolved_thread_id(&env), Some(3));
    }

    #[test]
    fn messenger_split_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("messenger.json"),
            r#"{"chatId": "-100123", "threadId": 9}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("messenger.token"), "bot-token-abc\n").unwrap();

        let m = MessengerConfig::load(dir.path()).unwrap().unwrap();
        assert_eq!(m.bot_token, "bot-token-abc");
        assert_eq!(m.chat_id, "-100123");
        assert_eq!(m.thread_id, Some(9));
    }

    #[test]
    fn messenger_legacy_single_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("messenger.json"),
            r#"{"chatId": "-100123", "botToken": "legacy-token"}"#,
        )
        .unwrap();

        let m = MessengerConfig::load(dir.path()).unwrap().unwrap();
        assert_eq!(m.bot_token, "legacy-token");
        assert_eq!(m.thread_id, None);
    }

    #[test]
    fn messenger_absent() {
        let dir = TempDir::new().unwrap();
        assert!(MessengerConfig::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn messenger_json_without_any_token_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("messenger.json"), r#"{"chatId": "-1"}"#).unwrap();
        assert!(MessengerConfig::load(dir.path()).is_err());
    }

    #[test]
    fn contacts_book() {
        let dir = TempDir::new().unwrap();
        assert!(load_contacts(dir.path()).is_empty());

        std::fs::write(dir.path().join("contacts.json"), r#"["bob", "carol"]"#).unwrap();
        assert_eq!(load_contacts(dir.path()), vec!["bob", "carol"]);
    }
}
