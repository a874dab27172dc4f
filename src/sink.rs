//! Sink resolution and delivery
//!
//! Two delivery endpoints sit behind this module: the human channel and the
//! AI sink. Both are resolved once on startup and stay sticky for the
//! process lifetime; a configuration change requires a restart. When no AI
//! sink can be found at all, the daemon degrades to unified-channel mode
//! and queues a one-time operator warning — the security separation between
//! the two sinks is gone until the operator fixes their setup.

use crate::config::{EnvOverrides, LocalConfig, MessengerConfig};
use crate::error::{Result, SinkError};
use crate::types::{AiPayload, Button, HumanPayload};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Messenger API deadline.
const MESSENGER_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for external command and AI binary invocations.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Name the AI binary is installed under.
const AI_BINARY_NAME: &str = "openclaw";
/// Session id used when no session registry entry resolves for the handle.
const FALLBACK_SESSION_ID: &str = "agent-chat-inbox";

/// Prefix tagging stdout deliveries so they are greppable in supervised logs.
const STDOUT_TAG: &str = "[agent-chat]";

/// Delivery endpoint seam. The router only talks to this trait.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver_human(&self, payload: &HumanPayload) -> Result<()>;
    async fn deliver_ai(&self, payload: &AiPayload) -> Result<()>;

    /// Both sinks collapse into the human channel (explicit configuration
    /// or unified fallback).
    fn unified(&self) -> bool;

    /// One-time operator notice queued during resolution (unified
    /// fallback), delivered before the first message.
    fn take_startup_notice(&self) -> Option<String>;
}

/// How the human channel is reached, in resolution priority order.
enum HumanRoute {
    Messenger {
        config: MessengerConfig,
        thread_id: Option<i64>,
    },
    Command(PathBuf),
    Stdout,
}

/// How the AI sink is reached.
enum AiRoute {
    /// External delivery command; it takes both channels.
    Command(PathBuf),
    Binary {
        path: PathBuf,
        via_node: bool,
        session_id: String,
        reply_thread: Option<i64>,
    },
    /// Unified mode: the AI sink is never invoked.
    Unified,
}

/// The resolved sinks, sticky for the process lifetime.
pub struct ResolvedSinks {
    human: HumanRoute,
    ai: AiRoute,
    http: reqwest::Client,
    startup_notice: Mutex<Option<String>>,
}

/// Resolve both sinks from configuration and environment. Logs the outcome
/// so misconfiguration is visible before the first message arrives.
pub fn resolve_sinks(
    config: &LocalConfig,
    env: &EnvOverrides,
    messenger: Option<MessengerConfig>,
) -> ResolvedSinks {
    let human = match messenger {
        Some(m) => {
            info!("Human sink: messenger API (chat {})", m.chat_id);
            let thread_id = m.thread_id.or_else(|| config.resolved_thread_id(env));
            HumanRoute::Messenger { config: m, thread_id }
        }
        None => match &env.deliver_cmd {
            Some(cmd) => {
                info!("Human sink: delivery command {}", cmd.display());
                HumanRoute::Command(cmd.clone())
            }
            None => {
                info!("Human sink: stdout");
                HumanRoute::Stdout
            }
        },
    };

    let mut startup_notice = None;
    let ai = if config.unified_channel {
        info!("AI sink: unified channel (explicit)");
        AiRoute::Unified
    } else if let Some(cmd) = &env.deliver_cmd {
        info!("AI sink: delivery command {}", cmd.display());
        AiRoute::Command(cmd.clone())
    } else if let Some(path) = find_ai_binary(
        config.openclaw_path.as_deref(),
        env.openclaw_path.as_deref(),
    ) {
        let via_node = invokes_via_node(&path);
        let session_id = resolve_session_id(&config.handle, &home_dir());
        info!(
            "AI sink: {} (session {session_id}{})",
            path.display(),
            if via_node { ", via node" } else { "" }
        );
        AiRoute::Binary {
            path,
            via_node,
            session_id,
            reply_thread: config.resolved_thread_id(env),
        }
    } else {
        warn!("No AI sink found; falling back to the unified channel");
        startup_notice = Some(
            "⚠️ No AI sink is installed and no delivery command is \
             configured. Until this is fixed, AI-bound messages are routed \
             through the human channel and the security separation between \
             the two sinks is disabled. Install the AI binary or set \
             AGENT_DELIVER_CMD, then restart the daemon."
                .to_string(),
        );
        AiRoute::Unified
    };

    ResolvedSinks {
        human,
        ai,
        http: reqwest::Client::builder()
            .timeout(MESSENGER_TIMEOUT)
            .build()
            .unwrap_or_default(),
        startup_notice: Mutex::new(startup_notice),
    }
}

/// AI binary discovery chain: pinned config path, environment override,
/// PATH lookup, then the standard install locations. A configured path
/// that is missing on disk is warned about and treated as absent.
fn find_ai_binary(pinned: Option<&Path>, override_path: Option<&Path>) -> Option<PathBuf> {
    for candidate in [pinned, override_path].into_iter().flatten() {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        warn!(
            "Configured AI sink path {} does not exist; ignoring",
            candidate.display()
        );
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(AI_BINARY_NAME);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for candidate in standard_install_paths() {
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn standard_install_paths() -> Vec<PathBuf> {
    vec![
        home_dir().join(".local/bin").join(AI_BINARY_NAME),
        PathBuf::from("/usr/local/bin").join(AI_BINARY_NAME),
        PathBuf::from("/opt/openclaw/bin").join(AI_BINARY_NAME),
    ]
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// A `.js` sink runs under the local script runtime.
fn invokes_via_node(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "js")
}

/// Look the handle up in the AI tool's session registry so the AI sees its
/// own conversation context; fall back to the fixed session id. Registry
/// entries must be well-formed UUIDs.
fn resolve_session_id(handle: &str, home: &Path) -> String {
    let path = home.join(".openclaw").join("sessions.json");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return FALLBACK_SESSION_ID.to_string();
    };
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(value) => value
            .get(handle)
            .and_then(|s| s.as_str())
            .filter(|s| uuid::Uuid::parse_str(s).is_ok())
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK_SESSION_ID.to_string()),
        Err(e) => {
            warn!("Ignoring malformed session registry {}: {e}", path.display());
            FALLBACK_SESSION_ID.to_string()
        }
    }
}

impl ResolvedSinks {
    async fn send_messenger(
        &self,
        config: &MessengerConfig,
        thread_id: Option<i64>,
        payload: &HumanPayload,
    ) -> Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            config.bot_token
        );
        let mut body = serde_json::json!({
            "chat_id": config.chat_id,
            "text": payload.text,
        });
        if let Some(thread) = thread_id {
            body["message_thread_id"] = serde_json::Value::from(thread);
        }
        if !payload.buttons.is_empty() {
            body["reply_markup"] = serde_json::json!({
                "inline_keyboard": payload
                    .buttons
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|b| serde_json::json!({ "text": b.label, "url": b.url }))
                            .collect::<Vec<_>>()
                    })
                    .collect::<Vec<_>>(),
            });
        }

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Messenger(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Messenger(format!("HTTP {}", response.status())).into());
        }
        Ok(())
    }

    /// Invoke the external delivery command: no argv arguments, payload in
    /// `AGENT_MSG`, buttons (when present) in `AGENT_MSG_BUTTONS`.
    /// Plaintext never appears in argv.
    async fn run_delivery_command(
        &self,
        path: &Path,
        text: &str,
        buttons: Option<&[Vec<Button>]>,
    ) -> Result<()> {
        let mut command = Command::new(path);
        command
            .env("AGENT_MSG", text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match buttons {
            Some(rows) if !rows.is_empty() => {
                command.env("AGENT_MSG_BUTTONS", serde_json::to_string(rows)?);
            }
            _ => {}
        }

        let status = tokio::time::timeout(COMMAND_TIMEOUT, async {
            command
                .status()
                .await
                .map_err(|e| SinkError::Command(e.to_string()))
        })
        .await
        .map_err(|_| SinkError::Timeout)??;

        if !status.success() {
            return Err(SinkError::Command(format!("exit status {status}")).into());
        }
        Ok(())
    }

    async fn run_ai_binary(
        &self,
        path: &Path,
        via_node: bool,
        session_id: &str,
        reply_thread: Option<i64>,
        text: &str,
    ) -> Result<()> {
        let mut command = if via_node {
            let mut c = Command::new("node");
            c.arg(path);
            c
        } else {
            Command::new(path)
        };
        command
            .arg("--local")
            .arg("--session-id")
            .arg(session_id)
            .arg("--message")
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(thread) = reply_thread {
            command.arg("--reply-thread-id").arg(thread.to_string());
        }

        let status = tokio::time::timeout(COMMAND_TIMEOUT, async {
            command
                .status()
                .await
                .map_err(|e| SinkError::AiSink(e.to_string()))
        })
        .await
        .map_err(|_| SinkError::Timeout)??;

        if !status.success() {
            return Err(SinkError::AiSink(format!("exit status {status}")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl DeliverySink for ResolvedSinks {
    async fn deliver_human(&self, payload: &HumanPayload) -> Result<()> {
        match &self.human {
            HumanRoute::Messenger { config, thread_id } => {
                self.send_messenger(config, *thread_id, payload).await
            }
            HumanRoute::Command(path) => {
                self.run_delivery_command(path, &payload.text, Some(&payload.buttons))
                    .await
            }
            HumanRoute::Stdout => {
                println!("{STDOUT_TAG} {}", payload.text);
                for row in &payload.buttons {
                    for button in row {
                        println!("{STDOUT_TAG}   ↳ {}: {}", button.label, button.url);
                    }
                }
                Ok(())
            }
        }
    }

    async fn deliver_ai(&self, payload: &AiPayload) -> Result<()> {
        match &self.ai {
            AiRoute::Command(path) => {
                self.run_delivery_command(path, &payload.text, None).await
            }
            AiRoute::Binary {
                path,
                via_node,
                session_id,
                reply_thread,
            } => {
                self.run_ai_binary(path, *via_node, session_id, *reply_thread, &payload.text)
                    .await
            }
            AiRoute::Unified => {
                debug!("AI delivery requested in unified mode; nothing to do");
                Ok(())
            }
        }
    }

    fn unified(&self) -> bool {
        matches!(self.ai, AiRoute::Unified)
    }

    fn take_startup_notice(&self) -> Option<String> {
        self.startup_notice.lock().unwrap().take()
    }
}
