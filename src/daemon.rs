//! Daemon lifecycle: startup, transport selection, reconnect, shutdown
//!
//! The supervisor owns the startup sequence (directories, PID lock, keys,
//! persisted state), picks the transport (live push first, silent fallback
//! to polling when the relay has no streaming endpoint), and runs the event
//! loop until a signal arrives. Reconnects back off exponentially from 1 s
//! to 30 s; once the backoff crosses 16 s a one-shot operator warning goes
//! out through the human sink.

use crate::config::{load_contacts, EnvOverrides, LocalConfig, MessengerConfig};
use crate::crypto::KeyMaterial;
use crate::error::{ChatError, RelayError, Result};
use crate::guardrail::GuardrailScanner;
use crate::pipeline::{EnvelopeOrigin, MessagePipeline};
use crate::relay::{RelayApi, RelayClient, POLL_INTERVAL};
use crate::router::TrustRouter;
use crate::sink::{resolve_sinks, DeliverySink};
use crate::state::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Backoff length at which the operator is told about the outage.
const BACKOFF_WARN: Duration = Duration::from_secs(16);

/// SIGINT/SIGTERM, collapsed into one future.
struct Shutdown {
    sigint: Signal,
    sigterm: Signal,
}

impl Shutdown {
    fn install() -> Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {}
            _ = self.sigterm.recv() => {}
        }
    }
}

/// The assembled daemon for one handle.
pub struct DaemonSupervisor {
    relay: Arc<RelayClient>,
    pipeline: MessagePipeline,
    handle: String,
}

impl DaemonSupervisor {
    /// Startup sequence: resolve the per-handle directory, take the PID
    /// lock, load keys and persisted state, resolve sinks, and wire the
    /// pipeline. Any failure here is fatal (exit code 1 territory).
    pub fn bootstrap(handle: &str, env: &EnvOverrides) -> Result<Self> {
        let handle_dir = env.resolved_data_dir().join(handle);

        let mut state = StateStore::open(&handle_dir.join("state"))?;
        state.acquire_lock()?;

        let config = LocalConfig::load(&handle_dir, handle)?;
        let keys = Arc::new(KeyMaterial::load(&env.resolved_keys_dir(), handle)?);
        let messenger = MessengerConfig::load(&handle_dir)?;
        let contacts = load_contacts(&handle_dir);

        let sinks: Arc<dyn DeliverySink> = Arc::new(resolve_sinks(&config, env, messenger));

        let relay_url = config.resolved_relay(env);
        info!("Handle {handle} using relay {relay_url}");
        let relay = Arc::new(RelayClient::new(&relay_url, handle, keys.clone())?);
        let relay_api: Arc<dyn RelayApi> = relay.clone();

        let scanner = GuardrailScanner::new(relay_api.clone(), env.lakera_guard_key.clone());
        let router = TrustRouter::new(relay_api.clone(), sinks, handle, config.blind_receipts);
        let pipeline = MessagePipeline::new(relay_api, keys, router, scanner, state, contacts);

        Ok(Self {
            relay,
            pipeline,
            handle: handle.to_string(),
        })
    }

    /// Run until SIGINT/SIGTERM. Attempts live push first and falls back
    /// silently to polling when the relay has no streaming endpoint.
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown = Shutdown::install()?;
        let mut backoff = BACKOFF_INITIAL;
        let mut backoff_warned = false;

        info!("Daemon for {} entering event loop", self.handle);
        loop {
            let connected = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.relay.connect_stream() => result,
            };

            match connected {
                Ok(mut session) => {
                    backoff = BACKOFF_INITIAL;
                    backoff_warned = false;

                    // Drain whatever queued while disconnected; queued
                    // history gets catch-up (silent skip) semantics.
                    if let Err(e) = self.pipeline.drain_inbox(EnvelopeOrigin::CatchUp).await {
                        warn!("Catch-up drain failed: {e}");
                    }

                    let stopping = loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                session.close().await;
                                break true;
                            }
                            event = session.next_event() => match event {
                                Ok(Some(event)) => {
                                    self.pipeline.handle_event(event, EnvelopeOrigin::Live).await;
                                }
                                Ok(None) => {
                                    info!("Relay closed the streaming session");
                                    break false;
                                }
                                Err(e) => {
                                    warn!("Streaming session error: {e}");
                                    break false;
                                }
                            }
                        }
                    };
                    if stopping {
                        break;
                    }
                }
                Err(ChatError::Relay(RelayError::StreamingUnavailable(reason))) => {
                    info!("Live push unavailable ({reason}); polling every {POLL_INTERVAL:?}");
                    self.poll_loop(&mut shutdown).await;
                    break;
                }
                Err(e) => {
                    warn!("Relay connection failed: {e}; retrying in {backoff:?}");
                    if backoff >= BACKOFF_WARN && !backoff_warned {
                        backoff_warned = true;
                        self.pipeline
                            .operator_notice(
                                "⚠️ The relay has been unreachable for a while; messages \
                                 will be delivered once the connection recovers.",
                            )
                            .await;
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        self.pipeline.shutdown();
        info!("Daemon for {} stopped cleanly", self.handle);
        Ok(())
    }

    /// Fallback transport: repeated cursor-driven inbox fetches. The first
    /// drain is catch-up; later rounds carry new traffic and get live
    /// failure semantics.
    async fn poll_loop(&mut self, shutdown: &mut Shutdown) {
        if let Err(e) = self.pipeline.drain_inbox(EnvelopeOrigin::CatchUp).await {
            warn!("Initial poll drain failed: {e}");
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if let Err(e) = self.pipeline.drain_inbox(EnvelopeOrigin::Live).await {
                        warn!("Inbox poll failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use tempfile::TempDir;

    fn provision_keys(keys_dir: &std::path::Path, handle: &str) {
        std::fs::create_dir_all(keys_dir).unwrap();
        let signing: [u8; 32] = rand::random();
        let agreement: [u8; 32] = rand::random();
        std::fs::write(keys_dir.join(format!("{handle}.signing")), STANDARD.encode(signing))
            .unwrap();
        std::fs::write(
            keys_dir.join(format!("{handle}.agreement")),
            STANDARD.encode(agreement),
        )
        .unwrap();
    }

    #[test]
    fn bootstrap_with_provisioned_keys() {
        let dir = TempDir::new().unwrap();
        let env = EnvOverrides {
            data_dir: Some(dir.path().join("data")),
            keys_dir: Some(dir.path().join("keys")),
            ..Default::default()
        };
        provision_keys(&dir.path().join("keys"), "alice");

        let supervisor = DaemonSupervisor::bootstrap("alice", &env).unwrap();
        assert_eq!(supervisor.handle, "alice");
        // The PID lock is held.
        let pid_file = dir.path().join("data/alice/state/daemon.pid");
        assert_eq!(
            std::fs::read_to_string(pid_file).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn bootstrap_without_keys_is_fatal() {
        let dir = TempDir::new().unwrap();
        let env = EnvOverrides {
            data_dir: Some(dir.path().join("data")),
            keys_dir: Some(dir.path().join("keys")),
            ..Default::default()
        };

        let result = DaemonSupervisor::bootstrap("alice", &env);
        assert!(result.is_err());
    }

    #[test]
    fn bootstrap_respects_a_held_lock() {
        let dir = TempDir::new().unwrap();
        let env = EnvOverrides {
            data_dir: Some(dir.path().join("data")),
            keys_dir: Some(dir.path().join("keys")),
            ..Default::default()
        };
        provision_keys(&dir.path().join("keys"), "alice");

        let state_dir = dir.path().join("data/alice/state");
        std::fs::create_dir_all(&state_dir).unwrap();
        // PID 1 is always alive.
        std::fs::write(state_dir.join("daemon.pid"), "1").unwrap();

        let result = DaemonSupervisor::bootstrap("alice", &env);
        assert!(result.is_err());
    }
}
