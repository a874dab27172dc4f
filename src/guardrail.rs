//! Three-tier injection scanning with health tracking
//!
//! Tier A posts the plaintext to a local scanner when a credential is
//! present (the only path on which plaintext leaves the process other than
//! sink delivery). Tier B asks the relay to scan against its prior hash
//! commitment. Tier C is no scanner at all. An unreachable scanner is never
//! a positive flag; it surfaces as `unavailable` and the router routes the
//! message as UNSCANNED.

use crate::error::Result;
use crate::relay::{RelayApi, SCAN_TIMEOUT};
use crate::types::ScanOutcome;
use std::sync::Arc;
use tracing::{debug, warn};

const LOCAL_SCAN_URL: &str = "https://api.lakera.ai/v2/guard";

/// Consecutive failures before the one-shot operator notice.
const DEGRADED_THRESHOLD: u32 = 3;

/// Injection scanner with degraded-health announcement.
pub struct GuardrailScanner {
    relay: Arc<dyn RelayApi>,
    http: reqwest::Client,
    local_key: Option<String>,
    consecutive_failures: u32,
    /// One-shot latch; rearmed by the first successful scan.
    warned: bool,
    pending_notice: Option<String>,
}

impl GuardrailScanner {
    pub fn new(relay: Arc<dyn RelayApi>, local_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SCAN_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            relay,
            http,
            local_key,
            consecutive_failures: 0,
            warned: false,
            pending_notice: None,
        }
    }

    /// Scan one plaintext. Never errors: every failure mode collapses to
    /// `unavailable`.
    pub async fn scan(&mut self, message_id: Option<&str>, text: &str) -> ScanOutcome {
        if self.local_key.is_some() {
            match self.scan_local(text).await {
                Ok(flagged) => return self.record_success(flagged),
                Err(e) => {
                    warn!("Local guardrail scan failed: {e}");
                    return self.record_failure();
                }
            }
        }

        if let Some(id) = message_id {
            match self.relay.scan_message(id, text).await {
                Ok(flagged) => return self.record_success(flagged),
                Err(e) => {
                    warn!("Relay guardrail scan failed: {e}");
                    return self.record_failure();
                }
            }
        }

        debug!("No guardrail tier usable; routing as unscanned");
        ScanOutcome::unavailable()
    }

    async fn scan_local(&self, text: &str) -> Result<bool> {
        let key = self.local_key.as_deref().unwrap_or_default();
        let body = serde_json::json!({
            "messages": [{ "role": "user", "content": text }]
        });
        let response = self
            .http
            .post(LOCAL_SCAN_URL)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(crate::error::RelayError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            }
            .into());
        }
        let value: serde_json::Value = response.json().await.map_err(|e| {
            crate::error::RelayError::InvalidResponse(e.to_string())
        })?;
        Ok(value.get("flagged").and_then(|f| f.as_bool()).unwrap_or(false))
    }

    fn record_success(&mut self, flagged: bool) -> ScanOutcome {
        self.consecutive_failures = 0;
        self.warned = false;
        if flagged {
            ScanOutcome::flagged()
        } else {
            ScanOutcome::clean()
        }
    }

    fn record_failure(&mut self) -> ScanOutcome {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= DEGRADED_THRESHOLD && !self.warned {
            self.warned = true;
            self.pending_notice = Some(
                "⚠️ The message guardrail has been unreachable for several \
                 messages in a row. Messages are being delivered unscanned. \
                 Set LAKERA_GUARD_KEY to enable local scanning, or check the \
                 relay's scanner."
                    .to_string(),
            );
        }
        ScanOutcome::unavailable()
    }

    /// Operator notice queued by a degraded scanner, delivered at most once
    /// per degradation episode.
    pub fn take_operator_notice(&mut self) -> Option<String> {
        self.pending_notice.take()
    }
}
