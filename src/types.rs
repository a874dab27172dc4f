//! Core types and wire structures for Agent Chat
//!
//! Everything the relay speaks is normalized here into closed shapes: the
//! streaming session pushes either a bare message envelope or a tagged
//! `{type:"system", data:{...}}` event, and both forms collapse into
//! [`RelayEvent`] before the pipeline sees them. Fields the relay may omit
//! (legacy envelopes without `plaintextHash`, unsigned envelopes) are
//! option-typed rather than duck-typed.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Trust gate computed by the relay for a specific (reader, envelope) pair.
///
/// Ordered: `Block < Blind < Trusted`. The relay never delivers `block`
/// envelopes, but the value round-trips through dedup keys so redelivery at
/// a higher level is distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveRead {
    Block,
    Blind,
    Trusted,
}

impl EffectiveRead {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveRead::Block => "block",
            EffectiveRead::Blind => "blind",
            EffectiveRead::Trusted => "trusted",
        }
    }
}

impl std::fmt::Display for EffectiveRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressed ciphertext plus routing metadata, as received from the relay.
///
/// `to` is the addressed handle; it differs from `recipient` on a group
/// fan-out copy. All binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    pub from: String,
    pub to: String,
    pub recipient: String,
    pub ciphertext: String,
    pub ephemeral_key: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plaintext_hash: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
    pub effective_read: EffectiveRead,
}

impl MessageEnvelope {
    /// Dedup key: `id ":" effectiveRead`. The same id at a higher trust
    /// level is a distinct key, which is what makes redelivery after a
    /// trust upgrade reprocess exactly once.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.id, self.effective_read)
    }

    /// A group fan-out copy addresses a handle other than the local one.
    pub fn is_group_copy(&self, local_handle: &str) -> bool {
        self.to != local_handle
    }
}

/// System events pushed over the streaming session or returned in the inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    /// A peer's effective-read level changed (the only path for trust
    /// upgrades to reach the daemon).
    TrustChanged {
        handle: String,
        level: String,
    },
    /// The local agent was granted membership in a group handle.
    AddedToHandle {
        handle: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inviter: Option<String>,
    },
    /// Owner-side permissions mutated.
    PermissionChanged {
        handle: String,
    },
}

impl SystemEvent {
    /// Composite dedup key. The relay is inconsistent about ids on system
    /// events, so dedup never relies on one.
    pub fn dedup_key(&self) -> String {
        match self {
            SystemEvent::TrustChanged { handle, level } => {
                format!("sys:trust_changed:{handle}:{level}")
            }
            SystemEvent::AddedToHandle { handle, inviter } => {
                format!(
                    "sys:added_to_handle:{handle}:{}",
                    inviter.as_deref().unwrap_or("")
                )
            }
            SystemEvent::PermissionChanged { handle } => {
                format!("sys:permission_changed:{handle}")
            }
        }
    }
}

/// A relay push, normalized. A frame without a `type` field is a bare
/// message envelope.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Message(MessageEnvelope),
    System(SystemEvent),
}

impl RelayEvent {
    /// Parse one streaming frame or inbox entry.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value.get("type").and_then(|t| t.as_str()) {
            Some("system") => {
                let data = value
                    .get("data")
                    .cloned()
                    .ok_or_else(|| ChatError::Serialization("system frame without data".into()))?;
                Ok(RelayEvent::System(serde_json::from_value(data)?))
            }
            Some("message") => {
                let data = value
                    .get("data")
                    .cloned()
                    .unwrap_or(value);
                Ok(RelayEvent::Message(serde_json::from_value(data)?))
            }
            _ => Ok(RelayEvent::Message(serde_json::from_value(value)?)),
        }
    }
}

/// Handle kinds, inferred from relay metadata. Display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    Personal,
    Group,
    Broadcast,
}

/// Public handle metadata from `GET /handle/info/{peer}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    pub name: String,
    pub owner: String,
    pub default_write: String,
    pub ed25519_public_key: String,
    pub x25519_public_key: String,
    #[serde(default)]
    pub kind: Option<HandleKind>,
    /// Members-only field, present when the caller is authenticated as one.
    #[serde(default)]
    pub members: Option<Vec<String>>,
}

/// Inbox fetch response body.
#[derive(Debug, Clone, Deserialize)]
pub struct InboxResponse {
    pub messages: Vec<MessageEnvelope>,
}

/// One-shot trust-token actions mintable from the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    Trust,
    Untrust,
    Block,
    ForwardOne,
}

impl TokenAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAction::Trust => "trust",
            TokenAction::Untrust => "untrust",
            TokenAction::Block => "block",
            TokenAction::ForwardOne => "forward-one",
        }
    }
}

/// Guardrail scan result. An unreachable scanner is never a positive flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub flagged: bool,
    pub unavailable: bool,
}

impl ScanOutcome {
    pub fn clean() -> Self {
        Self { flagged: false, unavailable: false }
    }

    pub fn flagged() -> Self {
        Self { flagged: true, unavailable: false }
    }

    pub fn unavailable() -> Self {
        Self { flagged: false, unavailable: true }
    }
}

/// An inline button attached to a human-sink message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

/// What the human sink receives for one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct HumanPayload {
    pub text: String,
    /// Rows of inline buttons; empty when the class mints none.
    pub buttons: Vec<Vec<Button>>,
}

/// What the AI sink receives for one envelope (only ever built for classes
/// where the AI may see content, plus content-free blind receipts).
#[derive(Debug, Clone, PartialEq)]
pub struct AiPayload {
    pub text: String,
}
