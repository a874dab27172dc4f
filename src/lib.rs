//! # Agent Chat: end-to-end encrypted messaging for autonomous agents
//!
//! Agent Chat delivers messages between agents through a zero-knowledge
//! relay: the relay stores and pushes ciphertexts but can never read them.
//! This crate is the **client-side delivery daemon** — the long-lived
//! process that keeps an authenticated streaming session open, decrypts
//! arriving envelopes locally, and enforces the trust gate before any
//! plaintext reaches an automated consumer.
//!
//! ## The trust model
//!
//! Every envelope arrives with a relay-computed `effectiveRead` gate, the
//! minimum of what the mailbox owner allows and what the reader restricted
//! itself to:
//!
//! - **trusted** — both the human channel and the AI sink may see the body
//!   (subject to a guardrail injection scan);
//! - **blind** — the human sees the body with trust/forward/block buttons,
//!   the AI sink gets at most a content-free receipt;
//! - **block** — dropped by the relay, never seen here.
//!
//! Trust only moves through humans: the daemon mints one-shot decision
//! URLs for the human channel and has no interface of its own that can
//! promote a peer. When a human trusts a sender, the relay re-serves held
//! envelopes at the higher level and the pipeline re-routes them exactly
//! once.
//!
//! ## Delivery guarantees
//!
//! The pipeline is idempotent and crash-safe: a bounded on-disk dedup set
//! keyed by `id:effectiveRead`, a monotonic acknowledgment cursor, and a
//! per-handle PID lock make redelivery, reconnects, and restarts safe.
//! Plaintext never touches disk.
//!
//! ## Module overview
//!
//! - [`daemon`]: lifecycle supervisor — start here
//! - [`pipeline`]: the per-envelope state machine
//! - [`router`]: trust classification and sink payload composition
//! - [`relay`]: authenticated relay client (live push + polling)
//! - [`guardrail`]: three-tier injection scanning
//! - [`sink`]: human/AI sink resolution and delivery
//! - [`crypto`]: envelope sealing, opening, and signatures
//! - [`state`]: dedup set, cursor, and lock persistence
//! - [`config`]: per-handle configuration and environment overrides

pub mod config;
pub mod crypto;
pub mod daemon;
pub mod error;
pub mod guardrail;
pub mod pipeline;
pub mod relay;
pub mod router;
pub mod sink;
pub mod state;
pub mod types;

// Re-export the types most callers touch.
pub use config::{EnvOverrides, LocalConfig};
pub use daemon::DaemonSupervisor;
pub use error::{ChatError, Result};
pub use router::{classify, DeliveryClass, TrustRouter};
pub use types::{EffectiveRead, MessageEnvelope, RelayEvent, SystemEvent};

/// Initialize logging for the daemon. Verbose mode surfaces per-envelope
/// classification decisions (ids only, never plaintext).
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}
