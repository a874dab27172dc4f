//! On-disk persistence for the delivery pipeline
//!
//! Single-writer, file-backed state under `<data dir>/<handle>/state/`:
//! the PID lock, the acknowledgment cursor, the bounded dedup set, and the
//! first-delivery sentinel. Every write is a whole-file replace. None of
//! these files ever contains plaintext.

use crate::error::{Result, StateError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Dedup set high-water mark; exceeding it prunes down to [`DEDUP_LOW`].
pub const DEDUP_HIGH: usize = 10_000;
/// Dedup set size after a prune, retaining the most recent additions.
pub const DEDUP_LOW: usize = 5_000;

const PID_FILE: &str = "daemon.pid";
const CURSOR_FILE: &str = "lastAckedId";
const DEDUP_FILE: &str = "dedup.json";
const FIRST_DELIVERY_FILE: &str = ".first-delivery-done";

/// File-backed state for one handle. All mutation goes through the pipeline
/// task, so there is at most one write in flight.
pub struct StateStore {
    dir: PathBuf,
    /// Insertion-ordered dedup keys, most recent last.
    dedup_order: Vec<String>,
    dedup_index: HashSet<String>,
    cursor: Option<String>,
    holds_lock: bool,
    dedup_high: usize,
    dedup_low: usize,
}

impl StateStore {
    /// Open (creating if needed) the state directory and load cursor and
    /// dedup state. Does not take the PID lock; call [`acquire_lock`]
    /// separately so startup can report lock conflicts before touching
    /// anything else.
    ///
    /// [`acquire_lock`]: StateStore::acquire_lock
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StateError::WriteFailed {
            path: dir.display().to_string(),
            source_msg: e.to_string(),
        })?;

        let cursor = match std::fs::read_to_string(dir.join(CURSOR_FILE)) {
            Ok(content) => {
                let trimmed = content.trim().to_string();
                (!trimmed.is_empty()).then_some(trimmed)
            }
            Err(_) => None,
        };

        let mut dedup_order: Vec<String> = match std::fs::read_to_string(dir.join(DEDUP_FILE)) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed dedup state {}: {e}", dir.join(DEDUP_FILE).display());
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        // Only the newest entries matter after a long downtime.
        if dedup_order.len() > DEDUP_HIGH {
            dedup_order.drain(..dedup_order.len() - DEDUP_HIGH);
        }
        let dedup_index = dedup_order.iter().cloned().collect();

        debug!(
            "Loaded state from {}: cursor={:?}, {} dedup entries",
            dir.display(),
            cursor,
            dedup_order.len()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            dedup_order,
            dedup_index,
            cursor,
            holds_lock: false,
            dedup_high: DEDUP_HIGH,
            dedup_low: DEDUP_LOW,
        })
    }

    /// Shrink the prune window (test hook).
    #[cfg(test)]
    pub(crate) fn set_dedup_limits(&mut self, high: usize, low: usize) {
        self.dedup_high = high;
        self.dedup_low = low;
    }

    /// Acquire the per-handle PID lock. A lock file owned by a live process
    /// aborts; a stale or malformed file is overtaken.
    pub fn acquire_lock(&mut self) -> Result<()> {
        let path = self.dir.join(PID_FILE);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(pid) = content.trim().parse::<u32>() {
                if pid != std::process::id() && process_alive(pid) {
                    return Err(StateError::LockHeld {
                        path: path.display().to_string(),
                        pid,
                    }
                    .into());
                }
                info!("Overtaking stale PID lock from dead process {pid}");
            } else {
                info!("Overtaking malformed PID lock at {}", path.display());
            }
        }

        write_file(&path, &std::process::id().to_string())?;
        self.holds_lock = true;
        Ok(())
    }

    /// Release the PID lock if this process holds it.
    pub fn release_lock(&mut self) {
        if !self.holds_lock {
            return;
        }
        let path = self.dir.join(PID_FILE);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to remove PID lock {}: {e}", path.display());
        }
        self.holds_lock = false;
    }

    /// The id of the most recently fully processed envelope.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Advance the cursor. Persisted as a whole-file replace. Ids are
    /// opaque, so monotonicity is the caller's contract: the pipeline only
    /// sets the cursor for envelopes processed in arrival order, never for
    /// redelivered history.
    pub fn set_cursor(&mut self, id: &str) -> Result<()> {
        self.cursor = Some(id.to_string());
        write_file(&self.dir.join(CURSOR_FILE), id)
    }

    /// Whether a dedup key has been recorded before.
    pub fn seen(&self, key: &str) -> bool {
        self.dedup_index.contains(key)
    }

    /// Record a dedup key and flush the set to disk, pruning when the
    /// high-water mark is exceeded.
    pub fn record(&mut self, key: &str) -> Result<()> {
        if !self.dedup_index.insert(key.to_string()) {
            return Ok(());
        }
        self.dedup_order.push(key.to_string());

        if self.dedup_order.len() > self.dedup_high {
            let drop_count = self.dedup_order.len() - self.dedup_low;
            for dropped in self.dedup_order.drain(..drop_count) {
                self.dedup_index.remove(&dropped);
            }
            debug!("Pruned dedup set to {} entries", self.dedup_order.len());
        }

        self.flush_dedup()
    }

    fn flush_dedup(&self) -> Result<()> {
        let path = self.dir.join(DEDUP_FILE);
        let content = serde_json::to_string(&self.dedup_order)?;
        write_file(&path, &content)
    }

    /// Whether the one-time onboarding hint has already been delivered.
    pub fn first_delivery_done(&self) -> bool {
        self.dir.join(FIRST_DELIVERY_FILE).exists()
    }

    /// Switch the onboarding hint off.
    pub fn mark_first_delivery(&self) -> Result<()> {
        write_file(&self.dir.join(FIRST_DELIVERY_FILE), "")
    }

    /// Number of dedup entries currently held (test hook).
    pub fn dedup_len(&self) -> usize {
        self.dedup_order.len()
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.release_lock();
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| {
        StateError::WriteFailed {
            path: path.display().to_string(),
            source_msg: e.to_string(),
        }
        .into()
    })
}

fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system.process(Pid::from_u32(pid)).is_some()
}
