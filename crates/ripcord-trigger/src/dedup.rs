//! Trigger deduplication with a success-armed cooldown.
//!
//! A trigger key is `(symbol, trigger kind)`. The cooldown timestamp is
//! written only after a fan-out in which at least one user actually
//! sold; a fan-out that made zero progress leaves the key immediately
//! retryable. Arming before execution would permanently suppress
//! retries whenever every user failed (bad credentials, venue outage).
//!
//! While a fan-out is running the key is marked in flight, so a
//! duplicate arriving seconds later loses deterministically instead of
//! racing the first one to the venue.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use ripcord_core::TriggerKind;

/// Why a trigger was rejected as a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupRejection {
    /// Key succeeded recently; retry after `remaining`.
    Cooldown { remaining: Duration },
    /// Another fan-out for this key is still running.
    InFlight,
}

impl DedupRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cooldown { .. } => "cooldown",
            Self::InFlight => "in_flight",
        }
    }
}

impl fmt::Display for DedupRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooldown { remaining } => {
                write!(f, "cooldown active, retry in {}s", remaining.as_secs())
            }
            Self::InFlight => write!(f, "already in flight"),
        }
    }
}

#[derive(Debug)]
struct DedupEntry {
    last_success: Option<Instant>,
    in_flight: bool,
}

/// Trigger gatekeeper. One instance per process, shared by reference.
#[derive(Debug)]
pub struct TriggerDeduper {
    cooldown: Duration,
    entries: Mutex<HashMap<(String, TriggerKind), DedupEntry>>,
}

impl TriggerDeduper {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a key for processing.
    ///
    /// Exactly one concurrent caller wins; everyone else gets a
    /// [`DedupRejection`]. The winner must call [`complete`] when the
    /// fan-out finishes, successful or not.
    ///
    /// [`complete`]: Self::complete
    pub fn begin(&self, symbol: &str, kind: TriggerKind) -> Result<(), DedupRejection> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        // Opportunistic GC. Entries hold only a timestamp, but symbols
        // come from an external sender and the map must not grow
        // without bound.
        let retention = self.cooldown * 2;
        entries.retain(|_, e| {
            e.in_flight
                || e.last_success
                    .map_or(false, |t| now.duration_since(t) < retention)
        });

        let entry = entries
            .entry((symbol.to_string(), kind))
            .or_insert(DedupEntry {
                last_success: None,
                in_flight: false,
            });

        if entry.in_flight {
            return Err(DedupRejection::InFlight);
        }
        if let Some(last) = entry.last_success {
            let elapsed = now.duration_since(last);
            if elapsed < self.cooldown {
                return Err(DedupRejection::Cooldown {
                    remaining: self.cooldown - elapsed,
                });
            }
        }

        entry.in_flight = true;
        Ok(())
    }

    /// Release a claimed key. The cooldown is armed only when `sold`
    /// is true.
    pub fn complete(&self, symbol: &str, kind: TriggerKind, sold: bool) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&(symbol.to_string(), kind)) {
            entry.in_flight = false;
            if sold {
                entry.last_success = Some(Instant::now());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
