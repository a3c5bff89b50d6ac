//! Exit trigger kinds received from the signal webhook.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::order::OrderRole;

/// Kind of exit signal carried by a webhook trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Tp1Hit,
    Tp2Hit,
    SlHit,
    TrailHit,
    TimeExit,
}

impl TriggerKind {
    /// Role the resulting exit order is tagged with.
    pub fn exit_role(&self) -> OrderRole {
        match self {
            Self::Tp1Hit => OrderRole::Tp1,
            Self::Tp2Hit => OrderRole::Tp2,
            Self::SlHit => OrderRole::Sl,
            Self::TrailHit => OrderRole::TrailSl,
            Self::TimeExit => OrderRole::TimeExit,
        }
    }

    /// Take-profit triggers sell into strength and may rest a limit;
    /// everything else exits at market.
    pub fn is_take_profit(&self) -> bool {
        matches!(self, Self::Tp1Hit | Self::Tp2Hit)
    }

    /// Wire name, matching the webhook vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tp1Hit => "TP1_HIT",
            Self::Tp2Hit => "TP2_HIT",
            Self::SlHit => "SL_HIT",
            Self::TrailHit => "TRAIL_HIT",
            Self::TimeExit => "TIME_EXIT",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic position slot for a symbol.
///
/// The downstream position tracker addresses positions by a small
/// numeric slot rather than a database id, so the slot must be
/// reproducible from the symbol alone (FNV-1a folded into 1..=99999).
pub fn position_slot(symbol: &str) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in symbol.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % 99_999) as u32 + 1
}
