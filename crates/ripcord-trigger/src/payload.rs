//! Inbound webhook trigger payload.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ripcord_core::{split_symbol, Price, TriggerKind};

use crate::error::TriggerError;

/// One exit signal as posted to the webhook.
///
/// `trigger_price` of zero means "no usable price, exit at market".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub symbol: String,
    pub trigger_type: TriggerKind,
    /// Fraction of the free base balance to sell, in (0, 1].
    pub quantity_pct: Decimal,
    #[serde(default)]
    pub trigger_price: Price,
    /// Sender-side timestamp, carried through for logs only.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl TriggerPayload {
    /// Reject bad secrets and malformed shapes before any user
    /// processing happens.
    pub fn validate(&self, expected_secret: Option<&str>) -> Result<(), TriggerError> {
        if let Some(expected) = expected_secret {
            if self.webhook_secret.as_deref() != Some(expected) {
                return Err(TriggerError::Auth);
            }
        }

        if self.quantity_pct <= Decimal::ZERO || self.quantity_pct > Decimal::ONE {
            return Err(TriggerError::Validation(format!(
                "quantity_pct must be in (0, 1], got {}",
                self.quantity_pct
            )));
        }

        if self.trigger_price.inner().is_sign_negative() {
            return Err(TriggerError::Validation(format!(
                "trigger_price must not be negative, got {}",
                self.trigger_price
            )));
        }

        let symbol = self.symbol.to_uppercase();
        split_symbol(&symbol)
            .map_err(|e| TriggerError::Validation(e.to_string()))?;

        Ok(())
    }

    /// Canonical form: symbols uppercased the way both venues name
    /// their spot markets.
    pub fn normalized(mut self) -> Self {
        self.symbol = self.symbol.to_uppercase();
        self
    }
}
