//! Client-side soft limits on turn count and cumulative spend.

use serde::{Deserialize, Serialize};

/// A soft limit that a completed turn crossed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GuardrailViolation {
    #[error("Turn limit exceeded: turn {turn} > max {limit}")]
    MaxTurns { limit: u64, turn: u64 },
    #[error("Budget exceeded: ${spent:.4} > max ${limit:.4}")]
    Budget { limit: f64, spent: f64 },
}

/// Soft limits. `None` disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default)]
    pub max_turns: Option<u64>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
}

impl Guardrails {
    /// Check a completed turn against the limits. The turn limit is checked
    /// first.
    #[must_use]
    pub fn check(&self, turn: u64, total_cost_usd: f64) -> Option<GuardrailViolation> {
        if let Some(limit) = self.max_turns {
            if turn > limit {
                return Some(GuardrailViolation::MaxTurns { limit, turn });
            }
        }
        if let Some(limit) = self.max_budget_usd {
            if total_cost_usd > limit {
                return Some(GuardrailViolation::Budget {
                    limit,
                    spent: total_cost_usd,
                });
            }
        }
        None
    }
}
