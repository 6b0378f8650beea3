use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, LockConfig};
use crate::operation::OperationKind;

/// A domain invariant checked before anything is locked or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessRule {
    NonNegativeStock,
    ReservationLimit,
    PositiveQuantity,
    PriceChangeBound,
}

impl BusinessRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessRule::NonNegativeStock => "non_negative_stock",
            BusinessRule::ReservationLimit => "reservation_limit",
            BusinessRule::PositiveQuantity => "positive_quantity",
            BusinessRule::PriceChangeBound => "price_change_bound",
        }
    }
}

/// One violated rule, with a message for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule: BusinessRule,
    pub message: String,
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule.as_str(), self.message)
    }
}

/// The state change a validator judges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedChange {
    pub kind: OperationKind,
    pub requested_quantity: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
}

/// Evaluates every business rule against a proposed change.
///
/// Rules are independent; a rejected change reports all violations at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusinessRuleValidator {
    reservation_limit_fraction: f64,
    max_price_change_fraction: f64,
}

impl Default for BusinessRuleValidator {
    fn default() -> Self {
        Self::new(0.8, 0.5)
    }
}

impl BusinessRuleValidator {
    pub fn new(reservation_limit_fraction: f64, max_price_change_fraction: f64) -> Self {
        Self {
            reservation_limit_fraction,
            max_price_change_fraction,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.reservation_limit_fraction,
            config.max_price_change_fraction,
        )
    }

    /// Returns `Ok(())` when the change passes, otherwise every violation.
    pub fn validate(
        &self,
        change: &ProposedChange,
        policy: &LockConfig,
    ) -> std::result::Result<(), Vec<RuleViolation>> {
        let violations = self.violations(change, policy);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    pub fn violations(&self, change: &ProposedChange, policy: &LockConfig) -> Vec<RuleViolation> {
        let mut violations = Vec::new();

        if change.new_quantity < 0 && !policy.allow_negative_stock {
            violations.push(RuleViolation {
                rule: BusinessRule::NonNegativeStock,
                message: format!(
                    "resulting quantity {} would be negative",
                    change.new_quantity
                ),
            });
        }

        if change.kind == OperationKind::Reserve && policy.enforce_reservation_limit {
            let limit = change.previous_quantity as f64 * self.reservation_limit_fraction;
            if change.requested_quantity as f64 > limit {
                violations.push(RuleViolation {
                    rule: BusinessRule::ReservationLimit,
                    message: format!(
                        "reservation of {} exceeds {:.0}% of available {}",
                        change.requested_quantity,
                        self.reservation_limit_fraction * 100.0,
                        change.previous_quantity
                    ),
                });
            }
        }

        if change.requested_quantity <= 0 {
            violations.push(RuleViolation {
                rule: BusinessRule::PositiveQuantity,
                message: format!(
                    "requested quantity {} must be positive",
                    change.requested_quantity
                ),
            });
        }

        // A zero previous price has no baseline to bound the change against.
        if change.kind == OperationKind::PriceUpdate && change.previous_quantity != 0 {
            let delta = change.new_quantity.abs_diff(change.previous_quantity) as f64;
            let ratio = delta / change.previous_quantity.unsigned_abs() as f64;
            if ratio > self.max_price_change_fraction {
                violations.push(RuleViolation {
                    rule: BusinessRule::PriceChangeBound,
                    message: format!(
                        "price change of {:.1}% exceeds {:.0}%",
                        ratio * 100.0,
                        self.max_price_change_fraction * 100.0
                    ),
                });
            }
        }

        violations
    }
}
