//! Approval matrix: which roles must sign off on an action type, by amount.
//!
//! The matrix is immutable configuration. A [`MatrixHandle`] hands out the
//! current version and swaps the whole table on reload; workflows record the
//! version their chain was resolved against.

use std::path::Path;
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum RiskClass {
    #[default]
    Standard,
    /// Always needs the second tier, whatever the amount.
    HighRisk,
}

/// One authority level: `role` may authorize up to and including `threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Tier {
    pub role: String,
    #[schema(value_type = String)]
    pub threshold: Decimal,
}

impl Tier {
    pub fn new(role: impl Into<String>, threshold: Decimal) -> Self {
        Self {
            role: role.into(),
            threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ApprovalRule {
    pub action_type: String,
    #[serde(default)]
    pub risk: RiskClass,
    /// Ascending by threshold.
    pub tiers: Vec<Tier>,
    /// Role a stuck workflow is escalated to. Defaults to the top tier.
    #[serde(default)]
    pub escalation_role: Option<String>,
}

impl ApprovalRule {
    pub fn escalation_target(&self) -> Option<&str> {
        self.escalation_role
            .as_deref()
            .or_else(|| self.tiers.last().map(|t| t.role.as_str()))
    }

    /// Ordered approver roles for `amount`.
    pub fn resolve(&self, amount: Decimal) -> Vec<String> {
        let mut chain = Vec::with_capacity(self.tiers.len());
        for (i, tier) in self.tiers.iter().enumerate() {
            let required = match i {
                0 => true,
                1 if self.risk == RiskClass::HighRisk => true,
                _ => amount > self.tiers[i - 1].threshold,
            };
            if !required {
                break;
            }
            chain.push(tier.role.clone());
        }
        chain
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ApprovalMatrix {
    pub version: i64,
    pub rules: Vec<ApprovalRule>,
}

impl ApprovalMatrix {
    pub fn rule(&self, action_type: &str) -> Option<&ApprovalRule> {
        self.rules.iter().find(|r| r.action_type == action_type)
    }

    pub fn validate(&self) -> AppResult<()> {
        for rule in &self.rules {
            if rule.action_type.trim().is_empty() {
                return Err(AppError::configuration("approval rule without action type"));
            }
            if rule.tiers.is_empty() {
                return Err(AppError::configuration(format!(
                    "approval rule '{}' has no tiers",
                    rule.action_type
                )));
            }
            if rule.tiers.windows(2).any(|w| w[0].threshold >= w[1].threshold) {
                return Err(AppError::configuration(format!(
                    "approval rule '{}' thresholds must be strictly ascending",
                    rule.action_type
                )));
            }
            if self.rules.iter().filter(|r| r.action_type == rule.action_type).count() > 1 {
                return Err(AppError::configuration(format!(
                    "approval rule '{}' is defined twice",
                    rule.action_type
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> AppResult<Self> {
        let matrix: ApprovalMatrix = serde_json::from_str(json)
            .map_err(|e| AppError::configuration(format!("invalid approval matrix: {e}")))?;
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            AppError::configuration(format!("cannot read approval matrix {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

impl Default for ApprovalMatrix {
    fn default() -> Self {
        default_matrix()
    }
}

/// Built-in banking matrix.
pub fn default_matrix() -> ApprovalMatrix {
    let rule = |action_type: &str, risk, tiers: Vec<Tier>| ApprovalRule {
        action_type: action_type.to_string(),
        risk,
        tiers,
        escalation_role: None,
    };

    ApprovalMatrix {
        version: 1,
        rules: vec![
            rule(
                "account_creation",
                RiskClass::Standard,
                vec![
                    Tier::new("BackOfficeOfficer", Decimal::from(100_000)),
                    Tier::new("BranchManager", Decimal::from(500_000)),
                ],
            ),
            rule(
                "loan_approval",
                RiskClass::Standard,
                vec![
                    Tier::new("LoanOfficer", Decimal::from(50_000)),
                    Tier::new("BranchManager", Decimal::from(500_000)),
                    Tier::new("RegionalManager", Decimal::from(5_000_000)),
                ],
            ),
            rule(
                "policy_creation",
                RiskClass::Standard,
                vec![
                    Tier::new("BancassuranceOfficer", Decimal::from(25_000)),
                    Tier::new("BranchManager", Decimal::from(500_000)),
                ],
            ),
            rule(
                "transaction_reversal",
                RiskClass::HighRisk,
                vec![
                    Tier::new("BackOfficeOfficer", Decimal::from(10_000)),
                    Tier::new("BranchManager", Decimal::from(500_000)),
                ],
            ),
        ],
    }
}

/// Resolves the approval chain for an action. Unknown action types are a
/// validation error.
pub fn resolve_chain(matrix: &ApprovalMatrix, action_type: &str, amount: Decimal) -> AppResult<Vec<String>> {
    let rule = matrix
        .rule(action_type)
        .ok_or_else(|| AppError::validation(format!("Unknown action type: {action_type}")))?;
    Ok(rule.resolve(amount))
}

/// Shared, atomically replaceable matrix.
#[derive(Debug, Clone)]
pub struct MatrixHandle {
    inner: Arc<RwLock<Arc<ApprovalMatrix>>>,
}

impl MatrixHandle {
    pub fn new(matrix: ApprovalMatrix) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(matrix))),
        }
    }

    pub fn current(&self) -> Arc<ApprovalMatrix> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validates and installs a new table. In-flight readers keep the old one.
    pub fn replace(&self, matrix: ApprovalMatrix) -> AppResult<()> {
        matrix.validate()?;
        // Checked under the write guard: an older table never replaces a newer one.
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if matrix.version <= guard.version {
            return Err(AppError::configuration(format!(
                "approval matrix version {} is not newer than {}",
                matrix.version, guard.version
            )));
        }
        *guard = Arc::new(matrix);
        Ok(())
    }
}

impl Default for MatrixHandle {
    fn default() -> Self {
        Self::new(default_matrix())
    }
}
