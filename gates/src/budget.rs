//! Effective-budget derivation and compliance checking.
//!
//! The baseline comes from the work item's risk tier; usable waivers scoped
//! to the `budget_limit` gate add their deltas on top. Deltas are strictly
//! additive: they commute, never multiply, and can never shrink a budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use policy_loader::PolicyDocument;

use crate::lifecycle::{evaluate, ApproverRule, SkipReason};
use crate::store::WaiverRepository;
use crate::waiver::BUDGET_GATE;
use crate::GateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub risk_tier: u8,
    pub waiver_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub files_changed: u64,
    pub lines_changed: u64,
    pub risk_tier: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_files: u64,
    pub max_loc: u64,
}

/// One referenced waiver that was not applied, with every reason surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiverSkip {
    pub id: String,
    pub reasons: Vec<SkipReason>,
}

/// Computed fresh on every call; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedBudget {
    pub baseline: BudgetLimits,
    pub effective: BudgetLimits,
    /// Every waiver the work item referenced, applied or not, so the
    /// derivation stays traceable.
    pub waivers_applied: Vec<String>,
    pub skips: Vec<WaiverSkip>,
    pub derived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    MaxFiles,
    MaxLoc,
}

impl BudgetDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxFiles => "max_files",
            Self::MaxLoc => "max_loc",
        }
    }
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-dimension overage. Carries the pre-waiver baseline so a caller can
/// see how much of the overage waivers covered and how much remains exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub dimension: BudgetDimension,
    pub actual: u64,
    pub limit: u64,
    pub baseline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub violations: Vec<BudgetViolation>,
}

#[derive(Debug)]
pub struct BudgetEngine<'a> {
    policy: &'a PolicyDocument,
    repository: &'a WaiverRepository,
    rule: ApproverRule,
}

impl<'a> BudgetEngine<'a> {
    pub fn new(policy: &'a PolicyDocument, repository: &'a WaiverRepository) -> Self {
        Self {
            policy,
            repository,
            rule: ApproverRule::default(),
        }
    }

    pub fn with_approver_rule(mut self, rule: ApproverRule) -> Self {
        self.rule = rule;
        self
    }

    /// Derive the effective budget for a work item. Unusable referenced
    /// waivers are skipped with surfaced reasons, never a hard failure, so
    /// an expired waiver does not block unrelated work.
    pub fn derive_budget(&self, work: &WorkItem) -> Result<DerivedBudget, GateError> {
        let tier = self
            .policy
            .tier(work.risk_tier)
            .ok_or_else(|| GateError::UnknownTier {
                tier: work.risk_tier,
                defined: self.policy.defined_tiers(),
            })?;

        let baseline = BudgetLimits {
            max_files: u64::from(tier.max_files),
            max_loc: u64::from(tier.max_loc),
        };
        let mut effective = baseline;
        let mut skips = Vec::new();
        let now = Utc::now();
        let approval = self.policy.waiver_approval.as_ref();

        for id in &work.waiver_ids {
            let waiver = match self.repository.load(id) {
                Ok(waiver) => waiver,
                Err(GateError::WaiverNotFound { .. }) => {
                    warn!(waiver_id = %id, "referenced waiver not found; skipping");
                    skips.push(WaiverSkip {
                        id: id.clone(),
                        reasons: vec![SkipReason::NotFound],
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            let usability = evaluate(&waiver, now, approval, self.rule);
            if !usability.usable {
                for reason in &usability.reasons {
                    warn!(waiver_id = %id, %reason, "waiver unusable; skipping");
                }
                skips.push(WaiverSkip {
                    id: id.clone(),
                    reasons: usability.reasons,
                });
                continue;
            }

            // A waiver not scoped to budgets must not relax budgets, even
            // when explicitly referenced.
            if !waiver.gates.contains(BUDGET_GATE) {
                warn!(waiver_id = %id, "waiver is not scoped to 'budget_limit'; skipping");
                skips.push(WaiverSkip {
                    id: id.clone(),
                    reasons: vec![SkipReason::NotBudgetScoped],
                });
                continue;
            }

            let delta = waiver.delta.unwrap_or_default();
            effective.max_files += delta.max_files;
            effective.max_loc += delta.max_loc;
        }

        Ok(DerivedBudget {
            baseline,
            effective,
            waivers_applied: work.waiver_ids.clone(),
            skips,
            derived_at: now,
        })
    }
}

/// Check actual change statistics against a derived budget. Dimensions are
/// evaluated independently; compliance is the conjunction of both.
pub fn check_compliance(derived: &DerivedBudget, stats: &ChangeStats) -> ComplianceReport {
    let mut violations = Vec::new();

    if stats.files_changed > derived.effective.max_files {
        violations.push(BudgetViolation {
            dimension: BudgetDimension::MaxFiles,
            actual: stats.files_changed,
            limit: derived.effective.max_files,
            baseline: derived.baseline.max_files,
        });
    }
    if stats.lines_changed > derived.effective.max_loc {
        violations.push(BudgetViolation {
            dimension: BudgetDimension::MaxLoc,
            actual: stats.lines_changed,
            limit: derived.effective.max_loc,
            baseline: derived.baseline.max_loc,
        });
    }

    ComplianceReport {
        compliant: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived(effective_files: u64, effective_loc: u64) -> DerivedBudget {
        DerivedBudget {
            baseline: BudgetLimits {
                max_files: 50,
                max_loc: 2000,
            },
            effective: BudgetLimits {
                max_files: effective_files,
                max_loc: effective_loc,
            },
            waivers_applied: Vec::new(),
            skips: Vec::new(),
            derived_at: Utc::now(),
        }
    }

    fn stats(files: u64, lines: u64) -> ChangeStats {
        ChangeStats {
            files_changed: files,
            lines_changed: lines,
            risk_tier: 2,
        }
    }

    #[test]
    fn within_budget_is_compliant() {
        let report = check_compliance(&derived(70, 2500), &stats(70, 2500));
        assert!(report.compliant);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn dimensions_are_checked_independently() {
        let report = check_compliance(&derived(70, 2500), &stats(71, 2400));
        assert!(!report.compliant);
        assert_eq!(report.violations.len(), 1);
        let v = report.violations[0];
        assert_eq!(v.dimension, BudgetDimension::MaxFiles);
        assert_eq!(v.actual, 71);
        assert_eq!(v.limit, 70);
        assert_eq!(v.baseline, 50);
    }

    #[test]
    fn both_dimensions_can_fail_together() {
        let report = check_compliance(&derived(70, 2500), &stats(80, 9000));
        assert_eq!(report.violations.len(), 2);
    }

    #[test]
    fn exactly_at_the_limit_passes() {
        let report = check_compliance(&derived(70, 2500), &stats(70, 2501));
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].dimension, BudgetDimension::MaxLoc);
    }
}
