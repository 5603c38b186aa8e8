//! Pure waiver usability evaluation.
//!
//! `active -> expired` is time-triggered and implicit, `active -> revoked`
//! is explicit, and `extend` is an `active -> active` self-loop that pushes
//! `expires_at` forward. Both `expired` and `revoked` are terminal: a lapsed
//! waiver is recreated under a new id, never resurrected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use policy_loader::WaiverApprovalPolicy;

use crate::waiver::{Waiver, WaiverStatus};

/// How the minimum-approver rule is applied. The upstream behavior was
/// inconsistent between call sites, so the rule is an explicit parameter:
/// `PolicyMinimum` enforces `waiver_approval.required_approvers` whenever a
/// policy is supplied; `AnyApprover` only requires a non-empty approver list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApproverRule {
    #[default]
    PolicyMinimum,
    AnyApprover,
}

/// Machine-readable reason a waiver was not applied. Reasons are always
/// surfaced; a waiver is never silently unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    NotActive { status: WaiverStatus },
    Expired { expired_at: DateTime<Utc> },
    NoApprovers,
    InsufficientApprovers { required: u32, present: usize },
    MissingField { field: String },
    NotFound,
    NotBudgetScoped,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotActive { status } => write!(f, "status is '{status}', not 'active'"),
            Self::Expired { expired_at } => {
                write!(f, "expired at {}", expired_at.to_rfc3339())
            }
            Self::NoApprovers => f.write_str("no approvers recorded"),
            Self::InsufficientApprovers { required, present } => write!(
                f,
                "policy requires {required} approver(s), only {present} recorded"
            ),
            Self::MissingField { field } => write!(f, "required field '{field}' is missing"),
            Self::NotFound => f.write_str("not found in the active store"),
            Self::NotBudgetScoped => f.write_str("gates do not include 'budget_limit'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usability {
    pub usable: bool,
    pub reasons: Vec<SkipReason>,
}

impl Usability {
    fn usable() -> Self {
        Self {
            usable: true,
            reasons: Vec::new(),
        }
    }
}

/// Evaluate whether a waiver is currently usable. Pure: the caller supplies
/// `now`, and nothing here touches storage.
pub fn evaluate(
    waiver: &Waiver,
    now: DateTime<Utc>,
    approval: Option<&WaiverApprovalPolicy>,
    rule: ApproverRule,
) -> Usability {
    let mut reasons = Vec::new();

    for (field, missing) in [
        ("id", waiver.id.trim().is_empty()),
        ("title", waiver.title.trim().is_empty()),
        ("gates", waiver.gates.is_empty()),
    ] {
        if missing {
            reasons.push(SkipReason::MissingField {
                field: field.to_string(),
            });
        }
    }

    if waiver.status != WaiverStatus::Active {
        reasons.push(SkipReason::NotActive {
            status: waiver.status,
        });
    }

    // Temporal check independent of the stored status: storage may not yet
    // reflect the passage of time.
    if waiver.is_expired(now) {
        reasons.push(SkipReason::Expired {
            expired_at: waiver.expires_at,
        });
    }

    if waiver.approvers.is_empty() {
        reasons.push(SkipReason::NoApprovers);
    } else if rule == ApproverRule::PolicyMinimum {
        if let Some(required) = approval.map(|a| a.required_approvers) {
            if (waiver.approvers.len() as u32) < required {
                reasons.push(SkipReason::InsufficientApprovers {
                    required,
                    present: waiver.approvers.len(),
                });
            }
        }
    }

    if reasons.is_empty() {
        Usability::usable()
    } else {
        Usability {
            usable: false,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Duration;

    use super::*;
    use crate::waiver::{ImpactLevel, RiskAssessment, WaiverReason};

    fn waiver() -> Waiver {
        Waiver {
            id: "WV-0001".to_string(),
            title: "Hotfix budget relief".to_string(),
            reason: WaiverReason::EmergencyHotfix,
            description: "x".repeat(60),
            gates: BTreeSet::from(["budget_limit".to_string()]),
            risk_assessment: RiskAssessment {
                impact_level: ImpactLevel::Low,
                mitigation_plan: "y".repeat(60),
                review_required: false,
            },
            expires_at: Utc::now() + Duration::days(3),
            approved_by: "lead".to_string(),
            approvers: vec!["alex".to_string()],
            created_at: Utc::now(),
            delta: None,
            status: WaiverStatus::Active,
            metadata: None,
        }
    }

    fn approval(required: u32) -> WaiverApprovalPolicy {
        WaiverApprovalPolicy {
            required_approvers: required,
            max_duration_days: 30,
            auto_revoke_expired: true,
        }
    }

    #[test]
    fn active_unexpired_approved_is_usable() {
        let u = evaluate(&waiver(), Utc::now(), None, ApproverRule::PolicyMinimum);
        assert!(u.usable);
        assert!(u.reasons.is_empty());
    }

    #[test]
    fn expired_is_unusable_even_while_marked_active() {
        let mut w = waiver();
        w.expires_at = Utc::now() - Duration::minutes(1);
        assert_eq!(w.status, WaiverStatus::Active);
        let u = evaluate(&w, Utc::now(), None, ApproverRule::PolicyMinimum);
        assert!(!u.usable);
        assert!(matches!(u.reasons[0], SkipReason::Expired { .. }));
    }

    #[test]
    fn revoked_is_unusable() {
        let mut w = waiver();
        w.status = WaiverStatus::Revoked;
        let u = evaluate(&w, Utc::now(), None, ApproverRule::PolicyMinimum);
        assert!(!u.usable);
        assert_eq!(
            u.reasons,
            vec![SkipReason::NotActive {
                status: WaiverStatus::Revoked
            }]
        );
    }

    #[test]
    fn approver_minimum_enforced_only_under_policy_minimum_rule() {
        let w = waiver(); // one approver
        let policy = approval(2);

        let strict = evaluate(&w, Utc::now(), Some(&policy), ApproverRule::PolicyMinimum);
        assert!(!strict.usable);
        assert_eq!(
            strict.reasons,
            vec![SkipReason::InsufficientApprovers {
                required: 2,
                present: 1
            }]
        );

        let lenient = evaluate(&w, Utc::now(), Some(&policy), ApproverRule::AnyApprover);
        assert!(lenient.usable);
    }

    #[test]
    fn no_approvers_is_unusable_under_either_rule() {
        let mut w = waiver();
        w.approvers.clear();
        for rule in [ApproverRule::PolicyMinimum, ApproverRule::AnyApprover] {
            let u = evaluate(&w, Utc::now(), None, rule);
            assert!(!u.usable);
            assert_eq!(u.reasons, vec![SkipReason::NoApprovers]);
        }
    }

    #[test]
    fn missing_required_fields_surface_individually() {
        let mut w = waiver();
        w.title = String::new();
        w.gates.clear();
        let u = evaluate(&w, Utc::now(), None, ApproverRule::PolicyMinimum);
        assert!(!u.usable);
        assert_eq!(u.reasons.len(), 2);
    }
}
