//! Waiver record model and declarative schema validation.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use policy_loader::WaiverApprovalPolicy;

/// Gate names a waiver may target. `budget_limit` is the only gate the
/// budget derivation engine acts on; the others are enforced by their own
/// collaborators.
pub const KNOWN_GATES: &[&str] = &[
    "budget_limit",
    "coverage_threshold",
    "mutation_threshold",
    "contracts_required",
    "manual_review",
];

pub const BUDGET_GATE: &str = "budget_limit";

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^WV-\d{4}$").expect("waiver id pattern compiles"));

pub fn is_valid_id(id: &str) -> bool {
    ID_PATTERN.is_match(id)
}

pub fn format_id(n: u32) -> String {
    format!("WV-{n:04}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaiverReason {
    EmergencyHotfix,
    SecurityPatch,
    DependencyUpdate,
    LegacyMigration,
    PerformanceFix,
    ToolingGap,
}

impl WaiverReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmergencyHotfix => "emergency_hotfix",
            Self::SecurityPatch => "security_patch",
            Self::DependencyUpdate => "dependency_update",
            Self::LegacyMigration => "legacy_migration",
            Self::PerformanceFix => "performance_fix",
            Self::ToolingGap => "tooling_gap",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::EmergencyHotfix,
            Self::SecurityPatch,
            Self::DependencyUpdate,
            Self::LegacyMigration,
            Self::PerformanceFix,
            Self::ToolingGap,
        ]
    }
}

impl std::fmt::Display for WaiverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaiverReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown waiver reason '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImpactLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown impact level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaiverStatus {
    Active,
    Expired,
    Revoked,
}

impl WaiverStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for WaiverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub impact_level: ImpactLevel,
    pub mitigation_plan: String,
    pub review_required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetDelta {
    #[serde(default)]
    pub max_files: u64,
    #[serde(default)]
    pub max_loc: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiverMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_pr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_issue: Option<String>,
    /// Set by `extend`: the expiry that was in force before the extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_expiry: Option<DateTime<Utc>>,
    /// Set by `extend`: who approved pushing the expiry forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_approver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waiver {
    pub id: String,
    pub title: String,
    pub reason: WaiverReason,
    pub description: String,
    pub gates: BTreeSet<String>,
    pub risk_assessment: RiskAssessment,
    pub expires_at: DateTime<Utc>,
    pub approved_by: String,
    pub approvers: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<BudgetDelta>,
    pub status: WaiverStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WaiverMetadata>,
}

impl Waiver {
    /// Temporal check, independent of the stored `status` field: storage may
    /// not yet reflect the passage of time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn environment(&self) -> Option<&str> {
        self.metadata.as_ref()?.environment.as_deref()
    }

    pub fn needs_review_flag(&self) -> bool {
        self.risk_assessment.impact_level == ImpactLevel::Critical
            || self.risk_assessment.review_required
    }
}

/// Everything the caller supplies to `create`; the store assigns `id`,
/// `created_at`, and `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaiverDraft {
    pub title: String,
    pub reason: WaiverReason,
    pub description: String,
    pub gates: BTreeSet<String>,
    pub risk_assessment: RiskAssessment,
    pub expires_at: DateTime<Utc>,
    pub approved_by: String,
    pub approvers: Vec<String>,
    pub delta: Option<BudgetDelta>,
    pub metadata: Option<WaiverMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const TITLE_RANGE: (usize, usize) = (10, 200);
const DESCRIPTION_RANGE: (usize, usize) = (50, 1000);
const MITIGATION_MIN: usize = 50;

/// Full declarative validation of a draft at creation time. Every failing
/// field is reported, not just the first.
pub fn validate_draft(
    draft: &WaiverDraft,
    now: DateTime<Utc>,
    approval: Option<&WaiverApprovalPolicy>,
) -> Vec<FieldViolation> {
    let mut violations = Vec::new();

    let title_len = draft.title.chars().count();
    if title_len < TITLE_RANGE.0 || title_len > TITLE_RANGE.1 {
        violations.push(FieldViolation::new(
            "title",
            format!(
                "must be {}..={} characters, got {title_len}",
                TITLE_RANGE.0, TITLE_RANGE.1
            ),
        ));
    }

    let desc_len = draft.description.chars().count();
    if desc_len < DESCRIPTION_RANGE.0 || desc_len > DESCRIPTION_RANGE.1 {
        violations.push(FieldViolation::new(
            "description",
            format!(
                "must be {}..={} characters, got {desc_len}",
                DESCRIPTION_RANGE.0, DESCRIPTION_RANGE.1
            ),
        ));
    }

    if draft.gates.is_empty() {
        violations.push(FieldViolation::new("gates", "at least one gate is required"));
    }
    for gate in &draft.gates {
        if !KNOWN_GATES.contains(&gate.as_str()) {
            violations.push(FieldViolation::new(
                "gates",
                format!("unknown gate '{gate}' (known: {})", KNOWN_GATES.join(", ")),
            ));
        }
    }

    let mitigation_len = draft.risk_assessment.mitigation_plan.chars().count();
    if mitigation_len < MITIGATION_MIN {
        violations.push(FieldViolation::new(
            "risk_assessment.mitigation_plan",
            format!("must be at least {MITIGATION_MIN} characters, got {mitigation_len}"),
        ));
    }

    if draft.approved_by.trim().is_empty() {
        violations.push(FieldViolation::new("approved_by", "must be non-empty"));
    }
    if draft.approvers.is_empty() {
        violations.push(FieldViolation::new(
            "approvers",
            "at least one approver is required",
        ));
    } else if draft.approvers.iter().any(|a| a.trim().is_empty()) {
        violations.push(FieldViolation::new(
            "approvers",
            "approver names must be non-empty",
        ));
    }

    if draft.expires_at <= now {
        violations.push(FieldViolation::new(
            "expires_at",
            format!("must be in the future (now: {})", now.to_rfc3339()),
        ));
    } else if let Some(max_days) = approval.map(|a| a.max_duration_days) {
        if let Some(violation) = validate_duration(draft.expires_at, now, max_days) {
            violations.push(violation);
        }
    }

    violations
}

/// Shared by `create` and `extend`: the expiry may not lie further out than
/// the approval policy allows.
pub fn validate_duration(
    expires_at: DateTime<Utc>,
    from: DateTime<Utc>,
    max_duration_days: u32,
) -> Option<FieldViolation> {
    let limit = from + Duration::days(i64::from(max_duration_days));
    if expires_at > limit {
        Some(FieldViolation::new(
            "expires_at",
            format!(
                "exceeds the approval policy maximum of {max_duration_days} days (latest allowed: {})",
                limit.to_rfc3339()
            ),
        ))
    } else {
        None
    }
}
