//! Tier policy document: types, structural validation, defaults, caching.
//!
//! The policy document lives at `<project-root>/.gatehouse/policy.yaml` and
//! defines a baseline change budget per risk tier plus optional waiver
//! approval settings. A missing file is recoverable (built-in defaults are
//! substituted and flagged as synthetic); a malformed or structurally
//! invalid file is fatal and reported with every violation, never repaired.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const POLICY_RELATIVE_PATH: &str = ".gatehouse/policy.yaml";

const DEFAULT_MAX_DURATION_DAYS: u32 = 30;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy file not found: {path}")]
    NotFound { path: String },

    #[error("Policy file could not be read: {path}: {message}")]
    Io { path: String, message: String },

    #[error("Policy file is not valid YAML: {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Policy document is structurally invalid: {path}")]
    Invalid {
        path: String,
        violations: Vec<PolicyViolation>,
    },
}

/// One structural problem in a policy document. Validation collects every
/// violation before failing rather than stopping at the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Baseline budget and gate thresholds for one risk tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub max_files: u32,
    pub max_loc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_threshold: Option<u32>,
    #[serde(default)]
    pub contracts_required: bool,
    #[serde(default)]
    pub manual_review_required: bool,
}

/// Process-wide waiver approval settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiverApprovalPolicy {
    #[serde(default)]
    pub required_approvers: u32,
    #[serde(default = "default_max_duration_days")]
    pub max_duration_days: u32,
    #[serde(default = "default_auto_revoke")]
    pub auto_revoke_expired: bool,
}

fn default_max_duration_days() -> u32 {
    DEFAULT_MAX_DURATION_DAYS
}

fn default_auto_revoke() -> bool {
    true
}

impl Default for WaiverApprovalPolicy {
    fn default() -> Self {
        Self {
            required_approvers: 0,
            max_duration_days: DEFAULT_MAX_DURATION_DAYS,
            auto_revoke_expired: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub risk_tiers: BTreeMap<u8, TierPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiver_approval: Option<WaiverApprovalPolicy>,
}

impl PolicyDocument {
    pub fn tier(&self, tier: u8) -> Option<&TierPolicy> {
        self.risk_tiers.get(&tier)
    }

    pub fn defined_tiers(&self) -> Vec<u8> {
        self.risk_tiers.keys().copied().collect()
    }
}

/// A loaded policy plus how it was obtained. `synthetic` means no policy
/// file existed and the built-in defaults were substituted; callers should
/// warn but not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPolicy {
    pub document: PolicyDocument,
    pub synthetic: bool,
}

/// Built-in default policy used when no policy file is present.
///
/// Tier 1 is the highest-rigor tier: the smaller the number, the tighter
/// the budget and the more gates are mandatory.
pub fn default_policy() -> PolicyDocument {
    let mut risk_tiers = BTreeMap::new();
    risk_tiers.insert(
        1,
        TierPolicy {
            max_files: 10,
            max_loc: 200,
            coverage_threshold: Some(90),
            mutation_threshold: Some(85),
            contracts_required: true,
            manual_review_required: true,
        },
    );
    risk_tiers.insert(
        2,
        TierPolicy {
            max_files: 25,
            max_loc: 1000,
            coverage_threshold: Some(80),
            mutation_threshold: Some(70),
            contracts_required: true,
            manual_review_required: false,
        },
    );
    risk_tiers.insert(
        3,
        TierPolicy {
            max_files: 60,
            max_loc: 3000,
            coverage_threshold: Some(70),
            mutation_threshold: None,
            contracts_required: false,
            manual_review_required: false,
        },
    );
    PolicyDocument {
        version: "1".to_string(),
        risk_tiers,
        waiver_approval: Some(WaiverApprovalPolicy::default()),
    }
}

/// Structural validation. Returns every violation found; an empty vector
/// means the document is valid.
pub fn validate(doc: &PolicyDocument) -> Vec<PolicyViolation> {
    let mut violations = Vec::new();

    if doc.version.trim().is_empty() {
        violations.push(PolicyViolation {
            path: "version".to_string(),
            message: "must be present and non-empty".to_string(),
        });
    }

    for tier in 1u8..=3 {
        match doc.risk_tiers.get(&tier) {
            None => violations.push(PolicyViolation {
                path: format!("risk_tiers.{tier}"),
                message: "tier must be defined".to_string(),
            }),
            Some(policy) => {
                if policy.max_files == 0 {
                    violations.push(PolicyViolation {
                        path: format!("risk_tiers.{tier}.max_files"),
                        message: "must be positive".to_string(),
                    });
                }
                if policy.max_loc == 0 {
                    violations.push(PolicyViolation {
                        path: format!("risk_tiers.{tier}.max_loc"),
                        message: "must be positive".to_string(),
                    });
                }
                if let Some(pct) = policy.coverage_threshold {
                    if pct > 100 {
                        violations.push(PolicyViolation {
                            path: format!("risk_tiers.{tier}.coverage_threshold"),
                            message: format!("must be within 0..=100, got {pct}"),
                        });
                    }
                }
                if let Some(pct) = policy.mutation_threshold {
                    if pct > 100 {
                        violations.push(PolicyViolation {
                            path: format!("risk_tiers.{tier}.mutation_threshold"),
                            message: format!("must be within 0..=100, got {pct}"),
                        });
                    }
                }
            }
        }
    }

    if let Some(approval) = &doc.waiver_approval {
        if approval.max_duration_days == 0 {
            violations.push(PolicyViolation {
                path: "waiver_approval.max_duration_days".to_string(),
                message: "must be positive".to_string(),
            });
        }
    }

    violations
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Use,
    Bypass,
}

struct CacheEntry {
    mtime: SystemTime,
    loaded: LoadedPolicy,
}

/// Caller-owned policy cache keyed by project root and file mtime.
///
/// Caching is an optimization only: a changed mtime or `CacheMode::Bypass`
/// always wins over a cached entry, so a freshly written policy file is
/// never shadowed.
#[derive(Default)]
pub struct PolicyCache {
    entries: HashMap<PathBuf, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl PolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self, project_root: &Path) {
        self.entries.remove(&policy_path(project_root));
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

pub fn policy_path(project_root: &Path) -> PathBuf {
    project_root.join(POLICY_RELATIVE_PATH)
}

/// Load and validate the policy for a project root.
///
/// A missing file yields the built-in defaults with `synthetic: true`; any
/// other failure is an error. Cache entries are keyed by file mtime.
pub fn load_policy(
    project_root: &Path,
    cache: &mut PolicyCache,
    mode: CacheMode,
) -> Result<LoadedPolicy, PolicyError> {
    let path = policy_path(project_root);

    let mtime = match fs::metadata(&path) {
        Ok(meta) => meta.modified().ok(),
        Err(_) => None,
    };

    if mode == CacheMode::Use {
        if let (Some(mtime), Some(entry)) = (mtime, cache.entries.get(&path)) {
            if entry.mtime == mtime {
                cache.hits += 1;
                debug!(path = %path.display(), "policy cache hit");
                return Ok(entry.loaded.clone());
            }
        }
    }
    cache.misses += 1;
    debug!(path = %path.display(), "policy cache miss");

    let loaded = load_policy_uncached(project_root)?;
    if let Some(mtime) = mtime {
        cache.entries.insert(
            path,
            CacheEntry {
                mtime,
                loaded: loaded.clone(),
            },
        );
    }
    Ok(loaded)
}

/// Load and validate the policy, ignoring any cache.
pub fn load_policy_uncached(project_root: &Path) -> Result<LoadedPolicy, PolicyError> {
    let path = policy_path(project_root);

    if !path.exists() {
        warn!(path = %path.display(), "no policy file; using built-in defaults");
        return Ok(LoadedPolicy {
            document: default_policy(),
            synthetic: true,
        });
    }

    let content = fs::read_to_string(&path).map_err(|e| PolicyError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let document: PolicyDocument =
        serde_yaml::from_str(&content).map_err(|e| PolicyError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let violations = validate(&document);
    if !violations.is_empty() {
        return Err(PolicyError::Invalid {
            path: path.display().to_string(),
            violations,
        });
    }

    Ok(LoadedPolicy {
        document,
        synthetic: false,
    })
}
