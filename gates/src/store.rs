//! Keyed waiver store with an append-only audit trail.
//!
//! Persistence is a single JSON document mapping waiver id to record,
//! wrapped with a revision counter. Serialization is stable (sorted keys,
//! pretty-printed) so rewrites stay diff-minimal under version control.
//! Writes go to a temp file in the store directory and are renamed into
//! place. There is no cross-process lock: two concurrent invocations
//! against the same project can still race between the revision check and
//! the rename; the revision token turns the lost-update case into an
//! explicit [`GateError::StoreConflict`] instead of a silent clobber.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use policy_loader::WaiverApprovalPolicy;

use crate::audit::{AuditAction, AuditLog};
use crate::waiver::{
    format_id, validate_draft, validate_duration, FieldViolation, Waiver, WaiverDraft,
    WaiverMetadata, WaiverStatus,
};
use crate::GateError;

pub const STORE_RELATIVE_PATH: &str = ".gatehouse/waivers.json";
pub const REVIEW_RELATIVE_DIR: &str = ".gatehouse/review";

const MAX_ID: u32 = 9999;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    revision: u64,
    #[serde(default)]
    waivers: BTreeMap<String, Waiver>,
}

#[derive(Deserialize)]
struct RevisionProbe {
    #[serde(default)]
    revision: u64,
}

#[derive(Debug)]
pub struct WaiverRepository {
    data_dir: PathBuf,
    store_path: PathBuf,
    review_dir: PathBuf,
    approval: Option<WaiverApprovalPolicy>,
    audit: AuditLog,
    state: StoreFile,
}

impl WaiverRepository {
    /// Open the store under `<project-root>/.gatehouse/`, reading the
    /// persisted set if present.
    pub fn open(project_root: &Path) -> Result<Self, GateError> {
        let data_dir = project_root.join(".gatehouse");
        let store_path = project_root.join(STORE_RELATIVE_PATH);
        let review_dir = project_root.join(REVIEW_RELATIVE_DIR);
        let audit = AuditLog::new(project_root);

        let state = if store_path.exists() {
            let content = fs::read_to_string(&store_path).map_err(|e| GateError::Io {
                path: store_path.display().to_string(),
                message: e.to_string(),
            })?;
            serde_json::from_str(&content).map_err(|e| GateError::Parse {
                path: store_path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            StoreFile::default()
        };

        Ok(Self {
            data_dir,
            store_path,
            review_dir,
            approval: None,
            audit,
            state,
        })
    }

    /// Supply the approval policy section used for duration and approver
    /// checks. `None` leaves only the structural rules in force.
    pub fn with_approval_policy(mut self, approval: Option<WaiverApprovalPolicy>) -> Self {
        self.approval = approval;
        self
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn review_flag_path(&self, id: &str) -> PathBuf {
        self.review_dir.join(format!("{id}.md"))
    }

    /// Fetch a waiver by id from the loaded set. Expired records that have
    /// not yet been pruned are still returned; usability is the lifecycle
    /// module's call.
    pub fn load(&self, id: &str) -> Result<Waiver, GateError> {
        self.state
            .waivers
            .get(id)
            .cloned()
            .ok_or_else(|| GateError::WaiverNotFound { id: id.to_string() })
    }

    /// Create a waiver: validate the full schema, assign the smallest unused
    /// id, reject gate conflicts with other active waivers, persist, audit.
    /// Critical-impact or review-required waivers additionally get a
    /// review-flag document and a `FLAG_REVIEW` audit entry.
    pub fn create(&mut self, draft: WaiverDraft) -> Result<Waiver, GateError> {
        let now = Utc::now();

        let violations = validate_draft(&draft, now, self.approval.as_ref());
        if !violations.is_empty() {
            return Err(GateError::WaiverInvalid { violations });
        }

        let id = self.next_id()?;

        let candidate_env = draft
            .metadata
            .as_ref()
            .and_then(|m| m.environment.as_deref());
        if let Some((gate, other_id)) = self.find_gate_conflict(&draft.gates, candidate_env, now) {
            return Err(GateError::WaiverConflict {
                id,
                gate,
                conflicts_with: other_id,
            });
        }

        let waiver = Waiver {
            id: id.clone(),
            title: draft.title,
            reason: draft.reason,
            description: draft.description,
            gates: draft.gates,
            risk_assessment: draft.risk_assessment,
            expires_at: draft.expires_at,
            approved_by: draft.approved_by,
            approvers: draft.approvers,
            created_at: now,
            delta: draft.delta,
            status: WaiverStatus::Active,
            metadata: draft.metadata,
        };

        let mut next = self.state.waivers.clone();
        next.insert(id.clone(), waiver.clone());
        self.persist(next)?;

        self.audit.append(
            AuditAction::Create,
            &id,
            serde_json::json!({
                "title": waiver.title,
                "reason": waiver.reason,
                "gates": waiver.gates,
                "expires_at": waiver.expires_at,
                "delta": waiver.delta,
            }),
        )?;
        info!(waiver_id = %id, reason = %waiver.reason, "waiver created");

        if waiver.needs_review_flag() {
            self.write_review_flag(&waiver)?;
            self.audit.append(
                AuditAction::FlagReview,
                &id,
                serde_json::json!({
                    "impact_level": waiver.risk_assessment.impact_level,
                    "review_required": waiver.risk_assessment.review_required,
                    "flag_path": self.review_flag_path(&id).display().to_string(),
                }),
            )?;
        }

        Ok(waiver)
    }

    /// Revoke a waiver: terminal. The record leaves the active store and
    /// survives only in the `REVOKE` audit entry, which carries the full
    /// prior record for forensic replay.
    pub fn revoke(&mut self, id: &str, reason: &str) -> Result<Waiver, GateError> {
        let mut revoked = self.load(id)?;
        revoked.status = WaiverStatus::Revoked;

        let mut next = self.state.waivers.clone();
        next.remove(id);
        self.persist(next)?;

        self.audit.append(
            AuditAction::Revoke,
            id,
            serde_json::json!({
                "reason": reason,
                "record": revoked,
            }),
        )?;
        info!(waiver_id = %id, reason, "waiver revoked");

        Ok(revoked)
    }

    /// Push a waiver's expiry forward. The previous expiry and the approver
    /// of the extension are recorded in the waiver's metadata before the
    /// overwrite. An already-lapsed waiver cannot be extended.
    pub fn extend(
        &mut self,
        id: &str,
        new_expiry: DateTime<Utc>,
        approver: &str,
    ) -> Result<Waiver, GateError> {
        let mut waiver = self.load(id)?;
        let now = Utc::now();

        let mut violations = Vec::new();
        if waiver.is_expired(now) {
            violations.push(FieldViolation {
                field: "expires_at".to_string(),
                message: format!(
                    "waiver lapsed at {}; recreate it under a new id",
                    waiver.expires_at.to_rfc3339()
                ),
            });
        }
        if new_expiry <= now {
            violations.push(FieldViolation {
                field: "expires_at".to_string(),
                message: "new expiry must be in the future".to_string(),
            });
        } else if let Some(max_days) = self.approval.as_ref().map(|a| a.max_duration_days) {
            violations.extend(validate_duration(new_expiry, now, max_days));
        }
        if !violations.is_empty() {
            return Err(GateError::WaiverInvalid { violations });
        }

        let previous_expiry = waiver.expires_at;
        let metadata = waiver.metadata.get_or_insert_with(WaiverMetadata::default);
        metadata.previous_expiry = Some(previous_expiry);
        metadata.extension_approver = Some(approver.to_string());
        waiver.expires_at = new_expiry;

        let mut next = self.state.waivers.clone();
        next.insert(id.to_string(), waiver.clone());
        self.persist(next)?;

        self.audit.append(
            AuditAction::Extend,
            id,
            serde_json::json!({
                "previous_expiry": previous_expiry,
                "new_expiry": new_expiry,
                "approver": approver,
            }),
        )?;
        info!(waiver_id = %id, approver, "waiver extended");

        Ok(waiver)
    }

    /// Return the currently active set, lazily dropping lapsed entries.
    /// Expiry is a derived fact, not an approved action, so pruning writes
    /// no audit entry. The pruned set is persisted back unless the approval
    /// policy disables `auto_revoke_expired`.
    pub fn list_active(&mut self) -> Result<Vec<Waiver>, GateError> {
        let now = Utc::now();
        let mut kept = BTreeMap::new();
        let mut pruned = 0usize;
        for (id, waiver) in &self.state.waivers {
            if waiver.status == WaiverStatus::Active && !waiver.is_expired(now) {
                kept.insert(id.clone(), waiver.clone());
            } else {
                pruned += 1;
            }
        }

        let auto_revoke = self
            .approval
            .as_ref()
            .map(|a| a.auto_revoke_expired)
            .unwrap_or(true);
        if pruned > 0 && auto_revoke {
            debug!(pruned, "pruning lapsed waivers from the store");
            self.persist(kept.clone())?;
        }

        Ok(kept.into_values().collect())
    }

    /// Smallest unused sequential id, reusing gaps left by revoked waivers.
    fn next_id(&self) -> Result<String, GateError> {
        for n in 1..=MAX_ID {
            let candidate = format_id(n);
            if !self.state.waivers.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(GateError::IdSpaceExhausted)
    }

    /// Two active waivers must not claim the same gate unless both are
    /// scoped to explicitly different environments.
    fn find_gate_conflict(
        &self,
        gates: &BTreeSet<String>,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<(String, String)> {
        for (other_id, other) in &self.state.waivers {
            if other.status != WaiverStatus::Active || other.is_expired(now) {
                continue;
            }
            for gate in gates {
                if !other.gates.contains(gate) {
                    continue;
                }
                let disjoint = matches!(
                    (environment, other.environment()),
                    (Some(a), Some(b)) if a != b
                );
                if !disjoint {
                    return Some((gate.clone(), other_id.clone()));
                }
            }
        }
        None
    }

    /// Revision-checked atomic write. The on-disk revision must still match
    /// the revision this repository loaded; otherwise another invocation got
    /// there first and the caller must re-open and retry.
    fn persist(&mut self, waivers: BTreeMap<String, Waiver>) -> Result<(), GateError> {
        let on_disk = self.read_disk_revision()?;
        if on_disk != self.state.revision {
            return Err(GateError::StoreConflict {
                loaded: self.state.revision,
                on_disk,
            });
        }

        let next = StoreFile {
            revision: self.state.revision + 1,
            waivers,
        };

        fs::create_dir_all(&self.data_dir).map_err(|e| GateError::Io {
            path: self.data_dir.display().to_string(),
            message: e.to_string(),
        })?;

        let json = serde_json::to_string_pretty(&next).map_err(|e| GateError::Parse {
            path: self.store_path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut tmp = NamedTempFile::new_in(&self.data_dir).map_err(|e| GateError::Io {
            path: self.data_dir.display().to_string(),
            message: e.to_string(),
        })?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_data())
            .map_err(|e| GateError::Io {
                path: self.store_path.display().to_string(),
                message: e.to_string(),
            })?;
        tmp.persist(&self.store_path).map_err(|e| GateError::Io {
            path: self.store_path.display().to_string(),
            message: e.to_string(),
        })?;

        self.state = next;
        Ok(())
    }

    fn read_disk_revision(&self) -> Result<u64, GateError> {
        if !self.store_path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&self.store_path).map_err(|e| GateError::Io {
            path: self.store_path.display().to_string(),
            message: e.to_string(),
        })?;
        let probe: RevisionProbe =
            serde_json::from_str(&content).map_err(|e| GateError::Parse {
                path: self.store_path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(probe.revision)
    }

    fn write_review_flag(&self, waiver: &Waiver) -> Result<(), GateError> {
        fs::create_dir_all(&self.review_dir).map_err(|e| GateError::Io {
            path: self.review_dir.display().to_string(),
            message: e.to_string(),
        })?;
        let path = self.review_flag_path(&waiver.id);
        fs::write(&path, render_review_flag(waiver)).map_err(|e| GateError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        info!(waiver_id = %waiver.id, path = %path.display(), "review flag written");
        Ok(())
    }
}

fn render_review_flag(waiver: &Waiver) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("# Manual review required: {}\n\n", waiver.id));
    doc.push_str(&format!("- Title: {}\n", waiver.title));
    doc.push_str(&format!("- Reason: {}\n", waiver.reason));
    doc.push_str(&format!(
        "- Impact level: {}\n",
        waiver.risk_assessment.impact_level
    ));
    doc.push_str(&format!(
        "- Review required: {}\n",
        waiver.risk_assessment.review_required
    ));
    doc.push_str(&format!("- Gates: {}\n", {
        let gates: Vec<&str> = waiver.gates.iter().map(String::as_str).collect();
        gates.join(", ")
    }));
    doc.push_str(&format!("- Expires: {}\n", waiver.expires_at.to_rfc3339()));
    doc.push_str(&format!("- Approved by: {}\n", waiver.approved_by));
    doc.push_str(&format!("- Approvers: {}\n", waiver.approvers.join(", ")));
    doc.push_str("\n## Mitigation plan\n\n");
    doc.push_str(&waiver.risk_assessment.mitigation_plan);
    doc.push('\n');
    doc
}
