use std::collections::BTreeSet;
use std::fs;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use gates::store::WaiverRepository;
use gates::waiver::{
    BudgetDelta, ImpactLevel, RiskAssessment, WaiverDraft, WaiverMetadata, WaiverReason,
    WaiverStatus,
};
use gates::GateError;

fn draft(environment: Option<&str>) -> WaiverDraft {
    WaiverDraft {
        title: "Relax budget for hotfix".to_string(),
        reason: WaiverReason::EmergencyHotfix,
        description: "Production incident requires touching more files than the tier \
                      budget allows; scope is limited to the payment module."
            .to_string(),
        gates: BTreeSet::from(["budget_limit".to_string()]),
        risk_assessment: RiskAssessment {
            impact_level: ImpactLevel::Medium,
            mitigation_plan: "Every touched file gets a second reviewer and the change \
                              ships behind the existing kill switch."
                .to_string(),
            review_required: false,
        },
        expires_at: Utc::now() + Duration::days(7),
        approved_by: "release-captain".to_string(),
        approvers: vec!["alex".to_string(), "sam".to_string()],
        delta: Some(BudgetDelta {
            max_files: 20,
            max_loc: 500,
        }),
        metadata: environment.map(|env| WaiverMetadata {
            environment: Some(env.to_string()),
            ..WaiverMetadata::default()
        }),
    }
}

fn expire_on_disk(root: &std::path::Path, id: &str) {
    let store_path = root.join(".gatehouse/waivers.json");
    let mut value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&store_path).unwrap()).unwrap();
    let past = (Utc::now() - Duration::hours(2)).to_rfc3339();
    value["waivers"][id]["expires_at"] = serde_json::Value::String(past);
    fs::write(&store_path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

#[test]
fn create_assigns_gap_filling_ids() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    let a = repo.create(draft(Some("prod"))).unwrap();
    let b = repo.create(draft(Some("staging"))).unwrap();
    let c = repo.create(draft(Some("dev"))).unwrap();
    assert_eq!(a.id, "WV-0001");
    assert_eq!(b.id, "WV-0002");
    assert_eq!(c.id, "WV-0003");

    repo.revoke("WV-0002", "no longer needed").unwrap();
    let reused = repo.create(draft(Some("qa"))).unwrap();
    assert_eq!(reused.id, "WV-0002");
}

#[test]
fn invalid_draft_reports_every_failing_field_and_persists_nothing() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    let mut bad = draft(None);
    bad.title = "short".to_string();
    bad.description = "too short".to_string();
    bad.gates = BTreeSet::from(["not_a_gate".to_string()]);
    bad.approvers.clear();

    let err = repo.create(bad).unwrap_err();
    match err {
        GateError::WaiverInvalid { violations } => {
            let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
            assert!(fields.contains(&"title"));
            assert!(fields.contains(&"description"));
            assert!(fields.contains(&"gates"));
            assert!(fields.contains(&"approvers"));
        }
        other => panic!("expected WaiverInvalid, got {other:?}"),
    }

    assert!(!root.path().join(".gatehouse/waivers.json").exists());
}

#[test]
fn same_gate_same_scope_conflicts_and_names_the_collision() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    repo.create(draft(None)).unwrap();
    let err = repo.create(draft(None)).unwrap_err();
    match err {
        GateError::WaiverConflict {
            gate,
            conflicts_with,
            ..
        } => {
            assert_eq!(gate, "budget_limit");
            assert_eq!(conflicts_with, "WV-0001");
        }
        other => panic!("expected WaiverConflict, got {other:?}"),
    }
}

#[test]
fn disjoint_environments_do_not_conflict() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    repo.create(draft(Some("prod"))).unwrap();
    let second = repo.create(draft(Some("staging"))).unwrap();
    assert_eq!(second.id, "WV-0002");
}

#[test]
fn unscoped_waiver_conflicts_with_scoped_one() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    repo.create(draft(Some("prod"))).unwrap();
    // No environment on the second claim of the same gate: not disjoint.
    let err = repo.create(draft(None)).unwrap_err();
    assert!(matches!(err, GateError::WaiverConflict { .. }));
}

#[test]
fn revoke_is_terminal_and_leaves_only_the_audit_record() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    let created = repo.create(draft(None)).unwrap();
    let revoked = repo.revoke(&created.id, "superseded by a redesign").unwrap();
    assert_eq!(revoked.status, WaiverStatus::Revoked);

    assert!(matches!(
        repo.load(&created.id),
        Err(GateError::WaiverNotFound { .. })
    ));
    assert!(repo.list_active().unwrap().is_empty());

    let entries = repo.audit().entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].action.as_str(), "REVOKE");
    assert_eq!(entries[1].waiver_id, created.id);
    // Full prior record rides along for forensic replay.
    assert_eq!(entries[1].details["record"]["id"], created.id.as_str());
    assert_eq!(entries[1].details["record"]["status"], "revoked");
    assert_eq!(entries[1].details["reason"], "superseded by a redesign");
}

#[test]
fn revoke_unknown_id_is_not_found() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();
    let err = repo.revoke("WV-0042", "whatever").unwrap_err();
    assert!(matches!(err, GateError::WaiverNotFound { id } if id == "WV-0042"));
}

#[test]
fn extend_records_previous_expiry_and_approver() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    let created = repo.create(draft(None)).unwrap();
    let new_expiry = Utc::now() + Duration::days(14);
    let extended = repo.extend(&created.id, new_expiry, "director").unwrap();

    assert_eq!(extended.expires_at, new_expiry);
    let metadata = extended.metadata.expect("extension metadata recorded");
    assert_eq!(metadata.previous_expiry, Some(created.expires_at));
    assert_eq!(metadata.extension_approver.as_deref(), Some("director"));

    let entries = repo.audit().entries().unwrap();
    assert_eq!(entries.last().unwrap().action.as_str(), "EXTEND");
    assert_eq!(entries.last().unwrap().details["approver"], "director");
}

#[test]
fn extend_is_bounded_by_the_approval_policy_duration() {
    use gates::WaiverApprovalPolicy;

    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path())
        .unwrap()
        .with_approval_policy(Some(WaiverApprovalPolicy {
            required_approvers: 1,
            max_duration_days: 10,
            auto_revoke_expired: true,
        }));

    let created = repo.create(draft(None)).unwrap();
    let err = repo
        .extend(&created.id, Utc::now() + Duration::days(60), "director")
        .unwrap_err();
    match err {
        GateError::WaiverInvalid { violations } => {
            assert_eq!(violations[0].field, "expires_at");
            assert!(violations[0].message.contains("10 days"));
        }
        other => panic!("expected WaiverInvalid, got {other:?}"),
    }

    // Within the bound the extension goes through.
    repo.extend(&created.id, Utc::now() + Duration::days(9), "director")
        .unwrap();
}

#[test]
fn lapsed_waiver_cannot_be_extended() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();
    let created = repo.create(draft(None)).unwrap();
    expire_on_disk(root.path(), &created.id);

    let mut repo = WaiverRepository::open(root.path()).unwrap();
    let err = repo
        .extend(&created.id, Utc::now() + Duration::days(7), "director")
        .unwrap_err();
    assert!(matches!(err, GateError::WaiverInvalid { .. }));
}

#[test]
fn list_active_lazily_prunes_lapsed_entries_without_an_audit_entry() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();
    let kept = repo.create(draft(Some("prod"))).unwrap();
    let lapsing = repo.create(draft(Some("staging"))).unwrap();
    expire_on_disk(root.path(), &lapsing.id);

    let mut repo = WaiverRepository::open(root.path()).unwrap();
    let active = repo.list_active().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, kept.id);

    // Pruned from the persisted set too, with no audit entry for it.
    let mut reopened = WaiverRepository::open(root.path()).unwrap();
    assert!(matches!(
        reopened.load(&lapsing.id),
        Err(GateError::WaiverNotFound { .. })
    ));
    assert_eq!(reopened.list_active().unwrap().len(), 1);
    let actions: Vec<&str> = repo
        .audit()
        .entries()
        .unwrap()
        .iter()
        .map(|e| e.action.as_str())
        .collect();
    assert_eq!(actions, vec!["CREATE", "CREATE"]);
}

#[test]
fn store_roundtrip_preserves_semantic_content() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();
    let a = repo.create(draft(Some("prod"))).unwrap();
    let b = repo.create(draft(Some("staging"))).unwrap();

    let reopened = WaiverRepository::open(root.path()).unwrap();
    assert_eq!(reopened.load(&a.id).unwrap(), a);
    assert_eq!(reopened.load(&b.id).unwrap(), b);

    // Stable serialization: keys appear in sorted order.
    let text = fs::read_to_string(root.path().join(".gatehouse/waivers.json")).unwrap();
    let first = text.find("WV-0001").unwrap();
    let second = text.find("WV-0002").unwrap();
    assert!(first < second);
}

#[test]
fn concurrent_modification_is_detected_not_clobbered() {
    let root = TempDir::new().unwrap();
    let mut first = WaiverRepository::open(root.path()).unwrap();
    let mut second = WaiverRepository::open(root.path()).unwrap();

    second.create(draft(Some("prod"))).unwrap();

    let err = first.create(draft(Some("staging"))).unwrap_err();
    assert!(matches!(err, GateError::StoreConflict { .. }));

    // The winning write is intact.
    let reopened = WaiverRepository::open(root.path()).unwrap();
    assert!(reopened.load("WV-0001").is_ok());
}

#[test]
fn critical_impact_waiver_gets_a_review_flag() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    let mut d = draft(None);
    d.risk_assessment.impact_level = ImpactLevel::Critical;
    let created = repo.create(d).unwrap();

    let flag_path = repo.review_flag_path(&created.id);
    assert!(flag_path.exists());
    let doc = fs::read_to_string(&flag_path).unwrap();
    assert!(doc.contains(&created.id));
    assert!(doc.contains("Impact level: critical"));
    assert!(doc.contains(&created.risk_assessment.mitigation_plan));

    let actions: Vec<&str> = repo
        .audit()
        .entries()
        .unwrap()
        .iter()
        .map(|e| e.action.as_str())
        .collect();
    assert_eq!(actions, vec!["CREATE", "FLAG_REVIEW"]);
}

#[test]
fn review_required_flag_also_triggers_the_artifact() {
    let root = TempDir::new().unwrap();
    let mut repo = WaiverRepository::open(root.path()).unwrap();

    let mut d = draft(None);
    d.risk_assessment.review_required = true;
    let created = repo.create(d).unwrap();
    assert!(repo.review_flag_path(&created.id).exists());
}
