use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Subcommand};

use gates::waiver::{
    is_valid_id, BudgetDelta, ImpactLevel, RiskAssessment, WaiverDraft, WaiverMetadata,
    WaiverReason,
};
use gates::GateError;

#[derive(Subcommand, Debug)]
pub enum WaiverCmd {
    /// Create a new waiver
    Create(CreateArgs),
    /// List active waivers (lapsed entries are pruned)
    List(ListArgs),
    /// Show one waiver by id
    Show(ShowArgs),
    /// Revoke a waiver; this is terminal
    Revoke(RevokeArgs),
    /// Push a waiver's expiry forward
    Extend(ExtendArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    #[arg(long)]
    pub title: String,
    /// One of: emergency_hotfix, security_patch, dependency_update,
    /// legacy_migration, performance_fix, tooling_gap
    #[arg(long)]
    pub reason: WaiverReason,
    #[arg(long)]
    pub description: String,
    /// Comma-separated gate names; budget relief requires 'budget_limit'
    #[arg(long, value_delimiter = ',')]
    pub gates: Vec<String>,
    /// One of: low, medium, high, critical
    #[arg(long)]
    pub impact: ImpactLevel,
    #[arg(long)]
    pub mitigation: String,
    /// Force a manual review flag regardless of impact level
    #[arg(long, action)]
    pub review_required: bool,
    /// Absolute expiry as an RFC 3339 timestamp
    #[arg(long, conflicts_with = "expires_in_days")]
    pub expires_at: Option<String>,
    /// Expiry relative to now, in days
    #[arg(long)]
    pub expires_in_days: Option<u32>,
    #[arg(long)]
    pub approved_by: String,
    /// Comma-separated approver names
    #[arg(long, value_delimiter = ',')]
    pub approvers: Vec<String>,
    /// Additional files allowed on top of the tier baseline
    #[arg(long)]
    pub max_files: Option<u64>,
    /// Additional lines allowed on top of the tier baseline
    #[arg(long)]
    pub max_loc: Option<u64>,
    #[arg(long)]
    pub environment: Option<String>,
    #[arg(long)]
    pub urgency: Option<String>,
    #[arg(long)]
    pub related_pr: Option<String>,
    #[arg(long)]
    pub related_issue: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    /// Output machine-readable JSON
    #[arg(long, action)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    pub id: String,
    #[arg(long, action)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RevokeArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    pub id: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct ExtendArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    pub id: String,
    /// New expiry as an RFC 3339 timestamp
    #[arg(long)]
    pub expires_at: String,
    #[arg(long)]
    pub approver: String,
}

pub fn run(cmd: WaiverCmd) -> Result<()> {
    match cmd {
        WaiverCmd::Create(args) => create(args),
        WaiverCmd::List(args) => list(args),
        WaiverCmd::Show(args) => show(args),
        WaiverCmd::Revoke(args) => revoke(args),
        WaiverCmd::Extend(args) => extend(args),
    }
}

fn parse_expiry(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("'{value}' is not an RFC 3339 timestamp"))
}

fn check_id(id: &str) -> Result<()> {
    if !is_valid_id(id) {
        bail!("'{id}' is not a waiver id (expected WV-#### format)");
    }
    Ok(())
}

fn create(args: CreateArgs) -> Result<()> {
    let loaded = super::load_policy(&args.project_root)?;
    let mut repo = super::open_repository(&args.project_root, &loaded)?;

    let expires_at = match (&args.expires_at, args.expires_in_days) {
        (Some(ts), None) => parse_expiry(ts)?,
        (None, Some(days)) => Utc::now() + Duration::days(i64::from(days)),
        _ => bail!("exactly one of --expires-at or --expires-in-days is required"),
    };

    let metadata = if args.environment.is_some()
        || args.urgency.is_some()
        || args.related_pr.is_some()
        || args.related_issue.is_some()
    {
        Some(WaiverMetadata {
            environment: args.environment,
            urgency: args.urgency,
            related_pr: args.related_pr,
            related_issue: args.related_issue,
            ..WaiverMetadata::default()
        })
    } else {
        None
    };

    let delta = match (args.max_files, args.max_loc) {
        (None, None) => None,
        (files, loc) => Some(BudgetDelta {
            max_files: files.unwrap_or(0),
            max_loc: loc.unwrap_or(0),
        }),
    };

    let draft = WaiverDraft {
        title: args.title,
        reason: args.reason,
        description: args.description,
        gates: BTreeSet::from_iter(args.gates),
        risk_assessment: RiskAssessment {
            impact_level: args.impact,
            mitigation_plan: args.mitigation,
            review_required: args.review_required,
        },
        expires_at,
        approved_by: args.approved_by,
        approvers: args.approvers,
        delta,
        metadata,
    };

    match repo.create(draft) {
        Ok(waiver) => {
            println!(
                "Created waiver {} (expires {})",
                waiver.id,
                waiver.expires_at.to_rfc3339()
            );
            if waiver.needs_review_flag() {
                println!(
                    "Manual review flagged: {}",
                    repo.review_flag_path(&waiver.id).display()
                );
            }
            Ok(())
        }
        Err(GateError::WaiverInvalid { violations }) => {
            eprintln!("Waiver rejected:");
            for violation in &violations {
                eprintln!("  - {violation}");
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn list(args: ListArgs) -> Result<()> {
    let loaded = super::load_policy(&args.project_root)?;
    let mut repo = super::open_repository(&args.project_root, &loaded)?;
    let waivers = repo.list_active()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&waivers)?);
        return Ok(());
    }

    if waivers.is_empty() {
        println!("No active waivers.");
        return Ok(());
    }

    println!(
        "{:<10} {:<20} {:<10} {:<25} {}",
        "ID", "REASON", "IMPACT", "EXPIRES", "GATES"
    );
    for waiver in waivers {
        let gates: Vec<&str> = waiver.gates.iter().map(String::as_str).collect();
        println!(
            "{:<10} {:<20} {:<10} {:<25} {}",
            waiver.id,
            waiver.reason.as_str(),
            waiver.risk_assessment.impact_level.as_str(),
            waiver.expires_at.to_rfc3339(),
            gates.join(",")
        );
    }
    Ok(())
}

fn show(args: ShowArgs) -> Result<()> {
    check_id(&args.id)?;
    let loaded = super::load_policy(&args.project_root)?;
    let repo = super::open_repository(&args.project_root, &loaded)?;
    let waiver = repo.load(&args.id)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&waiver)?);
        return Ok(());
    }

    println!("{}: {}", waiver.id, waiver.title);
    println!("  Reason:      {}", waiver.reason);
    println!("  Status:      {}", waiver.status);
    println!("  Impact:      {}", waiver.risk_assessment.impact_level);
    println!("  Created:     {}", waiver.created_at.to_rfc3339());
    println!("  Expires:     {}", waiver.expires_at.to_rfc3339());
    println!("  Approved by: {}", waiver.approved_by);
    println!("  Approvers:   {}", waiver.approvers.join(", "));
    if let Some(delta) = &waiver.delta {
        println!(
            "  Delta:       +{} files, +{} lines",
            delta.max_files, delta.max_loc
        );
    }
    Ok(())
}

fn revoke(args: RevokeArgs) -> Result<()> {
    check_id(&args.id)?;
    let loaded = super::load_policy(&args.project_root)?;
    let mut repo = super::open_repository(&args.project_root, &loaded)?;
    let revoked = repo.revoke(&args.id, &args.reason)?;
    println!("Revoked waiver {} ({})", revoked.id, args.reason);
    Ok(())
}

fn extend(args: ExtendArgs) -> Result<()> {
    check_id(&args.id)?;
    let loaded = super::load_policy(&args.project_root)?;
    let mut repo = super::open_repository(&args.project_root, &loaded)?;
    let new_expiry = parse_expiry(&args.expires_at)?;
    let extended = repo.extend(&args.id, new_expiry, &args.approver)?;
    let previous = extended
        .metadata
        .as_ref()
        .and_then(|m| m.previous_expiry)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "Extended waiver {}: {} -> {}",
        extended.id,
        previous,
        extended.expires_at.to_rfc3339()
    );
    Ok(())
}
