use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use gates::budget::{check_compliance, BudgetEngine, ChangeStats, WorkItem};
use gates::lifecycle::ApproverRule;

#[derive(Subcommand, Debug)]
pub enum BudgetCmd {
    /// Derive the effective budget for a unit of work
    Derive(DeriveArgs),
    /// Check actual change statistics against the effective budget
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct DeriveArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    /// Declared risk tier of the work
    #[arg(long)]
    pub tier: u8,
    /// Waiver id to apply; repeatable
    #[arg(long = "waiver")]
    pub waivers: Vec<String>,
    /// Only require a non-empty approver list instead of the policy minimum
    #[arg(long, action)]
    pub any_approver: bool,
    /// Output machine-readable JSON
    #[arg(long, action)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    #[arg(long)]
    pub tier: u8,
    #[arg(long = "waiver")]
    pub waivers: Vec<String>,
    #[arg(long)]
    pub files_changed: u64,
    #[arg(long)]
    pub lines_changed: u64,
    #[arg(long, action)]
    pub any_approver: bool,
    #[arg(long, action)]
    pub json: bool,
}

pub fn run(cmd: BudgetCmd) -> Result<()> {
    match cmd {
        BudgetCmd::Derive(args) => derive(args),
        BudgetCmd::Check(args) => check(args),
    }
}

fn approver_rule(any_approver: bool) -> ApproverRule {
    if any_approver {
        ApproverRule::AnyApprover
    } else {
        ApproverRule::PolicyMinimum
    }
}

fn derive(args: DeriveArgs) -> Result<()> {
    let loaded = super::load_policy(&args.project_root)?;
    let repo = super::open_repository(&args.project_root, &loaded)?;
    let engine = BudgetEngine::new(&loaded.document, &repo)
        .with_approver_rule(approver_rule(args.any_approver));

    let derived = engine.derive_budget(&WorkItem {
        risk_tier: args.tier,
        waiver_ids: args.waivers,
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&derived)?);
        return Ok(());
    }

    println!(
        "Baseline (tier {}): {} files, {} lines",
        args.tier, derived.baseline.max_files, derived.baseline.max_loc
    );
    println!(
        "Effective budget:  {} files, {} lines",
        derived.effective.max_files, derived.effective.max_loc
    );
    for skip in &derived.skips {
        for reason in &skip.reasons {
            println!("Skipped {}: {}", skip.id, reason);
        }
    }
    Ok(())
}

fn check(args: CheckArgs) -> Result<()> {
    let loaded = super::load_policy(&args.project_root)?;
    let repo = super::open_repository(&args.project_root, &loaded)?;
    let engine = BudgetEngine::new(&loaded.document, &repo)
        .with_approver_rule(approver_rule(args.any_approver));

    let derived = engine.derive_budget(&WorkItem {
        risk_tier: args.tier,
        waiver_ids: args.waivers,
    })?;
    let stats = ChangeStats {
        files_changed: args.files_changed,
        lines_changed: args.lines_changed,
        risk_tier: args.tier,
    };
    let report = check_compliance(&derived, &stats);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.compliant {
            std::process::exit(1);
        }
        return Ok(());
    }

    if report.compliant {
        println!(
            "Compliant: {} files <= {}, {} lines <= {}",
            stats.files_changed,
            derived.effective.max_files,
            stats.lines_changed,
            derived.effective.max_loc
        );
        return Ok(());
    }

    eprintln!("Budget exceeded:");
    for violation in &report.violations {
        eprintln!(
            "  - {}: actual {} > limit {} (baseline {})",
            violation.dimension, violation.actual, violation.limit, violation.baseline
        );
    }
    std::process::exit(1);
}
