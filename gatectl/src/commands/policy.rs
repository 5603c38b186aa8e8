use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use policy_loader::{load_policy_uncached, policy_path, PolicyError};

#[derive(Subcommand, Debug)]
pub enum PolicyCmd {
    /// Validate the policy document, listing every violation
    Validate(ValidateArgs),
    /// Print the effective tier policy
    Show(ShowArgs),
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    /// Output machine-readable JSON
    #[arg(long, action)]
    pub json: bool,
}

pub fn run(cmd: PolicyCmd) -> Result<()> {
    match cmd {
        PolicyCmd::Validate(args) => validate(args),
        PolicyCmd::Show(args) => show(args),
    }
}

fn validate(args: ValidateArgs) -> Result<()> {
    match load_policy_uncached(&args.project_root) {
        Ok(loaded) if loaded.synthetic => {
            println!(
                "No policy file at '{}'; the built-in defaults are in use and valid.",
                policy_path(&args.project_root).display()
            );
            Ok(())
        }
        Ok(_) => {
            println!(
                "Policy at '{}' is valid.",
                policy_path(&args.project_root).display()
            );
            Ok(())
        }
        Err(PolicyError::Invalid { path, violations }) => {
            eprintln!("Policy at '{path}' is invalid:");
            for violation in &violations {
                eprintln!("  - {violation}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn show(args: ShowArgs) -> Result<()> {
    let loaded = super::load_policy(&args.project_root)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&loaded.document)?);
        return Ok(());
    }

    println!(
        "{:<6} {:<10} {:<10} {:<10} {:<10} {:<10} {}",
        "TIER", "MAX_FILES", "MAX_LOC", "COVERAGE", "MUTATION", "CONTRACTS", "REVIEW"
    );
    for (tier, policy) in &loaded.document.risk_tiers {
        println!(
            "{:<6} {:<10} {:<10} {:<10} {:<10} {:<10} {}",
            tier,
            policy.max_files,
            policy.max_loc,
            policy
                .coverage_threshold
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            policy
                .mutation_threshold
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            policy.contracts_required,
            policy.manual_review_required,
        );
    }
    if let Some(approval) = &loaded.document.waiver_approval {
        println!(
            "\nWaiver approval: {} approver(s) required, max duration {} day(s), auto-revoke expired: {}",
            approval.required_approvers, approval.max_duration_days, approval.auto_revoke_expired
        );
    }
    Ok(())
}
