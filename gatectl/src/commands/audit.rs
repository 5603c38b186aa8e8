use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};

use gates::audit::AuditLog;

#[derive(Subcommand, Debug)]
pub enum AuditCmd {
    /// Print every audit entry in the order it was written
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, default_value = ".")]
    pub project_root: PathBuf,
    /// Output machine-readable JSON
    #[arg(long, action)]
    pub json: bool,
}

pub fn run(cmd: AuditCmd) -> Result<()> {
    match cmd {
        AuditCmd::List(args) => list(args),
    }
}

fn list(args: ListArgs) -> Result<()> {
    let log = AuditLog::new(&args.project_root);
    let entries = log.entries()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Audit log is empty.");
        return Ok(());
    }

    println!(
        "{:<27} {:<12} {:<10} {}",
        "TIMESTAMP", "ACTION", "WAIVER", "USER"
    );
    for entry in entries {
        println!(
            "{:<27} {:<12} {:<10} {}",
            entry.timestamp.to_rfc3339(),
            entry.action.as_str(),
            entry.waiver_id,
            entry.user
        );
    }
    Ok(())
}
