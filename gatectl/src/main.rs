use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "gatectl", version, about = "Change-budget governance for risk-tiered work")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and validate the tier policy
    #[command(subcommand)]
    Policy(commands::policy::PolicyCmd),
    /// Create and manage budget waivers
    #[command(subcommand)]
    Waiver(commands::waiver::WaiverCmd),
    /// Derive effective budgets and check change statistics
    #[command(subcommand)]
    Budget(commands::budget::BudgetCmd),
    /// Inspect the audit trail
    #[command(subcommand)]
    Audit(commands::audit::AuditCmd),
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.cmd {
        Commands::Policy(cmd) => commands::policy::run(cmd),
        Commands::Waiver(cmd) => commands::waiver::run(cmd),
        Commands::Budget(cmd) => commands::budget::run(cmd),
        Commands::Audit(cmd) => commands::audit::run(cmd),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
