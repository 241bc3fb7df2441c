use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{self, CommandReport};

/// Exit status when a command ran to completion but reported issues.
pub const EXIT_ISSUES: i32 = 2;

/// Merge E-PROFILE instrument fragments into daily files and promote them
/// through quarantine, ready-to-ingest and the archive.
#[derive(Parser, Debug)]
#[command(name = "eprofile-daily")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Print the command report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge every instrument-day found in the incoming directory
    Concat,
    /// Run one promotion pass over the ledger
    Promote,
    /// `concat` followed by `promote`
    Cycle,
    /// Show resolved paths, effective config and ledger counts
    Status,
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let verdict = if report.ok { "ok" } else { "issues" };
    println!("{}: {verdict}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

/// Run the selected command and return the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    let report = match cli.command {
        Command::Concat => commands::concat::run()?,
        Command::Promote => commands::promote::run()?,
        Command::Cycle => commands::cycle::run()?,
        Command::Status => commands::status::run()?,
    };
    print_report(&report, cli.json)?;
    Ok(if report.ok { 0 } else { EXIT_ISSUES })
}
