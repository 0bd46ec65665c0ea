//! casf: operator tooling for the audit hash chain.
//!
//! `export-digest` emits an anchor-ready daily digest of the audit trail:
//! run it from cron, redirect stdout to a file, and park the file in WORM
//! storage or sign it. `verify-chain` walks the full chain and reports the
//! first broken link.
//!
//! Exit codes: 0 = chain valid, 1 = chain broken (digest still emitted),
//! 2 = connectivity or unexpected error.

mod digest;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use casf_core::chain::ChainVerification;

use crate::digest::{export_digest, load_chain};

/// casf - audit trail operator tooling
#[derive(Parser, Debug)]
#[command(name = "casf")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Postgres DSN of the audit database (defaults to $PG_DSN)
    #[arg(long, global = true)]
    dsn: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emit a daily digest of the audit hash chain as JSON on stdout
    ExportDigest {
        /// Window to digest, YYYY-MM-DD UTC (defaults to yesterday)
        #[arg(long)]
        date: Option<String>,
    },
    /// Walk the full audit chain and verify every link
    VerifyChain,
}

fn resolve_dsn(cli_dsn: Option<String>) -> Result<String> {
    cli_dsn
        .or_else(|| std::env::var("PG_DSN").ok())
        .context("no DSN: pass --dsn or set PG_DSN")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(chain_valid) => {
            if chain_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        },
        Err(err) => {
            eprintln!("{{\"error\": \"{err:#}\"}}");
            ExitCode::from(2)
        },
    }
}

fn run(cli: Cli) -> Result<bool> {
    let dsn = resolve_dsn(cli.dsn)?;
    let mut client =
        postgres::Client::connect(&dsn, postgres::NoTls).context("failed to connect")?;

    match cli.command {
        Command::ExportDigest { date } => {
            let date = match date {
                Some(date) => date,
                None => digest::yesterday_utc(),
            };
            let result = export_digest(&mut client, &date).context("failed to build digest")?;
            println!("{}", serde_json::to_string_pretty(&result.document)?);
            Ok(result.chain_valid)
        },
        Command::VerifyChain => {
            let events = load_chain(&mut client).context("failed to load audit chain")?;
            match casf_core::chain::verify_chain(&events) {
                ChainVerification::Valid => {
                    println!(
                        "{}",
                        serde_json::json!({ "chain_valid": true, "event_count": events.len() })
                    );
                    Ok(true)
                },
                ChainVerification::BrokenAt(index) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "chain_valid": false,
                            "event_count": events.len(),
                            "broken_at": index,
                            "event_id": events[index].event_id,
                        })
                    );
                    Ok(false)
                },
            }
        },
    }
}
