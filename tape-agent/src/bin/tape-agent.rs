// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run the tape agent

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use display_error_chain::DisplayErrorChain;
use slog::info;
use tape_agent::{Config, TapeAgent};
use tape_common::cmd::{fatal, CmdError};

#[derive(Debug, Parser)]
#[clap(name = "tape-agent", about = "Cold storage on tape libraries")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconciles every library, then serves the order queues until
    /// interrupted.
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
    /// Reconciles every library with its hardware and exits.
    Reconcile {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();
    match args.command {
        Command::Run { config_file_path } => {
            run(&config_file_path).await.map_err(CmdError::Failure)
        }
        Command::Reconcile { config_file_path } => {
            reconcile(&config_file_path).await.map_err(CmdError::Failure)
        }
    }
}

async fn open(
    config_file_path: &Utf8PathBuf,
) -> anyhow::Result<(slog::Logger, TapeAgent)> {
    let config = Config::from_file(config_file_path)
        .with_context(|| format!("loading {}", config_file_path))?;
    let log = config
        .log
        .to_logger("tape-agent")
        .context("initializing logger")?;
    let agent = TapeAgent::open(&log, &config)
        .await
        .context("opening tape agent")?;
    Ok((log, agent))
}

async fn run(config_file_path: &Utf8PathBuf) -> anyhow::Result<()> {
    let (log, agent) = open(config_file_path).await?;
    let running = agent.start().await.context("starting tape agent")?;
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!(log, "interrupted, shutting down");
    running.shutdown().await;
    Ok(())
}

async fn reconcile(config_file_path: &Utf8PathBuf) -> anyhow::Result<()> {
    let (_log, agent) = open(config_file_path).await?;
    let results = agent.reconcile_all().await;
    let mut failed = 0;
    for (library, result) in &results {
        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                println!("{}: failed: {}", library, DisplayErrorChain::new(err));
                failed += 1;
                continue;
            }
        };
        println!(
            "{}: {} created, {} updated, {} unchanged, {} missing",
            library,
            summary.created.len(),
            summary.updated.len(),
            summary.unchanged.len(),
            summary.missing.len(),
        );
        for code in &summary.missing {
            println!("    missing: {}", code);
        }
        for location in &summary.unlabelled {
            println!("    unlabelled cartridge at {}", location);
        }
    }
    agent.store().close().await;
    if failed > 0 {
        anyhow::bail!(
            "{} of {} libraries failed to reconcile",
            failed,
            results.len()
        );
    }
    Ok(())
}
