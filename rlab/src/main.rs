//! `rlab`: build the three-subnet lab (or one from a file), run the router program on `r0`,
//! hand the console to the operator, and tear everything down on exit or Ctrl-C.

mod cli;
mod shell;

use std::{io, sync::Arc};

use anyhow::Context;
use clap::Parser;
use rlab_emu::{lifecycle::Lab, namespace::NetnsSubstrate};
use tracing_subscriber::EnvFilter;

use crate::{cli::Cli, shell::Shell};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.lab_config().context("failed to load the lab")?;
    let session_config = config.session_config().context("invalid lab")?;

    let substrate = Arc::new(NetnsSubstrate::new(cli.sudo));
    tracing::info!(
        lab_id = format!("{:04x}", substrate.lab_id()),
        nodes = config.nodes.len(),
        links = config.links.len(),
        "starting lab"
    );

    let lab = Lab::new(substrate);
    let mut controller = lab.controller(session_config)?;

    let stop = controller.stop_signal();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping the lab");
                stop.request();
            }
        }
    });

    let (input, interactive) = cli.console_input().context("failed to open the console input")?;
    let mut shell = Shell::new(input, io::stdout(), stop, interactive)?;

    let report = tokio::task::block_in_place(|| controller.run(&mut shell).cloned());
    if let Some(e) = controller.forwarding_error() {
        tracing::warn!(%e, "the forwarding program never ran");
    }
    for warning in controller.warnings() {
        tracing::warn!(%warning, "conditioning step failed");
    }
    let report = report?;

    for e in &report.errors {
        tracing::error!(%e, "teardown");
    }
    tracing::info!(
        processes = report.processes_stopped,
        links = report.links_released,
        nodes = report.nodes_released,
        "lab stopped"
    );

    anyhow::ensure!(report.is_clean(), "{} resources could not be released", report.errors.len());
    Ok(())
}
