use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::PathBuf,
};

use clap::Parser;
use rlab_emu::{config::LabConfig, namespace::Sudo};

/// Build the virtual lab, start the router program in it, and open a console on the nodes.
#[derive(Parser, Debug)]
#[command(name = "rlab", version, about)]
pub(crate) struct Cli {
    /// Lab file (TOML). The built-in three-subnet lab when omitted.
    #[arg(long, short)]
    pub(crate) config: Option<PathBuf>,

    /// Forwarding program to run on the router, overriding the lab file.
    #[arg(long)]
    pub(crate) router_bin: Option<String>,

    /// Where the forwarding program's stdout and stderr go, overriding the lab file.
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,

    /// Don't start a forwarding program.
    #[arg(long, default_value_t = false, conflicts_with_all = ["router_bin", "log"])]
    pub(crate) no_forwarding: bool,

    /// Prefix substrate commands with sudo: auto, always or never.
    #[arg(long, default_value = "auto")]
    pub(crate) sudo: Sudo,

    /// Read console commands from this file instead of stdin.
    #[arg(long)]
    pub(crate) script: Option<PathBuf>,
}

impl Cli {
    /// The lab file (or built-in lab) with the command line overrides applied.
    pub(crate) fn lab_config(&self) -> rlab_emu::config::Result<LabConfig> {
        let mut config = match &self.config {
            Some(path) => LabConfig::from_file(path)?,
            None => LabConfig::three_subnets(),
        };

        if self.no_forwarding {
            config.forwarding = None;
        } else if let Some(forwarding) = config.forwarding.as_mut() {
            if let Some(program) = &self.router_bin {
                forwarding.program.clone_from(program);
            }
            if let Some(log) = &self.log {
                forwarding.log.clone_from(log);
            }
        }

        Ok(config)
    }

    /// Console input, and whether it is interactive.
    pub(crate) fn console_input(&self) -> io::Result<(Box<dyn BufRead + Send>, bool)> {
        match &self.script {
            Some(path) => Ok((Box::new(BufReader::new(File::open(path)?)), false)),
            None => Ok((Box::new(BufReader::new(io::stdin())), true)),
        }
    }
}
