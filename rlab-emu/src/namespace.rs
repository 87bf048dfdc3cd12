//! Linux substrate: one network namespace per node, veth pairs for links, `tc netem` for link
//! quality.
//!
//! ```text
//! ┌──────────────────────┐          ┌───────────────────────────────┐
//! │ rlab-{id}-h1         │          │ rlab-{id}-s1                  │
//! │                      │   veth   │                               │
//! │   h1-eth0 ───────────┼──────────┼─── s1-eth2 ──┐                │
//! │   10.0.1.10/24       │          │              ├── bridge "s1"  │
//! └──────────────────────┘          │   s1-eth1 ───┘                │
//!                                   └──────┼────────────────────────┘
//!                                          │ veth
//!                                   ┌──────┼────────────────────────┐
//!                                   │   r0-eth1  10.0.1.1/24        │
//!                                   │ rlab-{id}-r0                  │
//!                                   └───────────────────────────────┘
//! ```
//!
//! Namespace names carry a lab id derived from the process id, so that several labs can run
//! on the same host without name collisions. Interface names only need to be unique inside their
//! own namespace.

use std::{
    process::{Child, Command, Stdio},
    str::FromStr,
};

use crate::{
    command::{self, Output, Runner},
    substrate::{Result, Substrate},
    tc::{self, LinkQuality},
    topology::{Endpoint, NodeKind},
};

/// Prefix for all network namespace names created by this crate.
pub const NAMESPACE_PREFIX: &str = "rlab";

/// Whether substrate commands are prefixed with `sudo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sudo {
    /// Use `sudo` unless the process already runs as root.
    #[default]
    Auto,
    Always,
    Never,
}

impl FromStr for Sudo {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("invalid sudo mode {other:?}, expected auto, always or never")),
        }
    }
}

impl Sudo {
    fn enabled(self) -> bool {
        match self {
            Self::Auto => !nix::unistd::geteuid().is_root(),
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// [`Substrate`] backed by `ip netns`, `ip link` and `tc`.
#[derive(Debug)]
pub struct NetnsSubstrate {
    /// Lab ID used to uniquely prefix namespace names, derived from PID.
    lab_id: u16,
    sudo: bool,
}

impl NetnsSubstrate {
    pub fn new(sudo: Sudo) -> Self {
        Self::with_lab_id(std::process::id() as u16, sudo)
    }

    pub fn with_lab_id(lab_id: u16, sudo: Sudo) -> Self {
        Self { lab_id, sudo: sudo.enabled() }
    }

    pub fn lab_id(&self) -> u16 {
        self.lab_id
    }

    /// The network namespace hosting `node`.
    pub fn namespace_name(&self, node: &str) -> String {
        format!("{NAMESPACE_PREFIX}-{:04x}-{node}", self.lab_id)
    }

    /// Names of the namespaces of this lab that currently exist.
    pub fn live_namespaces(&self) -> Result<Vec<String>> {
        let output = Runner::run(&mut self.command(&["ip", "netns", "list"]))?;
        let prefix = format!("{NAMESPACE_PREFIX}-{:04x}-", self.lab_id);

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| name.starts_with(&prefix))
            .map(str::to_string)
            .collect())
    }

    fn command<S: AsRef<str>>(&self, argv: &[S]) -> Command {
        let mut argv = argv.iter().map(AsRef::as_ref);
        let mut cmd = if self.sudo {
            Command::new("sudo")
        } else {
            Command::new(argv.next().unwrap_or_default())
        };
        cmd.args(argv);
        cmd
    }

    /// `ip netns exec <namespace> <argv...>`
    fn in_namespace(&self, node: &str, argv: &[String]) -> Command {
        let namespace = self.namespace_name(node);
        let mut full: Vec<&str> = vec!["ip", "netns", "exec", &namespace];
        full.extend(argv.iter().map(String::as_str));
        self.command(&full)
    }

    fn apply_quality(&self, endpoint: &Endpoint, quality: &LinkQuality) -> Result<()> {
        self.exec(&endpoint.node, &tc::netem_argv(&endpoint.interface, quality)).map(|_| ())
    }
}

impl Substrate for NetnsSubstrate {
    fn create_node(&self, name: &str, kind: NodeKind) -> Result<()> {
        let namespace = self.namespace_name(name);
        tracing::debug!(%namespace, %kind, "creating namespace");

        Runner::run(&mut self.command(&["ip", "netns", "add", &namespace]))?;
        Ok(())
    }

    fn destroy_node(&self, name: &str) -> Result<()> {
        let namespace = self.namespace_name(name);
        tracing::debug!(%namespace, "deleting namespace");

        Runner::run(&mut self.command(&["ip", "netns", "delete", &namespace]))?;
        Ok(())
    }

    fn create_link(&self, a: &Endpoint, b: &Endpoint, quality: &LinkQuality) -> Result<()> {
        let (ns_a, ns_b) = (self.namespace_name(&a.node), self.namespace_name(&b.node));
        let _span = tracing::debug_span!("create_link", %a, %b).entered();

        // NOTE: device names can be at most 15 bytes long, which the topology guarantees.
        Runner::run(&mut self.command(&[
            "ip",
            "link",
            "add",
            &a.interface,
            "netns",
            &ns_a,
            "type",
            "veth",
            "peer",
            "name",
            &b.interface,
            "netns",
            &ns_b,
        ]))?;

        if quality.is_best_effort() {
            return Ok(());
        }

        let applied = self.apply_quality(a, quality).and_then(|_| self.apply_quality(b, quality));
        if let Err(e) = applied {
            tracing::debug!(?e, "failed to apply link quality, removing pair");
            if let Err(e) = self.destroy_link(a, b) {
                tracing::warn!(?e, %a, %b, "failed to remove half-configured link");
            }
            return Err(e);
        }

        Ok(())
    }

    fn destroy_link(&self, a: &Endpoint, _b: &Endpoint) -> Result<()> {
        let argv = ["ip".into(), "link".into(), "del".into(), "dev".into(), a.interface.clone()];
        self.exec(&a.node, &argv)?;
        Ok(())
    }

    fn exec(&self, node: &str, argv: &[String]) -> Result<Output> {
        if argv.is_empty() {
            return Err(command::Error::Empty.into());
        }

        Ok(Runner::run(&mut self.in_namespace(node, argv))?)
    }

    fn spawn(&self, node: &str, argv: &[String], stdout: Stdio, stderr: Stdio) -> Result<Child> {
        if argv.is_empty() {
            return Err(command::Error::Empty.into());
        }

        let mut cmd = self.in_namespace(node, argv);
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        tracing::debug!(cmd = %command::render(&cmd), "spawning process");

        Ok(cmd.spawn()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_names_carry_the_lab_id() {
        let substrate = NetnsSubstrate::with_lab_id(0xa3f1, Sudo::Never);
        assert_eq!(substrate.namespace_name("h1"), "rlab-a3f1-h1");
    }

    #[test]
    fn commands_are_prefixed_with_sudo_when_enabled() {
        let substrate = NetnsSubstrate::with_lab_id(1, Sudo::Always);
        let cmd = substrate.in_namespace("r0", &["ip".into(), "-4".into(), "addr".into()]);
        assert_eq!(command::render(&cmd), "sudo ip netns exec rlab-0001-r0 ip -4 addr");

        let substrate = NetnsSubstrate::with_lab_id(1, Sudo::Never);
        let cmd = substrate.in_namespace("r0", &["ip".into(), "-4".into(), "addr".into()]);
        assert_eq!(command::render(&cmd), "ip netns exec rlab-0001-r0 ip -4 addr");
    }

    #[test]
    fn sudo_modes_parse() {
        assert_eq!("auto".parse::<Sudo>(), Ok(Sudo::Auto));
        assert_eq!("never".parse::<Sudo>(), Ok(Sudo::Never));
        assert!("sometimes".parse::<Sudo>().is_err());
    }

    #[test]
    fn empty_argv_is_rejected_before_running_anything() {
        let substrate = NetnsSubstrate::with_lab_id(1, Sudo::Never);
        assert!(substrate.exec("h1", &[]).is_err());
    }
}
