//! Helpers for testing against a substrate: an in-memory [`FakeSubstrate`] and a privilege check
//! for tests that need real network namespaces.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    process::{Child, Command, Stdio},
};

use parking_lot::Mutex;

use crate::{
    command::{self, Output},
    ip::{IpPrefix, MacAddr},
    namespace::{NetnsSubstrate, Sudo},
    substrate::{Error, Result, Substrate},
    tc::LinkQuality,
    topology::{Endpoint, NodeKind},
};

/// Check whether we have sufficient privileges (root) and tools (`ip`) available to create
/// network namespaces. Returns `false` if the test environment cannot support namespace-based
/// tests.
pub fn check_privileges() -> bool {
    if !nix::unistd::geteuid().is_root() {
        return false;
    }

    let substrate = NetnsSubstrate::new(Sudo::Never);
    let name = "privilege-check";
    if substrate.create_node(name, NodeKind::Host).is_err() {
        return false;
    }

    substrate.destroy_node(name).is_ok()
}

/// An interface as seen by the [`FakeSubstrate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FakeInterface {
    pub mac: Option<MacAddr>,
    pub addresses: Vec<IpPrefix>,
    pub up: bool,
    /// The bridge this interface is enslaved to.
    pub master: Option<String>,
    pub is_bridge: bool,
    /// Parameters of the netem root qdisc, if one is installed.
    pub netem: Option<Vec<String>>,
}

/// A static neighbour entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeNeighbor {
    pub interface: String,
    pub address: Ipv4Addr,
    pub mac: MacAddr,
}

#[derive(Debug, Clone)]
struct FakeNode {
    kind: NodeKind,
    interfaces: BTreeMap<String, FakeInterface>,
    sysctls: BTreeMap<String, String>,
    default_route: Option<Ipv4Addr>,
    neighbors: Vec<FakeNeighbor>,
}

impl FakeNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            interfaces: BTreeMap::from([("lo".to_string(), FakeInterface::default())]),
            sysctls: BTreeMap::new(),
            default_route: None,
            neighbors: Vec::new(),
        }
    }

    fn interface_mut(&mut self, dev: &str) -> std::result::Result<&mut FakeInterface, Output> {
        self.interfaces.get_mut(dev).ok_or_else(|| no_device(dev))
    }
}

#[derive(Debug, Clone)]
struct FakeLink {
    a: Endpoint,
    b: Endpoint,
    quality: LinkQuality,
}

impl FakeLink {
    fn has_end(&self, node: &str, interface: &str) -> bool {
        [&self.a, &self.b].iter().any(|e| e.node == node && e.interface == interface)
    }
}

#[derive(Debug, Default)]
struct Faults {
    create_node: Vec<String>,
    create_link: Vec<Endpoint>,
    destroy_node: Vec<String>,
    /// `(node, pattern)`: exec fails when the command line contains `pattern`.
    exec: Vec<(Option<String>, String)>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, FakeNode>,
    links: Vec<FakeLink>,
    journal: Vec<(String, String)>,
    faults: Faults,
}

/// In-memory [`Substrate`] interpreting the `ip`, `sysctl` and `tc` commands the core issues.
/// Commands it doesn't understand succeed with empty output. [`Substrate::spawn`] starts a real
/// process on the host, outside any namespace.
#[derive(Debug, Default)]
pub struct FakeSubstrate {
    state: Mutex<State>,
}

fn no_device(dev: &str) -> Output {
    Output::failure(1, format!("Cannot find device \"{dev}\""))
}

fn exists() -> Output {
    Output::failure(2, "RTNETLINK answers: File exists")
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_node` fail for `name`.
    pub fn fail_create_node(&self, name: &str) {
        self.state.lock().faults.create_node.push(name.to_string());
    }

    /// Make `create_link` fail for any link with `endpoint` on either side.
    pub fn fail_create_link(&self, endpoint: Endpoint) {
        self.state.lock().faults.create_link.push(endpoint);
    }

    /// Make `destroy_node` fail for `name`. The node stays alive.
    pub fn fail_destroy_node(&self, name: &str) {
        self.state.lock().faults.destroy_node.push(name.to_string());
    }

    /// Make every command containing `pattern` fail, on `node` or on any node when `None`.
    pub fn fail_exec(&self, node: Option<&str>, pattern: &str) {
        self.state.lock().faults.exec.push((node.map(str::to_string), pattern.to_string()));
    }

    /// Drop every injected fault.
    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Names of the live nodes, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.state.lock().nodes.keys().cloned().collect()
    }

    pub fn node_kind(&self, node: &str) -> Option<NodeKind> {
        self.state.lock().nodes.get(node).map(|n| n.kind)
    }

    /// Live links, in creation order.
    pub fn links(&self) -> Vec<(Endpoint, Endpoint)> {
        self.state.lock().links.iter().map(|l| (l.a.clone(), l.b.clone())).collect()
    }

    pub fn link_quality(&self, a: &Endpoint) -> Option<LinkQuality> {
        self.state.lock().links.iter().find(|l| l.has_end(&a.node, &a.interface)).map(|l| l.quality)
    }

    /// Whether no node and no link is alive.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.nodes.is_empty() && state.links.is_empty()
    }

    pub fn interface(&self, node: &str, interface: &str) -> Option<FakeInterface> {
        self.state.lock().nodes.get(node)?.interfaces.get(interface).cloned()
    }

    /// Interface names of a node, sorted, loopback included.
    pub fn interface_names(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .get(node)
            .map(|n| n.interfaces.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sysctl(&self, node: &str, key: &str) -> Option<String> {
        self.state.lock().nodes.get(node)?.sysctls.get(key).cloned()
    }

    pub fn default_route(&self, node: &str) -> Option<Ipv4Addr> {
        self.state.lock().nodes.get(node)?.default_route
    }

    pub fn neighbors(&self, node: &str) -> Vec<FakeNeighbor> {
        self.state.lock().nodes.get(node).map(|n| n.neighbors.clone()).unwrap_or_default()
    }

    /// Every command executed so far as `(node, command line)`, in order.
    pub fn journal(&self) -> Vec<(String, String)> {
        self.state.lock().journal.clone()
    }

    /// Commands executed on `node` so far.
    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .journal
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

impl State {
    fn node_mut(&mut self, name: &str) -> Result<&mut FakeNode> {
        self.nodes.get_mut(name).ok_or_else(|| Error::NoSuchNode(name.to_string()))
    }

    fn remove_link_at(&mut self, idx: usize) {
        let link = self.links.remove(idx);
        for end in [link.a, link.b] {
            if let Some(node) = self.nodes.get_mut(&end.node) {
                node.interfaces.remove(&end.interface);
            }
        }
    }

    fn interpret(&mut self, node_name: &str, argv: &[&str]) -> std::result::Result<String, Output> {
        if let ["ip", "link", "del", "dev", dev] = argv {
            let idx = self
                .links
                .iter()
                .position(|l| l.has_end(node_name, dev))
                .ok_or_else(|| no_device(dev))?;
            self.remove_link_at(idx);
            return Ok(String::new());
        }

        let node = self.nodes.get_mut(node_name).ok_or_else(|| no_device(node_name))?;

        match argv {
            ["ip", "link", "set", "dev", dev, "up"] => node.interface_mut(dev)?.up = true,
            ["ip", "link", "set", "dev", dev, "address", mac] => {
                let mac = mac
                    .parse()
                    .map_err(|_| Output::failure(1, format!("\"{mac}\" is invalid lladdr.")))?;
                node.interface_mut(dev)?.mac = Some(mac);
            }
            ["ip", "link", "add", "name", name, "type", "bridge"] => {
                if node.interfaces.contains_key(*name) {
                    return Err(exists());
                }
                let bridge = FakeInterface { is_bridge: true, ..Default::default() };
                node.interfaces.insert(name.to_string(), bridge);
            }
            ["ip", "link", "set", "dev", dev, "master", bridge] => {
                if !node.interfaces.get(*bridge).is_some_and(|i| i.is_bridge) {
                    return Err(no_device(bridge));
                }
                node.interface_mut(dev)?.master = Some(bridge.to_string());
            }
            ["ip", "addr", op @ ("add" | "replace"), prefix, "dev", dev] => {
                let prefix: IpPrefix = prefix.parse().map_err(|_| {
                    Output::failure(
                        1,
                        format!("Error: inet prefix is expected rather than \"{prefix}\"."),
                    )
                })?;
                let interface = node.interface_mut(dev)?;
                match interface.addresses.iter_mut().find(|a| a.address == prefix.address) {
                    Some(_) if *op == "add" => return Err(exists()),
                    Some(existing) => *existing = prefix,
                    None => interface.addresses.push(prefix),
                }
            }
            ["ip", "-4", "-o", "addr", "show", "dev", dev] => {
                let position = node
                    .interfaces
                    .keys()
                    .position(|k| k.as_str() == *dev)
                    .ok_or_else(|| no_device(dev))?;
                let interface = &node.interfaces[*dev];
                return Ok(interface
                    .addresses
                    .iter()
                    .map(|a| {
                        format!(
                            "{}: {dev}    inet {a} scope global {dev}\\       {}\n",
                            position + 1,
                            "valid_lft forever preferred_lft forever"
                        )
                    })
                    .collect());
            }
            ["ip", "route", "replace", "default", "via", gateway] => {
                let gateway: Ipv4Addr = gateway.parse().map_err(|_| {
                    Output::failure(
                        1,
                        format!("Error: inet address is expected rather than \"{gateway}\"."),
                    )
                })?;
                let on_link = node
                    .interfaces
                    .values()
                    .flat_map(|i| &i.addresses)
                    .any(|a| a.contains(gateway));
                if !on_link {
                    return Err(Output::failure(2, "Error: Nexthop has invalid gateway."));
                }
                node.default_route = Some(gateway);
            }
            ["ip", "neigh", "replace", address, "lladdr", mac, "dev", dev, "nud", "permanent"] => {
                let (Ok(address), Ok(mac)) = (address.parse::<Ipv4Addr>(), mac.parse::<MacAddr>())
                else {
                    return Err(Output::failure(1, "Error: invalid neighbour entry."));
                };
                node.interface_mut(dev)?;
                node.neighbors.retain(|n| !(n.interface == *dev && n.address == address));
                node.neighbors.push(FakeNeighbor { interface: dev.to_string(), address, mac });
            }
            ["sysctl", "-w", assignment] => {
                let (key, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| {
                        Output::failure(255, format!("sysctl: malformed setting \"{assignment}\""))
                    })?;
                node.sysctls.insert(key.to_string(), value.to_string());
            }
            ["tc", "qdisc", "replace", "dev", dev, "root", "netem", params @ ..] => {
                let params = params.iter().map(|p| p.to_string()).collect();
                node.interface_mut(dev)?.netem = Some(params);
            }
            _ => {}
        }

        Ok(String::new())
    }
}

impl Substrate for FakeSubstrate {
    fn create_node(&self, name: &str, kind: NodeKind) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.create_node.iter().any(|n| n == name) {
            return Err(command::Error::NonZero(Output::failure(1, "injected node failure")).into());
        }
        if state.nodes.contains_key(name) {
            return Err(command::Error::NonZero(Output::failure(
                1,
                format!("Cannot create namespace file \"/run/netns/{name}\": File exists"),
            ))
            .into());
        }

        state.nodes.insert(name.to_string(), FakeNode::new(kind));
        Ok(())
    }

    fn destroy_node(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.destroy_node.iter().any(|n| n == name) {
            let output = Output::failure(1, "injected destroy failure");
            return Err(command::Error::NonZero(output).into());
        }
        if state.nodes.remove(name).is_none() {
            return Err(Error::NoSuchNode(name.to_string()));
        }

        // Pairs die with either of their namespaces.
        while let Some(idx) =
            state.links.iter().position(|l| l.a.node == name || l.b.node == name)
        {
            state.remove_link_at(idx);
        }

        Ok(())
    }

    fn create_link(&self, a: &Endpoint, b: &Endpoint, quality: &LinkQuality) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.create_link.iter().any(|e| e == a || e == b) {
            return Err(command::Error::NonZero(Output::failure(2, "injected link failure")).into());
        }

        for end in [a, b] {
            if state.node_mut(&end.node)?.interfaces.contains_key(&end.interface) {
                return Err(command::Error::NonZero(exists()).into());
            }
        }

        let netem = (!quality.is_best_effort()).then(|| quality.netem_params());
        for end in [a, b] {
            let interface = FakeInterface { netem: netem.clone(), ..Default::default() };
            state.node_mut(&end.node)?.interfaces.insert(end.interface.clone(), interface);
        }

        state.links.push(FakeLink { a: a.clone(), b: b.clone(), quality: *quality });
        Ok(())
    }

    fn destroy_link(&self, a: &Endpoint, b: &Endpoint) -> Result<()> {
        let mut state = self.state.lock();
        let idx = state
            .links
            .iter()
            .position(|l| l.has_end(&a.node, &a.interface) && l.has_end(&b.node, &b.interface))
            .ok_or_else(|| command::Error::NonZero(no_device(&a.interface)))?;

        state.remove_link_at(idx);
        Ok(())
    }

    fn exec(&self, node: &str, argv: &[String]) -> Result<Output> {
        if argv.is_empty() {
            return Err(command::Error::Empty.into());
        }

        let mut state = self.state.lock();
        state.node_mut(node)?;

        let line = argv.join(" ");
        tracing::debug!(%node, cmd = %line, "fake exec");
        state.journal.push((node.to_string(), line.clone()));

        let injected = state
            .faults
            .exec
            .iter()
            .any(|(n, pattern)| {
                n.as_deref().map_or(true, |n| n == node) && line.contains(pattern.as_str())
            });
        if injected {
            return Err(command::Error::NonZero(Output::failure(1, "injected failure")).into());
        }

        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        match state.interpret(node, &argv) {
            Ok(stdout) => Ok(Output::success(stdout)),
            Err(output) => Err(command::Error::NonZero(output).into()),
        }
    }

    fn spawn(&self, node: &str, argv: &[String], stdout: Stdio, stderr: Stdio) -> Result<Child> {
        let (program, args) = argv.split_first().ok_or(command::Error::Empty)?;

        {
            let mut state = self.state.lock();
            state.node_mut(node)?;
            state.journal.push((node.to_string(), argv.join(" ")));
        }

        Ok(Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpCommand;

    fn exec(fake: &FakeSubstrate, node: &str, cmd: IpCommand) -> Result<Output> {
        fake.exec(node, &cmd.argv())
    }

    #[test]
    fn links_need_both_nodes() {
        let fake = FakeSubstrate::new();
        fake.create_node("h1", NodeKind::Host).unwrap();
        let (a, b) = (Endpoint::new("h1", "h1-eth0"), Endpoint::new("s1", "s1-eth1"));
        let err = fake.create_link(&a, &b, &LinkQuality::default()).unwrap_err();
        assert!(matches!(err, Error::NoSuchNode(n) if n == "s1"));
        assert!(fake.links().is_empty());
        assert_eq!(fake.interface_names("h1"), ["lo"]);
    }

    #[test]
    fn interprets_address_commands() {
        let fake = FakeSubstrate::new();
        fake.create_node("h1", NodeKind::Host).unwrap();
        fake.create_node("h2", NodeKind::Host).unwrap();
        let (a, b) = (Endpoint::new("h1", "h1-eth0"), Endpoint::new("h2", "h2-eth0"));
        fake.create_link(&a, &b, &LinkQuality::default()).unwrap();

        let prefix: IpPrefix = "10.0.1.10/24".parse().unwrap();
        exec(&fake, "h1", IpCommand::AddAddress { dev: "h1-eth0".into(), prefix }).unwrap();
        let err =
            exec(&fake, "h1", IpCommand::AddAddress { dev: "h1-eth0".into(), prefix }).unwrap_err();
        assert_eq!(err.output().unwrap().status.code(), Some(2));
        exec(&fake, "h1", IpCommand::ReplaceAddress { dev: "h1-eth0".into(), prefix }).unwrap();

        let shown = exec(&fake, "h1", IpCommand::ShowAddresses { dev: "h1-eth0".into() }).unwrap();
        assert_eq!(crate::ip::parse_inet_addresses(&shown.stdout), [prefix]);

        let off_link = IpCommand::DefaultRoute { via: Ipv4Addr::new(10, 0, 2, 1) };
        let err = exec(&fake, "h1", off_link).unwrap_err();
        assert!(err.output().unwrap().stderr.contains("Nexthop"));
        exec(&fake, "h1", IpCommand::DefaultRoute { via: Ipv4Addr::new(10, 0, 1, 1) }).unwrap();
        assert_eq!(fake.default_route("h1"), Some(Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn destroying_a_node_removes_its_links() {
        let fake = FakeSubstrate::new();
        fake.create_node("a", NodeKind::Host).unwrap();
        fake.create_node("b", NodeKind::Host).unwrap();
        let (a, b) = (Endpoint::new("a", "a-eth0"), Endpoint::new("b", "b-eth0"));
        fake.create_link(&a, &b, &LinkQuality::default()).unwrap();

        fake.destroy_node("a").unwrap();
        assert!(fake.links().is_empty());
        assert_eq!(fake.interface_names("b"), ["lo"]);
    }

    #[test]
    fn injected_exec_failures_match_by_pattern() {
        let fake = FakeSubstrate::new();
        fake.create_node("h1", NodeKind::Host).unwrap();
        fake.fail_exec(Some("h1"), "disable_ipv6");

        let disable: [String; 3] =
            ["sysctl".into(), "-w".into(), "net.ipv6.conf.all.disable_ipv6=1".into()];
        assert!(fake.exec("h1", &disable).is_err());
        fake.exec("h1", &["sysctl".into(), "-w".into(), "net.ipv4.ip_forward=1".into()]).unwrap();
        assert_eq!(fake.sysctl("h1", "net.ipv4.ip_forward").as_deref(), Some("1"));
        assert_eq!(fake.commands_on("h1").len(), 2);
    }
}
