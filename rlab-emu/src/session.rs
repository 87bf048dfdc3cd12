//! The live instance of a topology: realized nodes and links, the address table, the forwarding
//! process handle, and teardown.

use std::{
    fmt::{self, Display},
    net::Ipv4Addr,
    sync::Arc,
};

use crate::{
    command::Output,
    ip::{self, IpCommand, IpPrefix},
    substrate::{self, Substrate},
    supervisor::{self, ProcessHandle},
    topology::{Endpoint, InterfaceAddress, LinkRef, LinkSpec, NodeKind, NodeSpec, Topology},
};

/// A resource released during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Process { node: String, pid: u32 },
    Link { a: Endpoint, b: Endpoint },
    Node(String),
}

impl Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { node, pid } => write!(f, "process {pid} on {node}"),
            Self::Link { a, b } => write!(f, "link {a} <-> {b}"),
            Self::Node(name) => write!(f, "node {name}"),
        }
    }
}

/// A release that failed. Teardown records it and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownError {
    pub resource: Resource,
    pub cause: String,
}

impl Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to release {}: {}", self.resource, self.cause)
    }
}

/// What teardown released, and what it could not.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub processes_stopped: usize,
    pub links_released: usize,
    pub nodes_released: usize,
    pub errors: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A realized topology. Owns every live element and is the unit of teardown.
#[derive(Debug)]
pub struct Session {
    substrate: Arc<dyn Substrate>,
    topology: Topology,
    /// Realized nodes, in creation order.
    nodes: Vec<String>,
    /// Realized links, in creation order.
    links: Vec<LinkRef>,
    addresses: Vec<InterfaceAddress>,
    forwarding: Option<ProcessHandle>,
    torn_down: bool,
}

impl Session {
    pub(crate) fn new(substrate: Arc<dyn Substrate>, topology: Topology) -> Self {
        Self {
            substrate,
            topology,
            nodes: Vec::new(),
            links: Vec::new(),
            addresses: Vec::new(),
            forwarding: None,
            torn_down: false,
        }
    }

    pub(crate) fn push_node(&mut self, name: &str) {
        self.nodes.push(name.to_string());
    }

    pub(crate) fn push_link(&mut self, link: LinkRef) {
        self.links.push(link);
    }

    /// Record an address now bound to an interface. Re-recording an address replaces its
    /// prefix length.
    pub(crate) fn record_address(&mut self, entry: InterfaceAddress) {
        let existing = self.addresses.iter_mut().find(|a| {
            a.node == entry.node
                && a.interface == entry.interface
                && a.address.address == entry.address.address
        });

        match existing {
            Some(slot) => *slot = entry,
            None => self.addresses.push(entry),
        }
    }

    pub(crate) fn set_forwarding(&mut self, handle: ProcessHandle) {
        self.forwarding = Some(handle);
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// The graph this session was realized from.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Realized nodes, in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> + '_ {
        self.nodes.iter().filter_map(|name| self.topology.node(name))
    }

    /// Realized links, in creation order.
    pub fn links(&self) -> impl Iterator<Item = &LinkSpec> + '_ {
        self.links.iter().map(|link| self.topology.link(*link))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// A realized node by name.
    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().any(|n| n == name).then(|| self.topology.node(name)).flatten()
    }

    /// The first realized router.
    pub fn router(&self) -> Option<&NodeSpec> {
        self.nodes().find(|n| n.kind == NodeKind::Router)
    }

    /// Every address bound so far, by realization or conditioning.
    pub fn addresses(&self) -> &[InterfaceAddress] {
        &self.addresses
    }

    /// Addresses bound to one interface, in assignment order.
    pub fn addresses_of(&self, node: &str, interface: &str) -> Vec<IpPrefix> {
        self.addresses
            .iter()
            .filter(|a| a.node == node && a.interface == interface)
            .map(|a| a.address)
            .collect()
    }

    pub fn forwarding(&self) -> Option<&ProcessHandle> {
        self.forwarding.as_ref()
    }

    pub fn forwarding_mut(&mut self) -> Option<&mut ProcessHandle> {
        self.forwarding.as_mut()
    }

    /// Run a command inside a realized node.
    pub fn exec(&self, node: &str, argv: &[String]) -> substrate::Result<Output> {
        if self.node(node).is_none() {
            return Err(substrate::Error::NoSuchNode(node.to_string()));
        }

        self.substrate.exec(node, argv)
    }

    /// The IPv4 addresses the kernel reports for an interface.
    pub fn observed_addresses(
        &self,
        node: &str,
        interface: &str,
    ) -> substrate::Result<Vec<IpPrefix>> {
        let show = IpCommand::ShowAddresses { dev: interface.to_string() };
        let output = self.exec(node, &show.argv())?;
        Ok(ip::parse_inet_addresses(&output.stdout))
    }

    fn owner_of(&self, address: Ipv4Addr) -> Option<Endpoint> {
        self.addresses
            .iter()
            .find(|a| a.address.address == address)
            .map(|a| Endpoint::new(&a.node, &a.interface))
    }

    /// The interfaces a packet from `src` to `dst` crosses, following segments, the source's
    /// default route and a single router hop. `None` when no such path exists.
    ///
    /// For `h1` to `10.0.2.10` in the three-subnet lab this is
    /// `[h1:h1-eth0, r0:r0-eth1, r0:r0-eth2, h2:h2-eth0]`.
    pub fn l3_path(&self, src: &str, dst: Ipv4Addr) -> Option<Vec<Endpoint>> {
        let node = self.node(src)?;
        let target = self.owner_of(dst)?;
        if target.node == src {
            return Some(vec![target]);
        }

        let segments = self.topology.segments();
        let segment_of =
            |endpoint: &Endpoint| segments.iter().find(|s| s.members.contains(endpoint));

        for interface in node.interfaces() {
            let egress = Endpoint::new(src, interface);
            let Some(segment) = segment_of(&egress) else { continue };

            if segment.members.contains(&target) {
                return Some(vec![egress, target]);
            }

            let Some(gateway) = node.addressing.default_route else { continue };
            let Some(ingress) = self.owner_of(gateway).filter(|gw| segment.members.contains(gw))
            else {
                continue;
            };
            if self.node(&ingress.node).map(|n| n.kind) != Some(NodeKind::Router) {
                continue;
            }

            if target.node == ingress.node {
                return Some(vec![egress, ingress]);
            }

            let router = self.topology.node(&ingress.node)?;
            for out in router.interfaces() {
                let out = Endpoint::new(&router.name, out);
                if out != ingress && segment_of(&out).is_some_and(|s| s.members.contains(&target)) {
                    return Some(vec![egress, ingress, out, target]);
                }
            }
        }

        None
    }

    /// Release everything this session owns: the forwarding process, then links and nodes in
    /// reverse creation order. Every release is attempted; failures are collected in the report.
    /// Calling it again releases nothing.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.torn_down = true;

        let _span = tracing::info_span!("teardown").entered();

        if let Some(mut handle) = self.forwarding.take() {
            match supervisor::stop(&mut handle, supervisor::DEFAULT_GRACE) {
                Ok(status) => {
                    tracing::debug!(?status, pid = handle.pid(), "stopped forwarding process");
                    report.processes_stopped += 1;
                }
                Err(e) => {
                    let error = TeardownError {
                        resource: Resource::Process {
                            node: handle.node().to_string(),
                            pid: handle.pid(),
                        },
                        cause: e.to_string(),
                    };
                    tracing::warn!(%error);
                    report.errors.push(error);
                }
            }
        }

        for link in std::mem::take(&mut self.links).into_iter().rev() {
            let LinkSpec { a, b, .. } = self.topology.link(link);
            match self.substrate.destroy_link(a, b) {
                Ok(()) => report.links_released += 1,
                Err(e) => {
                    let error = TeardownError {
                        resource: Resource::Link { a: a.clone(), b: b.clone() },
                        cause: e.to_string(),
                    };
                    tracing::warn!(%error);
                    report.errors.push(error);
                }
            }
        }

        for node in std::mem::take(&mut self.nodes).into_iter().rev() {
            match self.substrate.destroy_node(&node) {
                Ok(()) => report.nodes_released += 1,
                Err(e) => {
                    let error =
                        TeardownError { resource: Resource::Node(node), cause: e.to_string() };
                    tracing::warn!(%error);
                    report.errors.push(error);
                }
            }
        }

        self.addresses.clear();

        tracing::info!(
            links = report.links_released,
            nodes = report.nodes_released,
            errors = report.errors.len(),
            "session torn down"
        );

        report
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let idle = self.nodes.is_empty() && self.links.is_empty() && self.forwarding.is_none();
        if self.torn_down || idle {
            return;
        }

        tracing::warn!(
            nodes = self.nodes.len(),
            links = self.links.len(),
            "session dropped without teardown"
        );
        let report = self.teardown();
        if !report.is_clean() {
            tracing::error!(errors = report.errors.len(), "teardown on drop left resources behind");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        realize::{realize, RealizeOptions, StopSignal},
        test_util::FakeSubstrate,
        topology::{Addressing, LinkOptions},
    };

    fn pair() -> Topology {
        let mut topo = Topology::new();
        topo.add_host("a", Addressing::ip("10.0.0.1/24".parse().unwrap())).unwrap();
        topo.add_host("b", Addressing::ip("10.0.0.2/24".parse().unwrap())).unwrap();
        topo.add_link("a", "b", LinkOptions::default()).unwrap();
        topo
    }

    #[test]
    fn exec_is_limited_to_realized_nodes() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake.clone(), &pair(), &RealizeOptions::default(), &StopSignal::new()).unwrap();

        assert!(session.exec("a", &["true".into()]).is_ok());
        assert!(matches!(
            session.exec("c", &["true".into()]),
            Err(substrate::Error::NoSuchNode(_))
        ));

        session.teardown();
    }

    #[test]
    fn direct_neighbours_have_a_one_hop_path() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake, &pair(), &RealizeOptions::default(), &StopSignal::new()).unwrap();

        assert_eq!(
            session.l3_path("a", Ipv4Addr::new(10, 0, 0, 2)),
            Some(vec![Endpoint::new("a", "a-eth0"), Endpoint::new("b", "b-eth0")])
        );
        assert_eq!(session.l3_path("a", Ipv4Addr::new(10, 0, 9, 9)), None);

        session.teardown();
    }

    #[test]
    fn teardown_is_reverse_ordered_and_idempotent() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake.clone(), &pair(), &RealizeOptions::default(), &StopSignal::new()).unwrap();

        let report = session.teardown();
        assert!(report.is_clean());
        assert_eq!((report.links_released, report.nodes_released), (1, 2));
        assert!(fake.is_empty());

        let again = session.teardown();
        assert_eq!((again.links_released, again.nodes_released), (0, 0));
    }

    #[test]
    fn dropping_a_live_session_releases_it() {
        let fake = Arc::new(FakeSubstrate::new());
        let session =
            realize(fake.clone(), &pair(), &RealizeOptions::default(), &StopSignal::new()).unwrap();
        assert_eq!(fake.node_names(), ["a", "b"]);

        drop(session);
        assert!(fake.is_empty());
    }

    #[test]
    fn teardown_continues_past_failures() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake.clone(), &pair(), &RealizeOptions::default(), &StopSignal::new()).unwrap();
        fake.fail_destroy_node("b");

        let report = session.teardown();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].resource, Resource::Node("b".into()));
        assert_eq!(fake.node_names(), ["b"]);
    }
}
