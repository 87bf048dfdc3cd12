//! Declarative description of a lab: nodes, links and addressing. Building a [`Topology`] has no
//! side effects; nothing exists until it is handed to [`crate::realize::realize`].
//!
//! ```
//! use rlab_emu::topology::{Addressing, LinkOptions, Topology};
//!
//! let mut topo = Topology::new();
//! topo.add_router("r0", Addressing::ip("10.0.1.1/24".parse()?))?;
//! topo.add_switch("s1")?;
//! let h1 = Addressing::ip("10.0.1.10/24".parse()?).default_route("10.0.1.1".parse()?);
//! topo.add_host("h1", h1)?;
//! topo.add_link("r0", "s1", LinkOptions::default().interface_a("r0-eth1"))?;
//! topo.add_link("h1", "s1", LinkOptions::default())?;
//!
//! topo.validate()?;
//! assert_eq!(topo.node("h1").unwrap().interfaces(), ["h1-eth0"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{
    fmt::{self, Display},
    net::Ipv4Addr,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    ip::{IpPrefix, MacAddr, IFNAME_MAX_LEN},
    tc::LinkQuality,
};

/// Errors raised while building or validating a graph. None of them leave a live resource
/// behind, since nothing is realized yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node names must not be empty")]
    EmptyName,
    #[error("duplicate node name: {0}")]
    DuplicateName(String),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("interface {interface} already exists on node {node}")]
    DuplicateInterface { node: String, interface: String },
    #[error("interface name {0:?} is longer than {IFNAME_MAX_LEN} bytes")]
    InterfaceNameTooLong(String),
    #[error("MAC {mac} of node {node} is already declared by node {owner}")]
    DuplicateMac { node: String, owner: String, mac: MacAddr },
    #[error("switch {0} cannot carry L3 addressing")]
    SwitchAddressed(String),
    #[error("node {0} cannot be linked to itself")]
    SelfLink(String),
    #[error("node {0} is addressed but has no interface")]
    AddressedWithoutInterface(String),
    #[error("default route of {node} names {gateway}, not owned by a router on its subnet")]
    GatewayUnreachable { node: String, gateway: Ipv4Addr },
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// An end host with its own execution context.
    Host,
    /// A pure L2 forwarding element.
    Switch,
    /// The multi-homed node running the forwarding program.
    Router,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Host => "host",
            Self::Switch => "switch",
            Self::Router => "router",
        })
    }
}

/// Static L3 configuration of a node's primary (first created) interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addressing {
    pub addresses: Vec<IpPrefix>,
    pub mac: Option<MacAddr>,
    pub default_route: Option<Ipv4Addr>,
}

impl Addressing {
    /// Addressing with a single IP/prefix.
    pub fn ip(prefix: IpPrefix) -> Self {
        Self { addresses: vec![prefix], ..Default::default() }
    }

    pub fn mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn default_route(mut self, via: Ipv4Addr) -> Self {
        self.default_route = Some(via);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.mac.is_none() && self.default_route.is_none()
    }
}

/// Index of a node in its [`Topology`], in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(usize);

impl NodeRef {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Index of a link in its [`Topology`], in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkRef(usize);

impl LinkRef {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One side of a link: a node and the name of its interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, interface: impl Into<String>) -> Self {
        Self { node: node.into(), interface: interface.into() }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

/// An address bound to a specific interface of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub node: String,
    pub interface: String,
    pub address: IpPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub addressing: Addressing,
    interfaces: Vec<String>,
}

impl NodeSpec {
    /// Interface names in creation order.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// The interface carrying the node's [`Addressing`].
    pub fn primary_interface(&self) -> Option<&str> {
        self.interfaces.first().map(String::as_str)
    }

    fn first_port(&self) -> usize {
        match self.kind {
            NodeKind::Switch => 1,
            NodeKind::Host | NodeKind::Router => 0,
        }
    }
}

/// Per-link options: explicit interface names and the link quality class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkOptions {
    pub interface_a: Option<String>,
    pub interface_b: Option<String>,
    pub quality: LinkQuality,
}

impl LinkOptions {
    pub fn interface_a(mut self, name: impl Into<String>) -> Self {
        self.interface_a = Some(name.into());
        self
    }

    pub fn interface_b(mut self, name: impl Into<String>) -> Self {
        self.interface_b = Some(name.into());
        self
    }

    pub fn quality(mut self, quality: LinkQuality) -> Self {
        self.quality = quality;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub a: Endpoint,
    pub b: Endpoint,
    pub quality: LinkQuality,
}

/// An L2 broadcast domain: the endpoints of non-switch nodes that can reach each other without
/// crossing a router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// The switches forming the segment, empty for a direct node-to-node link.
    pub switches: Vec<String>,
    /// Attached host and router endpoints, in link creation order.
    pub members: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: Vec<NodeSpec>,
    index: FxHashMap<String, usize>,
    links: Vec<LinkSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        addressing: Addressing,
    ) -> Result<NodeRef> {
        let name = name.into();
        if name.is_empty() {
            return Err(GraphError::EmptyName);
        }
        if self.index.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }
        if kind == NodeKind::Switch && !addressing.is_empty() {
            return Err(GraphError::SwitchAddressed(name));
        }
        if let Some(mac) = addressing.mac {
            if let Some(owner) = self.nodes.iter().find(|n| n.addressing.mac == Some(mac)) {
                return Err(GraphError::DuplicateMac { node: name, owner: owner.name.clone(), mac });
            }
        }

        let node_ref = NodeRef(self.nodes.len());
        self.index.insert(name.clone(), node_ref.0);
        self.nodes.push(NodeSpec { name, kind, addressing, interfaces: Vec::new() });

        Ok(node_ref)
    }

    pub fn add_host(&mut self, name: impl Into<String>, addressing: Addressing) -> Result<NodeRef> {
        self.add_node(name, NodeKind::Host, addressing)
    }

    pub fn add_switch(&mut self, name: impl Into<String>) -> Result<NodeRef> {
        self.add_node(name, NodeKind::Switch, Addressing::default())
    }

    pub fn add_router(
        &mut self,
        name: impl Into<String>,
        addressing: Addressing,
    ) -> Result<NodeRef> {
        self.add_node(name, NodeKind::Router, addressing)
    }

    /// Connect two existing nodes. Interfaces not named in `options` are named
    /// `{node}-eth{n}`, `n` being the node's next free port.
    pub fn add_link(&mut self, a: &str, b: &str, options: LinkOptions) -> Result<LinkRef> {
        let a_idx = self.lookup(a)?;
        let b_idx = self.lookup(b)?;
        if a_idx == b_idx {
            return Err(GraphError::SelfLink(a.to_string()));
        }

        // Resolve both names before mutating, so a failed call leaves the graph untouched.
        let if_a = self.interface_name(a_idx, options.interface_a)?;
        let if_b = self.interface_name(b_idx, options.interface_b)?;

        self.nodes[a_idx].interfaces.push(if_a.clone());
        self.nodes[b_idx].interfaces.push(if_b.clone());

        let link_ref = LinkRef(self.links.len());
        self.links.push(LinkSpec {
            a: Endpoint::new(a, if_a),
            b: Endpoint::new(b, if_b),
            quality: options.quality,
        });

        Ok(link_ref)
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.index.get(name).copied().ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    fn interface_name(&self, idx: usize, explicit: Option<String>) -> Result<String> {
        let node = &self.nodes[idx];
        let taken = |candidate: &str| node.interfaces.iter().any(|i| i == candidate);

        let name = match explicit {
            Some(name) if taken(&name) => {
                return Err(GraphError::DuplicateInterface {
                    node: node.name.clone(),
                    interface: name,
                });
            }
            Some(name) => name,
            None => {
                let mut port = node.first_port() + node.interfaces.len();
                loop {
                    let candidate = format!("{}-eth{port}", node.name);
                    if !taken(&candidate) {
                        break candidate;
                    }
                    port += 1;
                }
            }
        };

        if name.is_empty() || name.len() > IFNAME_MAX_LEN {
            return Err(GraphError::InterfaceNameTooLong(name));
        }

        Ok(name)
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.index.get(name).map(|idx| &self.nodes[*idx])
    }

    pub fn node_ref(&self, name: &str) -> Option<NodeRef> {
        self.index.get(name).copied().map(NodeRef)
    }

    pub fn get(&self, node: NodeRef) -> &NodeSpec {
        &self.nodes[node.0]
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// Links in creation order.
    pub fn links(&self) -> &[LinkSpec] {
        &self.links
    }

    pub fn link(&self, link: LinkRef) -> &LinkSpec {
        &self.links[link.0]
    }

    /// Links with their references, in creation order.
    pub fn link_refs(&self) -> impl Iterator<Item = (LinkRef, &LinkSpec)> + '_ {
        self.links.iter().enumerate().map(|(idx, link)| (LinkRef(idx), link))
    }

    /// The addresses declared on primary interfaces of hosts and routers.
    pub fn declared_addresses(&self) -> Vec<InterfaceAddress> {
        self.nodes
            .iter()
            .filter_map(|node| node.primary_interface().map(|interface| (node, interface)))
            .flat_map(|(node, interface)| {
                node.addressing.addresses.iter().map(move |address| InterfaceAddress {
                    node: node.name.clone(),
                    interface: interface.to_string(),
                    address: *address,
                })
            })
            .collect()
    }

    fn is_switch(&self, node: &str) -> bool {
        self.node(node).is_some_and(|n| n.kind == NodeKind::Switch)
    }

    /// Compute the L2 segments. Switches linked to each other share a segment.
    pub fn segments(&self) -> Vec<Segment> {
        // Union-find over switches.
        let mut parent: FxHashMap<&str, &str> = FxHashMap::default();
        fn root<'a>(parent: &FxHashMap<&'a str, &'a str>, mut node: &'a str) -> &'a str {
            while let Some(&p) = parent.get(node) {
                if p == node {
                    break;
                }
                node = p;
            }
            node
        }

        for node in self.nodes.iter().filter(|n| n.kind == NodeKind::Switch) {
            parent.insert(&node.name, &node.name);
        }
        for link in &self.links {
            if self.is_switch(&link.a.node) && self.is_switch(&link.b.node) {
                let (ra, rb) = (root(&parent, &link.a.node), root(&parent, &link.b.node));
                if ra != rb {
                    parent.insert(ra, rb);
                }
            }
        }

        let mut segments: Vec<Segment> = Vec::new();
        let mut by_root: FxHashMap<&str, usize> = FxHashMap::default();

        for node in self.nodes.iter().filter(|n| n.kind == NodeKind::Switch) {
            let r = root(&parent, &node.name);
            let idx = *by_root.entry(r).or_insert_with(|| {
                segments.push(Segment { switches: Vec::new(), members: Vec::new() });
                segments.len() - 1
            });
            segments[idx].switches.push(node.name.clone());
        }

        for link in &self.links {
            match (self.is_switch(&link.a.node), self.is_switch(&link.b.node)) {
                (true, true) => {}
                (true, false) => {
                    segments[by_root[root(&parent, &link.a.node)]].members.push(link.b.clone())
                }
                (false, true) => {
                    segments[by_root[root(&parent, &link.b.node)]].members.push(link.a.clone())
                }
                (false, false) => segments.push(Segment {
                    switches: Vec::new(),
                    members: vec![link.a.clone(), link.b.clone()],
                }),
            }
        }

        segments
    }

    /// The segment an endpoint belongs to.
    pub fn segment_of(&self, endpoint: &Endpoint) -> Option<Segment> {
        self.segments().into_iter().find(|s| s.members.contains(endpoint))
    }

    /// Validate the graph using only its declared addresses. See [`Self::validate_with`].
    pub fn validate(&self) -> Result<()> {
        self.validate_with(&[])
    }

    /// Check that every addressed node has an interface and that every default route names an
    /// address owned by a router interface on the node's own segment. `extra` lists addresses
    /// that will be assigned after realization.
    pub fn validate_with(&self, extra: &[InterfaceAddress]) -> Result<()> {
        for node in &self.nodes {
            if node.primary_interface().is_none() && !node.addressing.is_empty() {
                return Err(GraphError::AddressedWithoutInterface(node.name.clone()));
            }
        }

        let mut owned = self.declared_addresses();
        owned.extend(extra.iter().cloned());
        let segments = self.segments();

        for node in &self.nodes {
            let Some(gateway) = node.addressing.default_route else { continue };
            let unreachable =
                || GraphError::GatewayUnreachable { node: node.name.clone(), gateway };

            let interface = node.primary_interface().ok_or_else(unreachable)?;
            let endpoint = Endpoint::new(&node.name, interface);
            let segment = segments
                .iter()
                .find(|s| s.members.contains(&endpoint))
                .ok_or_else(unreachable)?;

            let on_link = node.addressing.addresses.iter().any(|p| p.contains(gateway));
            let owned_by_router = segment.members.iter().any(|member| {
                self.node(&member.node).is_some_and(|n| n.kind == NodeKind::Router)
                    && owned.iter().any(|a| {
                        a.node == member.node
                            && a.interface == member.interface
                            && a.address.address == gateway
                    })
            });

            if !on_link || !owned_by_router {
                return Err(unreachable());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    fn three_subnets() -> Topology {
        let mut topo = Topology::new();
        topo.add_router("r0", Addressing::ip(prefix("10.0.1.1/24"))).unwrap();
        for s in ["s1", "s2", "s3"] {
            topo.add_switch(s).unwrap();
        }
        for i in 1..=3u8 {
            topo.add_host(
                format!("h{i}"),
                Addressing::ip(prefix(&format!("10.0.{i}.10/24")))
                    .mac(MacAddr::from_index(u64::from(i)))
                    .default_route(Ipv4Addr::new(10, 0, i, 1)),
            )
            .unwrap();
        }
        for i in 1..=3 {
            let options = LinkOptions::default().interface_a(format!("r0-eth{i}"));
            topo.add_link("r0", &format!("s{i}"), options).unwrap();
        }
        for i in 1..=3 {
            topo.add_link(&format!("h{i}"), &format!("s{i}"), LinkOptions::default()).unwrap();
        }
        topo
    }

    fn router_extras() -> Vec<InterfaceAddress> {
        (2..=3)
            .map(|i| InterfaceAddress {
                node: "r0".into(),
                interface: format!("r0-eth{i}"),
                address: prefix(&format!("10.0.{i}.1/24")),
            })
            .collect()
    }

    #[test]
    fn duplicate_node_name_is_rejected() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        assert_eq!(topo.add_switch("s1"), Err(GraphError::DuplicateName("s1".into())));
        assert_eq!(topo.nodes().len(), 1);
    }

    #[test]
    fn duplicate_mac_is_rejected() {
        let mut topo = three_subnets();
        let mac = MacAddr::from_index(2);
        assert_eq!(
            topo.add_host("h4", Addressing::ip(prefix("10.0.2.11/24")).mac(mac)),
            Err(GraphError::DuplicateMac { node: "h4".into(), owner: "h2".into(), mac })
        );
        assert!(topo.node("h4").is_none());

        let fresh = Addressing::ip(prefix("10.0.2.11/24")).mac(MacAddr::from_index(4));
        topo.add_host("h4", fresh).unwrap();
    }

    #[test]
    fn link_to_unknown_node_is_rejected() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        assert_eq!(
            topo.add_link("s1", "h9", LinkOptions::default()),
            Err(GraphError::UnknownNode("h9".into()))
        );
        assert!(topo.links().is_empty());
        assert!(topo.node("s1").unwrap().interfaces().is_empty());
    }

    #[test]
    fn interfaces_are_named_by_creation_order() {
        let topo = three_subnets();
        assert_eq!(topo.node("r0").unwrap().interfaces(), ["r0-eth1", "r0-eth2", "r0-eth3"]);
        assert_eq!(topo.node("s1").unwrap().interfaces(), ["s1-eth1", "s1-eth2"]);
        assert_eq!(topo.node("h2").unwrap().interfaces(), ["h2-eth0"]);
        assert_eq!(topo.node("h2").unwrap().primary_interface(), Some("h2-eth0"));
    }

    #[test]
    fn auto_names_skip_explicit_ones() {
        let mut topo = Topology::new();
        topo.add_host("a", Addressing::default()).unwrap();
        topo.add_switch("s").unwrap();
        topo.add_switch("t").unwrap();
        topo.add_link("a", "s", LinkOptions::default().interface_a("a-eth1")).unwrap();
        topo.add_link("a", "t", LinkOptions::default()).unwrap();
        assert_eq!(topo.node("a").unwrap().interfaces(), ["a-eth1", "a-eth2"]);
    }

    #[test]
    fn explicit_interface_names_must_be_unique_per_node() {
        let mut topo = Topology::new();
        topo.add_router("r0", Addressing::default()).unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        topo.add_link("r0", "s1", LinkOptions::default().interface_a("r0-eth1")).unwrap();

        let err =
            topo.add_link("r0", "s2", LinkOptions::default().interface_a("r0-eth1")).unwrap_err();
        assert_eq!(
            err,
            GraphError::DuplicateInterface { node: "r0".into(), interface: "r0-eth1".into() }
        );
        assert_eq!(topo.links().len(), 1);
        assert!(topo.node("s2").unwrap().interfaces().is_empty());
    }

    #[test]
    fn long_interface_names_are_rejected() {
        let mut topo = Topology::new();
        topo.add_host("a-very-long-host-name", Addressing::default()).unwrap();
        topo.add_switch("s1").unwrap();
        assert!(matches!(
            topo.add_link("a-very-long-host-name", "s1", LinkOptions::default()),
            Err(GraphError::InterfaceNameTooLong(_))
        ));
    }

    #[test]
    fn switches_cannot_be_addressed_or_self_linked() {
        let mut topo = Topology::new();
        assert_eq!(
            topo.add_node("s1", NodeKind::Switch, Addressing::ip(prefix("10.0.0.1/24"))),
            Err(GraphError::SwitchAddressed("s1".into()))
        );
        topo.add_switch("s1").unwrap();
        assert_eq!(
            topo.add_link("s1", "s1", LinkOptions::default()),
            Err(GraphError::SelfLink("s1".into()))
        );
    }

    #[test]
    fn segments_group_switch_and_attachments() {
        let topo = three_subnets();
        let segments = topo.segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].switches, ["s2"]);
        assert_eq!(
            segments[1].members,
            [Endpoint::new("r0", "r0-eth2"), Endpoint::new("h2", "h2-eth0")]
        );
    }

    #[test]
    fn chained_switches_share_a_segment() {
        let mut topo = Topology::new();
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        topo.add_host("a", Addressing::default()).unwrap();
        topo.add_host("b", Addressing::default()).unwrap();
        topo.add_host("c", Addressing::default()).unwrap();
        topo.add_link("s1", "s2", LinkOptions::default()).unwrap();
        topo.add_link("a", "s1", LinkOptions::default()).unwrap();
        topo.add_link("b", "s2", LinkOptions::default()).unwrap();
        topo.add_link("a", "c", LinkOptions::default()).unwrap();

        let segments = topo.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(
            segments[0].members,
            [Endpoint::new("a", "a-eth0"), Endpoint::new("b", "b-eth0")]
        );
        assert!(segments[1].switches.is_empty());
        assert_eq!(
            segments[1].members,
            [Endpoint::new("a", "a-eth1"), Endpoint::new("c", "c-eth0")]
        );
    }

    #[test]
    fn gateways_need_the_router_addresses_assigned_later() {
        let topo = three_subnets();
        assert_eq!(
            topo.validate(),
            Err(GraphError::GatewayUnreachable {
                node: "h2".into(),
                gateway: Ipv4Addr::new(10, 0, 2, 1)
            })
        );
        assert_eq!(topo.validate_with(&router_extras()), Ok(()));
    }

    #[test]
    fn gateway_on_another_segment_is_rejected() {
        let mut topo = Topology::new();
        topo.add_router("r0", Addressing::ip(prefix("10.0.1.1/24"))).unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_switch("s2").unwrap();
        let h1 = Addressing::ip(prefix("10.0.1.10/24")).default_route(Ipv4Addr::new(10, 0, 1, 1));
        topo.add_host("h1", h1).unwrap();
        topo.add_link("r0", "s1", LinkOptions::default()).unwrap();
        topo.add_link("h1", "s2", LinkOptions::default()).unwrap();

        assert!(matches!(topo.validate(), Err(GraphError::GatewayUnreachable { .. })));
    }

    #[test]
    fn addressed_nodes_need_an_interface() {
        let mut topo = Topology::new();
        topo.add_host("h1", Addressing::ip(prefix("10.0.1.10/24"))).unwrap();
        assert_eq!(topo.validate(), Err(GraphError::AddressedWithoutInterface("h1".into())));
    }

    #[test]
    fn declared_addresses_follow_primary_interfaces() {
        let topo = three_subnets();
        let declared = topo.declared_addresses();
        assert_eq!(declared.len(), 4);
        assert_eq!(declared[0].interface, "r0-eth1");
        assert_eq!(declared[0].address, prefix("10.0.1.1/24"));
    }
}
