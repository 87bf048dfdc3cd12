//! Declarative lab files.
//!
//! A lab file is TOML:
//!
//! ```toml
//! [[nodes]]
//! name = "r0"
//! kind = "router"
//! addresses = ["10.0.1.1/24"]
//!
//! [[nodes]]
//! name = "s1"
//! kind = "switch"
//!
//! [[links]]
//! a = "r0"
//! b = "s1"
//! interface_a = "r0-eth1"
//!
//! [[conditioning.addresses]]
//! node = "r0"
//! interface = "r0-eth2"
//! address = "10.0.2.1/24"
//!
//! [forwarding]
//! node = "r0"
//! program = "./fouter"
//! log = "./out.log"
//! ```

use std::{
    io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    condition::{ConditioningAction, ConditioningPlan},
    ip::{IpPrefix, MacAddr},
    lifecycle::{ForwardingLaunch, SessionConfig},
    realize::RealizeOptions,
    supervisor::ForwardingCommand,
    tc::LinkQuality,
    topology::{Addressing, GraphError, InterfaceAddress, LinkOptions, NodeKind, Topology},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid lab file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, Error>;

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub addresses: Vec<IpPrefix>,
    pub mac: Option<MacAddr>,
    pub default_route: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub a: String,
    pub b: String,
    pub interface_a: Option<String>,
    pub interface_b: Option<String>,
    #[serde(default)]
    pub quality: LinkQuality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditioningConfig {
    #[serde(default = "default_true")]
    pub disable_ipv6: bool,
    /// Enable the kernel's own IPv4 forwarding on routers. Off by default, leaving forwarding to
    /// the forwarding program.
    #[serde(default)]
    pub kernel_forwarding: bool,
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self { disable_ipv6: true, kernel_forwarding: false, addresses: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardingConfig {
    pub node: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub log: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealizeConfig {
    #[serde(default = "default_true")]
    pub static_arp: bool,
}

impl Default for RealizeConfig {
    fn default() -> Self {
        Self { static_arp: true }
    }
}

/// A complete lab: the graph, how to condition it, and what forwarding program to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub conditioning: ConditioningConfig,
    pub forwarding: Option<ForwardingConfig>,
    #[serde(default)]
    pub realize: RealizeConfig,
}

impl LabConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&contents)
    }

    /// Router `r0` serving three subnets, one switch and one host each.
    ///
    /// ```text
    ///        h1 10.0.1.10          h2 10.0.2.10          h3 10.0.3.10
    ///         |                     |                     |
    ///        s1                    s2                    s3
    ///         |                     |                     |
    ///  r0-eth1 10.0.1.1      r0-eth2 10.0.2.1      r0-eth3 10.0.3.1
    ///         \_____________________|_____________________/
    ///                               r0
    /// ```
    pub fn three_subnets() -> Self {
        let subnet =
            |i: u8, host: u8| IpPrefix { address: Ipv4Addr::new(10, 0, i, host), prefix_len: 24 };

        let mut nodes = vec![NodeConfig {
            name: "r0".into(),
            kind: NodeKind::Router,
            addresses: vec![subnet(1, 1)],
            mac: None,
            default_route: None,
        }];
        nodes.extend((1..=3).map(|i| NodeConfig {
            name: format!("s{i}"),
            kind: NodeKind::Switch,
            addresses: Vec::new(),
            mac: None,
            default_route: None,
        }));
        nodes.extend((1..=3u8).map(|i| NodeConfig {
            name: format!("h{i}"),
            kind: NodeKind::Host,
            addresses: vec![subnet(i, 10)],
            mac: Some(MacAddr::from_index(u64::from(i))),
            default_route: Some(Ipv4Addr::new(10, 0, i, 1)),
        }));

        let router_links = (1..=3).map(|i| LinkConfig {
            a: "r0".into(),
            b: format!("s{i}"),
            interface_a: Some(format!("r0-eth{i}")),
            interface_b: None,
            quality: LinkQuality::default(),
        });
        let host_links = (1..=3).map(|i| LinkConfig {
            a: format!("h{i}"),
            b: format!("s{i}"),
            interface_a: None,
            interface_b: None,
            quality: LinkQuality::default(),
        });

        let addresses = (2..=3u8)
            .map(|i| InterfaceAddress {
                node: "r0".into(),
                interface: format!("r0-eth{i}"),
                address: subnet(i, 1),
            })
            .collect();

        Self {
            nodes,
            links: router_links.chain(host_links).collect(),
            conditioning: ConditioningConfig { addresses, ..Default::default() },
            forwarding: Some(ForwardingConfig {
                node: "r0".into(),
                program: "./fouter".into(),
                args: Vec::new(),
                log: PathBuf::from("./out.log"),
            }),
            realize: RealizeConfig::default(),
        }
    }

    /// Build the graph. Graph errors surface here, before anything exists.
    pub fn build_topology(&self) -> Result<Topology> {
        let mut topology = Topology::new();

        for node in &self.nodes {
            let addressing = Addressing {
                addresses: node.addresses.clone(),
                mac: node.mac,
                default_route: node.default_route,
            };
            topology.add_node(&node.name, node.kind, addressing)?;
        }

        for link in &self.links {
            let options = LinkOptions {
                interface_a: link.interface_a.clone(),
                interface_b: link.interface_b.clone(),
                quality: link.quality,
            };
            topology.add_link(&link.a, &link.b, options)?;
        }

        Ok(topology)
    }

    pub fn conditioning_plan(&self, topology: &Topology) -> ConditioningPlan {
        let mut plan = ConditioningPlan::new();
        if self.conditioning.disable_ipv6 {
            plan = plan.disable_ipv6(topology);
        }
        if self.conditioning.kernel_forwarding {
            for router in topology.nodes().iter().filter(|n| n.kind == NodeKind::Router) {
                plan = plan.step(&router.name, ConditioningAction::kernel_forwarding(true));
            }
        }

        plan.assign_addresses(&self.conditioning.addresses)
    }

    /// Everything a [`crate::lifecycle::Controller`] needs.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let topology = self.build_topology()?;
        let conditioning = self.conditioning_plan(&topology);
        let realize = RealizeOptions { static_arp: self.realize.static_arp, ..Default::default() };

        let forwarding = self.forwarding.as_ref().map(|f| ForwardingLaunch {
            node: f.node.clone(),
            command: ForwardingCommand { program: f.program.clone(), args: f.args.clone() },
            log_path: f.log.clone(),
        });

        Ok(SessionConfig { topology, realize, conditioning, forwarding })
    }
}
