//! Turns a [`Topology`] into a live [`Session`].
//!
//! Realization happens in a fixed order, so that every later step can rely on the earlier ones:
//!
//! 1. one execution context per node, in creation order (switches also get a bridge named after
//!    the switch);
//! 2. one virtual pair per link, in creation order, switch ends enslaved to the switch bridge;
//! 3. MAC addresses, primary addresses and link state of every interface, loopback up;
//! 4. default routes;
//! 5. optionally, static neighbour entries for every other addressed interface on the segment.
//!
//! If any step fails, the elements created so far are handed back in a [`PartialSession`] so the
//! caller can tear them down.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rustc_hash::FxHashMap;

use crate::{
    ip::{IpCommand, MacAddr, MacAllocator},
    session::{Session, TeardownReport},
    substrate::{self, Substrate},
    topology::{Endpoint, GraphError, InterfaceAddress, NodeKind, Topology},
};

#[derive(Debug, thiserror::Error)]
pub enum RealizeError {
    #[error("invalid topology: {0}")]
    Graph(#[from] GraphError),
    #[error("failed to create node {node}: {source}")]
    Node {
        node: String,
        #[source]
        source: substrate::Error,
    },
    #[error("failed to create link {a} <-> {b}: {source}")]
    Link {
        a: Endpoint,
        b: Endpoint,
        #[source]
        source: substrate::Error,
    },
    #[error("failed to configure {node} (`{command}`): {source}")]
    Configure {
        node: String,
        command: String,
        #[source]
        source: substrate::Error,
    },
    #[error("realization cancelled")]
    Cancelled,
}

/// A failed realization: the error, and whatever had been created before it.
#[derive(Debug, thiserror::Error)]
#[error("realization failed: {error}")]
pub struct RealizeFailure {
    #[source]
    pub error: RealizeError,
    pub partial: PartialSession,
}

/// The elements created by a realization that did not complete. They stay alive until
/// [`PartialSession::teardown`] is called or the value is dropped.
#[derive(Debug)]
pub struct PartialSession(Session);

impl PartialSession {
    pub fn session(&self) -> &Session {
        &self.0
    }

    pub fn into_session(self) -> Session {
        self.0
    }

    pub fn teardown(&mut self) -> TeardownReport {
        self.0.teardown()
    }
}

/// Cooperative stop request, checked by realization between elements and by operators between
/// commands. Clones share the same flag.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StopSignal").field(&self.is_requested()).finish()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RealizeOptions {
    /// Install permanent neighbour entries for every addressed interface on the same segment.
    pub static_arp: bool,
    /// Addresses that conditioning will assign later. They count for gateway validation and
    /// static neighbour entries.
    pub extra_addresses: Vec<InterfaceAddress>,
}

impl Default for RealizeOptions {
    fn default() -> Self {
        Self { static_arp: true, extra_addresses: Vec::new() }
    }
}

/// Realize `topology` on `substrate`. The graph is validated before anything is created.
pub fn realize(
    substrate: Arc<dyn Substrate>,
    topology: &Topology,
    options: &RealizeOptions,
    stop: &StopSignal,
) -> Result<Session, RealizeFailure> {
    let mut session = Session::new(substrate, topology.clone());

    let realizer = Realizer { topology, options, stop };

    match realizer.run(&mut session) {
        Ok(()) => {
            tracing::info!(
                nodes = session.node_count(),
                links = session.link_count(),
                "topology realized"
            );
            Ok(session)
        }
        Err(error) => {
            tracing::warn!(
                %error,
                nodes = session.node_count(),
                links = session.link_count(),
                "realization failed"
            );
            Err(RealizeFailure { error, partial: PartialSession(session) })
        }
    }
}

struct Realizer<'a> {
    topology: &'a Topology,
    options: &'a RealizeOptions,
    stop: &'a StopSignal,
}

impl Realizer<'_> {
    fn run(&self, session: &mut Session) -> Result<(), RealizeError> {
        self.topology.validate_with(&self.options.extra_addresses)?;

        self.create_nodes(session)?;
        self.create_links(session)?;
        let macs = self.configure_interfaces(session)?;
        self.install_default_routes(session)?;

        if self.options.static_arp {
            self.install_neighbors(session, &macs)?;
        }

        Ok(())
    }

    fn check_stop(&self) -> Result<(), RealizeError> {
        if self.stop.is_requested() {
            return Err(RealizeError::Cancelled);
        }
        Ok(())
    }

    fn configure(session: &Session, node: &str, command: IpCommand) -> Result<(), RealizeError> {
        session.substrate().exec(node, &command.argv()).map(|_| ()).map_err(|source| {
            RealizeError::Configure { node: node.to_string(), command: command.to_string(), source }
        })
    }

    fn create_nodes(&self, session: &mut Session) -> Result<(), RealizeError> {
        for node in self.topology.nodes() {
            self.check_stop()?;

            let _span =
                tracing::debug_span!("node", name = %node.name, kind = %node.kind).entered();
            session
                .substrate()
                .create_node(&node.name, node.kind)
                .map_err(|source| RealizeError::Node { node: node.name.clone(), source })?;
            session.push_node(&node.name);

            if node.kind == NodeKind::Switch {
                let bridge = IpCommand::AddBridge { name: node.name.clone() };
                Self::configure(session, &node.name, bridge)?;
                Self::configure(session, &node.name, IpCommand::LinkUp { dev: node.name.clone() })?;
            }
        }

        Ok(())
    }

    fn create_links(&self, session: &mut Session) -> Result<(), RealizeError> {
        for (link_ref, link) in self.topology.link_refs() {
            self.check_stop()?;

            session.substrate().create_link(&link.a, &link.b, &link.quality).map_err(|source| {
                RealizeError::Link { a: link.a.clone(), b: link.b.clone(), source }
            })?;
            session.push_link(link_ref);

            for end in [&link.a, &link.b] {
                if self.topology.node(&end.node).is_some_and(|n| n.kind == NodeKind::Switch) {
                    let attach = IpCommand::AttachToBridge {
                        dev: end.interface.clone(),
                        bridge: end.node.clone(),
                    };
                    Self::configure(session, &end.node, attach)?;
                }
            }
        }

        Ok(())
    }

    /// Set MACs, primary addresses and link state. Returns the MAC of every host and router
    /// interface.
    fn configure_interfaces(
        &self,
        session: &mut Session,
    ) -> Result<FxHashMap<Endpoint, MacAddr>, RealizeError> {
        let mut allocator = MacAllocator::default();
        for node in self.topology.nodes() {
            if let Some(mac) = node.addressing.mac {
                allocator.reserve(mac);
            }
        }

        let mut macs = FxHashMap::default();

        for node in self.topology.nodes() {
            self.check_stop()?;
            let _span = tracing::debug_span!("configure", node = %node.name).entered();

            for (port, interface) in node.interfaces().iter().enumerate() {
                if node.kind != NodeKind::Switch {
                    let mac = match node.addressing.mac {
                        Some(mac) if port == 0 => mac,
                        _ => allocator.allocate(),
                    };
                    let set_mac = IpCommand::SetMac { dev: interface.clone(), mac };
                    Self::configure(session, &node.name, set_mac)?;
                    macs.insert(Endpoint::new(&node.name, interface), mac);
                }

                if port == 0 {
                    for prefix in &node.addressing.addresses {
                        Self::configure(
                            session,
                            &node.name,
                            IpCommand::AddAddress { dev: interface.clone(), prefix: *prefix },
                        )?;
                        session.record_address(InterfaceAddress {
                            node: node.name.clone(),
                            interface: interface.clone(),
                            address: *prefix,
                        });
                    }
                }

                Self::configure(session, &node.name, IpCommand::LinkUp { dev: interface.clone() })?;
            }

            Self::configure(session, &node.name, IpCommand::LinkUp { dev: "lo".to_string() })?;
        }

        Ok(macs)
    }

    fn install_default_routes(&self, session: &mut Session) -> Result<(), RealizeError> {
        for node in self.topology.nodes() {
            if let Some(via) = node.addressing.default_route {
                self.check_stop()?;
                Self::configure(session, &node.name, IpCommand::DefaultRoute { via })?;
            }
        }

        Ok(())
    }

    fn install_neighbors(
        &self,
        session: &mut Session,
        macs: &FxHashMap<Endpoint, MacAddr>,
    ) -> Result<(), RealizeError> {
        let mut known = session.addresses().to_vec();
        known.extend(self.options.extra_addresses.iter().cloned());

        for segment in self.topology.segments() {
            self.check_stop()?;

            for member in &segment.members {
                for peer in segment.members.iter().filter(|p| *p != member) {
                    let Some(mac) = macs.get(peer) else { continue };
                    let addresses = known
                        .iter()
                        .filter(|a| a.node == peer.node && a.interface == peer.interface);

                    for address in addresses {
                        let neighbor = IpCommand::StaticNeighbor {
                            dev: member.interface.clone(),
                            address: address.address.address,
                            mac: *mac,
                        };
                        Self::configure(session, &member.node, neighbor)?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{
        test_util::FakeSubstrate,
        topology::{Addressing, LinkOptions},
    };

    fn lan() -> Topology {
        let mut topo = Topology::new();
        topo.add_router("r0", Addressing::ip("10.0.1.1/24".parse().unwrap())).unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_host(
            "h1",
            Addressing::ip("10.0.1.10/24".parse().unwrap())
                .mac("00:00:00:00:00:01".parse().unwrap())
                .default_route(Ipv4Addr::new(10, 0, 1, 1)),
        )
        .unwrap();
        topo.add_link("r0", "s1", LinkOptions::default().interface_a("r0-eth1")).unwrap();
        topo.add_link("h1", "s1", LinkOptions::default()).unwrap();
        topo
    }

    #[test]
    fn switches_bridge_their_ports() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake.clone(), &lan(), &RealizeOptions::default(), &StopSignal::new()).unwrap();

        let bridge = fake.interface("s1", "s1").unwrap();
        assert!(bridge.is_bridge && bridge.up);
        for port in ["s1-eth1", "s1-eth2"] {
            let port = fake.interface("s1", port).unwrap();
            assert_eq!(port.master.as_deref(), Some("s1"));
            assert!(port.up);
            assert!(port.mac.is_none());
        }

        session.teardown();
    }

    #[test]
    fn macs_are_explicit_or_allocated_without_collisions() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake.clone(), &lan(), &RealizeOptions::default(), &StopSignal::new()).unwrap();

        assert_eq!(fake.interface("h1", "h1-eth0").unwrap().mac, Some(MacAddr::from_index(1)));
        assert_eq!(fake.interface("r0", "r0-eth1").unwrap().mac, Some(MacAddr::from_index(2)));

        session.teardown();
    }

    #[test]
    fn addresses_routes_and_neighbours_are_installed() {
        let fake = Arc::new(FakeSubstrate::new());
        let mut session =
            realize(fake.clone(), &lan(), &RealizeOptions::default(), &StopSignal::new()).unwrap();

        assert_eq!(
            fake.interface("h1", "h1-eth0").unwrap().addresses,
            ["10.0.1.10/24".parse().unwrap()]
        );
        assert!(fake.interface("h1", "lo").unwrap().up);
        assert_eq!(fake.default_route("h1"), Some(Ipv4Addr::new(10, 0, 1, 1)));

        let neighbors = fake.neighbors("h1");
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].address, Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(neighbors[0].mac, MacAddr::from_index(2));

        session.teardown();
    }

    #[test]
    fn static_arp_can_be_disabled() {
        let fake = Arc::new(FakeSubstrate::new());
        let options = RealizeOptions { static_arp: false, ..Default::default() };
        let mut session = realize(fake.clone(), &lan(), &options, &StopSignal::new()).unwrap();

        assert!(fake.neighbors("h1").is_empty());
        session.teardown();
    }

    #[test]
    fn invalid_graphs_create_nothing() {
        let mut topo = lan();
        let addressing = Addressing::ip("10.0.2.10/24".parse().unwrap())
            .default_route(Ipv4Addr::new(10, 0, 2, 1));
        topo.add_host("h2", addressing).unwrap();
        topo.add_link("h2", "s1", LinkOptions::default()).unwrap();

        let fake = Arc::new(FakeSubstrate::new());
        let failure = realize(fake.clone(), &topo, &RealizeOptions::default(), &StopSignal::new())
            .unwrap_err();
        assert!(matches!(
            failure.error,
            RealizeError::Graph(GraphError::GatewayUnreachable { .. })
        ));
        assert_eq!(failure.partial.session().node_count(), 0);
        assert!(fake.journal().is_empty());
    }

    #[test]
    fn configuration_failures_keep_the_partial_session() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.fail_exec(Some("h1"), "route replace default");

        let mut failure =
            realize(fake.clone(), &lan(), &RealizeOptions::default(), &StopSignal::new())
                .unwrap_err();
        assert!(matches!(&failure.error, RealizeError::Configure { node, .. } if node == "h1"));
        assert_eq!(failure.partial.session().node_count(), 3);
        assert_eq!(failure.partial.session().link_count(), 2);

        assert!(failure.partial.teardown().is_clean());
        assert!(fake.is_empty());
    }

    #[test]
    fn a_requested_stop_cancels_before_anything_is_created() {
        let fake = Arc::new(FakeSubstrate::new());
        let stop = StopSignal::new();
        stop.request();

        let failure = realize(fake.clone(), &lan(), &RealizeOptions::default(), &stop).unwrap_err();
        assert!(matches!(failure.error, RealizeError::Cancelled));
        assert!(fake.is_empty());
    }
}
