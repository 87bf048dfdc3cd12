//! Property-based tests over randomly shaped labs on the in-memory substrate.

use std::{net::Ipv4Addr, sync::Arc};

use proptest::prelude::*;
use rlab_emu::{
    condition::ConditioningPlan,
    ip::IpPrefix,
    lifecycle::{self, Lab, SessionConfig, SessionState},
    realize::RealizeOptions,
    session::{Session, TeardownReport},
    tc::LinkQuality,
    test_util::FakeSubstrate,
    topology::{Addressing, InterfaceAddress, LinkOptions, NodeKind, Topology},
};

/// A router `r0` with one switched subnet per entry of `hosts_per_subnet`, plus a few host pairs
/// linked back to back.
#[derive(Debug, Clone)]
struct LabShape {
    hosts_per_subnet: Vec<usize>,
    direct_pairs: usize,
    delay_us: u32,
    static_arp: bool,
}

fn lab_shape() -> impl Strategy<Value = LabShape> {
    (
        prop::collection::vec(1usize..=3, 1..=4),
        0usize..=2,
        prop_oneof![Just(0u32), 1u32..5_000],
        any::<bool>(),
    )
        .prop_map(|(hosts_per_subnet, direct_pairs, delay_us, static_arp)| LabShape {
            hosts_per_subnet,
            direct_pairs,
            delay_us,
            static_arp,
        })
}

fn prefix(s: &str) -> IpPrefix {
    s.parse().unwrap()
}

impl LabShape {
    /// The graph, and the router addresses that only conditioning binds.
    fn build(&self) -> (Topology, Vec<InterfaceAddress>) {
        let mut topo = Topology::new();
        topo.add_router("r0", Addressing::ip(prefix("10.0.1.1/24"))).unwrap();
        let mut extra = Vec::new();

        for (i, hosts) in self.hosts_per_subnet.iter().enumerate() {
            let subnet = i as u8 + 1;
            let switch = format!("s{subnet}");
            let interface = format!("r0-eth{subnet}");
            let quality = LinkQuality { delay_us: self.delay_us, ..Default::default() };

            topo.add_switch(&switch).unwrap();
            let options = LinkOptions::default().interface_a(&interface).quality(quality);
            topo.add_link("r0", &switch, options).unwrap();
            if subnet > 1 {
                extra.push(InterfaceAddress {
                    node: "r0".into(),
                    interface,
                    address: prefix(&format!("10.0.{subnet}.1/24")),
                });
            }

            for h in 0..*hosts {
                let host = format!("h{subnet}{h}");
                let addressing = Addressing::ip(prefix(&format!("10.0.{subnet}.{}/24", 10 + h)))
                    .default_route(Ipv4Addr::new(10, 0, subnet, 1));
                topo.add_host(&host, addressing).unwrap();
                topo.add_link(&host, &switch, LinkOptions::default()).unwrap();
            }
        }

        for p in 0..self.direct_pairs {
            let (a, b) = (format!("p{p}a"), format!("p{p}b"));
            topo.add_host(&a, Addressing::ip(prefix(&format!("192.168.{p}.1/30")))).unwrap();
            topo.add_host(&b, Addressing::ip(prefix(&format!("192.168.{p}.2/30")))).unwrap();
            topo.add_link(&a, &b, LinkOptions::default()).unwrap();
        }

        (topo, extra)
    }

    fn session_config(&self) -> (SessionConfig, Vec<InterfaceAddress>) {
        let (topology, extra) = self.build();
        let plan = ConditioningPlan::standard(&topology, &extra);
        let mut config = SessionConfig::new(topology).conditioning(plan);
        config.realize = RealizeOptions { static_arp: self.static_arp, ..Default::default() };
        (config, extra)
    }
}

/// Interfaces the substrate should hold for every node of `topo`.
fn check_interfaces(fake: &FakeSubstrate, topo: &Topology) -> Result<(), TestCaseError> {
    for node in topo.nodes() {
        let mut expected: Vec<String> = node.interfaces().to_vec();
        expected.push("lo".into());
        if node.kind == NodeKind::Switch {
            expected.push(node.name.clone());
        }
        expected.sort();
        prop_assert_eq!(fake.interface_names(&node.name), expected);
    }
    Ok(())
}

fn check_addresses(session: &Session, addresses: &[InterfaceAddress]) -> Result<(), TestCaseError> {
    for entry in addresses {
        let observed = session.observed_addresses(&entry.node, &entry.interface).unwrap();
        prop_assert_eq!(observed, vec![entry.address], "{}:{}", entry.node, entry.interface);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever state the session reached, stopping releases every node and link.
    #[test]
    fn every_element_is_realized_and_released(shape in lab_shape(), stop_after in 0usize..5) {
        let fake = Arc::new(FakeSubstrate::new());
        let lab = Lab::new(fake.clone());
        let (config, extra) = shape.session_config();
        let topo = config.topology.clone();
        let mut controller = lab.controller(config).unwrap();

        let report: TeardownReport = if stop_after == 4 {
            let mut idle = |_: &mut Session| -> lifecycle::Result<()> { Ok(()) };
            controller.run(&mut idle).unwrap().clone()
        } else {
            if stop_after >= 1 {
                controller.realize().unwrap();
                let session = controller.session().unwrap();
                prop_assert_eq!(session.node_count(), topo.nodes().len());
                prop_assert_eq!(session.link_count(), topo.links().len());
                prop_assert_eq!(fake.node_names().len(), topo.nodes().len());
                prop_assert_eq!(fake.links().len(), topo.links().len());
                check_interfaces(&fake, &topo)?;
                check_addresses(session, &topo.declared_addresses())?;

                for i in 1..=shape.hosts_per_subnet.len() {
                    let port = fake.interface("r0", &format!("r0-eth{i}")).unwrap();
                    prop_assert_eq!(port.netem.is_some(), shape.delay_us > 0);
                }
            }
            if stop_after >= 2 {
                controller.condition().unwrap();
                prop_assert!(controller.warnings().is_empty());
                check_addresses(controller.session().unwrap(), &extra)?;
            }
            if stop_after >= 3 {
                controller.start().unwrap();
                prop_assert_eq!(controller.state(), SessionState::Running);
            }
            controller.stop().clone()
        };

        prop_assert!(report.is_clean(), "{:?}", report.errors);
        prop_assert_eq!(controller.state(), SessionState::Stopped);
        prop_assert!(fake.is_empty());
        prop_assert!(!lab.is_active());

        let (nodes, links) =
            if stop_after == 0 { (0, 0) } else { (topo.nodes().len(), topo.links().len()) };
        prop_assert_eq!(report.nodes_released, nodes);
        prop_assert_eq!(report.links_released, links);
    }
}
