//! End-to-end tests on real network namespaces. They need root and `ip`, and skip otherwise.

use std::sync::Arc;

use rlab_emu::{
    config::LabConfig,
    lifecycle::{self, Lab, SessionState},
    namespace::{NetnsSubstrate, Sudo},
    session::Session,
    test_util::check_privileges,
};

/// Guard that requires privileges.
fn require_privileged_env() -> Option<Arc<NetnsSubstrate>> {
    let _ = tracing_subscriber::fmt::try_init();
    if !check_privileges() {
        eprintln!("Skipping test: requires root/netns privileges");
        return None;
    }

    Some(Arc::new(NetnsSubstrate::new(Sudo::Never)))
}

/// The three-subnet lab with the kernel forwarding between subnets, and an idle process standing
/// in for the forwarding program.
fn kernel_forwarded_lab() -> lifecycle::SessionConfig {
    let mut config = LabConfig::three_subnets();
    config.conditioning.kernel_forwarding = true;
    if let Some(forwarding) = config.forwarding.as_mut() {
        forwarding.program = "sleep".into();
        forwarding.args = vec!["600".into()];
        forwarding.log =
            std::env::temp_dir().join(format!("rlab-netns-{}.log", std::process::id()));
    }

    config.session_config().unwrap()
}

#[test]
fn h1_pings_h2_across_the_router() {
    let Some(substrate) = require_privileged_env() else { return };
    let lab = Lab::new(substrate.clone());
    let mut controller = lab.controller(kernel_forwarded_lab()).unwrap();

    let report = controller
        .run(&mut |session: &mut Session| -> lifecycle::Result<()> {
            for i in 1..=3 {
                let observed = session.observed_addresses("r0", &format!("r0-eth{i}"))?;
                assert_eq!(observed.len(), 1, "r0-eth{i}: {observed:?}");
            }

            let ping = ["ping", "-c", "1", "-W", "2", "10.0.2.10"].map(String::from);
            let output = session.exec("h1", &ping)?;
            assert!(output.stdout.contains("1 received"), "{}", output.stdout);

            let path = session.l3_path("h1", "10.0.2.10".parse().unwrap()).unwrap();
            assert!(path.iter().any(|hop| hop.node == "r0"));
            Ok(())
        })
        .unwrap();

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(substrate.live_namespaces().unwrap().is_empty());
}

#[test]
fn failed_realization_leaks_no_namespace() {
    let Some(substrate) = require_privileged_env() else { return };
    let lab = Lab::new(substrate.clone());

    // netem rejects a loss above 100%, after both ends of the pair exist.
    let mut config = LabConfig::three_subnets();
    config.links[4].quality.loss_percent = 250.0;
    let mut controller = lab.controller(config.session_config().unwrap()).unwrap();

    assert!(controller.realize().is_err());
    assert_eq!(controller.state(), SessionState::Stopped);
    assert!(substrate.live_namespaces().unwrap().is_empty());
}
