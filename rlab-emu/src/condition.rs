//! Post-realization adjustments that the topology cannot express: disabling IPv6 and binding the
//! router's additional subnet addresses.
//!
//! Conditioning is best-effort. Every step of a [`ConditioningPlan`] is attempted, and a failing
//! step becomes a [`ConditioningWarning`] instead of stopping the others. Every action is
//! idempotent, so a plan can be applied twice with the same result.

use std::fmt::{self, Display};

use crate::{
    ip::{IpCommand, IpPrefix},
    session::Session,
    sysctl::{Ipv4, Ipv6Conf, Ipv6Scope, RawParam, SysctlParam},
    topology::{InterfaceAddress, Topology},
};

/// A typed node-local adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditioningAction {
    /// `sysctl -w net.ipv6.conf.<scope>.disable_ipv6=1`
    DisableIpv6(Ipv6Scope),
    /// Bind `address` to `interface`, keeping any address already there.
    AssignAddress { interface: String, address: IpPrefix },
    /// Write an arbitrary sysctl parameter.
    Sysctl { key: String, value: String },
}

impl ConditioningAction {
    /// Turn the kernel's own IPv4 forwarding on or off.
    pub fn kernel_forwarding(enabled: bool) -> Self {
        Self::Sysctl { key: Ipv4::Forwarding.key(), value: u8::from(enabled).to_string() }
    }

    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::DisableIpv6(scope) => Ipv6Conf::DisableIpv6(*scope).write_argv("1"),
            Self::AssignAddress { interface, address } => {
                IpCommand::ReplaceAddress { dev: interface.clone(), prefix: *address }.argv()
            }
            Self::Sysctl { key, value } => RawParam(key.clone()).write_argv(value),
        }
    }
}

impl Display for ConditioningAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DisableIpv6(scope) => write!(f, "disable IPv6 ({})", scope.as_str()),
            Self::AssignAddress { interface, address } => {
                write!(f, "assign {address} to {interface}")
            }
            Self::Sysctl { key, value } => write!(f, "set {key}={value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditioningStep {
    pub node: String,
    pub action: ConditioningAction,
}

/// A failed conditioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditioningWarning {
    pub node: String,
    pub action: ConditioningAction,
    pub cause: String,
}

impl Display for ConditioningWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} failed: {}", self.node, self.action, self.cause)
    }
}

/// Ordered list of conditioning steps.
///
/// ```
/// use rlab_emu::{condition::ConditioningPlan, topology::InterfaceAddress};
///
/// let extra = InterfaceAddress {
///     node: "r0".into(),
///     interface: "r0-eth2".into(),
///     address: "10.0.2.1/24".parse()?,
/// };
/// let plan = ConditioningPlan::new().assign_addresses(&[extra.clone()]);
/// assert_eq!(plan.extra_addresses(), [extra]);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditioningPlan {
    steps: Vec<ConditioningStep>,
}

impl ConditioningPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// IPv6 disabled on every scope of every node, then the `extra` addresses.
    pub fn standard(topology: &Topology, extra: &[InterfaceAddress]) -> Self {
        Self::new().disable_ipv6(topology).assign_addresses(extra)
    }

    pub fn step(mut self, node: impl Into<String>, action: ConditioningAction) -> Self {
        self.steps.push(ConditioningStep { node: node.into(), action });
        self
    }

    /// Disable IPv6 on the `all`, `default` and `lo` scopes of every node of `topology`.
    pub fn disable_ipv6(mut self, topology: &Topology) -> Self {
        for node in topology.nodes() {
            for scope in Ipv6Scope::ALL {
                self = self.step(&node.name, ConditioningAction::DisableIpv6(scope));
            }
        }
        self
    }

    pub fn assign_addresses(mut self, addresses: &[InterfaceAddress]) -> Self {
        for entry in addresses {
            let action = ConditioningAction::AssignAddress {
                interface: entry.interface.clone(),
                address: entry.address,
            };
            self = self.step(&entry.node, action);
        }
        self
    }

    pub fn steps(&self) -> &[ConditioningStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The addresses this plan assigns.
    pub fn extra_addresses(&self) -> Vec<InterfaceAddress> {
        self.steps
            .iter()
            .filter_map(|step| match &step.action {
                ConditioningAction::AssignAddress { interface, address } => Some(InterfaceAddress {
                    node: step.node.clone(),
                    interface: interface.clone(),
                    address: *address,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Apply every step of `plan` to the session's nodes, in order. Returns one warning per failed
/// step; successful address assignments are recorded in the session's address table.
pub fn condition(session: &mut Session, plan: &ConditioningPlan) -> Vec<ConditioningWarning> {
    let mut warnings = Vec::new();

    for ConditioningStep { node, action } in plan.steps() {
        let _span = tracing::debug_span!("condition", %node, %action).entered();

        match session.exec(node, &action.argv()) {
            Ok(_) => {
                if let ConditioningAction::AssignAddress { interface, address } = action {
                    session.record_address(InterfaceAddress {
                        node: node.clone(),
                        interface: interface.clone(),
                        address: *address,
                    });
                }
            }
            Err(e) => {
                let warning = ConditioningWarning {
                    node: node.clone(),
                    action: action.clone(),
                    cause: e.to_string(),
                };
                tracing::warn!(%warning, "conditioning step failed");
                warnings.push(warning);
            }
        }
    }

    tracing::info!(steps = plan.steps().len(), warnings = warnings.len(), "session conditioned");
    warnings
}
