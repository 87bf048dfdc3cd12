//! Typed kernel network parameters applied inside node contexts.
//!
//! These parameters are **per-namespace**: writing one inside a node's context affects only that
//! node. They are written with `sysctl -w <key>=<value>` through the substrate's command
//! execution, so a failure is attributed to the node and parameter that caused it.
//!
//! ```
//! use rlab_emu::sysctl::{Ipv6Conf, Ipv6Scope, SysctlParam};
//!
//! let param = Ipv6Conf::DisableIpv6(Ipv6Scope::All);
//! assert_eq!(param.key(), "net.ipv6.conf.all.disable_ipv6");
//! assert_eq!(param.write_argv("1"), ["sysctl", "-w", "net.ipv6.conf.all.disable_ipv6=1"]);
//! ```

/// A sysctl parameter, addressed by its dotted key.
pub trait SysctlParam {
    /// The dotted key, e.g. `net.ipv4.ip_forward`.
    fn key(&self) -> String;

    /// The `/proc/sys` path backing the key.
    fn path(&self) -> String {
        format!("/proc/sys/{}", self.key().replace('.', "/"))
    }

    /// The argv writing `value` to this parameter.
    fn write_argv(&self, value: &str) -> Vec<String> {
        vec!["sysctl".to_string(), "-w".to_string(), format!("{}={value}", self.key())]
    }
}

/// Which `net.ipv6.conf.<scope>` tree a parameter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ipv6Scope {
    /// Every interface currently present.
    All,
    /// Interfaces created after the write.
    Default,
    /// The loopback interface.
    Loopback,
}

impl Ipv6Scope {
    /// Every scope, in the order they are usually written.
    pub const ALL: [Self; 3] = [Self::All, Self::Default, Self::Loopback];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Default => "default",
            Self::Loopback => "lo",
        }
    }
}

/// IPv6 per-scope parameters under `net.ipv6.conf.<scope>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Ipv6Conf {
    /// `disable_ipv6`: `1` removes the IPv6 stack from the scope.
    DisableIpv6(Ipv6Scope),
}

impl SysctlParam for Ipv6Conf {
    fn key(&self) -> String {
        match self {
            Self::DisableIpv6(scope) => format!("net.ipv6.conf.{}.disable_ipv6", scope.as_str()),
        }
    }
}

/// IPv4 parameters under `net.ipv4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Ipv4 {
    /// `ip_forward`: kernel forwarding between interfaces. Left off by default so that only the
    /// forwarding program under test moves packets between subnets.
    Forwarding,
}

impl SysctlParam for Ipv4 {
    fn key(&self) -> String {
        match self {
            Self::Forwarding => "net.ipv4.ip_forward".to_string(),
        }
    }
}

/// A parameter given by its raw key, for anything not covered by the typed enums.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawParam(pub String);

impl SysctlParam for RawParam {
    fn key(&self) -> String {
        self.0.clone()
    }
}
