//! Addressing value types and the `ip(8)` commands used to configure interfaces.

use std::{
    fmt::{self, Display},
    net::Ipv4Addr,
    str::FromStr,
};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Maximum length of a Linux interface name (`IFNAMSIZ - 1`).
pub const IFNAME_MAX_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid address/prefix: {0:?}")]
    InvalidPrefix(String),
    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),
}

/// An IPv4 interface address together with its prefix length, e.g. `10.0.1.10/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl IpPrefix {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidPrefix(format!("{address}/{prefix_len}")));
        }

        Ok(Self { address, prefix_len })
    }

    /// The netmask in dotted form, e.g. `255.255.255.0` for a `/24`.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// The network address, i.e. the address with its host bits cleared.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask_bits())
    }

    /// Whether `address` falls inside this prefix's subnet.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & self.mask_bits() == u32::from(self.network())
    }

    fn mask_bits(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }
}

impl Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidPrefix(s.to_string());
        let (address, prefix_len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address = address.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        let prefix_len = prefix_len.parse::<u8>().map_err(|_| invalid())?;

        Self::new(address, prefix_len).map_err(|_| invalid())
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(value: IpPrefix) -> Self {
        value.to_string()
    }
}

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The address whose 48 bits encode `index`, e.g. `3` is `00:00:00:00:00:03`.
    pub fn from_index(index: u64) -> Self {
        let bytes = index.to_be_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);
        Self(mac)
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidMac(s.to_string());
        let mut mac = [0u8; 6];
        let mut parts = s.trim().split(':');

        for byte in mac.iter_mut() {
            let part = parts.next().filter(|p| p.len() == 2).ok_or_else(invalid)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(mac))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(value: MacAddr) -> Self {
        value.to_string()
    }
}

/// Hands out MAC addresses sequentially from `00:00:00:00:00:01`, never repeating one that was
/// reserved or handed out before.
#[derive(Debug)]
pub struct MacAllocator {
    taken: FxHashSet<MacAddr>,
    next: u64,
}

impl Default for MacAllocator {
    fn default() -> Self {
        Self { taken: FxHashSet::default(), next: 1 }
    }
}

impl MacAllocator {
    /// Mark an explicitly configured address as used.
    pub fn reserve(&mut self, mac: MacAddr) {
        self.taken.insert(mac);
    }

    pub fn allocate(&mut self) -> MacAddr {
        loop {
            let mac = MacAddr::from_index(self.next);
            self.next += 1;
            if self.taken.insert(mac) {
                return mac;
            }
        }
    }
}

/// The `ip(8)` invocations issued inside node contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpCommand {
    /// `ip link set dev <dev> up`
    LinkUp { dev: String },
    /// `ip link set dev <dev> address <mac>`
    SetMac { dev: String, mac: MacAddr },
    /// `ip link add name <name> type bridge`
    AddBridge { name: String },
    /// `ip link set dev <dev> master <bridge>`
    AttachToBridge { dev: String, bridge: String },
    /// `ip addr add <prefix> dev <dev>`
    AddAddress { dev: String, prefix: IpPrefix },
    /// `ip addr replace <prefix> dev <dev>`, which does not fail if the address is present.
    ReplaceAddress { dev: String, prefix: IpPrefix },
    /// `ip -4 -o addr show dev <dev>`
    ShowAddresses { dev: String },
    /// `ip route replace default via <gateway>`
    DefaultRoute { via: Ipv4Addr },
    /// `ip neigh replace <address> lladdr <mac> dev <dev> nud permanent`
    StaticNeighbor { dev: String, address: Ipv4Addr, mac: MacAddr },
}

impl IpCommand {
    pub fn argv(&self) -> Vec<String> {
        let args: Vec<String> = match self {
            Self::LinkUp { dev } => {
                vec!["link".into(), "set".into(), "dev".into(), dev.clone(), "up".into()]
            }
            Self::SetMac { dev, mac } => vec![
                "link".into(),
                "set".into(),
                "dev".into(),
                dev.clone(),
                "address".into(),
                mac.to_string(),
            ],
            Self::AddBridge { name } => vec![
                "link".into(),
                "add".into(),
                "name".into(),
                name.clone(),
                "type".into(),
                "bridge".into(),
            ],
            Self::AttachToBridge { dev, bridge } => vec![
                "link".into(),
                "set".into(),
                "dev".into(),
                dev.clone(),
                "master".into(),
                bridge.clone(),
            ],
            Self::AddAddress { dev, prefix } => {
                vec!["addr".into(), "add".into(), prefix.to_string(), "dev".into(), dev.clone()]
            }
            Self::ReplaceAddress { dev, prefix } => {
                vec!["addr".into(), "replace".into(), prefix.to_string(), "dev".into(), dev.clone()]
            }
            Self::ShowAddresses { dev } => vec![
                "-4".into(),
                "-o".into(),
                "addr".into(),
                "show".into(),
                "dev".into(),
                dev.clone(),
            ],
            Self::DefaultRoute { via } => vec![
                "route".into(),
                "replace".into(),
                "default".into(),
                "via".into(),
                via.to_string(),
            ],
            Self::StaticNeighbor { dev, address, mac } => vec![
                "neigh".into(),
                "replace".into(),
                address.to_string(),
                "lladdr".into(),
                mac.to_string(),
                "dev".into(),
                dev.clone(),
                "nud".into(),
                "permanent".into(),
            ],
        };

        std::iter::once("ip".to_string()).chain(args).collect()
    }
}

impl Display for IpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Extract the IPv4 addresses from `ip -4 -o addr show` output.
///
/// Each line looks like
/// `2: r0-eth1    inet 10.0.1.1/24 brd 10.0.1.255 scope global r0-eth1\       valid_lft ...`.
pub fn parse_inet_addresses(stdout: &str) -> Vec<IpPrefix> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet")?;
            tokens.next()?.parse().ok()
        })
        .collect()
}
