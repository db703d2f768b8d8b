//! IPv4/IPv6 addresses with prefix lengths
//!
//! Addresses keep their host bits (unlike a pure network type): a NAT pool
//! base is `10.0.0.1/32 + offset`, an L3 address is a host address, and a
//! gateway candidate carries the prefix of its subnet.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::errors::{Error, ErrorKind, Result};

/// Address family of a [`NetAddr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Prefix width of the family in bits
    pub fn width(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

/// An address plus prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    ip: IpAddr,
    prefix: u8,
}

impl NetAddr {
    pub fn new(ip: IpAddr, prefix: u8) -> Result<Self> {
        let width = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > width {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("prefix /{} too long for {}", prefix, ip),
            ));
        }
        Ok(Self { ip, prefix })
    }

    /// A host address: full-width prefix
    pub fn host_addr(ip: IpAddr) -> Self {
        let prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { ip, prefix }
    }

    /// Parse `addr` or `addr/prefix`; a bare address is a host address
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('/') {
            let net = IpNetwork::from_str(s)
                .map_err(|e| Error::new(ErrorKind::InvalidValue, format!("invalid address {}: {}", s, e)))?;
            Ok(Self {
                ip: net.ip(),
                prefix: net.prefix(),
            })
        } else {
            let ip = IpAddr::from_str(s)
                .map_err(|_| Error::new(ErrorKind::InvalidValue, format!("invalid address {}", s)))?;
            Ok(Self::host_addr(ip))
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn family(&self) -> Family {
        match self.ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn is_host(&self) -> bool {
        self.prefix == self.family().width()
    }

    /// Raw address bytes, big endian
    pub fn octets(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    fn to_u128(self) -> u128 {
        match self.ip {
            IpAddr::V4(v4) => u32::from(v4) as u128,
            IpAddr::V6(v6) => u128::from(v6),
        }
    }

    fn with_value(&self, value: u128) -> Self {
        let ip = match self.ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
        };
        Self {
            ip,
            prefix: self.prefix,
        }
    }

    /// Address arithmetic over the raw bytes; wraps within the family
    pub fn add_offset(&self, offset: u64) -> Self {
        let value = self.to_u128().wrapping_add(offset as u128);
        let value = match self.ip {
            IpAddr::V4(_) => value & u32::MAX as u128,
            IpAddr::V6(_) => value,
        };
        self.with_value(value)
    }

    /// Distance from `base`, saturating at zero for addresses below it
    pub fn offset_from(&self, base: &NetAddr) -> u64 {
        self.to_u128().saturating_sub(base.to_u128()) as u64
    }

    /// Whether `other`'s address falls inside this address's prefix
    pub fn prefix_contains(&self, other: &NetAddr) -> bool {
        if self.family() != other.family() {
            return false;
        }
        match IpNetwork::new(self.ip, self.prefix) {
            Ok(net) => net.contains(other.ip),
            Err(_) => false,
        }
    }

    /// The same address forced to a host prefix (/32 or /128)
    pub fn host(&self) -> Self {
        Self::host_addr(self.ip)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}/{}", self.ip, self.prefix)
        }
    }
}

impl FromStr for NetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NetAddr::parse(s)
    }
}
