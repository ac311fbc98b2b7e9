//! Mesh subnet math and peer IP allocation

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// IPv4 network in CIDR notation, e.g. "100.64.0.0/16".
///
/// Host bits of the base address are masked off on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(Error::InvalidArgument(format!(
                "invalid prefix length /{prefix_len}"
            )));
        }
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        };
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix_len,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Number of assignable host addresses (network and broadcast excluded).
    pub fn usable_hosts(&self) -> u32 {
        let host_bits = 32 - u32::from(self.prefix_len);
        if host_bits < 2 {
            return 0;
        }
        (1u32 << host_bits) - 2
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        };
        u32::from(ip) & mask == self.network
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("invalid CIDR {s:?}: expected x.x.x.x/y")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid CIDR {s:?}: bad address")))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid CIDR {s:?}: bad prefix")))?;
        Cidr::new(addr, prefix_len)
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Cidr> for String {
    fn from(c: Cidr) -> Self {
        c.to_string()
    }
}

/// Picks a uniformly random assignable address from the subnet.
///
/// Reservation is the caller's job: the address is only claimed once the
/// peer row carrying it is inserted, and the unique constraint on
/// (account, ip) resolves races between concurrent registrations.
pub fn allocate_random_peer_ip(net: &Cidr) -> Result<Ipv4Addr> {
    let hosts = net.usable_hosts();
    if hosts == 0 {
        return Err(Error::InvalidArgument(format!(
            "network {net} has no assignable addresses"
        )));
    }
    let offset = rand::thread_rng().gen_range(1..=hosts);
    let ip = net
        .network
        .checked_add(offset)
        .ok_or_else(|| Error::internal(format!("address overflow in {net}")))?;
    Ok(Ipv4Addr::from(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let net: Cidr = "100.64.0.0/16".parse().unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(100, 64, 0, 0));
        assert_eq!(net.prefix_len(), 16);
        assert_eq!(net.to_string(), "100.64.0.0/16");
    }

    #[test]
    fn host_bits_are_masked() {
        let net: Cidr = "10.100.3.7/16".parse().unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(10, 100, 0, 0));
    }

    #[test]
    fn rejects_malformed() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn contains() {
        let net: Cidr = "100.64.0.0/16".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(100, 64, 3, 7)));
        assert!(!net.contains(Ipv4Addr::new(100, 65, 0, 1)));
    }

    #[test]
    fn allocation_stays_in_subnet() {
        let net: Cidr = "100.64.0.0/16".parse().unwrap();
        for _ in 0..1000 {
            let ip = allocate_random_peer_ip(&net).unwrap();
            assert!(net.contains(ip));
            assert_ne!(ip, net.network());
            assert_ne!(ip, Ipv4Addr::new(100, 64, 255, 255));
        }
    }

    #[test]
    fn tiny_subnets_have_no_hosts() {
        let net: Cidr = "10.0.0.0/31".parse().unwrap();
        assert!(allocate_random_peer_ip(&net).is_err());
    }
}
