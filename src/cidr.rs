use std::fmt;
use std::net::IpAddr;

/// An IP network: base address plus prefix length. Prefix lengths run
/// 0..=32 for IPv4 and 0..=128 for IPv6; the lexer enforces the range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    address: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(address: IpAddr, prefix: u8) -> Self {
        Self { address, prefix }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The widest prefix length valid for the given address family.
    pub fn max_prefix(address: &IpAddr) -> u8 {
        match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Tests whether `addr` falls inside this network. Addresses of a
    /// different family are never contained.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask32(self.prefix);
                u32::from(*ip) & mask == u32::from(net) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask128(self.prefix);
                u128::from(*ip) & mask == u128::from(net) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix.min(32)))
    }
}

fn prefix_mask128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        !0u128 << (128 - u32::from(prefix.min(128)))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn cidr(addr: &str, prefix: u8) -> Cidr {
        Cidr::new(ip(addr), prefix)
    }

    #[test]
    fn contains_non_byte_aligned_v4_prefix() {
        // 10.0.0.0/12 spans 10.0.0.0 - 10.15.255.255.
        let net = cidr("10.0.0.0", 12);
        assert!(net.contains(&ip("10.0.0.1")));
        assert!(net.contains(&ip("10.15.255.255")));
        assert!(!net.contains(&ip("10.16.0.0")));
        assert!(!net.contains(&ip("11.0.0.0")));
    }

    #[test]
    fn full_prefix_matches_address_equality() {
        let addr = ip("192.168.1.7");
        let net = Cidr::new(addr, 32);
        assert!(net.contains(&addr));
        assert!(!net.contains(&ip("192.168.1.8")));

        let addr6 = ip("fe80::1");
        let net6 = Cidr::new(addr6, 128);
        assert!(net6.contains(&addr6));
        assert!(!net6.contains(&ip("fe80::2")));
    }

    #[test]
    fn zero_prefix_contains_everything_in_family() {
        let any4 = cidr("0.0.0.0", 0);
        assert!(any4.contains(&ip("255.255.255.255")));
        assert!(!any4.contains(&ip("::1")));
    }

    #[test]
    fn v6_prefix_on_word_boundary() {
        let net = cidr("2001:db8::", 32);
        assert!(net.contains(&ip("2001:db8::1")));
        assert!(net.contains(&ip("2001:db8:ffff::")));
        assert!(!net.contains(&ip("2001:db9::")));
    }

    #[test]
    fn family_mismatch_is_never_contained() {
        let net = cidr("10.0.0.0", 8);
        assert!(!net.contains(&ip("::ffff:10.0.0.1")));
    }

    #[test]
    fn display_round_trip() {
        assert_eq!(cidr("10.0.0.0", 12).to_string(), "10.0.0.0/12");
        assert_eq!(cidr("fe80::", 10).to_string(), "fe80::/10");
    }
}
