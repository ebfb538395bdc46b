//! CIDR address prefixes used to filter resolved addresses.

use std::{fmt, net::IpAddr, str::FromStr};

use crate::error::ConnectError;

/// An IP network prefix such as `10.0.0.0/8` or `2001:db8::/32`.
///
/// Host bits below the prefix length are kept as written and ignored when matching. An IPv4
/// prefix never contains an IPv6 address and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrPrefix {
    addr: IpAddr,
    bits: u8,
}

impl AddrPrefix {
    /// The prefix that disables filtering: `0.0.0.0/0`.
    pub const CATCH_ALL: Self =
        Self { addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), bits: 0 };

    /// Creates a prefix, rejecting lengths longer than the address family allows.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidPrefix`] if `bits` exceeds 32 for IPv4 or 128 for IPv6.
    pub fn new(addr: IpAddr, bits: u8) -> Result<Self, ConnectError> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(ConnectError::InvalidPrefix {
                prefix: format!("{addr}/{bits}"),
                message: format!("prefix length must be <= {max}"),
            });
        }
        Ok(Self { addr, bits })
    }

    /// Returns true for exactly `0.0.0.0/0`.
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        *self == Self::CATCH_ALL
    }

    /// Returns the prefix length.
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Returns whether `ip` falls inside this prefix.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.bits)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            },
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.bits)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            },
            _ => false,
        }
    }
}

impl Default for AddrPrefix {
    fn default() -> Self {
        Self::CATCH_ALL
    }
}

impl FromStr for AddrPrefix {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConnectError::InvalidPrefix {
            prefix: s.to_string(),
            message: message.to_string(),
        };

        let (addr, bits) = s.split_once('/').ok_or_else(|| invalid("no '/'"))?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid("bad IP address"))?;
        // Decimal digits only, no leading zeros.
        if bits.is_empty()
            || !bits.bytes().all(|b| b.is_ascii_digit())
            || (bits.len() > 1 && bits.starts_with('0'))
        {
            return Err(invalid("bad prefix length"));
        }
        let bits: u8 = bits.parse().map_err(|_| invalid("bad prefix length"))?;
        Self::new(addr, bits).map_err(|_| invalid("prefix length out of range"))
    }
}

impl fmt::Display for AddrPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}
