//! Host identity: a validated textual IPv4/IPv6 address.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A validated host address. Malformed strings are rejected at parse
/// time rather than carried around as plain `String`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(IpAddr);

impl Host {
    pub fn as_ip(&self) -> IpAddr {
        self.0
    }
}

impl FromStr for Host {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpAddr::from_str(s.trim()).map(Host)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Host(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4_and_v6() {
        assert!("192.0.2.10".parse::<Host>().is_ok());
        assert!("2001:db8::1".parse::<Host>().is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!("not-a-host".parse::<Host>().is_err());
        assert!("999.999.999.999".parse::<Host>().is_err());
    }

    #[test]
    fn display_roundtrips() {
        let h: Host = "192.0.2.10".parse().unwrap();
        assert_eq!(h.to_string(), "192.0.2.10");
    }
}
