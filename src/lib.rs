// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Policy-routed multi-WAN failover daemon.
//!
//! The daemon monitors uplink interfaces through rtnetlink and probes a set
//! of hosts per uplink with ICMP echo bursts. Reachability counts drive a
//! per-(interface, family) state machine that installs policy rules, copies
//! default-gateway routes between a private routing table and the main table
//! (at an administrator-chosen metric) and runs hook commands on up/down
//! transitions.

pub mod config;
pub mod icmp;
pub mod linkstate;
pub mod logging;
pub mod netlink;
pub mod routesync;
pub mod supervisor;

use rtnetlink::packet_route::AddressFamily;
use rtnetlink::IpVersion;

pub use config::Config;

/// Address family of a probed host, a counter or a kernel route.
///
/// Counters, hook invocations and gateway routes are all maintained per
/// family; the two families of one interface fail over independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Name used in hook environments and log lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        }
    }

    pub const fn address_family(self) -> AddressFamily {
        match self {
            Family::V4 => AddressFamily::Inet,
            Family::V6 => AddressFamily::Inet6,
        }
    }

    pub const fn ip_version(self) -> IpVersion {
        match self {
            Family::V4 => IpVersion::V4,
            Family::V6 => IpVersion::V6,
        }
    }

    /// Prefix length of a single-host route or rule selector.
    pub const fn host_prefix_len(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    pub fn of(addr: &std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(_) => Family::V4,
            std::net::IpAddr::V6(_) => Family::V6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_strings() {
        assert_eq!(Family::V4.as_str(), "IPv4");
        assert_eq!(Family::V6.as_str(), "IPv6");
    }

    #[test]
    fn test_family_prefix_lengths() {
        assert_eq!(Family::V4.host_prefix_len(), 32);
        assert_eq!(Family::V6.host_prefix_len(), 128);
    }

    #[test]
    fn test_family_of_addr() {
        assert_eq!(Family::of(&"192.0.2.1".parse().unwrap()), Family::V4);
        assert_eq!(Family::of(&"2001:db8::1".parse().unwrap()), Family::V6);
    }
}
