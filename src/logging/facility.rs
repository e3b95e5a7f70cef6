// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    /// Startup, CLI handling, capability check
    Main = 0,
    /// Configuration parsing and validation
    Config = 1,
    /// Task lifecycle, signals, shutdown ordering
    Supervisor = 2,
    /// Failover state machine, gateway promotion/demotion
    Controller = 3,
    /// Per-interface link state monitoring
    LinkMonitor = 4,
    /// Per-host ICMP echo probing
    IcmpMonitor = 5,
    /// Private route table synchronization
    RouteSync = 6,
    /// Netlink transport operations
    Netlink = 7,
    /// Up/down hook command execution
    Hook = 8,
    /// Test harness and fixtures
    Test = 9,
}

impl Facility {
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Main => "Main",
            Facility::Config => "Config",
            Facility::Supervisor => "Supervisor",
            Facility::Controller => "Controller",
            Facility::LinkMonitor => "LinkMonitor",
            Facility::IcmpMonitor => "IcmpMonitor",
            Facility::RouteSync => "RouteSync",
            Facility::Netlink => "Netlink",
            Facility::Hook => "Hook",
            Facility::Test => "Test",
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facility_display() {
        assert_eq!(format!("{}", Facility::Supervisor), "Supervisor");
        assert_eq!(format!("{}", Facility::IcmpMonitor), "IcmpMonitor");
    }
}
