// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for failoverd.
//!
//! TOML configuration with strict decoding (unknown keys are rejected).
//! The raw file structs are decoded first and then validated into the
//! runtime `Config`/`Interface`/`Host` model; probe parameters cascade
//! from the global scope to interfaces to hosts.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Family;

pub const DEF_MINIMUM_UP: usize = 1;
pub const BURST_SIZE_MIN: usize = 1;
pub const BURST_SIZE_MAX: usize = 5;
pub const METRIC_MIN: u32 = 1;
pub const METRIC_MAX: u32 = 32764;

/// Reserved kernel tables that may not be used as a private interface table.
pub const RT_TABLE_MAIN: u32 = 254;
pub const RT_TABLE_LOCAL: u32 = 255;

pub const DEF_BURST_SIZE: usize = 3;
pub const DEF_BURST_INTERVAL: Duration = Duration::from_secs(15);
pub const DEF_ICMP_INTERVAL: Duration = Duration::from_secs(2);
pub const DEF_ICMP_TIMEOUT: Duration = Duration::from_millis(250);

/// Top level of the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CfgFile {
    /// Enable debug logging for the whole daemon
    debug: Option<bool>,

    /// Interval between probe bursts (default 15s)
    #[serde(skip_serializing_if = "Option::is_none")]
    burst_interval: Option<String>,
    /// Echo requests per burst (default 3)
    #[serde(skip_serializing_if = "Option::is_none")]
    burst_size: Option<i64>,
    /// Spacing between echo requests within a burst (default 2s)
    #[serde(skip_serializing_if = "Option::is_none")]
    icmp_interval: Option<String>,
    /// Reply timeout per echo request (default 250ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    icmp_timeout: Option<String>,

    /// Command to run when an interface family comes up
    #[serde(skip_serializing_if = "Option::is_none")]
    up_action: Option<String>,
    /// Command to run when an interface family goes down
    #[serde(skip_serializing_if = "Option::is_none")]
    down_action: Option<String>,

    #[serde(default)]
    interfaces: Vec<CfgInterface>,
}

/// Interface section as stored in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CfgInterface {
    /// Interface name (as seen in `ip link ls`)
    name: String,
    /// Free-form description, exported to hooks
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    /// Enable debug logging for this interface
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<bool>,

    /// Private routing table number for this interface
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<i64>,
    /// Metric for gateway routes promoted into the main table
    #[serde(skip_serializing_if = "Option::is_none")]
    metric: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    up_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    down_action: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    burst_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    burst_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icmp_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icmp_timeout: Option<String>,
    /// Hosts that must be reachable for a family of this interface to be
    /// considered up (default 1)
    #[serde(skip_serializing_if = "Option::is_none")]
    minimum_up: Option<i64>,

    #[serde(default)]
    hosts: Vec<CfgHost>,
}

/// Host section as stored in the config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CfgHost {
    /// Display name, defaults to the host address
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// IP literal to probe
    host: String,
    /// Enable debug logging for this host
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    burst_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    burst_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icmp_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icmp_timeout: Option<String>,
}

/// Validated runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub debug: bool,

    pub burst_interval: Duration,
    pub burst_size: usize,
    pub icmp_interval: Duration,
    pub icmp_timeout: Duration,

    pub up_action: String,
    pub down_action: String,

    pub interfaces: Vec<Interface>,
}

/// An `Interface` provides configuration for an individual uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub name: String,
    pub description: String,
    pub debug: bool,

    /// Private routing table, 0 when none is configured
    pub table: u32,
    /// Promotion metric, 0 when unset
    pub metric: u32,
    pub up_action: String,
    pub down_action: String,

    pub burst_interval: Duration,
    pub burst_size: usize,
    pub icmp_interval: Duration,
    pub icmp_timeout: Duration,

    pub minimum_up: usize,
    pub total_hosts4: usize,
    pub total_hosts6: usize,

    pub hosts: Vec<Host>,
}

impl Interface {
    /// Families that have at least one probe host configured.
    pub fn families(&self) -> Vec<Family> {
        let mut out = Vec::new();
        if self.total_hosts4 > 0 {
            out.push(Family::V4);
        }
        if self.total_hosts6 > 0 {
            out.push(Family::V6);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub addr: IpAddr,
    pub family: Family,
    pub debug: bool,

    pub burst_interval: Duration,
    pub burst_size: usize,
    pub icmp_interval: Duration,
    pub icmp_timeout: Duration,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let cfg: CfgFile =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if cfg.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }

        let burst_size = match cfg.burst_size {
            None => DEF_BURST_SIZE,
            Some(v) => parse_burst_size(v, "global")?,
        };

        let mut config = Config {
            debug: cfg.debug.unwrap_or(false),
            burst_interval: parse_duration_opt(&cfg.burst_interval, DEF_BURST_INTERVAL)?,
            burst_size,
            icmp_interval: parse_duration_opt(&cfg.icmp_interval, DEF_ICMP_INTERVAL)?,
            icmp_timeout: parse_duration_opt(&cfg.icmp_timeout, DEF_ICMP_TIMEOUT)?,
            up_action: cfg.up_action.unwrap_or_default(),
            down_action: cfg.down_action.unwrap_or_default(),
            interfaces: Vec::with_capacity(cfg.interfaces.len()),
        };

        let mut seen = HashSet::new();
        for raw in &cfg.interfaces {
            let ifi = parse_interface(raw, &config)?;
            if !seen.insert(ifi.name.clone()) {
                return Err(ConfigError::DuplicateInterface {
                    name: ifi.name.clone(),
                });
            }
            config.interfaces.push(ifi);
        }

        Ok(config)
    }

    /// Serialize back to TOML. Parsing the output yields an equivalent model.
    pub fn to_toml(&self) -> String {
        let cfg = CfgFile {
            debug: Some(self.debug),
            burst_interval: Some(format_duration(self.burst_interval)),
            burst_size: Some(self.burst_size as i64),
            icmp_interval: Some(format_duration(self.icmp_interval)),
            icmp_timeout: Some(format_duration(self.icmp_timeout)),
            up_action: Some(self.up_action.clone()),
            down_action: Some(self.down_action.clone()),
            interfaces: self
                .interfaces
                .iter()
                .map(|ifi| CfgInterface {
                    name: ifi.name.clone(),
                    description: Some(ifi.description.clone()),
                    debug: Some(ifi.debug),
                    table: (ifi.table != 0).then_some(ifi.table as i64),
                    metric: (ifi.metric != 0).then_some(ifi.metric as i64),
                    up_action: Some(ifi.up_action.clone()),
                    down_action: Some(ifi.down_action.clone()),
                    burst_interval: Some(format_duration(ifi.burst_interval)),
                    burst_size: Some(ifi.burst_size as i64),
                    icmp_interval: Some(format_duration(ifi.icmp_interval)),
                    icmp_timeout: Some(format_duration(ifi.icmp_timeout)),
                    minimum_up: Some(ifi.minimum_up as i64),
                    hosts: ifi
                        .hosts
                        .iter()
                        .map(|host| CfgHost {
                            name: Some(host.name.clone()),
                            host: host.addr.to_string(),
                            debug: Some(host.debug),
                            burst_interval: Some(format_duration(host.burst_interval)),
                            burst_size: Some(host.burst_size as i64),
                            icmp_interval: Some(format_duration(host.icmp_interval)),
                            icmp_timeout: Some(format_duration(host.icmp_timeout)),
                        })
                        .collect(),
                })
                .collect(),
        };
        toml::to_string_pretty(&cfg).unwrap_or_default()
    }

    /// The commented example configuration printed by `--example`.
    pub fn example() -> &'static str {
        EXAMPLE_CONFIG
    }
}

fn parse_interface(cfg: &CfgInterface, parent: &Config) -> Result<Interface, ConfigError> {
    let mut ifi = Interface {
        name: cfg.name.clone(),
        description: cfg.description.clone().unwrap_or_default(),
        debug: cfg.debug.unwrap_or(false),

        table: 0,
        metric: 0,
        up_action: cfg
            .up_action
            .clone()
            .unwrap_or_else(|| parent.up_action.clone()),
        down_action: cfg
            .down_action
            .clone()
            .unwrap_or_else(|| parent.down_action.clone()),

        burst_interval: parse_duration_opt(&cfg.burst_interval, parent.burst_interval)?,
        burst_size: match cfg.burst_size {
            None => parent.burst_size,
            Some(v) => parse_burst_size(v, &cfg.name)?,
        },
        icmp_interval: parse_duration_opt(&cfg.icmp_interval, parent.icmp_interval)?,
        icmp_timeout: parse_duration_opt(&cfg.icmp_timeout, parent.icmp_timeout)?,

        minimum_up: DEF_MINIMUM_UP,
        total_hosts4: 0,
        total_hosts6: 0,

        hosts: Vec::with_capacity(cfg.hosts.len()),
    };

    if ifi.name.is_empty() {
        return Err(ConfigError::MissingInterfaceName);
    }

    if let Some(table) = cfg.table {
        if table < 1 || table > u32::MAX as i64 {
            return Err(ConfigError::InvalidTable { table });
        }
        if table == RT_TABLE_LOCAL as i64 || table == RT_TABLE_MAIN as i64 {
            return Err(ConfigError::ReservedTable { table });
        }
        ifi.table = table as u32;
    }

    if let Some(metric) = cfg.metric {
        if metric < METRIC_MIN as i64 || metric > METRIC_MAX as i64 {
            return Err(ConfigError::InvalidMetric { metric });
        }
        if ifi.table == 0 {
            // gateway promotion needs the private table to copy from
            return Err(ConfigError::MetricWithoutTable {
                name: ifi.name.clone(),
            });
        }
        ifi.metric = metric as u32;
    }

    if let Some(minimum_up) = cfg.minimum_up {
        if minimum_up < 1 || minimum_up > cfg.hosts.len() as i64 {
            return Err(ConfigError::InvalidMinimumUp {
                value: minimum_up,
                hosts: cfg.hosts.len(),
            });
        }
        ifi.minimum_up = minimum_up as usize;
    }

    let mut seen = HashSet::new();
    for raw in &cfg.hosts {
        let host = parse_host(raw, &ifi)?;
        if !seen.insert(host.addr) {
            return Err(ConfigError::DuplicateHost {
                interface: ifi.name.clone(),
                host: host.addr.to_string(),
            });
        }
        match host.family {
            Family::V4 => ifi.total_hosts4 += 1,
            Family::V6 => ifi.total_hosts6 += 1,
        }
        ifi.hosts.push(host);
    }

    Ok(ifi)
}

fn parse_host(cfg: &CfgHost, parent: &Interface) -> Result<Host, ConfigError> {
    let addr: IpAddr = cfg.host.parse().map_err(|_| ConfigError::InvalidHost {
        interface: parent.name.clone(),
        host: cfg.host.clone(),
    })?;

    Ok(Host {
        name: cfg
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| addr.to_string()),
        addr,
        family: Family::of(&addr),
        debug: cfg.debug.unwrap_or(false),

        burst_interval: parse_duration_opt(&cfg.burst_interval, parent.burst_interval)?,
        burst_size: match cfg.burst_size {
            None => parent.burst_size,
            Some(v) => parse_burst_size(v, &cfg.host)?,
        },
        icmp_interval: parse_duration_opt(&cfg.icmp_interval, parent.icmp_interval)?,
        icmp_timeout: parse_duration_opt(&cfg.icmp_timeout, parent.icmp_timeout)?,
    })
}

fn parse_burst_size(value: i64, context: &str) -> Result<usize, ConfigError> {
    if value < BURST_SIZE_MIN as i64 || value > BURST_SIZE_MAX as i64 {
        return Err(ConfigError::InvalidBurstSize {
            value,
            context: context.to_string(),
        });
    }
    Ok(value as usize)
}

/// Parse a duration value such as "250ms", "15s", "2m" or "1h".
/// A missing key falls back to the given default.
fn parse_duration_opt(value: &Option<String>, def: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(def),
        Some(s) => parse_duration(s),
    }
}

pub(crate) fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let err = || ConfigError::InvalidDuration {
        value: s.to_string(),
    };

    // check "ms" before "s", the latter is a suffix of the former
    let (digits, scale) = if let Some(v) = s.strip_suffix("ms") {
        (v, Duration::from_millis(1))
    } else if let Some(v) = s.strip_suffix('s') {
        (v, Duration::from_secs(1))
    } else if let Some(v) = s.strip_suffix('m') {
        (v, Duration::from_secs(60))
    } else if let Some(v) = s.strip_suffix('h') {
        (v, Duration::from_secs(3600))
    } else {
        return Err(err());
    };

    let n: u32 = digits.parse().map_err(|_| err())?;
    if n == 0 {
        return Err(err());
    }
    scale.checked_mul(n).ok_or_else(err)
}

pub(crate) fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    NoInterfaces,
    MissingInterfaceName,
    DuplicateInterface { name: String },
    DuplicateHost { interface: String, host: String },
    InvalidTable { table: i64 },
    ReservedTable { table: i64 },
    InvalidMetric { metric: i64 },
    MetricWithoutTable { name: String },
    InvalidMinimumUp { value: i64, hosts: usize },
    InvalidBurstSize { value: i64, context: String },
    InvalidHost { interface: String, host: String },
    InvalidDuration { value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(f, "failed to read config file '{}': {}", path.display(), msg)
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::NoInterfaces => write!(f, "no interfaces configured"),
            ConfigError::MissingInterfaceName => write!(f, "interface without a name"),
            ConfigError::DuplicateInterface { name } => {
                write!(f, "interface '{}' appears multiple times", name)
            }
            ConfigError::DuplicateHost { interface, host } => {
                write!(
                    f,
                    "host '{}' appears multiple times for interface '{}'",
                    host, interface
                )
            }
            ConfigError::InvalidTable { table } => {
                write!(f, "table {} out of range, must be in [1, {}]", table, u32::MAX)
            }
            ConfigError::ReservedTable { table } => {
                write!(f, "table {} is a reserved kernel table", table)
            }
            ConfigError::InvalidMetric { metric } => {
                write!(
                    f,
                    "metric {} out of range, must be in [{}, {}]",
                    metric, METRIC_MIN, METRIC_MAX
                )
            }
            ConfigError::MetricWithoutTable { name } => {
                write!(
                    f,
                    "interface '{}': metric requires a non-zero table",
                    name
                )
            }
            ConfigError::InvalidMinimumUp { value, hosts } => {
                write!(
                    f,
                    "minimum_up {} out of range, must be in [1, {}]",
                    value, hosts
                )
            }
            ConfigError::InvalidBurstSize { value, context } => {
                write!(
                    f,
                    "burst_size {} in '{}' out of range, must be in [{}, {}]",
                    value, context, BURST_SIZE_MIN, BURST_SIZE_MAX
                )
            }
            ConfigError::InvalidHost { interface, host } => {
                write!(
                    f,
                    "host address '{}' on interface '{}' could not be parsed",
                    host, interface
                )
            }
            ConfigError::InvalidDuration { value } => {
                write!(f, "invalid duration '{}', expected e.g. \"250ms\" or \"15s\"", value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

const EXAMPLE_CONFIG: &str = r#"# failoverd configuration file

# global defaults (override per interface or per host)
# debug = false
# icmp_interval = "2s"
# icmp_timeout = "250ms"
# burst_size = 3
# burst_interval = "15s"

# commands to run on up or down transitions
# up_action = "/path/to/script"
# down_action = "/path/to/script"

# monitor interface eth0 and use routing table 2
[[interfaces]]
name = "eth0"
table = 2
metric = 1000
# debug = false

# amount of hosts that need to be up for this interface to be considered up
# minimum_up = 1

# up_action = "/path/to/script"
# down_action = "/path/to/script"
# icmp_interval = "2s"
# icmp_timeout = "250ms"
# burst_size = 3
# burst_interval = "15s"

[[interfaces.hosts]]
name = "Cloudflare"
host = "1.1.1.1"
# debug = false
# icmp_interval = "2s"
# icmp_timeout = "250ms"
# burst_size = 3
# burst_interval = "15s"

[[interfaces.hosts]]
name = "Cloudflare"
host = "2606:4700:4700::1111"

[[interfaces.hosts]]
name = "Google"
host = "8.8.8.8"

[[interfaces.hosts]]
name = "Google"
host = "2001:4860:4860::8888"
"#;
