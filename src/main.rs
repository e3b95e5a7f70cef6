// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;

use clap::Parser;

use failoverd::config::Config;
use failoverd::logging::{Facility, Logger};
use failoverd::supervisor::Supervisor;
use failoverd::{log_error, log_info};

/// CAP_NET_ADMIN bit in the CapEff mask of /proc/self/status.
const CAP_NET_ADMIN: u32 = 12;

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about = "Policy-routed multi-WAN failover daemon", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "failoverd.toml")]
    config: PathBuf,

    /// Print an example configuration and exit
    #[arg(long)]
    example: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.example {
        print!("{}", Config::example());
        return;
    }

    let logger = Logger::new(args.debug);

    if !has_net_admin() {
        log_error!(logger, Facility::Main, "you don't have the proper rights");
        log_error!(
            logger,
            Facility::Main,
            "either add CAP_NET_ADMIN (setcap 'cap_net_admin+ep' failoverd) or run as root"
        );
        std::process::exit(1);
    }

    log_info!(
        logger,
        Facility::Main,
        &format!("starting with configuration file {:?}", args.config)
    );

    let config = match Config::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log_error!(logger, Facility::Main, &format!("{}", e));
            std::process::exit(1);
        }
    };

    // the config file can turn on debug logging too
    let logger = Logger::new(args.debug || config.debug);

    if let Err(e) = Supervisor::new(config, logger.clone()).run().await {
        log_error!(
            logger,
            Facility::Main,
            &format!("supervisor failed: {:#}", e)
        );
        std::process::exit(1);
    }
}

/// Effective CAP_NET_ADMIN, or plain root.
fn has_net_admin() -> bool {
    if nix::unistd::geteuid().is_root() {
        return true;
    }
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => cap_eff(&status)
            .map(|mask| mask & (1u64 << CAP_NET_ADMIN) != 0)
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Extract the effective capability mask from /proc/self/status content.
fn cap_eff(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix("CapEff:")?;
        u64::from_str_radix(rest.trim(), 16).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_parsing() {
        let args = Args::parse_from(["failoverd"]);
        assert_eq!(args.config, PathBuf::from("failoverd.toml"));
        assert!(!args.example);
        assert!(!args.debug);

        let args = Args::parse_from(["failoverd", "-c", "/etc/failoverd.toml", "-d"]);
        assert_eq!(args.config, PathBuf::from("/etc/failoverd.toml"));
        assert!(args.debug);

        let args = Args::parse_from(["failoverd", "--example"]);
        assert!(args.example);
    }

    #[test]
    fn test_cap_eff_parsing() {
        let status = "Name:\tfailoverd\nCapInh:\t0000000000000000\nCapEff:\t0000000000001000\n";
        assert_eq!(cap_eff(status), Some(0x1000));
        // bit 12 is CAP_NET_ADMIN
        assert_ne!(cap_eff(status).unwrap() & (1 << CAP_NET_ADMIN), 0);

        let without = "Name:\tfailoverd\nCapEff:\t0000000000000000\n";
        assert_eq!(cap_eff(without).unwrap() & (1 << CAP_NET_ADMIN), 0);

        assert_eq!(cap_eff("Name:\tfailoverd\n"), None);
        assert_eq!(cap_eff("CapEff:\tnot-hex\n"), None);
    }
}
