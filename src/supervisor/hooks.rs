// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Up/down hook command execution.
//!
//! Hooks run under `/bin/sh -c` with a clean environment describing the
//! transition. Combined output is logged, a non-zero exit is logged and
//! never fatal. Hook processes are killed when the daemon shuts down
//! mid-run.

use std::process::Stdio;

use tokio::process::Command;

use crate::config::Interface;
use crate::logging::{Facility, Logger};
use crate::{log_debug, log_info, log_warning, Family};

/// Environment handed to a hook script.
pub(crate) fn hook_env(
    event: &str,
    family: Family,
    ifi: &Interface,
    up4: i64,
    up6: i64,
) -> Vec<(String, String)> {
    vec![
        ("EVENT".into(), event.to_string()),
        ("FAMILY".into(), family.as_str().to_string()),
        ("NAME".into(), ifi.name.clone()),
        ("DESCRIPTION".into(), ifi.description.clone()),
        ("TABLE".into(), ifi.table.to_string()),
        ("UP_HOSTS4".into(), up4.to_string()),
        ("UP_HOSTS6".into(), up6.to_string()),
        ("MINIMUM_UP".into(), ifi.minimum_up.to_string()),
    ]
}

/// Run one hook script to completion. An empty script is a no-op.
pub async fn run_hook(
    logger: &Logger,
    script: &str,
    event: &str,
    family: Family,
    ifi: &Interface,
    up4: i64,
    up6: i64,
) {
    if script.is_empty() {
        return;
    }

    log_debug!(
        logger,
        Facility::Hook,
        &format!("running {} action for {:?}: {}", event, ifi.name, script)
    );

    let result = Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .env_clear()
        .envs(hook_env(event, family, ifi, up4, up6))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match result {
        Ok(output) => {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            if !combined.is_empty() {
                let text = String::from_utf8_lossy(&combined);
                log_info!(logger, Facility::Hook, &format!(">>> {:?}", text.trim_end()));
            }
            if !output.status.success() {
                log_warning!(
                    logger,
                    Facility::Hook,
                    &format!(
                        "{} action for {:?} exited with {}",
                        event, ifi.name, output.status
                    )
                );
            }
        }
        Err(e) => {
            log_warning!(
                logger,
                Facility::Hook,
                &format!("could not run {} action for {:?}: {}", event, ifi.name, e)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_interface() -> Interface {
        Interface {
            name: "eth0".to_string(),
            description: "uplink".to_string(),
            debug: false,
            table: 2,
            metric: 1000,
            up_action: String::new(),
            down_action: String::new(),
            burst_interval: Duration::from_secs(15),
            burst_size: 3,
            icmp_interval: Duration::from_secs(2),
            icmp_timeout: Duration::from_millis(250),
            minimum_up: 2,
            total_hosts4: 2,
            total_hosts6: 0,
            hosts: Vec::new(),
        }
    }

    #[test]
    fn test_hook_env_contract() {
        let ifi = test_interface();
        let env = hook_env("UP", Family::V4, &ifi, 1, 0);

        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or_else(|| panic!("missing {}", key))
        };

        assert_eq!(get("EVENT"), "UP");
        assert_eq!(get("FAMILY"), "IPv4");
        assert_eq!(get("NAME"), "eth0");
        assert_eq!(get("DESCRIPTION"), "uplink");
        assert_eq!(get("TABLE"), "2");
        assert_eq!(get("UP_HOSTS4"), "1");
        assert_eq!(get("UP_HOSTS6"), "0");
        assert_eq!(get("MINIMUM_UP"), "2");
        assert_eq!(env.len(), 8);
    }

    #[test]
    fn test_hook_env_down_event() {
        let ifi = test_interface();
        let env = hook_env("DOWN", Family::V6, &ifi, 0, 0);
        assert!(env.contains(&("EVENT".to_string(), "DOWN".to_string())));
        assert!(env.contains(&("FAMILY".to_string(), "IPv6".to_string())));
    }

    #[tokio::test]
    async fn test_empty_script_is_noop() {
        let logger = Logger::new(false);
        let ifi = test_interface();
        run_hook(&logger, "", "UP", Family::V4, &ifi, 0, 0).await;
    }

    #[tokio::test]
    async fn test_hook_runs_with_environment() {
        let logger = Logger::new(false);
        let ifi = test_interface();
        // exits non-zero unless the environment is present; failures only log
        run_hook(
            &logger,
            "test \"$EVENT\" = UP && test \"$NAME\" = eth0",
            "UP",
            Family::V4,
            &ifi,
            1,
            0,
        )
        .await;
    }
}
