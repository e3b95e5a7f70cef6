// Logic tests for the failover state machine: counter transitions,
// burst verdicts, rule construction, configuration handling and hook
// execution. Nothing here needs CAP_NET_ADMIN or a live kernel interface.

use std::sync::Arc;
use std::time::Duration;

use failoverd::config::{Config, ConfigError, Interface, RT_TABLE_LOCAL, RT_TABLE_MAIN};
use failoverd::logging::Logger;
use failoverd::supervisor::{run_hook, UpCounter};
use failoverd::{icmp, netlink, Family};

fn test_interface(dir: &std::path::Path, action: &str) -> Interface {
    Interface {
        name: "eth0".to_string(),
        description: "primary uplink".to_string(),
        debug: false,
        table: 2,
        metric: 1000,
        up_action: action.replace("{}", &dir.join("out").display().to_string()),
        down_action: String::new(),
        burst_interval: Duration::from_secs(15),
        burst_size: 3,
        icmp_interval: Duration::from_secs(2),
        icmp_timeout: Duration::from_millis(250),
        minimum_up: 1,
        total_hosts4: 1,
        total_hosts6: 0,
        hosts: Vec::new(),
    }
}

// --- counter state machine ---

/// Replay a flap with minimum_up = 2: the second host crossing the
/// threshold drives the transitions, everything else is silent.
#[test]
fn test_flap_under_minimum_up_two() {
    let counter = UpCounter::new(2, 0, 2);

    // first host comes up: below minimum, no transition
    assert!(!counter.host_up(Family::V4));
    // second host comes up: at minimum, family-up fires
    assert!(counter.host_up(Family::V4));
    // first host drops: below minimum, family-down fires
    assert!(counter.host_down(Family::V4));
    // and recovers: at minimum again, family-up fires again
    assert!(counter.host_up(Family::V4));
}

#[test]
fn test_link_down_resets_next_cycle() {
    let counter = UpCounter::new(1, 1, 1);
    assert!(counter.host_up(Family::V4));
    assert!(counter.host_up(Family::V6));

    // link flap
    counter.reset();
    assert_eq!(counter.up(Family::V4), 0);
    assert_eq!(counter.up(Family::V6), 0);

    // the next cycle crosses the boundary again
    assert!(counter.host_up(Family::V4));
}

/// Interleaved increments and decrements from many threads never push the
/// observable counter outside [0, total].
#[test]
fn test_counter_bounds_under_interleaving() {
    let counter = Arc::new(UpCounter::new(3, 3, 2));
    let mut handles = Vec::new();
    for worker in 0..6 {
        let counter = Arc::clone(&counter);
        handles.push(std::thread::spawn(move || {
            let family = if worker % 2 == 0 { Family::V4 } else { Family::V6 };
            for round in 0..2000 {
                if (worker + round) % 3 == 0 {
                    counter.host_down(family);
                } else {
                    counter.host_up(family);
                }
                let seen = counter.up(family);
                assert!((0..=3).contains(&seen), "counter escaped bounds: {}", seen);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Boundary crossings fire exactly once even when every prober piles on.
#[test]
fn test_single_transition_per_crossing() {
    let counter = Arc::new(UpCounter::new(4, 0, 2));
    let fired: Vec<bool> = (0..4).map(|_| counter.host_up(Family::V4)).collect();
    assert_eq!(fired.iter().filter(|f| **f).count(), 1);
    assert_eq!(fired[1], true);

    let fired: Vec<bool> = (0..4).map(|_| counter.host_down(Family::V4)).collect();
    assert_eq!(fired.iter().filter(|f| **f).count(), 1);
    // 4 -> 3 silent, 3 -> 2 silent, 2 -> 1 fires
    assert_eq!(fired[2], true);
}

// --- burst verdicts ---

#[test]
fn test_packet_loss_threshold() {
    // 3 sent, 1 received: 67% loss, up
    assert!(icmp::verdict(3, 1));
    // 3 sent, 0 received: 100% loss, down
    assert!(!icmp::verdict(3, 0));
    // exactly at the 75% threshold stays up
    assert!(icmp::verdict(4, 1));
    assert!(!icmp::verdict(5, 1));
}

// --- policy rule construction ---

#[test]
fn test_cold_start_rule_shape() {
    // cold start installs: from 10.0.0.2/32 to 1.1.1.1/32 table 2 priority 1
    let msg = netlink::rule_message(
        Family::V4,
        "10.0.0.2".parse().unwrap(),
        "1.1.1.1".parse().unwrap(),
        2,
        1,
    );
    assert_eq!(msg.header.src_len, 32);
    assert_eq!(msg.header.dst_len, 32);
    assert_eq!(netlink::rule_table_id(&msg), 2);

    let msg = netlink::rule_message(
        Family::V6,
        "2001:db8::2".parse().unwrap(),
        "2606:4700:4700::1111".parse().unwrap(),
        2,
        1,
    );
    assert_eq!(msg.header.src_len, 128);
    assert_eq!(msg.header.dst_len, 128);
}

// --- configuration ---

#[test]
fn test_example_config_round_trip() {
    let config = Config::parse(Config::example()).unwrap();
    let reparsed = Config::parse(&config.to_toml()).unwrap();
    assert_eq!(config, reparsed);
}

#[test]
fn test_config_rejections() {
    let dup_ifaces = r#"
[[interfaces]]
name = "eth0"
[[interfaces]]
name = "eth0"
"#;
    assert!(matches!(
        Config::parse(dup_ifaces),
        Err(ConfigError::DuplicateInterface { .. })
    ));

    let dup_hosts = r#"
[[interfaces]]
name = "eth0"
[[interfaces.hosts]]
host = "1.1.1.1"
[[interfaces.hosts]]
host = "1.1.1.1"
"#;
    assert!(matches!(
        Config::parse(dup_hosts),
        Err(ConfigError::DuplicateHost { .. })
    ));

    for table in [RT_TABLE_MAIN, RT_TABLE_LOCAL] {
        let reserved = format!("[[interfaces]]\nname = \"eth0\"\ntable = {}\n", table);
        assert!(matches!(
            Config::parse(&reserved),
            Err(ConfigError::ReservedTable { .. })
        ));
    }

    let burst = "burst_size = 9\n[[interfaces]]\nname = \"eth0\"\n";
    assert!(matches!(
        Config::parse(burst),
        Err(ConfigError::InvalidBurstSize { .. })
    ));

    let minimum = r#"
[[interfaces]]
name = "eth0"
minimum_up = 3
[[interfaces.hosts]]
host = "1.1.1.1"
"#;
    assert!(matches!(
        Config::parse(minimum),
        Err(ConfigError::InvalidMinimumUp { .. })
    ));

    let metric = "[[interfaces]]\nname = \"eth0\"\nmetric = 1000\n";
    assert!(matches!(
        Config::parse(metric),
        Err(ConfigError::MetricWithoutTable { .. })
    ));
}

// --- hooks ---

#[tokio::test]
async fn test_hook_receives_transition_environment() {
    let dir = tempfile::tempdir().unwrap();
    let ifi = test_interface(
        dir.path(),
        "printf '%s %s %s %s %s %s' \"$EVENT\" \"$FAMILY\" \"$NAME\" \"$TABLE\" \"$UP_HOSTS4\" \"$MINIMUM_UP\" > {}",
    );

    run_hook(&Logger::new(false), &ifi.up_action, "UP", Family::V4, &ifi, 1, 0).await;

    let written = std::fs::read_to_string(dir.path().join("out")).unwrap();
    assert_eq!(written, "UP IPv4 eth0 2 1 1");
}

#[tokio::test]
async fn test_hook_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ifi = test_interface(dir.path(), "exit 3");
    // a failing hook only logs
    run_hook(&Logger::new(false), &ifi.up_action, "DOWN", Family::V6, &ifi, 0, 0).await;
}
