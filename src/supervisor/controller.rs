// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The failover controller.
//!
//! All monitors publish into one event channel and the controller is its
//! single consumer, so per-interface handling is serial: link up, rule
//! install, prober start, probe verdicts and hook execution cannot
//! interleave for one interface. Events from a previous link cycle are
//! recognized by generation number and dropped, which closes the race
//! between a link flap and in-flight probe verdicts.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use rtnetlink::packet_route::rule::RuleMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::hooks;
use super::state::UpCounter;
use crate::config::{Config, RT_TABLE_MAIN};
use crate::icmp::Prober;
use crate::logging::{Facility, Logger};
use crate::netlink::{
    self, err_is_exist, err_is_no_entry, route_gateway, route_output_ifindex, route_table_id,
    rule_table_id, Transport,
};
use crate::routesync::mirror_of;
use crate::{log_debug, log_info, log_warning, Family};

/// Source address discovery backs off exponentially up to this cap.
const DISCOVERY_BACKOFF_START: Duration = Duration::from_secs(1);
const DISCOVERY_BACKOFF_CAP: Duration = Duration::from_secs(32);

/// Policy rules selecting the private table are installed at this priority.
const RULE_PRIORITY: u32 = 1;

/// Events feeding the controller.
#[derive(Debug)]
pub enum Event {
    /// Debounced link verdict from a link monitor.
    Link { iface: usize, up: bool },
    /// Source address discovery succeeded for one family.
    Source {
        iface: usize,
        gen: u64,
        family: Family,
        addr: IpAddr,
    },
    /// Burst verdict from an ICMP prober.
    Probe {
        iface: usize,
        gen: u64,
        host: String,
        family: Family,
        up: bool,
    },
}

struct ProberEntry {
    token: CancellationToken,
    handle: JoinHandle<()>,
    /// Debounce latch; repeated identical verdicts must not move the counter.
    was_up: bool,
}

struct DiscoveryTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Dynamic state of one interface, owned by the controller.
struct IfaceRuntime {
    /// Bumped on every link edge; events carrying an older value are stale.
    gen: u64,
    link_up: bool,
    counter: UpCounter,
    probers: HashMap<String, ProberEntry>,
    rules: Vec<RuleMessage>,
    discovery: Vec<DiscoveryTask>,
}

pub struct Controller {
    config: Arc<Config>,
    transport: Transport,
    events_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    token: CancellationToken,
    logger: Logger,
    runtimes: Vec<IfaceRuntime>,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        transport: Transport,
        events_rx: mpsc::Receiver<Event>,
        events_tx: mpsc::Sender<Event>,
        token: CancellationToken,
        logger: Logger,
    ) -> Self {
        let runtimes = config
            .interfaces
            .iter()
            .map(|ifi| IfaceRuntime {
                gen: 0,
                link_up: false,
                counter: UpCounter::new(ifi.total_hosts4, ifi.total_hosts6, ifi.minimum_up),
                probers: HashMap::new(),
                rules: Vec::new(),
                discovery: Vec::new(),
            })
            .collect();

        Self {
            config,
            transport,
            events_rx,
            events_tx,
            token,
            logger,

            runtimes,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                maybe = self.events_rx.recv() => {
                    let Some(event) = maybe else { break };
                    self.dispatch(event).await;
                }
            }
        }
        self.shutdown().await;
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Link { iface, up: true } => self.link_up(iface).await,
            Event::Link { iface, up: false } => self.link_down(iface).await,
            Event::Source {
                iface,
                gen,
                family,
                addr,
            } => self.source_found(iface, gen, family, addr).await,
            Event::Probe {
                iface,
                gen,
                host,
                family,
                up,
            } => self.probe_verdict(iface, gen, &host, family, up).await,
        }
    }

    /// Link came up: start one source address search per represented family.
    /// Rules and probers follow once a source is known.
    async fn link_up(&mut self, idx: usize) {
        let ifi = &self.config.interfaces[idx];
        let rt = &mut self.runtimes[idx];
        if rt.link_up {
            return;
        }
        rt.gen += 1;
        rt.link_up = true;
        rt.counter.reset();

        log_info!(
            self.logger,
            Facility::Controller,
            &format!("link up: {:?}", ifi.name)
        );

        for family in ifi.families() {
            let token = self.token.child_token();
            let handle = tokio::spawn(discover_source(
                self.transport.clone(),
                idx,
                rt.gen,
                ifi.name.clone(),
                family,
                self.events_tx.clone(),
                token.clone(),
                self.logger.scoped(ifi.debug),
            ));
            rt.discovery.push(DiscoveryTask { token, handle });
        }
    }

    /// Link went down: tear down this cycle's probers and rules, zero the
    /// counters and force the down pathway for both families.
    async fn link_down(&mut self, idx: usize) {
        let ifi = &self.config.interfaces[idx];
        let rt = &mut self.runtimes[idx];
        if !rt.link_up {
            return;
        }
        rt.gen += 1;
        rt.link_up = false;

        log_info!(
            self.logger,
            Facility::Controller,
            &format!("link down: {:?}", ifi.name)
        );

        // discovery first so no prober can start after this point
        for task in rt.discovery.drain(..) {
            task.token.cancel();
            let _ = task.handle.await;
        }
        for (_host, entry) in rt.probers.drain() {
            entry.token.cancel();
            let _ = entry.handle.await;
        }
        let recorded: Vec<_> = rt.rules.drain(..).collect();
        rt.counter.reset();

        if ifi.table != 0 {
            for rule in recorded {
                if let Err(e) = self.transport.rule_del(rule).await {
                    if !err_is_no_entry(&e) {
                        log_warning!(
                            self.logger,
                            Facility::Controller,
                            &format!("error deleting rule for {:?}: {}", ifi.name, e)
                        );
                    }
                }
            }
            // sweep by table id as well, catching rules an earlier run left
            self.remove_rules_for_table(ifi.table).await;
        }

        self.family_down(idx, Family::V4, true).await;
        self.family_down(idx, Family::V6, true).await;
    }

    /// Delete every policy rule pointing at the interface's private table,
    /// whatever the address family.
    async fn remove_rules_for_table(&self, table: u32) {
        for family in [Family::V4, Family::V6] {
            let rules = match self.transport.rules(family).await {
                Ok(rules) => rules,
                Err(e) => {
                    log_warning!(
                        self.logger,
                        Facility::Controller,
                        &format!("rule list failed: {}", e)
                    );
                    continue;
                }
            };
            for rule in rules {
                if rule_table_id(&rule) != table {
                    continue;
                }
                if let Err(e) = self.transport.rule_del(rule).await {
                    if !err_is_no_entry(&e) {
                        log_warning!(
                            self.logger,
                            Facility::Controller,
                            &format!("error deleting rule for table {}: {}", table, e)
                        );
                    }
                }
            }
        }
    }

    /// A source address was found: install per-host policy rules, start the
    /// probers and enter the initial down state for the family.
    async fn source_found(&mut self, idx: usize, gen: u64, family: Family, addr: IpAddr) {
        let ifi = &self.config.interfaces[idx];
        {
            let rt = &self.runtimes[idx];
            if gen != rt.gen || !rt.link_up {
                // a link flap invalidated this discovery
                return;
            }
        }

        log_info!(
            self.logger,
            Facility::Controller,
            &format!(
                "using {} source {} for interface {:?}",
                family, addr, ifi.name
            )
        );

        for host in ifi.hosts.iter().filter(|h| h.family == family) {
            if ifi.table != 0 {
                match self
                    .transport
                    .rule_add(family, addr, host.addr, ifi.table, RULE_PRIORITY)
                    .await
                {
                    Ok(installed) => self.runtimes[idx].rules.push(installed),
                    Err(e) if err_is_exist(&e) => {}
                    Err(e) => {
                        log_warning!(
                            self.logger,
                            Facility::Controller,
                            &format!(
                                "could not add rule {} -> {} for {:?}: {}",
                                addr, host.addr, ifi.name, e
                            )
                        );
                    }
                }
            }

            let token = self.token.child_token();
            let prober = Prober::new(
                idx,
                gen,
                &ifi.name,
                host,
                addr,
                self.events_tx.clone(),
                token.clone(),
                self.logger.scoped(ifi.debug || host.debug),
            );
            match prober {
                Ok(prober) => {
                    let handle = tokio::spawn(prober.run());
                    self.runtimes[idx].probers.insert(
                        host.name.clone(),
                        ProberEntry {
                            token,
                            handle,
                            was_up: false,
                        },
                    );
                }
                Err(e) => {
                    log_warning!(
                        self.logger,
                        Facility::Controller,
                        &format!(
                            "could not start icmp monitor {:?} -> {}: {}",
                            ifi.name, host.name, e
                        )
                    );
                }
            }
        }

        // all hosts start out down until a burst proves otherwise
        self.demote(idx, family).await;
    }

    /// One burst verdict. The per-prober latch makes repeats idempotent;
    /// the counter fires hooks only on boundary crossings.
    async fn probe_verdict(&mut self, idx: usize, gen: u64, host: &str, family: Family, up: bool) {
        let (fire, up_count) = {
            let rt = &mut self.runtimes[idx];
            if gen != rt.gen {
                return;
            }
            let Some(entry) = rt.probers.get_mut(host) else {
                return;
            };
            if entry.was_up == up {
                return;
            }
            entry.was_up = up;

            let fire = if up {
                rt.counter.host_up(family)
            } else {
                rt.counter.host_down(family)
            };
            (fire, rt.counter.up(family))
        };

        let ifi = &self.config.interfaces[idx];
        log_info!(
            self.logger,
            Facility::Controller,
            &format!(
                "host {}: {} on {:?}, family {}, up {}/{}",
                if up { "up" } else { "down" },
                host,
                ifi.name,
                family,
                up_count,
                ifi.minimum_up
            )
        );

        if fire {
            if up {
                self.family_up(idx, family).await;
            } else {
                self.family_down(idx, family, false).await;
            }
        }
    }

    /// The family reached `minimum_up`: run the up hook and promote the
    /// interface's gateway routes into the main table.
    async fn family_up(&mut self, idx: usize, family: Family) {
        let ifi = &self.config.interfaces[idx];
        let rt = &self.runtimes[idx];

        log_info!(
            self.logger,
            Facility::Controller,
            &format!("family up: {} on interface {:?}", family, ifi.name)
        );

        hooks::run_hook(
            &self.logger.scoped(ifi.debug),
            &ifi.up_action,
            "UP",
            family,
            ifi,
            rt.counter.up(Family::V4),
            rt.counter.up(Family::V6),
        )
        .await;

        self.promote(idx, family).await;
    }

    /// The family fell below `minimum_up`, or the link died (`forced`):
    /// run the down hook and demote the gateway routes.
    async fn family_down(&mut self, idx: usize, family: Family, forced: bool) {
        let ifi = &self.config.interfaces[idx];
        let rt = &self.runtimes[idx];

        log_info!(
            self.logger,
            Facility::Controller,
            &format!(
                "family down: {} on interface {:?}{}",
                family,
                ifi.name,
                if forced { " (link down)" } else { "" }
            )
        );

        hooks::run_hook(
            &self.logger.scoped(ifi.debug),
            &ifi.down_action,
            "DOWN",
            family,
            ifi,
            rt.counter.up(Family::V4),
            rt.counter.up(Family::V6),
        )
        .await;

        self.demote(idx, family).await;
    }

    /// Copy the interface's gateway routes from its private table into the
    /// main table at the configured metric. Upserts are idempotent.
    async fn promote(&self, idx: usize, family: Family) {
        let ifi = &self.config.interfaces[idx];
        if ifi.table == 0 {
            return;
        }
        let Some(ifindex) = netlink::ifindex(&ifi.name) else {
            log_warning!(
                self.logger,
                Facility::Controller,
                &format!("interface {:?} has no index, cannot promote", ifi.name)
            );
            return;
        };

        let routes = match self.transport.routes(family).await {
            Ok(routes) => routes,
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::Controller,
                    &format!("route list failed: {}", e)
                );
                return;
            }
        };

        for route in routes {
            if route_table_id(&route) != ifi.table
                || route_output_ifindex(&route) != Some(ifindex)
                || route_gateway(&route).is_none()
            {
                continue;
            }
            let promoted = mirror_of(&route, RT_TABLE_MAIN, ifi.metric);
            log_debug!(
                self.logger,
                Facility::Controller,
                &format!(
                    "promoting {} gateway route for {:?} at metric {}",
                    family, ifi.name, ifi.metric
                )
            );
            if let Err(e) = self.transport.route_replace(promoted).await {
                log_warning!(
                    self.logger,
                    Facility::Controller,
                    &format!("error adding gateway route for {:?}: {}", ifi.name, e)
                );
            }
        }
    }

    /// Delete the interface's gateway routes from the main table.
    async fn demote(&self, idx: usize, family: Family) {
        let ifi = &self.config.interfaces[idx];
        let Some(ifindex) = netlink::ifindex(&ifi.name) else {
            // interface is gone, its routes went with it
            return;
        };

        let routes = match self.transport.routes(family).await {
            Ok(routes) => routes,
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::Controller,
                    &format!("route list failed: {}", e)
                );
                return;
            }
        };

        for route in routes {
            if route_table_id(&route) != RT_TABLE_MAIN
                || route_output_ifindex(&route) != Some(ifindex)
                || route_gateway(&route).is_none()
            {
                continue;
            }
            if let Err(e) = self.transport.route_del(route).await {
                if !err_is_no_entry(&e) {
                    log_warning!(
                        self.logger,
                        Facility::Controller,
                        &format!("error deleting gateway route for {:?}: {}", ifi.name, e)
                    );
                }
            }
        }
    }

    /// Drain all spawned tasks. Called once the supervisor cancels us;
    /// probers stop before link monitors and route syncs are torn down.
    async fn shutdown(&mut self) {
        log_debug!(
            self.logger,
            Facility::Controller,
            "tearing down icmp monitors"
        );
        for rt in &mut self.runtimes {
            for task in rt.discovery.drain(..) {
                task.token.cancel();
                let _ = task.handle.await;
            }
            for (_host, entry) in rt.probers.drain() {
                entry.token.cancel();
                let _ = entry.handle.await;
            }
        }
    }
}

/// Search for a usable source address on the interface, doubling the wait
/// between attempts. Runs until it finds one, the link flaps or the daemon
/// shuts down.
#[allow(clippy::too_many_arguments)]
async fn discover_source(
    transport: Transport,
    iface_id: usize,
    gen: u64,
    name: String,
    family: Family,
    events: mpsc::Sender<Event>,
    token: CancellationToken,
    logger: Logger,
) {
    let mut backoff = DISCOVERY_BACKOFF_START;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }

        log_debug!(
            logger,
            Facility::Controller,
            &format!("trying to find an {} address on interface {:?}", family, name)
        );

        if let Some(addr) = find_source(&transport, &name, family).await {
            let event = Event::Source {
                iface: iface_id,
                gen,
                family,
                addr,
            };
            // never block on a controller that is already draining us
            tokio::select! {
                _ = token.cancelled() => {}
                _ = events.send(event) => {}
            }
            return;
        }

        if backoff < DISCOVERY_BACKOFF_CAP {
            backoff = (backoff * 2).min(DISCOVERY_BACKOFF_CAP);
        }
    }
}

async fn find_source(transport: &Transport, name: &str, family: Family) -> Option<IpAddr> {
    let ifindex = netlink::ifindex(name)?;
    let addrs = transport.addresses(ifindex).await.ok()?;
    match family {
        Family::V4 => addrs.into_iter().find(|a| a.is_ipv4()),
        Family::V6 => addrs.into_iter().find(|a| match a {
            IpAddr::V6(v6) => is_global_unicast(v6),
            IpAddr::V4(_) => false,
        }),
    }
}

/// Probing needs a routable v6 source; link-local, loopback, multicast and
/// unspecified addresses are skipped. Unique-local addresses are accepted.
pub(crate) fn is_global_unicast(addr: &Ipv6Addr) -> bool {
    let link_local = (addr.segments()[0] & 0xffc0) == 0xfe80;
    !(addr.is_unspecified() || addr.is_loopback() || addr.is_multicast() || link_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_unicast_selection() {
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(is_global_unicast(&global));

        // unique-local counts as usable
        let ula: Ipv6Addr = "fd00::1".parse().unwrap();
        assert!(is_global_unicast(&ula));

        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        assert!(!is_global_unicast(&link_local));
        assert!(!is_global_unicast(&Ipv6Addr::LOCALHOST));
        assert!(!is_global_unicast(&Ipv6Addr::UNSPECIFIED));
        let multicast: Ipv6Addr = "ff02::1".parse().unwrap();
        assert!(!is_global_unicast(&multicast));
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = DISCOVERY_BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            if backoff < DISCOVERY_BACKOFF_CAP {
                backoff = (backoff * 2).min(DISCOVERY_BACKOFF_CAP);
            }
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 32]);
    }
}
