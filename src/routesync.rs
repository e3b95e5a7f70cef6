// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Private route table synchronization.
//!
//! DHCP and PPP agents install default routes into the main table, not into
//! the private table the failover rules point at. Each sync watches kernel
//! route churn and mirrors main-table default gateway routes belonging to
//! its interface into the private table, rewriting the metric to the
//! interface's configured value. Mirrors are removed when the source route
//! vanishes. Events caused by the daemon's own netlink writes are recognized
//! by port id and skipped.

use anyhow::{Context, Result};
use futures::StreamExt;
use rtnetlink::constants::{RTMGRP_IPV4_ROUTE, RTMGRP_IPV6_ROUTE};
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::route::RouteMessage;
use rtnetlink::packet_route::{AddressFamily, RouteNetlinkMessage};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::logging::{Facility, Logger};
use crate::netlink::{
    self, err_is_exist, err_is_no_entry, route_gateway, route_output_ifindex, route_priority,
    route_set_priority, route_set_table, route_table_id, Transport,
};
use crate::{log_debug, log_warning, Family};

/// True when the event did not originate from our own transport.
pub(crate) fn is_foreign(msg_port: u32, own_pid: u32) -> bool {
    msg_port != own_pid
}

/// A main-table default gateway route leaving through the given interface.
pub(crate) fn is_uplink_default(route: &RouteMessage, ifindex: u32) -> bool {
    route_table_id(route) == config::RT_TABLE_MAIN
        && route.header.destination_prefix_length == 0
        && route_gateway(route).is_some()
        && route_output_ifindex(route) == Some(ifindex)
}

pub(crate) fn family_of_route(route: &RouteMessage) -> Option<Family> {
    match route.header.address_family {
        AddressFamily::Inet => Some(Family::V4),
        AddressFamily::Inet6 => Some(Family::V6),
        _ => None,
    }
}

/// Copy of a route re-homed into `table`. A non-zero metric overrides the
/// route priority so the mirror carries the interface's canonical metric.
pub(crate) fn mirror_of(route: &RouteMessage, table: u32, metric: u32) -> RouteMessage {
    let mut mirror = route.clone();
    route_set_table(&mut mirror, table);
    if metric != 0 {
        route_set_priority(&mut mirror, metric);
    }
    mirror
}

/// Move a route to a new metric without opening a window where the
/// destination has no route: the copy at the new metric is installed first,
/// the old one is deleted second.
pub async fn change_metric(
    transport: &Transport,
    route: &RouteMessage,
    metric: u32,
) -> Result<(), rtnetlink::Error> {
    let mut updated = route.clone();
    route_set_priority(&mut updated, metric);
    if let Err(e) = transport.route_add(updated).await {
        if !err_is_exist(&e) {
            return Err(e);
        }
    }
    if let Err(e) = transport.route_del(route.clone()).await {
        if !err_is_no_entry(&e) {
            return Err(e);
        }
    }
    Ok(())
}

pub struct RouteSync {
    name: String,
    table: u32,
    metric: u32,
    transport: Transport,
    token: CancellationToken,
    logger: Logger,
}

impl RouteSync {
    pub fn new(
        name: String,
        table: u32,
        metric: u32,
        transport: Transport,
        token: CancellationToken,
        logger: Logger,
    ) -> Self {
        Self {
            name,
            table,
            metric,
            transport,
            token,
            logger,
        }
    }

    pub async fn run(self) -> Result<()> {
        let (_handle, mut messages) =
            netlink::subscribe(RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE)
                .with_context(|| format!("route sync for {}: netlink subscription", self.name))?;

        log_debug!(
            self.logger,
            Facility::RouteSync,
            &format!("starting table sync on {:?} (table {})", self.name, self.table)
        );

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    log_debug!(
                        self.logger,
                        Facility::RouteSync,
                        &format!("table sync for {:?} stopping", self.name)
                    );
                    return Ok(());
                }
                maybe = messages.next() => {
                    let Some((msg, _addr)) = maybe else {
                        anyhow::bail!("route event stream closed for {}", self.name);
                    };
                    if !is_foreign(msg.header.port_number, self.transport.pid()) {
                        // our own write echoed back
                        continue;
                    }
                    match msg.payload {
                        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                            self.source_added(route).await;
                        }
                        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
                            self.source_removed(route).await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// A default route appeared in the main table. Mirror it into the
    /// private table and retire mirrors left at another metric.
    async fn source_added(&self, route: RouteMessage) {
        let Some(ifindex) = netlink::ifindex(&self.name) else {
            return;
        };
        if !is_uplink_default(&route, ifindex) {
            return;
        }
        let Some(family) = family_of_route(&route) else {
            return;
        };

        let desired = if self.metric != 0 {
            Some(self.metric)
        } else {
            route_priority(&route)
        };

        let mirrors = match self.mirrors(family, ifindex).await {
            Ok(m) => m,
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::RouteSync,
                    &format!("route list failed for {:?}: {}", self.name, e)
                );
                return;
            }
        };

        // make sure the mirror at the wanted metric exists before any stale
        // copy is removed, so the destination never loses coverage
        let have_desired = mirrors.iter().any(|m| route_priority(m) == desired);
        if !have_desired {
            log_debug!(
                self.logger,
                Facility::RouteSync,
                &format!(
                    "mirroring {} default route into table {} for {:?}",
                    family, self.table, self.name
                )
            );
            let result = match (self.metric, mirrors.first()) {
                // re-home an existing mirror onto the configured metric
                (metric, Some(stale)) if metric != 0 => {
                    change_metric(&self.transport, stale, metric).await
                }
                _ => {
                    let mirror = mirror_of(&route, self.table, self.metric);
                    match self.transport.route_add(mirror).await {
                        Err(e) if !err_is_exist(&e) => Err(e),
                        _ => Ok(()),
                    }
                }
            };
            if let Err(e) = result {
                log_warning!(
                    self.logger,
                    Facility::RouteSync,
                    &format!("mirror add failed for {:?}: {}", self.name, e)
                );
            }
        }

        // retire every leftover copy at another metric; one of them may
        // already be gone through change_metric above
        for mirror in mirrors {
            if route_priority(&mirror) == desired {
                continue;
            }
            if let Err(e) = self.transport.route_del(mirror).await {
                if !err_is_no_entry(&e) {
                    log_warning!(
                        self.logger,
                        Facility::RouteSync,
                        &format!("stale mirror delete failed for {:?}: {}", self.name, e)
                    );
                }
            }
        }
    }

    /// The source route vanished from the main table; drop its mirrors.
    async fn source_removed(&self, route: RouteMessage) {
        let Some(ifindex) = netlink::ifindex(&self.name) else {
            return;
        };
        if !is_uplink_default(&route, ifindex) {
            return;
        }
        let Some(family) = family_of_route(&route) else {
            return;
        };

        let mirrors = match self.mirrors(family, ifindex).await {
            Ok(m) => m,
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::RouteSync,
                    &format!("route list failed for {:?}: {}", self.name, e)
                );
                return;
            }
        };

        for mirror in mirrors {
            log_debug!(
                self.logger,
                Facility::RouteSync,
                &format!(
                    "removing {} mirror from table {} for {:?}",
                    family, self.table, self.name
                )
            );
            if let Err(e) = self.transport.route_del(mirror).await {
                if !err_is_no_entry(&e) {
                    log_warning!(
                        self.logger,
                        Facility::RouteSync,
                        &format!("mirror delete failed for {:?}: {}", self.name, e)
                    );
                }
            }
        }
    }

    /// Current private-table mirror candidates for this interface.
    async fn mirrors(
        &self,
        family: Family,
        ifindex: u32,
    ) -> Result<Vec<RouteMessage>, rtnetlink::Error> {
        let routes = self.transport.routes(family).await?;
        Ok(routes
            .into_iter()
            .filter(|r| {
                route_table_id(r) == self.table
                    && r.header.destination_prefix_length == 0
                    && route_gateway(r).is_some()
                    && route_output_ifindex(r) == Some(ifindex)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};
    use std::net::Ipv4Addr;

    fn default_route(table: u32, oif: u32, gateway: bool, priority: Option<u32>) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet;
        msg.header.destination_prefix_length = 0;
        route_set_table(&mut msg, table);
        msg.attributes.push(RouteAttribute::Oif(oif));
        if gateway {
            msg.attributes.push(RouteAttribute::Gateway(RouteAddress::Inet(
                Ipv4Addr::new(192, 0, 2, 254),
            )));
        }
        if let Some(priority) = priority {
            msg.attributes.push(RouteAttribute::Priority(priority));
        }
        msg
    }

    #[test]
    fn test_self_events_are_filtered() {
        let pid = 4242;
        assert!(!is_foreign(pid, pid));
        assert!(is_foreign(0, pid));
        assert!(is_foreign(pid + 1, pid));
    }

    #[test]
    fn test_uplink_default_predicate() {
        let candidate = default_route(config::RT_TABLE_MAIN, 7, true, None);
        assert!(is_uplink_default(&candidate, 7));

        // wrong interface
        assert!(!is_uplink_default(&candidate, 8));
        // private table is not a source
        assert!(!is_uplink_default(&default_route(2, 7, true, None), 7));
        // routes without a gateway are not mirrored
        assert!(!is_uplink_default(
            &default_route(config::RT_TABLE_MAIN, 7, false, None),
            7
        ));
        // prefixed routes are not default routes
        let mut prefixed = default_route(config::RT_TABLE_MAIN, 7, true, None);
        prefixed.header.destination_prefix_length = 24;
        assert!(!is_uplink_default(&prefixed, 7));
    }

    #[test]
    fn test_mirror_rewrites_table_and_metric() {
        let source = default_route(config::RT_TABLE_MAIN, 7, true, Some(100));
        let mirror = mirror_of(&source, 2, 1000);

        assert_eq!(route_table_id(&mirror), 2);
        assert_eq!(route_priority(&mirror), Some(1000));
        // gateway and output interface survive the rewrite
        assert!(route_gateway(&mirror).is_some());
        assert_eq!(route_output_ifindex(&mirror), Some(7));
        // the source is untouched
        assert_eq!(route_table_id(&source), config::RT_TABLE_MAIN);
        assert_eq!(route_priority(&source), Some(100));
    }

    #[test]
    fn test_mirror_keeps_priority_without_metric() {
        let source = default_route(config::RT_TABLE_MAIN, 7, true, Some(100));
        let mirror = mirror_of(&source, 2, 0);
        assert_eq!(route_priority(&mirror), Some(100));
    }

    #[test]
    fn test_family_of_route() {
        let v4 = default_route(config::RT_TABLE_MAIN, 7, true, None);
        assert_eq!(family_of_route(&v4), Some(Family::V4));

        let mut v6 = RouteMessage::default();
        v6.header.address_family = AddressFamily::Inet6;
        assert_eq!(family_of_route(&v6), Some(Family::V6));

        let mut other = RouteMessage::default();
        other.header.address_family = AddressFamily::Unspec;
        assert_eq!(family_of_route(&other), None);
    }
}
