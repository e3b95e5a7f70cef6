// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Netlink transport.
//!
//! One `Transport` is opened at startup with the daemon's process id as the
//! netlink port id. The kernel tags route notifications with the port id of
//! the socket that caused them, so pinning our own id lets the route table
//! sync recognize and ignore the daemon's own writes.
//!
//! Subscription sockets (link events, route events) are separate short-lived
//! connections bound to the wanted RTNLGRP groups with a kernel-assigned
//! port id.

use std::net::IpAddr;

use futures::channel::mpsc::UnboundedReceiver;
use futures::TryStreamExt;
use rtnetlink::packet_core::NetlinkMessage;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::route::{RouteAttribute, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, RouteMessageBuilder};

use crate::Family;

/// Broadcast message stream of a subscription connection.
pub type EventStream = UnboundedReceiver<(NetlinkMessage<RouteNetlinkMessage>, SocketAddr)>;

/// Shared handle to the daemon's control connection.
#[derive(Clone)]
pub struct Transport {
    handle: Handle,
    pid: u32,
}

impl Transport {
    /// Open the control connection, forcing the kernel to assign our
    /// process id as the netlink port id.
    pub fn new() -> std::io::Result<Self> {
        let (mut conn, handle, _) = rtnetlink::new_connection()?;
        let pid = std::process::id();
        conn.socket_mut().socket_mut().bind(&SocketAddr::new(pid, 0))?;
        tokio::spawn(conn);
        Ok(Self { handle, pid })
    }

    /// The pinned netlink port id, used to filter self-originated events.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Dump all routes of one address family.
    pub async fn routes(&self, family: Family) -> Result<Vec<RouteMessage>, rtnetlink::Error> {
        let mut filter = RouteMessageBuilder::<IpAddr>::new().build();
        filter.header.address_family = family.address_family();

        let mut stream = self.handle.route().get(filter).execute();
        let mut routes = Vec::new();
        while let Some(route) = stream.try_next().await? {
            routes.push(route);
        }
        Ok(routes)
    }

    /// Idempotent route upsert (NLM_F_REPLACE).
    pub async fn route_replace(&self, route: RouteMessage) -> Result<(), rtnetlink::Error> {
        self.handle.route().add(route).replace().execute().await
    }

    pub async fn route_add(&self, route: RouteMessage) -> Result<(), rtnetlink::Error> {
        self.handle.route().add(route).execute().await
    }

    pub async fn route_del(&self, route: RouteMessage) -> Result<(), rtnetlink::Error> {
        self.handle.route().del(route).execute().await
    }

    /// Dump all policy rules of one address family.
    pub async fn rules(&self, family: Family) -> Result<Vec<RuleMessage>, rtnetlink::Error> {
        let mut stream = self.handle.rule().get(family.ip_version()).execute();
        let mut rules = Vec::new();
        while let Some(rule) = stream.try_next().await? {
            rules.push(rule);
        }
        Ok(rules)
    }

    /// Install a source-policy rule `from src to dst lookup table`.
    /// Returns the installed message for the caller's cleanup registry.
    pub async fn rule_add(
        &self,
        family: Family,
        src: IpAddr,
        dst: IpAddr,
        table: u32,
        priority: u32,
    ) -> Result<RuleMessage, rtnetlink::Error> {
        let mut req = self.handle.rule().add();
        *req.message_mut() = rule_message(family, src, dst, table, priority);
        let installed = req.message_mut().clone();
        req.execute().await?;
        Ok(installed)
    }

    pub async fn rule_del(&self, rule: RuleMessage) -> Result<(), rtnetlink::Error> {
        self.handle.rule().del(rule).execute().await
    }

    /// Addresses currently assigned to an interface. Point-to-point links
    /// carry the local address in IFA_LOCAL, so that one wins over
    /// IFA_ADDRESS when both are present.
    pub async fn addresses(&self, ifindex: u32) -> Result<Vec<IpAddr>, rtnetlink::Error> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(ifindex)
            .execute();

        let mut addrs = Vec::new();
        while let Some(msg) = stream.try_next().await? {
            let mut local = None;
            let mut address = None;
            for attr in msg.attributes {
                match attr {
                    AddressAttribute::Local(addr) => local = Some(addr),
                    AddressAttribute::Address(addr) => address = Some(addr),
                    _ => {}
                }
            }
            if let Some(addr) = local.or(address) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }
}

/// Open a subscription connection bound to the given RTNLGRP bitmask.
/// The returned handle can issue dumps whose replies do not interleave
/// with the broadcast stream.
pub fn subscribe(groups: u32) -> std::io::Result<(Handle, EventStream)> {
    let (mut conn, handle, messages) = rtnetlink::new_connection()?;
    conn.socket_mut().socket_mut().bind(&SocketAddr::new(0, groups))?;
    tokio::spawn(conn);
    Ok((handle, messages))
}

/// Resolve an interface name to its current index. Resolved fresh for every
/// kernel operation since indices change when a device is recreated.
pub fn ifindex(name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(name).ok()
}

/// Routing table of a route message. Tables above 255 do not fit the legacy
/// header field and are carried in the RTA_TABLE attribute instead.
pub fn route_table_id(route: &RouteMessage) -> u32 {
    route
        .attributes
        .iter()
        .find_map(|attr| {
            if let RouteAttribute::Table(table) = attr {
                Some(*table)
            } else {
                None
            }
        })
        .unwrap_or(route.header.table as u32)
}

pub fn route_gateway(route: &RouteMessage) -> Option<&rtnetlink::packet_route::route::RouteAddress> {
    route.attributes.iter().find_map(|attr| {
        if let RouteAttribute::Gateway(gw) = attr {
            Some(gw)
        } else {
            None
        }
    })
}

pub fn route_output_ifindex(route: &RouteMessage) -> Option<u32> {
    route.attributes.iter().find_map(|attr| {
        if let RouteAttribute::Oif(oif) = attr {
            Some(*oif)
        } else {
            None
        }
    })
}

pub fn route_priority(route: &RouteMessage) -> Option<u32> {
    route.attributes.iter().find_map(|attr| {
        if let RouteAttribute::Priority(prio) = attr {
            Some(*prio)
        } else {
            None
        }
    })
}

pub fn route_set_table(route: &mut RouteMessage, table: u32) {
    route.header.table = if table <= 255 { table as u8 } else { 0 };
    route
        .attributes
        .retain(|attr| !matches!(attr, RouteAttribute::Table(_)));
    route.attributes.push(RouteAttribute::Table(table));
}

pub fn route_set_priority(route: &mut RouteMessage, priority: u32) {
    route
        .attributes
        .retain(|attr| !matches!(attr, RouteAttribute::Priority(_)));
    route.attributes.push(RouteAttribute::Priority(priority));
}

pub fn rule_table_id(rule: &RuleMessage) -> u32 {
    rule.attributes
        .iter()
        .find_map(|attr| {
            if let RuleAttribute::Table(table) = attr {
                Some(*table)
            } else {
                None
            }
        })
        .unwrap_or(rule.header.table as u32)
}

/// Build the message for a source-policy rule selecting `table` for traffic
/// from a single source host to a single destination host.
pub fn rule_message(
    family: Family,
    src: IpAddr,
    dst: IpAddr,
    table: u32,
    priority: u32,
) -> RuleMessage {
    let mut msg = RuleMessage::default();
    msg.header.family = family.address_family();
    msg.header.src_len = family.host_prefix_len();
    msg.header.dst_len = family.host_prefix_len();
    msg.header.action = RuleAction::ToTable;
    msg.header.table = if table <= 255 { table as u8 } else { 0 };
    msg.attributes.push(RuleAttribute::Table(table));
    msg.attributes.push(RuleAttribute::Priority(priority));
    msg.attributes.push(RuleAttribute::Source(src));
    msg.attributes.push(RuleAttribute::Destination(dst));
    msg
}

pub fn err_is_exist(e: &rtnetlink::Error) -> bool {
    err_is(e, libc::EEXIST)
}

pub fn err_is_no_entry(e: &rtnetlink::Error) -> bool {
    err_is(e, libc::ENOENT) || err_is(e, libc::ESRCH)
}

fn err_is(e: &rtnetlink::Error, errno: i32) -> bool {
    if let rtnetlink::Error::NetlinkError(msg) = e {
        if let Some(code) = msg.code {
            return -code.get() == errno;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtnetlink::packet_route::route::RouteAddress;
    use rtnetlink::packet_route::AddressFamily;
    use std::net::Ipv4Addr;

    fn gateway_route(table: u32, oif: u32, priority: u32) -> RouteMessage {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet;
        route_set_table(&mut msg, table);
        msg.attributes.push(RouteAttribute::Oif(oif));
        msg.attributes.push(RouteAttribute::Priority(priority));
        msg.attributes.push(RouteAttribute::Gateway(RouteAddress::Inet(
            Ipv4Addr::new(192, 0, 2, 254),
        )));
        msg
    }

    #[test]
    fn test_route_accessors() {
        let msg = gateway_route(2, 7, 1000);
        assert_eq!(route_table_id(&msg), 2);
        assert_eq!(route_output_ifindex(&msg), Some(7));
        assert_eq!(route_priority(&msg), Some(1000));
        assert!(route_gateway(&msg).is_some());

        let empty = RouteMessage::default();
        assert_eq!(route_output_ifindex(&empty), None);
        assert!(route_gateway(&empty).is_none());
    }

    #[test]
    fn test_route_set_table_small_and_large() {
        let mut msg = RouteMessage::default();
        route_set_table(&mut msg, 200);
        assert_eq!(msg.header.table, 200);
        assert_eq!(route_table_id(&msg), 200);

        // large ids only fit the attribute
        route_set_table(&mut msg, 70000);
        assert_eq!(msg.header.table, 0);
        assert_eq!(route_table_id(&msg), 70000);
        // no stale attribute left behind
        let tables = msg
            .attributes
            .iter()
            .filter(|a| matches!(a, RouteAttribute::Table(_)))
            .count();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_route_set_priority_replaces() {
        let mut msg = gateway_route(2, 7, 1);
        route_set_priority(&mut msg, 1000);
        assert_eq!(route_priority(&msg), Some(1000));
        let priorities = msg
            .attributes
            .iter()
            .filter(|a| matches!(a, RouteAttribute::Priority(_)))
            .count();
        assert_eq!(priorities, 1);
    }

    #[test]
    fn test_rule_message_v4() {
        let src: IpAddr = "10.0.0.2".parse().unwrap();
        let dst: IpAddr = "1.1.1.1".parse().unwrap();
        let msg = rule_message(Family::V4, src, dst, 2, 1);

        assert_eq!(msg.header.family, AddressFamily::Inet);
        assert_eq!(msg.header.src_len, 32);
        assert_eq!(msg.header.dst_len, 32);
        assert_eq!(msg.header.action, RuleAction::ToTable);
        assert_eq!(rule_table_id(&msg), 2);
        assert!(msg.attributes.contains(&RuleAttribute::Priority(1)));
        assert!(msg.attributes.contains(&RuleAttribute::Source(src)));
        assert!(msg.attributes.contains(&RuleAttribute::Destination(dst)));
    }

    #[test]
    fn test_rule_message_v6_prefix_lengths() {
        let src: IpAddr = "2001:db8::2".parse().unwrap();
        let dst: IpAddr = "2606:4700:4700::1111".parse().unwrap();
        let msg = rule_message(Family::V6, src, dst, 70000, 1);

        assert_eq!(msg.header.family, AddressFamily::Inet6);
        assert_eq!(msg.header.src_len, 128);
        assert_eq!(msg.header.dst_len, 128);
        // table above 255 lives in the attribute only
        assert_eq!(msg.header.table, 0);
        assert_eq!(rule_table_id(&msg), 70000);
    }
}
