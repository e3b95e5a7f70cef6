// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-host ICMP echo probing.
//!
//! A prober owns one privileged raw socket bound to its interface and source
//! address. Every `burst_interval` it sends a burst of echo requests spaced
//! `icmp_interval` apart, collects replies until an overall deadline of
//! `burst_size * (icmp_interval + icmp_timeout)` and reports a verdict to
//! the controller: down when more than 75% of the burst was lost, up
//! otherwise. Transport errors count as loss. The verdict stream is not
//! debounced here, the controller keeps a latch per prober.

use std::io::Read;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use pnet::packet::icmp::{self, echo_reply, echo_request, IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{echo_reply as echo_reply6, echo_request as echo_request6, Icmpv6Types};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Host;
use crate::logging::{Facility, Logger};
use crate::supervisor::Event;
use crate::{log_debug, Family};

/// Echo payload is 16 bytes of zeros after the 8 byte header.
const ECHO_PACKET_LEN: usize = 24;

/// Loss percentage above which a burst is judged down.
const LOSS_THRESHOLD: f64 = 75.0;

static NEXT_IDENT: AtomicU16 = AtomicU16::new(0);

fn next_ident() -> u16 {
    (std::process::id() as u16).wrapping_add(NEXT_IDENT.fetch_add(1, Ordering::Relaxed))
}

/// Judge one finished burst: up unless loss exceeds the threshold.
pub fn verdict(sent: usize, received: usize) -> bool {
    if sent == 0 {
        return false;
    }
    let loss = 100.0 * sent.saturating_sub(received) as f64 / sent as f64;
    loss <= LOSS_THRESHOLD
}

pub struct Prober {
    iface_id: usize,
    gen: u64,
    iface: String,
    host: String,
    family: Family,
    ident: u16,

    interval: Duration,
    timeout: Duration,
    burst_size: usize,
    burst_interval: Duration,

    socket: AsyncFd<Socket>,
    dst_addr: SockAddr,

    events: mpsc::Sender<Event>,
    token: CancellationToken,
    logger: Logger,
}

impl Prober {
    /// Open the raw socket for one (interface, host) pair. Opening can fail
    /// without capabilities or while the interface is being torn down; that
    /// is fatal for this prober only and reported to the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        iface_id: usize,
        gen: u64,
        iface: &str,
        host: &Host,
        src: IpAddr,
        events: mpsc::Sender<Event>,
        token: CancellationToken,
        logger: Logger,
    ) -> std::io::Result<Self> {
        let scope_id = crate::netlink::ifindex(iface).unwrap_or(0);
        let socket = open_socket(host.family, src, iface, scope_id)?;
        let socket = AsyncFd::new(socket)?;

        Ok(Self {
            iface_id,
            gen,
            iface: iface.to_string(),
            host: host.name.clone(),
            family: host.family,
            ident: next_ident(),
            interval: host.icmp_interval,
            timeout: host.icmp_timeout,
            burst_size: host.burst_size,
            burst_interval: host.burst_interval,
            socket,
            dst_addr: sockaddr(host.addr, scope_id),
            events,
            token,
            logger,
        })
    }

    /// Burst loop. The first burst runs one `burst_interval` after start,
    /// then periodically until cancelled.
    pub async fn run(mut self) {
        log_debug!(
            self.logger,
            Facility::IcmpMonitor,
            &format!("starting monitor on {:?} for {}", self.iface, self.host)
        );

        let start = tokio::time::Instant::now() + self.burst_interval;
        let mut ticker = tokio::time::interval_at(start, self.burst_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(up) = self.burst().await else {
                        // cancelled mid-burst, the verdict is discarded
                        break;
                    };
                    let event = Event::Probe {
                        iface: self.iface_id,
                        gen: self.gen,
                        host: self.host.clone(),
                        family: self.family,
                        up,
                    };
                    // the controller stops reading while it drains probers,
                    // so a send must never outlive cancellation
                    let delivered = tokio::select! {
                        _ = self.token.cancelled() => false,
                        sent = self.events.send(event) => sent.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
            }
        }

        log_debug!(
            self.logger,
            Facility::IcmpMonitor,
            &format!("stopped monitor on {:?} for {}", self.iface, self.host)
        );
    }

    /// Send one burst and collect replies until everything answered or the
    /// deadline passes. Returns None when cancelled.
    async fn burst(&mut self) -> Option<bool> {
        let overall = (self.interval + self.timeout) * self.burst_size as u32;
        let deadline = tokio::time::Instant::now() + overall;

        let mut send_timer = tokio::time::interval(self.interval);
        send_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sent = 0usize;
        let mut seen = vec![false; self.burst_size];
        let mut received = 0usize;
        let mut buf = [0u8; 1536];

        while sent < self.burst_size || received < sent {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = send_timer.tick(), if sent < self.burst_size => {
                    if let Err(e) = self.send_echo(sent as u16) {
                        // counted as loss
                        log_debug!(
                            self.logger,
                            Facility::IcmpMonitor,
                            &format!("({}) send to {} failed: {}", self.iface, self.host, e)
                        );
                    }
                    sent += 1;
                }
                guard = self.socket.readable() => {
                    let Ok(mut guard) = guard else { break };
                    match guard.try_io(|s| {
                        let mut sock: &Socket = s.get_ref();
                        sock.read(&mut buf)
                    }) {
                        Ok(Ok(n)) => {
                            if let Some(seq) = parse_reply(self.family, &buf[..n], self.ident) {
                                let seq = seq as usize;
                                if seq < seen.len() && !seen[seq] {
                                    seen[seq] = true;
                                    received += 1;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            log_debug!(
                                self.logger,
                                Facility::IcmpMonitor,
                                &format!("({}) receive error: {}", self.iface, e)
                            );
                        }
                        Err(_would_block) => {}
                    }
                }
            }
        }

        log_debug!(
            self.logger,
            Facility::IcmpMonitor,
            &format!(
                "({}) {} packets transmitted to {}, {} received",
                self.iface, self.burst_size, self.host, received
            )
        );
        Some(verdict(self.burst_size, received))
    }

    fn send_echo(&self, seq: u16) -> std::io::Result<()> {
        let packet = match self.family {
            Family::V4 => build_echo_v4(self.ident, seq),
            Family::V6 => build_echo_v6(self.ident, seq),
        };
        self.socket.get_ref().send_to(&packet, &self.dst_addr)?;
        Ok(())
    }
}

fn open_socket(
    family: Family,
    src: IpAddr,
    iface: &str,
    scope_id: u32,
) -> std::io::Result<Socket> {
    let (domain, proto) = match family {
        Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
        Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::RAW, Some(proto))?;
    socket.set_nonblocking(true)?;
    socket.bind_device(Some(iface.as_bytes()))?;
    socket.bind(&sockaddr(src, scope_id))?;
    Ok(socket)
}

/// Interface-scoped socket address; the scope id is the v6 zone, pinning
/// link traffic to the monitored interface.
fn sockaddr(addr: IpAddr, scope_id: u32) -> SockAddr {
    match addr {
        IpAddr::V4(v4) => SocketAddrV4::new(v4, 0).into(),
        IpAddr::V6(v6) => SocketAddrV6::new(v6, 0, 0, scope_id).into(),
    }
}

pub(crate) fn build_echo_v4(ident: u16, seq: u16) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_PACKET_LEN];
    let Some(mut pkt) = echo_request::MutableEchoRequestPacket::new(&mut buf) else {
        return buf;
    };
    pkt.set_icmp_type(IcmpTypes::EchoRequest);
    pkt.set_identifier(ident);
    pkt.set_sequence_number(seq);
    let checksum = IcmpPacket::new(pkt.packet()).map(|p| icmp::checksum(&p)).unwrap_or(0);
    pkt.set_checksum(checksum);
    buf
}

/// The kernel fills in the ICMPv6 checksum for IPPROTO_ICMPV6 raw sockets.
pub(crate) fn build_echo_v6(ident: u16, seq: u16) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_PACKET_LEN];
    let Some(mut pkt) = echo_request6::MutableEchoRequestPacket::new(&mut buf) else {
        return buf;
    };
    pkt.set_icmpv6_type(Icmpv6Types::EchoRequest);
    pkt.set_identifier(ident);
    pkt.set_sequence_number(seq);
    buf
}

/// Extract the sequence number of an echo reply addressed to us.
/// IPv4 raw sockets deliver the IP header, IPv6 raw sockets do not.
pub(crate) fn parse_reply(family: Family, data: &[u8], ident: u16) -> Option<u16> {
    match family {
        Family::V4 => {
            let ip = Ipv4Packet::new(data)?;
            let reply = echo_reply::EchoReplyPacket::new(ip.payload())?;
            if reply.get_icmp_type() != IcmpTypes::EchoReply || reply.get_identifier() != ident {
                return None;
            }
            Some(reply.get_sequence_number())
        }
        Family::V6 => {
            let reply = echo_reply6::EchoReplyPacket::new(data)?;
            if reply.get_icmpv6_type() != Icmpv6Types::EchoReply || reply.get_identifier() != ident
            {
                return None;
            }
            Some(reply.get_sequence_number())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_threshold() {
        // 1 of 3 received is 67% loss, still up
        assert!(verdict(3, 1));
        // nothing received is down
        assert!(!verdict(3, 0));
        assert!(verdict(3, 3));
        // exactly 75% loss is not above the threshold
        assert!(verdict(4, 1));
        assert!(!verdict(1, 0));
        assert!(!verdict(0, 0));
    }

    #[test]
    fn test_build_echo_v4() {
        let buf = build_echo_v4(0x1234, 2);
        assert_eq!(buf.len(), ECHO_PACKET_LEN);
        let pkt = IcmpPacket::new(&buf).unwrap();
        assert_eq!(pkt.get_icmp_type(), IcmpTypes::EchoRequest);
        // checksum must be filled in for v4
        assert_ne!(pkt.get_checksum(), 0);

        let req = echo_request::EchoRequestPacket::new(&buf).unwrap();
        assert_eq!(req.get_identifier(), 0x1234);
        assert_eq!(req.get_sequence_number(), 2);
    }

    #[test]
    fn test_build_echo_v6() {
        let buf = build_echo_v6(7, 1);
        let req = echo_request6::EchoRequestPacket::new(&buf).unwrap();
        assert_eq!(req.get_icmpv6_type(), Icmpv6Types::EchoRequest);
        assert_eq!(req.get_identifier(), 7);
        assert_eq!(req.get_sequence_number(), 1);
    }

    fn v4_reply(ident: u16, seq: u16) -> Vec<u8> {
        // minimal IPv4 header (20 bytes) followed by an echo reply
        let mut data = vec![
            0x45, 0, 0, 28, 0, 0, 0, 0, 64, 1, 0, 0, 1, 1, 1, 1, 10, 0, 0, 2,
        ];
        data.extend_from_slice(&[
            0, // type 0 = echo reply
            0,
            0,
            0,
            (ident >> 8) as u8,
            ident as u8,
            (seq >> 8) as u8,
            seq as u8,
        ]);
        data
    }

    #[test]
    fn test_parse_reply_v4() {
        let data = v4_reply(0xbeef, 1);
        assert_eq!(parse_reply(Family::V4, &data, 0xbeef), Some(1));
        // wrong identifier belongs to another prober
        assert_eq!(parse_reply(Family::V4, &data, 0xbee0), None);
        // truncated packet
        assert_eq!(parse_reply(Family::V4, &data[..10], 0xbeef), None);
    }

    #[test]
    fn test_parse_reply_v6() {
        let data = vec![129u8, 0, 0, 0, 0, 42, 0, 3];
        assert_eq!(parse_reply(Family::V6, &data, 42), Some(3));
        // echo request type is not a reply
        let req = vec![128u8, 0, 0, 0, 0, 42, 0, 3];
        assert_eq!(parse_reply(Family::V6, &req, 42), None);
    }

    #[test]
    fn test_idents_distinct() {
        assert_ne!(next_ident(), next_ident());
    }
}
