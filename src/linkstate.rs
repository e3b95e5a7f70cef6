// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-interface link state monitoring.
//!
//! Each monitor owns a netlink subscription to RTNLGRP_LINK and watches
//! RTM_NEWLINK/RTM_DELLINK for one interface. The kernel reports links going
//! down as RTM_NEWLINK with a non-up operational state, so state is derived
//! from operstate; RTM_DELLINK always means down. Edges are debounced with a
//! latched `is_up` before they reach the controller.

use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use rtnetlink::constants::RTMGRP_LINK;
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage, State};
use rtnetlink::packet_route::RouteNetlinkMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::logging::{Facility, Logger};
use crate::supervisor::Event;
use crate::{log_debug, log_warning};

/// Latched link state; only edges produce events.
#[derive(Debug, Default)]
pub struct LinkState {
    is_up: bool,
}

impl LinkState {
    /// Returns the new state when the verdict is an edge, None when it
    /// repeats the current state.
    pub fn transition(&mut self, up: bool) -> Option<bool> {
        if self.is_up == up {
            return None;
        }
        self.is_up = up;
        Some(up)
    }
}

/// Classify a netlink message for the named interface.
/// Messages for other interfaces or of other types yield None.
pub fn classify(msg: &RouteNetlinkMessage, name: &str) -> Option<bool> {
    match msg {
        RouteNetlinkMessage::NewLink(link) if link_name(link) == Some(name) => {
            Some(link_operstate_up(link))
        }
        RouteNetlinkMessage::DelLink(link) if link_name(link) == Some(name) => Some(false),
        _ => None,
    }
}

fn link_name(link: &LinkMessage) -> Option<&str> {
    link.attributes.iter().find_map(|attr| {
        if let LinkAttribute::IfName(name) = attr {
            Some(name.as_str())
        } else {
            None
        }
    })
}

fn link_operstate_up(link: &LinkMessage) -> bool {
    link.attributes
        .iter()
        .any(|attr| matches!(attr, LinkAttribute::OperState(State::Up)))
}

pub struct LinkMonitor {
    iface_id: usize,
    name: String,
    state: LinkState,
    events: mpsc::Sender<Event>,
    token: CancellationToken,
    logger: Logger,
}

impl LinkMonitor {
    pub fn new(
        iface_id: usize,
        name: String,
        events: mpsc::Sender<Event>,
        token: CancellationToken,
        logger: Logger,
    ) -> Self {
        Self {
            iface_id,
            name,
            state: LinkState::default(),
            events,
            token,
            logger,
        }
    }

    /// Run until cancelled. Returns an error if the netlink subscription
    /// cannot be established or dies; the supervisor treats that as fatal.
    pub async fn run(mut self) -> Result<()> {
        let (handle, mut messages) = crate::netlink::subscribe(RTMGRP_LINK)
            .with_context(|| format!("link monitor for {}: netlink subscription", self.name))?;

        log_debug!(
            self.logger,
            Facility::LinkMonitor,
            &format!("starting monitor on {:?}", self.name)
        );

        // Seed initial state with a dump so an interface that is already up
        // at daemon start goes through the same up path as a later event.
        match handle
            .link()
            .get()
            .match_name(self.name.clone())
            .execute()
            .try_next()
            .await
        {
            Ok(Some(link)) => {
                let up = link_operstate_up(&link);
                log_debug!(
                    self.logger,
                    Facility::LinkMonitor,
                    &format!("initial state of {:?}: up={}", self.name, up)
                );
                if self.emit(up).await {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => {
                // interface may simply not exist yet
                log_debug!(
                    self.logger,
                    Facility::LinkMonitor,
                    &format!("initial dump for {:?} failed: {}", self.name, e)
                );
            }
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    log_debug!(
                        self.logger,
                        Facility::LinkMonitor,
                        &format!("monitor for {:?} stopping", self.name)
                    );
                    return Ok(());
                }
                maybe = messages.next() => {
                    let Some((msg, _addr)) = maybe else {
                        log_warning!(
                            self.logger,
                            Facility::LinkMonitor,
                            &format!("netlink stream for {:?} closed", self.name)
                        );
                        anyhow::bail!("link event stream closed for {}", self.name);
                    };
                    if let NetlinkPayload::InnerMessage(inner) = msg.payload {
                        if let Some(up) = classify(&inner, &self.name) {
                            log_debug!(
                                self.logger,
                                Facility::LinkMonitor,
                                &format!("netlink reports interface {:?} up={}", self.name, up)
                            );
                            if self.emit(up).await {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Debounce and deliver one verdict. Returns true when the controller
    /// side of the channel is gone and the monitor should exit.
    async fn emit(&mut self, up: bool) -> bool {
        if let Some(up) = self.state.transition(up) {
            let event = Event::Link {
                iface: self.iface_id,
                up,
            };
            if self.events.send(event).await.is_err() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_msg(name: &str, state: Option<State>) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        if let Some(state) = state {
            msg.attributes.push(LinkAttribute::OperState(state));
        }
        msg
    }

    #[test]
    fn test_debounce_edges_only() {
        let mut state = LinkState::default();
        // initial down verdict is swallowed, we start down
        assert_eq!(state.transition(false), None);
        assert_eq!(state.transition(true), Some(true));
        assert_eq!(state.transition(true), None);
        assert_eq!(state.transition(false), Some(false));
        assert_eq!(state.transition(false), None);
        assert_eq!(state.transition(true), Some(true));
    }

    #[test]
    fn test_classify_newlink_operstate() {
        let up = RouteNetlinkMessage::NewLink(link_msg("eth0", Some(State::Up)));
        assert_eq!(classify(&up, "eth0"), Some(true));

        let down = RouteNetlinkMessage::NewLink(link_msg("eth0", Some(State::Down)));
        assert_eq!(classify(&down, "eth0"), Some(false));

        // dormant, unknown etc. are all not up
        let dormant = RouteNetlinkMessage::NewLink(link_msg("eth0", Some(State::Dormant)));
        assert_eq!(classify(&dormant, "eth0"), Some(false));

        let missing = RouteNetlinkMessage::NewLink(link_msg("eth0", None));
        assert_eq!(classify(&missing, "eth0"), Some(false));
    }

    #[test]
    fn test_classify_dellink_is_down() {
        let del = RouteNetlinkMessage::DelLink(link_msg("eth0", Some(State::Up)));
        assert_eq!(classify(&del, "eth0"), Some(false));
    }

    #[test]
    fn test_classify_filters_by_name() {
        let other = RouteNetlinkMessage::NewLink(link_msg("eth1", Some(State::Up)));
        assert_eq!(classify(&other, "eth0"), None);

        let del = RouteNetlinkMessage::DelLink(link_msg("eth1", None));
        assert_eq!(classify(&del, "eth0"), None);
    }
}
