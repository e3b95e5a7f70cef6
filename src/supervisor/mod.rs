// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Supervisor: owns the netlink transport and all long-running tasks.
//!
//! Per interface it spawns a link monitor and, when a private table is
//! configured, a route table sync. The controller consumes their events and
//! owns the probers. On SIGINT/SIGTERM/SIGHUP, or when a monitor task dies,
//! teardown is ordered: the controller drains its probers first, then the
//! link monitors stop, then the route syncs. Installed routes and rules are
//! intentionally left in the kernel; down hooks and the kernel's own
//! link-down processing are the cleanup path.

mod controller;
mod hooks;
mod state;

pub use controller::{Controller, Event};
pub use hooks::run_hook;
pub use state::UpCounter;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::linkstate::LinkMonitor;
use crate::logging::{Facility, Logger};
use crate::netlink::Transport;
use crate::routesync::RouteSync;
use crate::{log_debug, log_error, log_info};

/// Bound on draining each task group during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const EVENT_CHANNEL_DEPTH: usize = 64;

pub struct Supervisor {
    config: Arc<Config>,
    logger: Logger,
}

impl Supervisor {
    pub fn new(config: Config, logger: Logger) -> Self {
        Self {
            config: Arc::new(config),
            logger,
        }
    }

    /// Run until a termination signal arrives or a monitor dies.
    pub async fn run(self) -> Result<()> {
        let transport = Transport::new().context("failed to open netlink transport")?;
        log_debug!(
            self.logger,
            Facility::Supervisor,
            &format!("netlink transport pinned to pid {}", transport.pid())
        );

        let controller_token = CancellationToken::new();
        let link_token = CancellationToken::new();
        let sync_token = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        log_debug!(self.logger, Facility::Supervisor, "starting link monitors");
        let mut link_monitors: FuturesUnordered<JoinHandle<Result<()>>> = FuturesUnordered::new();
        let mut route_syncs: FuturesUnordered<JoinHandle<Result<()>>> = FuturesUnordered::new();
        for (idx, ifi) in self.config.interfaces.iter().enumerate() {
            let scoped = self.logger.scoped(ifi.debug);
            let monitor = LinkMonitor::new(
                idx,
                ifi.name.clone(),
                events_tx.clone(),
                link_token.child_token(),
                scoped.clone(),
            );
            link_monitors.push(tokio::spawn(monitor.run()));

            // table sync only runs when a private table is in use
            if ifi.table != 0 {
                let sync = RouteSync::new(
                    ifi.name.clone(),
                    ifi.table,
                    ifi.metric,
                    transport.clone(),
                    sync_token.child_token(),
                    scoped,
                );
                route_syncs.push(tokio::spawn(sync.run()));
            }
        }

        let controller = Controller::new(
            Arc::clone(&self.config),
            transport,
            events_rx,
            events_tx,
            controller_token.clone(),
            self.logger.clone(),
        );
        let controller_handle = tokio::spawn(controller.run());

        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

        tokio::select! {
            _ = sigint.recv() => {
                log_info!(self.logger, Facility::Supervisor,
                    "terminating due to signal SIGINT, cleaning up");
            }
            _ = sigterm.recv() => {
                log_info!(self.logger, Facility::Supervisor,
                    "terminating due to signal SIGTERM, cleaning up");
            }
            _ = sighup.recv() => {
                log_info!(self.logger, Facility::Supervisor,
                    "terminating due to signal SIGHUP, cleaning up");
            }
            Some(result) = link_monitors.next() => {
                self.log_monitor_exit("link monitor", result);
            }
            Some(result) = route_syncs.next() => {
                self.log_monitor_exit("route table sync", result);
            }
        }

        // ordered teardown: probers drain inside the controller first
        log_debug!(self.logger, Facility::Supervisor, "tearing down icmp monitors");
        controller_token.cancel();
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, controller_handle).await;

        log_debug!(self.logger, Facility::Supervisor, "tearing down link monitors");
        link_token.cancel();
        drain(&mut link_monitors, SHUTDOWN_TIMEOUT).await;

        if !route_syncs.is_empty() {
            log_debug!(self.logger, Facility::Supervisor, "tearing down route table sync");
        }
        sync_token.cancel();
        drain(&mut route_syncs, SHUTDOWN_TIMEOUT).await;

        log_info!(self.logger, Facility::Supervisor, "shutdown complete");
        Ok(())
    }

    /// A monitor returning at all is unexpected; its death shuts the daemon
    /// down so a half-monitored interface set never runs silently.
    fn log_monitor_exit(&self, what: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) {
        match result {
            Ok(Ok(())) => {
                log_info!(
                    self.logger,
                    Facility::Supervisor,
                    &format!("{} exited, shutting down", what)
                );
            }
            Ok(Err(e)) => {
                log_error!(
                    self.logger,
                    Facility::Supervisor,
                    &format!("{} failed, shutting down: {:#}", what, e)
                );
            }
            Err(e) => {
                log_error!(
                    self.logger,
                    Facility::Supervisor,
                    &format!("{} panicked, shutting down: {}", what, e)
                );
            }
        }
    }
}

async fn drain(tasks: &mut FuturesUnordered<JoinHandle<Result<()>>>, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        match tokio::time::timeout_at(deadline, tasks.next()).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(_elapsed) => return,
        }
    }
}
