// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::procs::runner::{Crash, Runner, StopOutcome};
use crate::procs::RunnerState;
use crate::registry::Registry;
use crate::Error;

/// Launch and monitor processes
///
/// Rules:
///   - one runner per registry entry, kept in registry order
///   - restart crashed services with autorestart after their fixed delay, forever
///   - a failing service never takes the supervisor down
pub struct Supervisor {
    registry: Registry,
    runners: Vec<Arc<Runner>>,
}

impl Supervisor {
    /// Creates a runner for every service, nothing is started yet
    ///
    /// Must be called from within a tokio runtime, the restart loop is spawned onto it.
    pub fn new(registry: Registry) -> Arc<Self> {
        let (crashes_tx, crashes_rx) = mpsc::unbounded_channel();

        let runners = registry
            .iter()
            .map(|spec| Arc::new(Runner::new(Arc::clone(spec), crashes_tx.clone())))
            .collect();

        let supervisor = Arc::new(Self { registry, runners });
        tokio::spawn(restart_loop(Arc::downgrade(&supervisor), crashes_rx));

        supervisor
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn runner(&self, name: &str) -> Option<&Arc<Runner>> {
        self.runners.iter().find(|runner| runner.name() == name)
    }

    fn get(&self, name: &str) -> Result<&Arc<Runner>, Error> {
        self.runner(name).ok_or_else(|| Error::unknown_service(name))
    }

    /// Starts every service in registry order
    ///
    /// Spawn failures are recorded on the runner that failed, the remaining services are
    /// still started.
    pub fn start_all(&self) {
        for runner in &self.runners {
            if let Err(e) = runner.start() {
                warn!(service = runner.name(), "not started: {}", e);
            }
        }
    }

    pub fn start(&self, name: &str) -> Result<u32, Error> {
        self.get(name)?.start()
    }

    /// Stops one service, `None` uses the service's own stop timeout
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<StopOutcome, Error> {
        let runner = self.get(name)?;
        stop_runner(runner, timeout).await
    }

    /// Stops every service concurrently and waits for all of them
    pub async fn stop_all(&self, timeout: Option<Duration>) {
        let stops = self.runners.iter().map(|runner| async move {
            if let Err(e) = stop_runner(runner, timeout).await {
                warn!(service = runner.name(), "failed to stop: {}", e);
            }
        });

        join_all(stops).await;
    }

    /// Stop followed by start, this does not count as a restart of a crashed service
    pub async fn restart(&self, name: &str) -> Result<u32, Error> {
        self.get(name)?.restart().await
    }

    /// Snapshots of every runner, in registry order
    pub fn status(&self) -> impl Iterator<Item = RunnerState> + '_ {
        self.runners.iter().map(|runner| runner.state())
    }

    pub fn state(&self, name: &str) -> Option<RunnerState> {
        self.runner(name).map(|runner| runner.state())
    }
}

async fn stop_runner(runner: &Runner, timeout: Option<Duration>) -> Result<StopOutcome, Error> {
    let spec = runner.spec();
    runner
        .stop(
            spec.stop_signal(),
            timeout.unwrap_or_else(|| spec.stop_timeout()),
        )
        .await
}

async fn restart_loop(supervisor: Weak<Supervisor>, mut crashes: mpsc::UnboundedReceiver<Crash>) {
    while let Some(crash) = crashes.recv().await {
        let supervisor = match supervisor.upgrade() {
            Some(supervisor) => supervisor,
            None => break,
        };

        if let Some(runner) = supervisor.runner(&crash.name) {
            schedule_restart(runner, crash.generation);
        }
    }

    debug!("restart loop finished");
}

fn schedule_restart(runner: &Arc<Runner>, generation: u64) {
    let spec = runner.spec();
    if !spec.autorestart() {
        info!(service = runner.name(), "autorestart is off, leaving it crashed");
        return;
    }

    let delay = spec.restart_delay();
    info!(
        service = runner.name(),
        delay_ms = delay.as_millis() as u64,
        "scheduling restart"
    );

    let runner = Arc::clone(runner);
    tokio::spawn(async move {
        time::sleep(delay).await;

        match runner.respawn(generation) {
            None => debug!(service = runner.name(), "restart no longer needed"),
            Some(Ok(pid)) => info!(
                service = runner.name(),
                pid,
                restart_count = runner.state().restart_count,
                "restarted"
            ),
            // a failed spawn reports another crash, which schedules the next attempt
            Some(Err(e)) => warn!(service = runner.name(), "restart failed: {}", e),
        }
    });
}
