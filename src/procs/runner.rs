// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::ErrorKind;
use crate::procs::{sink, Exit, RunnerState, Status};
use crate::registry::ServiceSpec;
use crate::Error;

/// Sent to the supervisor when a child exits unexpectedly or can not be spawned
#[derive(Debug)]
pub(crate) struct Crash {
    pub name: String,
    pub generation: u64,
}

/// How a call to `stop` ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    AlreadyStopped,
    /// The child exited after the stop signal
    Graceful,
    /// The child outlived the timeout and was sent SIGKILL
    Killed,
}

struct Live {
    pid: u32,
    exited: watch::Receiver<Option<Exit>>,
}

struct Inner {
    state: RunnerState,
    /// Bumped on every spawn, exit and restart notifications carry the one they belong to
    generation: u64,
    live: Option<Live>,
}

/// Supervisory handle for one service's OS process
///
/// Rules:
///   - at most one child per runner at any time
///   - the child's exit is observed by a monitor task, never by polling
///   - stdin is closed, stdout and stderr go straight to the service's log files
pub struct Runner {
    spec: Arc<ServiceSpec>,
    inner: Mutex<Inner>,
    crashes: mpsc::UnboundedSender<Crash>,
}

impl Runner {
    pub(crate) fn new(spec: Arc<ServiceSpec>, crashes: mpsc::UnboundedSender<Crash>) -> Self {
        let state = RunnerState::new(spec.name());

        Self {
            spec,
            inner: Mutex::new(Inner {
                state,
                generation: 0,
                live: None,
            }),
            crashes,
        }
    }

    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// A copy of the current state, never waits on the child
    pub fn state(&self) -> RunnerState {
        self.inner.lock().state.clone()
    }

    /// Spawns the child, returning its pid
    ///
    /// A runner that is already running is left alone. Must be called from within a tokio
    /// runtime, the exit monitor is spawned onto it.
    pub fn start(self: &Arc<Self>) -> Result<u32, Error> {
        let mut inner = self.inner.lock();
        self.launch(&mut inner)
    }

    /// Respawn after a crash, unless the runner was stopped or started since
    pub(crate) fn respawn(self: &Arc<Self>, generation: u64) -> Option<Result<u32, Error>> {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state.status != Status::Crashed {
            return None;
        }

        inner.state.restart_count += 1;
        Some(self.launch(&mut inner))
    }

    fn launch(self: &Arc<Self>, inner: &mut Inner) -> Result<u32, Error> {
        match inner.state.status {
            Status::Running | Status::Starting => {
                if let Some(live) = &inner.live {
                    return Ok(live.pid);
                }
            }
            Status::Stopping => {
                return Err(format!("{} is still stopping", self.name()).into());
            }
            Status::Stopped | Status::Crashed => (),
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.state.status = Status::Starting;

        match self.spawn() {
            Ok((child, pid)) => {
                let (exited_tx, exited) = watch::channel(None);

                inner.live = Some(Live { pid, exited });
                inner.state.pid = Some(pid);
                inner.state.status = Status::Running;
                info!(service = self.name(), pid, "started");

                tokio::spawn(Arc::clone(self).monitor(child, generation, exited_tx));
                Ok(pid)
            }
            Err(e) => {
                inner.live = None;
                inner.state.pid = None;
                inner.state.status = Status::Crashed;
                error!(service = self.name(), "{}", e);
                sink::report(self.spec.stderr_path(), self.name(), &e.to_string());

                // an unopenable log file will not get better by retrying
                if let ErrorKind::Spawn { .. } = e.kind() {
                    self.crashed(generation);
                }

                Err(e)
            }
        }
    }

    fn spawn(&self) -> Result<(Child, u32), Error> {
        let stdout = sink::stdio_for(self.spec.stdout_path())?;
        let stderr = sink::stdio_for(self.spec.stderr_path())?;

        let mut command = Command::new(self.spec.command());
        command
            .args(self.spec.args())
            .envs(self.spec.env())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        if let Some(cwd) = self.spec.cwd() {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| Error::spawn(self.name(), e))?;

        let pid = child.id().ok_or_else(|| {
            Error::spawn(
                self.name(),
                io::Error::new(io::ErrorKind::Other, "child was reaped before it was tracked"),
            )
        })?;

        Ok((child, pid))
    }

    async fn monitor(
        self: Arc<Self>,
        mut child: Child,
        generation: u64,
        exited: watch::Sender<Option<Exit>>,
    ) {
        let exit = match child.wait().await {
            Ok(status) => Exit::from(status),
            Err(e) => {
                error!(service = self.name(), "failed waiting on child: {}", e);
                child.kill().await.ok();
                Exit {
                    code: None,
                    signal: None,
                }
            }
        };

        self.on_exit(generation, exit);
        exited.send_replace(Some(exit));
    }

    /// Records the exit of the child spawned in `generation`
    pub(crate) fn on_exit(&self, generation: u64, exit: Exit) {
        let requested = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(service = self.name(), generation, "ignoring exit of a previous child");
                return;
            }

            inner.live = None;
            inner.state.pid = None;
            inner.state.last_exit_code = exit.code;
            inner.state.last_signal = exit.signal;

            let requested = inner.state.status == Status::Stopping;
            inner.state.status = if requested {
                Status::Stopped
            } else {
                Status::Crashed
            };

            requested
        };

        if requested {
            info!(service = self.name(), "stopped ({})", exit);
        } else {
            warn!(service = self.name(), "exited unexpectedly ({})", exit);
            sink::report(
                self.spec.stderr_path(),
                self.name(),
                &format!("exited unexpectedly ({})", exit),
            );
            self.crashed(generation);
        }
    }

    fn crashed(&self, generation: u64) {
        let crash = Crash {
            name: self.name().to_string(),
            generation,
        };

        // the receiver is gone once the supervisor is shutting down
        self.crashes.send(crash).ok();
    }

    /// Sends `signal`, waits up to `timeout` for the child to exit and then kills it
    ///
    /// Stopping a stopped runner does nothing. Stopping a crashed runner cancels its pending
    /// restart. If the returned future is dropped before the child has exited, the child is
    /// killed.
    pub async fn stop(&self, signal: Signal, timeout: Duration) -> Result<StopOutcome, Error> {
        let (pid, mut exited) = {
            let mut inner = self.inner.lock();
            let live = inner
                .live
                .as_ref()
                .map(|live| (live.pid, live.exited.clone()));

            match (inner.state.status, live) {
                (Status::Stopped, _) => return Ok(StopOutcome::AlreadyStopped),
                (_, Some(live)) => {
                    inner.state.status = Status::Stopping;
                    live
                }
                (status, None) => {
                    if status == Status::Crashed {
                        info!(service = self.name(), "pending restart cancelled");
                    }
                    inner.state.status = Status::Stopped;
                    return Ok(StopOutcome::AlreadyStopped);
                }
            }
        };

        let mut guard = KillOnDrop {
            pid,
            exited: exited.clone(),
            armed: true,
        };

        info!(service = self.name(), pid, signal = signal.as_str(), "stopping");
        send_signal(pid, signal)?;

        let outcome = match tokio::time::timeout(timeout, wait_exit(&mut exited)).await {
            Ok(()) => StopOutcome::Graceful,
            Err(_) => {
                warn!(
                    service = self.name(),
                    pid,
                    "{}, sending SIGKILL",
                    Error::timeout(timeout)
                );
                send_signal(pid, Signal::SIGKILL)?;
                wait_exit(&mut exited).await;
                StopOutcome::Killed
            }
        };

        guard.armed = false;
        Ok(outcome)
    }

    /// Stop with the service's own signal and timeout
    pub async fn halt(&self) -> Result<StopOutcome, Error> {
        self.stop(self.spec.stop_signal(), self.spec.stop_timeout())
            .await
    }

    /// Stops the child if needed and starts a new one
    pub async fn restart(self: &Arc<Self>) -> Result<u32, Error> {
        self.halt().await?;
        self.start()
    }
}

async fn wait_exit(exited: &mut watch::Receiver<Option<Exit>>) {
    // the monitor publishes the exit before dropping the sender
    exited.wait_for(Option::is_some).await.ok();
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), Error> {
    match signal::kill(Pid::from_raw(pid as i32), signal) {
        // already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Kills the child when a stop is abandoned part way
struct KillOnDrop {
    pid: u32,
    exited: watch::Receiver<Option<Exit>>,
    armed: bool,
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed || self.exited.borrow().is_some() {
            return;
        }

        warn!(pid = self.pid, "stop was cancelled, killing child");
        send_signal(self.pid, Signal::SIGKILL)
            .map_err(|e| error!(pid = self.pid, "could not kill child: {}", e))
            .ok();
    }
}
