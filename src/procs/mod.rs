// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod runner;
pub mod sink;
mod supervisor;

pub use runner::{Runner, StopOutcome};
pub use supervisor::Supervisor;

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

/// Lifecycle of a runner
///
/// Stopped -> Starting -> Running -> {Crashed | Stopping -> Stopped}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Exited without being asked to, or could not be spawned
    Crashed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Crashed => "crashed",
        };

        f.write_str(s)
    }
}

/// Snapshot of one runner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerState {
    pub name: String,
    pub pid: Option<u32>,
    pub status: Status,
    pub last_exit_code: Option<i32>,
    /// Set instead of `last_exit_code` when the child died from a signal
    pub last_signal: Option<i32>,
    pub restart_count: u64,
}

impl RunnerState {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            status: Status::Stopped,
            last_exit_code: None,
            last_signal: None,
            restart_count: 0,
        }
    }
}

/// How a child terminated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}
