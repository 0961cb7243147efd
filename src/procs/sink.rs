// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Log files for child output.
//!
//! Rules:
//!  - files are only ever opened for append, existing content is kept
//!  - the child writes directly to the file, nothing is copied through the supervisor
//!  - supervisor failures for a service go to that service's error log

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use tracing::warn;

use crate::Error;

pub const TAG: &str = "[minium]";

/// Opens `path` for appending, creating it if needed
pub fn open_append(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::log_sink(path.to_path_buf(), e))
}

/// Stdio for a child stream, discarded when there is no path
pub fn stdio_for(path: Option<&Path>) -> Result<Stdio, Error> {
    match path {
        Some(path) => open_append(path).map(Stdio::from),
        None => Ok(Stdio::null()),
    }
}

/// Append a supervisor message to a service's error log
///
/// This is best effort, failures are only traced.
pub fn report(path: Option<&Path>, service: &str, message: &str) {
    let path = match path {
        Some(path) => path,
        None => return,
    };

    let written = open_append(path).and_then(|mut file| {
        writeln!(file, "{} {}: {}", TAG, service, message).map_err(Error::from)
    });

    if let Err(e) = written {
        warn!(service, path = %path.display(), "could not write to error log: {}", e);
    }
}
