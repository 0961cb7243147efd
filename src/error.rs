// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A registry entry that can not be turned into a runnable service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("service #{0} has an empty name")]
    EmptyName(usize),
    #[error("service name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("service `{0}` has no command")]
    MissingCommand(String),
    #[error("service `{name}` has a negative restart delay: {delay_ms}ms")]
    NegativeRestartDelay { name: String, delay_ms: i64 },
    #[error("service `{name}` has a negative stop timeout: {timeout_ms}ms")]
    NegativeStopTimeout { name: String, timeout_ms: i64 },
    #[error("service `{name}` has an unknown stop signal: {signal}")]
    UnknownSignal { name: String, signal: String },
    #[error("log file {path:?} is shared by `{first}` and `{second}`")]
    SharedLogPath {
        path: PathBuf,
        first: String,
        second: String,
    },
}

#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("invalid registry: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to spawn `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not open log file {path:?}: {source}")]
    LogSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no such service: {0}")]
    UnknownService(String),
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("nix error: {0}")]
    NixError(#[from] nix::Error),
    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("toml error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message encoding error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("an error occured: {0}")]
    ErrorMsg(String),
    #[error("an error occured: {0}")]
    ErrorStr(&'static str),
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(ErrorKind);

impl Error {
    fn from_kind(kind: ErrorKind) -> Self {
        Self(kind)
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    pub(crate) fn spawn(name: &str, source: io::Error) -> Self {
        Self::from_kind(ErrorKind::Spawn {
            name: name.to_string(),
            source,
        })
    }

    pub(crate) fn log_sink(path: PathBuf, source: io::Error) -> Self {
        Self::from_kind(ErrorKind::LogSink { path, source })
    }

    pub(crate) fn unknown_service(name: &str) -> Self {
        Self::from_kind(ErrorKind::UnknownService(name.to_string()))
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self::from_kind(ErrorKind::Timeout(after))
    }

    /// True for registry problems, which are fatal at load time
    pub fn is_validation(&self) -> bool {
        matches!(self.0, ErrorKind::Validation(_))
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(err: E) -> Self {
        Self::from_kind(err.into())
    }
}

impl From<&'static str> for Error {
    fn from(err: &'static str) -> Self {
        Self::from_kind(ErrorKind::ErrorStr(err))
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::from_kind(ErrorKind::ErrorMsg(err))
    }
}
