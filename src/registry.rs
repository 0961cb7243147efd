// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The service registry, the flat list of programs to keep running.
//!
//! Registries are read from TOML (an array of `[[service]]` tables) or JSON. The field
//! names used by pm2 ecosystem files (`apps`, `script`, `restart_delay`, `out_file`,
//! `error_file`, `kill_timeout`) are accepted as aliases, so an existing ecosystem
//! definition only needs to be converted to JSON.
//!
//! ```toml
//! [[service]]
//! name = "crypto-trading-news"
//! command = ".venv/bin/python3"
//! args = ["-m", "crypto_trading_news"]
//! restart_delay_ms = 5000
//! stdout_path = "/tmp/crypto_trading_news.log"
//! stderr_path = "/tmp/crypto_trading_news-error.log"
//! ```

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::Error;

/// Grace period between the stop signal and SIGKILL, pm2's `kill_timeout` default
pub const DEFAULT_STOP_TIMEOUT_MS: i64 = 1600;

/// On-disk encoding of a registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// `.json` files are JSON, everything else is treated as TOML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Toml,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(rename = "service", alias = "services", alias = "apps", default)]
    services: Vec<ServiceEntry>,
}

/// A service as written in a registry file, before validation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(alias = "script", skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub autorestart: bool,
    #[serde(alias = "restart_delay")]
    pub restart_delay_ms: i64,
    #[serde(alias = "out_file", skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<PathBuf>,
    #[serde(alias = "error_file", skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(alias = "kill_timeout", skip_serializing_if = "Option::is_none")]
    pub stop_timeout_ms: Option<i64>,
    // tables have to follow plain values in TOML output
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Default for ServiceEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: None,
            args: Vec::new(),
            cwd: None,
            autorestart: true,
            restart_delay_ms: 0,
            stdout_path: None,
            stderr_path: None,
            stop_signal: None,
            stop_timeout_ms: None,
            env: BTreeMap::new(),
        }
    }
}

impl From<&ServiceSpec> for ServiceEntry {
    fn from(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            command: Some(spec.command.clone()),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            autorestart: spec.autorestart,
            restart_delay_ms: spec.restart_delay.as_millis() as i64,
            stdout_path: spec.stdout_path.clone(),
            stderr_path: spec.stderr_path.clone(),
            stop_signal: Some(spec.stop_signal.as_str().to_string()),
            stop_timeout_ms: Some(spec.stop_timeout.as_millis() as i64),
            env: spec.env.clone(),
        }
    }
}

/// Static definition of one externally launched program and its restart policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSpec {
    name: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    autorestart: bool,
    restart_delay: Duration,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    stop_signal: Signal,
    stop_timeout: Duration,
}

impl ServiceSpec {
    fn validate(index: usize, entry: ServiceEntry) -> Result<Self, ValidationError> {
        let ServiceEntry {
            name,
            command,
            args,
            cwd,
            autorestart,
            restart_delay_ms,
            stdout_path,
            stderr_path,
            stop_signal,
            stop_timeout_ms,
            env,
        } = entry;

        if name.trim().is_empty() {
            return Err(ValidationError::EmptyName(index));
        }

        let command = match command {
            Some(command) if !command.trim().is_empty() => command,
            _ => return Err(ValidationError::MissingCommand(name)),
        };

        if restart_delay_ms < 0 {
            return Err(ValidationError::NegativeRestartDelay {
                name,
                delay_ms: restart_delay_ms,
            });
        }

        let stop_timeout_ms = stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS);
        if stop_timeout_ms < 0 {
            return Err(ValidationError::NegativeStopTimeout {
                name,
                timeout_ms: stop_timeout_ms,
            });
        }

        let stop_signal = match stop_signal {
            None => Signal::SIGTERM,
            Some(signal) => match parse_signal(&signal) {
                Some(signal) => signal,
                None => return Err(ValidationError::UnknownSignal { name, signal }),
            },
        };

        Ok(Self {
            name,
            command,
            args,
            env,
            cwd,
            autorestart,
            restart_delay: Duration::from_millis(restart_delay_ms as u64),
            stdout_path,
            stderr_path,
            stop_signal,
            stop_timeout: Duration::from_millis(stop_timeout_ms as u64),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Variables overlaid on the supervisor's own environment
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Restart after any exit that was not requested, successful or not
    pub fn autorestart(&self) -> bool {
        self.autorestart
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn stdout_path(&self) -> Option<&Path> {
        self.stdout_path.as_deref()
    }

    pub fn stderr_path(&self) -> Option<&Path> {
        self.stderr_path.as_deref()
    }

    pub fn stop_signal(&self) -> Signal {
        self.stop_signal
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    fn log_paths(&self) -> impl Iterator<Item = &Path> {
        let stderr = self
            .stderr_path()
            .filter(|stderr| Some(*stderr) != self.stdout_path());

        self.stdout_path().into_iter().chain(stderr)
    }
}

/// Accepts `SIGTERM`, `TERM` and `term`
fn parse_signal(name: &str) -> Option<Signal> {
    let name = name.trim().to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };

    Signal::from_str(&name).ok()
}

/// Validated, read-only set of services, in file order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registry {
    services: Vec<Arc<ServiceSpec>>,
}

impl Registry {
    /// Parses and validates a registry
    pub fn load(source: &str, format: Format) -> Result<Self, Error> {
        let file: RegistryFile = match format {
            Format::Toml => toml::from_str(source)?,
            Format::Json => serde_json::from_str(source)?,
        };

        Self::from_entries(file.services)
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let source = fs::read_to_string(path)?;
        Self::load(&source, Format::from_path(path))
    }

    pub fn from_entries<I>(entries: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = ServiceEntry>,
    {
        let mut services = Vec::new();
        let mut names = HashSet::new();
        let mut log_owners: HashMap<PathBuf, String> = HashMap::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let spec = ServiceSpec::validate(index, entry)?;

            if !names.insert(spec.name.clone()) {
                return Err(ValidationError::DuplicateName(spec.name).into());
            }

            for path in spec.log_paths() {
                match log_owners.entry(path.to_path_buf()) {
                    Entry::Occupied(owner) => {
                        return Err(ValidationError::SharedLogPath {
                            path: path.to_path_buf(),
                            first: owner.get().clone(),
                            second: spec.name.clone(),
                        }
                        .into())
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(spec.name.clone());
                    }
                }
            }

            services.push(Arc::new(spec));
        }

        Ok(Self { services })
    }

    /// Encodes the registry so that `load` gives back the same specs
    pub fn serialize(&self, format: Format) -> Result<String, Error> {
        let file = RegistryFile {
            services: self
                .services
                .iter()
                .map(|spec| ServiceEntry::from(spec.as_ref()))
                .collect(),
        };

        match format {
            Format::Toml => Ok(toml::to_string(&file)?),
            Format::Json => Ok(serde_json::to_string_pretty(&file)?),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ServiceSpec>> {
        self.services.iter().find(|spec| spec.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ECOSYSTEM: &str = r#"{
      "apps": [
        {
          "name": "tor-multi",
          "script": "bash",
          "args": ["-c", "exec tor -f /tmp/torrc-multi"],
          "autorestart": true,
          "restart_delay": 5000,
          "out_file": "/tmp/tor.log",
          "error_file": "/tmp/tor-error.log"
        },
        {
          "name": "crypto-trading-news",
          "script": ".venv/bin/python3",
          "args": ["-m", "crypto_trading_news"],
          "autorestart": true,
          "restart_delay": 5000,
          "out_file": "/tmp/crypto_trading_news.log",
          "error_file": "/tmp/crypto_trading_news-error.log"
        }
      ]
    }"#;

    fn validation_error(result: Result<Registry, Error>) -> ValidationError {
        match result.expect_err("registry should be rejected").kind() {
            ErrorKind::Validation(err) => err.clone(),
            other => panic!("expected a validation error, got: {}", other),
        }
    }

    #[test]
    fn test_load_pm2_ecosystem() {
        let registry = Registry::load(ECOSYSTEM, Format::Json).unwrap();
        assert_eq!(registry.len(), 2);

        let tor = registry.get("tor-multi").unwrap();
        assert_eq!(tor.command(), "bash");
        assert_eq!(tor.args()[0], "-c");
        assert_eq!(tor.restart_delay(), Duration::from_millis(5000));
        assert_eq!(tor.stdout_path(), Some(Path::new("/tmp/tor.log")));
        assert_eq!(tor.stderr_path(), Some(Path::new("/tmp/tor-error.log")));
        assert_eq!(tor.stop_signal(), Signal::SIGTERM);

        let names: Vec<_> = registry.iter().map(|spec| spec.name()).collect();
        assert_eq!(names, ["tor-multi", "crypto-trading-news"]);
    }

    #[test]
    fn test_defaults() {
        let registry = Registry::load(
            r#"
            [[service]]
            name = "sleeper"
            command = "sleep"
            "#,
            Format::Toml,
        )
        .unwrap();

        let spec = registry.get("sleeper").unwrap();
        assert!(spec.autorestart());
        assert_eq!(spec.restart_delay(), Duration::ZERO);
        assert_eq!(spec.stop_timeout(), Duration::from_millis(1600));
        assert!(spec.args().is_empty());
        assert!(spec.stdout_path().is_none());
        assert!(spec.cwd().is_none());
    }

    #[test]
    fn test_duplicate_name() {
        let err = validation_error(Registry::load(
            r#"
            [[service]]
            name = "tor"
            command = "tor"

            [[service]]
            name = "tor"
            command = "tor"
            "#,
            Format::Toml,
        ));

        assert_eq!(err, ValidationError::DuplicateName("tor".to_string()));
    }

    #[test]
    fn test_missing_command() {
        let err = validation_error(Registry::load(
            r#"
            [[service]]
            name = "nothing"
            args = ["-m", "module"]
            "#,
            Format::Toml,
        ));
        assert_eq!(err, ValidationError::MissingCommand("nothing".to_string()));

        let err = validation_error(Registry::load(
            r#"{"apps": [{"name": "blank", "script": "  "}]}"#,
            Format::Json,
        ));
        assert_eq!(err, ValidationError::MissingCommand("blank".to_string()));
    }

    #[test]
    fn test_negative_restart_delay() {
        let err = validation_error(Registry::load(
            r#"
            [[service]]
            name = "eager"
            command = "true"
            restart_delay_ms = -1
            "#,
            Format::Toml,
        ));

        assert_eq!(
            err,
            ValidationError::NegativeRestartDelay {
                name: "eager".to_string(),
                delay_ms: -1
            }
        );
    }

    #[test]
    fn test_empty_name() {
        let err = validation_error(Registry::load(
            r#"
            [[service]]
            name = "ok"
            command = "true"

            [[service]]
            command = "true"
            "#,
            Format::Toml,
        ));

        assert_eq!(err, ValidationError::EmptyName(1));
    }

    #[test]
    fn test_shared_log_path() {
        let err = validation_error(Registry::load(
            r#"
            [[service]]
            name = "a"
            command = "true"
            stdout_path = "/tmp/shared.log"

            [[service]]
            name = "b"
            command = "true"
            stderr_path = "/tmp/shared.log"
            "#,
            Format::Toml,
        ));

        assert_eq!(
            err,
            ValidationError::SharedLogPath {
                path: PathBuf::from("/tmp/shared.log"),
                first: "a".to_string(),
                second: "b".to_string(),
            }
        );
    }

    #[test]
    fn test_merged_logs_for_one_service() {
        let registry = Registry::load(
            r#"
            [[service]]
            name = "merged"
            command = "true"
            stdout_path = "/tmp/merged.log"
            stderr_path = "/tmp/merged.log"
            "#,
            Format::Toml,
        )
        .unwrap();

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stop_signal_names() {
        assert_eq!(parse_signal("SIGINT"), Some(Signal::SIGINT));
        assert_eq!(parse_signal("hup"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal(" QUIT "), Some(Signal::SIGQUIT));
        assert_eq!(parse_signal("SIGNOPE"), None);

        let err = validation_error(Registry::load(
            r#"
            [[service]]
            name = "odd"
            command = "true"
            stop_signal = "NOPE"
            "#,
            Format::Toml,
        ));
        assert_eq!(
            err,
            ValidationError::UnknownSignal {
                name: "odd".to_string(),
                signal: "NOPE".to_string()
            }
        );
    }

    #[test]
    fn test_reload_serialized_registry() {
        let mut entry = ServiceEntry {
            name: "worker".to_string(),
            command: Some("/usr/bin/env".to_string()),
            args: vec!["python3".to_string(), "-m".to_string(), "worker".to_string()],
            cwd: Some(PathBuf::from("/srv/worker")),
            autorestart: false,
            restart_delay_ms: 250,
            stop_signal: Some("INT".to_string()),
            stop_timeout_ms: Some(10),
            ..ServiceEntry::default()
        };
        entry.env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        let registry = Registry::from_entries(vec![entry])
            .and_then(|registry| {
                let json = Registry::load(ECOSYSTEM, Format::Json)?;
                Registry::from_entries(
                    registry
                        .iter()
                        .chain(json.iter())
                        .map(|spec| ServiceEntry::from(spec.as_ref())),
                )
            })
            .unwrap();

        for format in [Format::Toml, Format::Json] {
            let encoded = registry.serialize(format).unwrap();
            let reloaded = Registry::load(&encoded, format).unwrap();
            assert_eq!(reloaded, registry, "{:?} did not survive: {}", format, encoded);
        }
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("ecosystem.JSON")), Format::Json);
        assert_eq!(Format::from_path(Path::new("minium.toml")), Format::Toml);
        assert_eq!(Format::from_path(Path::new("services")), Format::Toml);
    }
}
