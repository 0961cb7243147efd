// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Generation of a multi-port Tor configuration.
//!
//! Rendering is kept apart from launching: the supervisor only ever runs `tor -f <file>`,
//! the file itself comes from `TorrcConfig::render`.

use crate::Error;

pub const NUM_PORTS_ENV: &str = "NUM_PORTS";
pub const MAX_CIRCUIT_ENV: &str = "MAX_CIRCUIT";

pub const DEFAULT_BASE_PORT: u16 = 9050;
pub const DEFAULT_NUM_PORTS: u16 = 1;
pub const DEFAULT_MAX_CIRCUIT_DIRTINESS: u32 = 600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TorrcConfig {
    /// Number of consecutive SocksPorts, starting at `base_port`
    pub num_ports: u16,
    pub base_port: u16,
    /// Seconds a circuit may be reused, opaque to the supervisor
    pub max_circuit_dirtiness: u32,
}

impl Default for TorrcConfig {
    fn default() -> Self {
        Self {
            num_ports: DEFAULT_NUM_PORTS,
            base_port: DEFAULT_BASE_PORT,
            max_circuit_dirtiness: DEFAULT_MAX_CIRCUIT_DIRTINESS,
        }
    }
}

impl TorrcConfig {
    /// The torrc contents, one `SocksPort` line per port followed by `MaxCircuitDirtiness`
    pub fn render(&self) -> Result<Vec<u8>, Error> {
        if self.num_ports == 0 {
            return Err("at least one SocksPort is required".into());
        }

        let last = u32::from(self.base_port) + u32::from(self.num_ports) - 1;
        if last > u32::from(u16::MAX) {
            return Err(format!(
                "{} ports starting at {} run past port {}",
                self.num_ports,
                self.base_port,
                u16::MAX
            )
            .into());
        }

        let mut torrc = String::new();
        for port in u32::from(self.base_port)..=last {
            torrc.push_str(&format!("SocksPort {} IsolateSOCKSAuth\n", port));
        }
        torrc.push_str(&format!(
            "MaxCircuitDirtiness {}\n",
            self.max_circuit_dirtiness
        ));

        Ok(torrc.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_torrc() {
        let torrc = TorrcConfig::default().render().unwrap();

        assert_eq!(
            String::from_utf8(torrc).unwrap(),
            "SocksPort 9050 IsolateSOCKSAuth\nMaxCircuitDirtiness 600\n"
        );
    }

    #[test]
    fn test_multiple_ports() {
        let config = TorrcConfig {
            num_ports: 3,
            max_circuit_dirtiness: 30,
            ..TorrcConfig::default()
        };
        let torrc = String::from_utf8(config.render().unwrap()).unwrap();

        let lines: Vec<_> = torrc.lines().collect();
        assert_eq!(
            lines,
            [
                "SocksPort 9050 IsolateSOCKSAuth",
                "SocksPort 9051 IsolateSOCKSAuth",
                "SocksPort 9052 IsolateSOCKSAuth",
                "MaxCircuitDirtiness 30",
            ]
        );
    }

    #[test]
    fn test_port_range_checked() {
        let zero = TorrcConfig {
            num_ports: 0,
            ..TorrcConfig::default()
        };
        assert!(zero.render().is_err());

        let top = TorrcConfig {
            num_ports: 2,
            base_port: u16::MAX,
            ..TorrcConfig::default()
        };
        assert!(top.render().is_err());

        let last = TorrcConfig {
            num_ports: 1,
            base_port: u16::MAX,
            ..TorrcConfig::default()
        };
        assert!(last.render().is_ok());
    }
}
