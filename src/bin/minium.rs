// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{value_parser, Arg, ArgMatches, Command};
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use miniumrc::control::{self, ControlServer};
use miniumrc::msg::{Request, Response};
use miniumrc::procs::{RunnerState, Supervisor};
use miniumrc::registry::Registry;
use miniumrc::torrc::{self, TorrcConfig};
use miniumrc::Error;

const RUN: &str = "run";
const CHECK: &str = "check";
const START: &str = "start";
const STOP: &str = "stop";
const RESTART: &str = "restart";
const STATUS: &str = "status";
const TORRC: &str = "torrc";

const CONFIG: &str = "config";
const SOCKET: &str = "socket";
const NAME: &str = "name";
const TIMEOUT: &str = "timeout";
const STOP_TIMEOUT: &str = "stop-timeout";
const PORTS: &str = "ports";
const BASE_PORT: &str = "base-port";
const MAX_CIRCUIT: &str = "max-circuit";
const OUTPUT: &str = "output";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn socket_opt(self) -> Self;
    fn config_opt(self) -> Self;
    fn target_opts(self) -> Self;
}

impl SetupClapApp for Command {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn socket_opt(self) -> Self {
        self.arg(
            Arg::new(SOCKET)
                .short('s')
                .long(SOCKET)
                .value_name("PATH")
                .env(control::SOCKET_ENV)
                .value_parser(value_parser!(PathBuf))
                .help("control socket of the supervisor"),
        )
    }

    fn config_opt(self) -> Self {
        self.arg(
            Arg::new(CONFIG)
                .value_name("FILE")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("service registry, TOML or JSON (by extension)"),
        )
    }

    fn target_opts(self) -> Self {
        self.arg(
            Arg::new(NAME)
                .value_name("NAME")
                .help("service to act on, all services when omitted"),
        )
        .arg(
            Arg::new(TIMEOUT)
                .short('t')
                .long(TIMEOUT)
                .value_name("SECONDS")
                .default_value("60")
                .value_parser(value_parser!(u64))
                .help("how long to wait for the supervisor to answer"),
        )
        .socket_opt()
    }
}

fn run_sub_command() -> Command {
    Command::new(RUN)
        .about("load a registry and supervise its services until interrupted")
        .config_opt()
        .socket_opt()
        .arg(
            Arg::new(STOP_TIMEOUT)
                .long(STOP_TIMEOUT)
                .value_name("MILLIS")
                .value_parser(value_parser!(u64))
                .help("grace period for every service on shutdown, overriding their own"),
        )
}

fn torrc_sub_command() -> Command {
    Command::new(TORRC)
        .about("write a Tor configuration with consecutive SocksPorts")
        .arg(
            Arg::new(PORTS)
                .long(PORTS)
                .value_name("COUNT")
                .env(torrc::NUM_PORTS_ENV)
                .default_value("1")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new(BASE_PORT)
                .long(BASE_PORT)
                .value_name("PORT")
                .default_value("9050")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new(MAX_CIRCUIT)
                .long(MAX_CIRCUIT)
                .value_name("SECONDS")
                .env(torrc::MAX_CIRCUIT_ENV)
                .default_value("600")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new(OUTPUT)
                .short('o')
                .long(OUTPUT)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("write here instead of stdout"),
        )
}

fn main() -> ExitCode {
    let args = Command::new("minium")
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .subcommand(run_sub_command().setup_clap_app())
        .subcommand(
            Command::new(CHECK)
                .about("validate a registry and list its services")
                .config_opt(),
        )
        .subcommand(
            Command::new(START)
                .about("start services of a running supervisor")
                .target_opts(),
        )
        .subcommand(
            Command::new(STOP)
                .about("stop services of a running supervisor")
                .target_opts(),
        )
        .subcommand(
            Command::new(RESTART)
                .about("restart services of a running supervisor")
                .target_opts(),
        )
        .subcommand(
            Command::new(STATUS)
                .about("show the state of supervised services")
                .target_opts(),
        )
        .subcommand(torrc_sub_command())
        .get_matches();

    init_logging();

    let runtime = match runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to initialize Tokio Runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        match args.subcommand() {
            Some((RUN, args)) => run(args).await,
            Some((CHECK, args)) => check(args),
            Some((START, args)) => ctl(args, Request::Start(target(args))).await,
            Some((STOP, args)) => ctl(args, Request::Stop(target(args))).await,
            Some((RESTART, args)) => ctl(args, Request::Restart(target(args))).await,
            Some((STATUS, args)) => ctl(args, Request::Status(target(args))).await,
            Some((TORRC, args)) => write_torrc(args),
            Some((arg, _)) => Err(Error::from(format!("unexpected command: {}", arg))),
            None => Err(Error::from("command required")),
        }
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            if e.is_validation() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn socket_path(args: &ArgMatches) -> PathBuf {
    args.get_one::<PathBuf>(SOCKET)
        .cloned()
        .unwrap_or_else(control::default_socket_path)
}

fn target(args: &ArgMatches) -> Option<String> {
    args.get_one::<String>(NAME).cloned()
}

async fn run(args: &ArgMatches) -> Result<ExitCode, Error> {
    let config = args
        .get_one::<PathBuf>(CONFIG)
        .ok_or("a registry file is required")?;
    let stop_timeout = args
        .get_one::<u64>(STOP_TIMEOUT)
        .map(|millis| Duration::from_millis(*millis));

    let registry = Registry::from_path(config)?;
    info!(
        services = registry.len(),
        config = %config.display(),
        "registry loaded"
    );

    // bind first, a second supervisor must not spawn duplicates
    let server = ControlServer::bind(&socket_path(args)).await?;
    let supervisor = Supervisor::new(registry);
    supervisor.start_all();

    let mut terminate = signal(SignalKind::terminate())?;
    let served = tokio::select! {
        served = server.serve(Arc::clone(&supervisor)) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("terminated");
            Ok(())
        }
    };

    info!("stopping all services");
    supervisor.stop_all(stop_timeout).await;
    drop(server);

    served.map(|()| ExitCode::SUCCESS)
}

fn check(args: &ArgMatches) -> Result<ExitCode, Error> {
    let config = args
        .get_one::<PathBuf>(CONFIG)
        .ok_or("a registry file is required")?;
    let registry = Registry::from_path(config)?;

    for spec in registry.iter() {
        println!(
            "{:<24} {} {}",
            spec.name(),
            spec.command(),
            spec.args().join(" ")
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn ctl(args: &ArgMatches, request: Request) -> Result<ExitCode, Error> {
    let timeout = args
        .get_one::<u64>(TIMEOUT)
        .copied()
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

    let response = control::request(
        &socket_path(args),
        request.clone(),
        Duration::from_secs(timeout),
    )
    .await?;

    match response {
        Response::States(states) => {
            print_states(&states);
            if control::succeeded(&request, &states) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Response::Error(message) => {
            eprintln!("error: {}", message);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_states(states: &[RunnerState]) {
    println!(
        "{:<24} {:<9} {:>8} {:>9} {:>10}",
        "NAME", "STATUS", "PID", "RESTARTS", "LAST EXIT"
    );

    for state in states {
        let pid = state.pid.map(|pid| pid.to_string()).unwrap_or_default();
        let last_exit = match (state.last_exit_code, state.last_signal) {
            (Some(code), _) => code.to_string(),
            (None, Some(signal)) => format!("sig {}", signal),
            (None, None) => String::new(),
        };

        println!(
            "{:<24} {:<9} {:>8} {:>9} {:>10}",
            state.name,
            state.status.to_string(),
            pid,
            state.restart_count,
            last_exit
        );
    }
}

fn write_torrc(args: &ArgMatches) -> Result<ExitCode, Error> {
    let defaults = TorrcConfig::default();
    let config = TorrcConfig {
        num_ports: args
            .get_one::<u16>(PORTS)
            .copied()
            .unwrap_or(defaults.num_ports),
        base_port: args
            .get_one::<u16>(BASE_PORT)
            .copied()
            .unwrap_or(defaults.base_port),
        max_circuit_dirtiness: args
            .get_one::<u32>(MAX_CIRCUIT)
            .copied()
            .unwrap_or(defaults.max_circuit_dirtiness),
    };

    let torrc = config.render()?;
    match args.get_one::<PathBuf>(OUTPUT) {
        Some(path) => std::fs::write(path, &torrc)?,
        None => std::io::stdout().write_all(&torrc)?,
    }

    Ok(ExitCode::SUCCESS)
}
