//! fleetlink - host launcher and CLI
//!
//! `run` joins a group and executes the built-in workload; `launch` starts a
//! whole group of local hosts, one process each, wired together with join
//! arguments.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::process::{Child, Command};

use clap::Parser;
use tracing::{error, info};

use fleetlink::cli::{self, Cli, Commands, ConfigSubcommand};
use fleetlink::config::{self, Backend, FleetConfig, JoinArgs};
use fleetlink::error::{Error, Result};
use fleetlink::{device, logging, version, workload};

/// Environment signal forcing sequential ports instead of OS-assigned ones
const NO_RANDOM_PORTS: &str = "NO_RANDOM_PORTS";

fn main() {
    let outcome = cli::strip_join_args(std::env::args()).and_then(|(args, join)| {
        let cli = Cli::parse_from(args);
        dispatch(cli, join)
    });

    if let Err(e) = outcome {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli, join: JoinArgs) -> Result<()> {
    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand, &join)
        }
        Commands::Devices { config, simulated_devices } => {
            logging::init_simple(tracing::Level::WARN)?;
            let config = load_config(config.as_deref(), &join, simulated_devices)?;
            list_devices(&config)
        }
        Commands::Run { config, simulated_devices } => {
            let config = load_config(config.as_deref(), &join, simulated_devices)?;

            // The guards must be kept alive for the lifetime of the program
            let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;
            run_hosts(&config)
        }
        Commands::Launch {
            hosts,
            base_port,
            config,
            simulated_devices,
            job_id,
        } => {
            logging::init_simple(if cli.quiet {
                tracing::Level::ERROR
            } else {
                tracing::Level::INFO
            })?;
            let mut extra = Vec::new();
            if let Some(ref path) = config {
                extra.push(format!("--config={}", path));
            }
            if let Some(n) = simulated_devices {
                extra.push(format!("--simulated-devices={}", n));
            }
            if cli.verbose > 0 {
                extra.push(format!("-{}", "v".repeat(cli.verbose as usize)));
            }
            if cli.quiet {
                extra.push("--quiet".to_string());
            }
            launch(hosts, base_port, job_id, &extra)
        }
    }
}

fn load_config(path: Option<&str>, join: &JoinArgs, simulated_devices: Option<u32>) -> Result<FleetConfig> {
    let mut config = FleetConfig::load_with_join(path, join)?;
    if let Some(n) = simulated_devices {
        config.devices.simulated = n;
        config.validate()?;
    }
    Ok(config)
}

// ─────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────

fn run_hosts(config: &FleetConfig) -> Result<()> {
    let build = version::build_info();
    info!(
        version = %build.full_version(),
        backend = ?config.transport.backend,
        hosts = config.host_count(),
        job_id = %config.host.job_id,
        "Starting fleetlink"
    );

    let summaries = workload::run(config)?;
    for summary in summaries.iter().filter(|s| s.host_id == 0) {
        println!(
            "fleetlink: {} hosts, {} devices, {} echoes verified, {} bulk bytes in {} ms",
            summary.host_count,
            summary.group_devices,
            summary.echoes_verified,
            summary.bulk_bytes,
            summary.elapsed.as_millis()
        );
    }
    Ok(())
}

fn list_devices(config: &FleetConfig) -> Result<()> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let devices = device::local_devices(&config.devices)?;

    println!("Devices on {} (vulkan: {}):", host, device::is_vulkan_available());
    if devices.is_empty() {
        println!("  none");
    }
    for (local_id, props) in devices.iter().enumerate() {
        println!("  [{}] {}", local_id, props.summary());
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Launch
// ─────────────────────────────────────────────────────────────────

/// Loopback listen addresses for `count` hosts
fn launch_addresses(count: usize, base_port: u16) -> Result<Vec<String>> {
    if std::env::var_os(NO_RANDOM_PORTS).is_some() {
        return (0..count)
            .map(|i| {
                u16::try_from(i)
                    .ok()
                    .and_then(|i| base_port.checked_add(i))
                    .map(|port| format!("127.0.0.1:{}", port))
                    .ok_or_else(|| Error::config_field_invalid("base_port", "port range overflows"))
            })
            .collect();
    }

    // Hold every listener until all ports are known so none repeats
    let listeners = (0..count)
        .map(|_| TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
        .collect::<std::io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(|l| Ok(l.local_addr()?.to_string()))
        .collect()
}

fn launch(hosts: usize, base_port: u16, job_id: Option<String>, extra: &[String]) -> Result<()> {
    if hosts == 0 {
        return Err(Error::config_field_invalid("hosts", "at least one host is required"));
    }
    let addresses = launch_addresses(hosts, base_port)?;
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let exe = std::env::current_exe()?;
    info!(hosts, job_id = %job_id, addresses = ?addresses, "Launching hosts");

    let mut children: Vec<Child> = Vec::with_capacity(hosts);
    for host_id in 0..hosts {
        let spawned = Command::new(&exe)
            .arg("run")
            .args(extra)
            .args(cli::join_args(host_id, &addresses, &job_id))
            .spawn();
        match spawned {
            Ok(child) => children.push(child),
            Err(e) => {
                for child in children.iter_mut() {
                    let _ = child.kill();
                }
                return Err(e.into());
            }
        }
    }

    let mut failed = Vec::new();
    for (host_id, mut child) in children.into_iter().enumerate() {
        let status = child.wait()?;
        if !status.success() {
            error!(host_id, status = %status, "Host exited with failure");
            failed.push(format!("host {} exited with {}", host_id, status));
        }
    }

    if failed.is_empty() {
        info!(hosts, "All hosts finished");
        Ok(())
    } else {
        Err(Error::workload(failed.join("; ")))
    }
}

// ─────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(subcommand: ConfigSubcommand, join: &JoinArgs) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = FleetConfig::load_with_join(config.as_deref(), join)?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let written = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", written.display());
        }
        ConfigSubcommand::Validate { config } => {
            let cfg = FleetConfig::load_with_join(config.as_deref(), join)?;
            let backend = match cfg.transport.backend {
                Backend::Local => "local",
                Backend::Tcp => "tcp",
            };
            println!(
                "Configuration is valid ({} backend, {} hosts).",
                backend,
                cfg.host_count()
            );
        }
    }

    Ok(())
}
