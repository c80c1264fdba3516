//! CLI argument parsing using clap v4
//!
//! Besides the subcommands, a host started by a launcher receives its group
//! membership as `--fleetlink-*=value` join arguments. They are stripped from
//! argv before clap sees it, so any command line can carry them.

use clap::{Parser, Subcommand};

use crate::config::{split_addresses, JoinArgs};
use crate::error::{Error, Result};

const HOST_ID_ARG: &str = "--fleetlink-host-id=";
const HOSTS_ARG: &str = "--fleetlink-hosts=";
const JOB_ID_ARG: &str = "--fleetlink-job-id=";

/// fleetlink - host-to-host transport for accelerator fleets
///
/// Joins a group of hosts, discovers every accelerator in the group and
/// moves tasks and bulk data between them.
#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the group and run the built-in workload
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "FLEETLINK_CONFIG")]
        config: Option<String>,

        /// Number of simulated devices on this host
        #[arg(long)]
        simulated_devices: Option<u32>,
    },

    /// Start a group of local hosts, one process each, on loopback
    Launch {
        /// Number of hosts to start
        #[arg(short = 'n', long, default_value = "2")]
        hosts: usize,

        /// First port when NO_RANDOM_PORTS is set
        #[arg(long, default_value = "7070")]
        base_port: u16,

        /// Path to configuration file passed to every host
        #[arg(short, long, env = "FLEETLINK_CONFIG")]
        config: Option<String>,

        /// Number of simulated devices on each host
        #[arg(long)]
        simulated_devices: Option<u32>,

        /// Job identifier (random if not set)
        #[arg(long)]
        job_id: Option<String>,
    },

    /// List the devices this host would contribute
    Devices {
        /// Path to configuration file
        #[arg(short, long, env = "FLEETLINK_CONFIG")]
        config: Option<String>,

        /// Number of simulated devices to add
        #[arg(long)]
        simulated_devices: Option<u32>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: Option<String>,
    },
}

// ─────────────────────────────────────────────────────────────────
// Join Arguments
// ─────────────────────────────────────────────────────────────────

/// Remove join arguments from `args`, returning the rest and what they said.
/// The first element (program name) is always kept.
pub fn strip_join_args<I>(args: I) -> Result<(Vec<String>, JoinArgs)>
where
    I: IntoIterator<Item = String>,
{
    let mut rest = Vec::new();
    let mut join = JoinArgs::default();

    for arg in args {
        if let Some(value) = arg.strip_prefix(HOST_ID_ARG) {
            let id = value.parse().map_err(|_| {
                Error::config_field_invalid("host.id", format!("invalid host id '{}'", value))
            })?;
            join.host_id = Some(id);
        } else if let Some(value) = arg.strip_prefix(HOSTS_ARG) {
            join.hosts = Some(split_addresses(value));
        } else if let Some(value) = arg.strip_prefix(JOB_ID_ARG) {
            join.job_id = Some(value.to_string());
        } else {
            rest.push(arg);
        }
    }

    Ok((rest, join))
}

/// Join arguments telling a host who it is
pub fn join_args(host_id: usize, hosts: &[String], job_id: &str) -> Vec<String> {
    vec![
        format!("{}{}", HOST_ID_ARG, host_id),
        format!("{}{}", HOSTS_ARG, hosts.join(",")),
        format!("{}{}", JOB_ID_ARG, job_id),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["fleetlink", "run", "--simulated-devices", "2"]);
        match cli.command {
            Commands::Run { config, simulated_devices } => {
                assert!(config.is_none());
                assert_eq!(simulated_devices, Some(2));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_launch_defaults() {
        let cli = Cli::parse_from(["fleetlink", "launch"]);
        match cli.command {
            Commands::Launch { hosts, base_port, job_id, .. } => {
                assert_eq!(hosts, 2);
                assert_eq!(base_port, 7070);
                assert!(job_id.is_none());
            }
            _ => panic!("Expected Launch command"),
        }
    }

    #[test]
    fn test_launch_with_options() {
        let cli = Cli::parse_from(["fleetlink", "launch", "-n", "4", "--base-port", "9000"]);
        match cli.command {
            Commands::Launch { hosts, base_port, .. } => {
                assert_eq!(hosts, 4);
                assert_eq!(base_port, 9000);
            }
            _ => panic!("Expected Launch command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["fleetlink", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["fleetlink", "config", "init", "--force"]);
        match cli.command {
            Commands::Config { subcommand: ConfigSubcommand::Init { path, force } } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_strip_join_args() {
        let (rest, join) = strip_join_args(args(&[
            "fleetlink",
            "--fleetlink-host-id=1",
            "run",
            "--fleetlink-hosts=127.0.0.1:7000,127.0.0.1:7001",
            "--fleetlink-job-id=abc",
            "-v",
        ]))
        .unwrap();

        assert_eq!(rest, args(&["fleetlink", "run", "-v"]));
        assert_eq!(join.host_id, Some(1));
        assert_eq!(join.hosts.unwrap(), args(&["127.0.0.1:7000", "127.0.0.1:7001"]));
        assert_eq!(join.job_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_strip_leaves_other_args() {
        let (rest, join) = strip_join_args(args(&["fleetlink", "run", "--config", "x.toml"])).unwrap();
        assert_eq!(rest.len(), 4);
        assert!(join.is_empty());
    }

    #[test]
    fn test_strip_rejects_bad_host_id() {
        assert!(strip_join_args(args(&["fleetlink", "--fleetlink-host-id=first"])).is_err());
    }

    #[test]
    fn test_join_args_roundtrip_through_strip() {
        let hosts = args(&["127.0.0.1:1", "127.0.0.1:2"]);
        let mut argv = args(&["fleetlink", "run"]);
        argv.extend(join_args(1, &hosts, "job"));

        let (rest, join) = strip_join_args(argv).unwrap();
        assert_eq!(rest, args(&["fleetlink", "run"]));
        assert_eq!(join.host_id, Some(1));
        assert_eq!(join.hosts, Some(hosts));
    }
}
