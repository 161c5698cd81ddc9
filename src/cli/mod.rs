//! CLI module for netlab
//!
//! Provides subcommands:
//! - `netlab serve` - Run the controller
//! - `netlab compute` - List, add, remove or probe compute hosts
//! - `netlab node list` - List the nodes of a project
//! - `netlab watch` - Follow a project's notification stream
//! - `netlab validate` - Check a controller settings file

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

/// Default controller URL used by client subcommands
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3080";

#[derive(Parser, Debug)]
#[command(name = "netlab")]
#[command(about = "Orchestrate network-emulation labs across compute hosts")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Controller URL for client subcommands
    #[arg(long, global = true, env = "NETLAB_SERVER", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller
    Serve(ServeArgs),

    /// Manage compute hosts
    Compute(ComputeArgs),

    /// Inspect nodes
    Node(NodeArgs),

    /// Follow a project's notifications
    Watch(WatchArgs),

    /// Validate a controller settings file
    Validate(ValidateArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug, Default)]
pub struct ServeArgs {
    /// Path to the settings file (default: ~/.netlab/controller.yaml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Bind address for the API
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to a .env file for compute credentials
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Back every compute with the in-memory simulator
    #[arg(long)]
    pub simulate: bool,

    /// Register a simulated compute named after this machine
    #[arg(long)]
    pub local_compute: bool,
}

/// Arguments for the compute command
#[derive(Parser, Debug)]
pub struct ComputeArgs {
    #[command(subcommand)]
    pub action: ComputeAction,
}

#[derive(Subcommand, Debug)]
pub enum ComputeAction {
    /// List registered computes
    #[command(visible_alias = "ls")]
    List,

    /// Register a compute
    Add {
        /// Host name or address of the compute
        host: String,

        /// API port of the compute
        #[arg(long, default_value_t = crate::compute::DEFAULT_COMPUTE_PORT)]
        port: u16,

        /// Identifier (default: host:port)
        #[arg(long)]
        id: Option<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Reach the compute over https
        #[arg(long)]
        https: bool,

        /// Basic-auth user
        #[arg(long)]
        user: Option<String>,

        /// Basic-auth password
        #[arg(long, env = "NETLAB_COMPUTE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Unregister a compute
    #[command(visible_alias = "rm")]
    Remove {
        /// Compute identifier
        id: String,

        /// Drop the nodes it still hosts
        #[arg(long)]
        force: bool,
    },

    /// Probe a compute now
    Probe {
        /// Compute identifier
        id: String,
    },
}

/// Arguments for the node command
#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[command(subcommand)]
    pub action: NodeCommand,
}

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// List the nodes of a project
    #[command(visible_alias = "ls")]
    List {
        /// Project identifier
        project: uuid::Uuid,
    },
}

/// Arguments for the watch command
#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Project identifier
    pub project: uuid::Uuid,

    /// Resume after this sequence number
    #[arg(long)]
    pub resume_from: Option<u64>,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the settings file
    pub file: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["netlab", "serve", "--simulate", "--port", "4000"]);
        match cli.command {
            Commands::Serve(args) => {
                assert!(args.simulate);
                assert!(!args.local_compute);
                assert_eq!(args.port, Some(4000));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_parse_compute_add() {
        let cli = Cli::parse_from([
            "netlab", "compute", "add", "10.0.0.5", "--id", "lab1", "--https",
        ]);
        match cli.command {
            Commands::Compute(args) => match args.action {
                ComputeAction::Add {
                    host,
                    port,
                    id,
                    https,
                    ..
                } => {
                    assert_eq!(host, "10.0.0.5");
                    assert_eq!(port, 3080);
                    assert_eq!(id.as_deref(), Some("lab1"));
                    assert!(https);
                }
                _ => panic!("Expected Add action"),
            },
            _ => panic!("Expected Compute command"),
        }
    }

    #[test]
    fn test_parse_compute_remove_force() {
        let cli = Cli::parse_from(["netlab", "compute", "rm", "lab1", "--force"]);
        match cli.command {
            Commands::Compute(args) => match args.action {
                ComputeAction::Remove { id, force } => {
                    assert_eq!(id, "lab1");
                    assert!(force);
                }
                _ => panic!("Expected Remove action"),
            },
            _ => panic!("Expected Compute command"),
        }
    }

    #[test]
    fn test_parse_watch() {
        let project = uuid::Uuid::new_v4().to_string();
        let cli = Cli::parse_from(["netlab", "watch", &project, "--resume-from", "12"]);
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.project.to_string(), project);
                assert_eq!(args.resume_from, Some(12));
            }
            _ => panic!("Expected Watch command"),
        }
    }

    #[test]
    fn test_verbose_global() {
        let cli = Cli::parse_from(["netlab", "-vvv", "compute", "list"]);
        assert_eq!(cli.verbose, 3);
        assert_eq!(cli.server, DEFAULT_SERVER_URL);
    }
}
