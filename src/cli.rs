//! Command-line interface for vpcctl
//!
//! Uses clap with derive for type-safe CLI parsing

use crate::store::SubnetType;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// vpcctl - Linux VPC manager
#[derive(Parser)]
#[command(name = "vpcctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (default: /etc/vpcctl/vpcctl.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Topology state file (overrides the config file)
    #[arg(short, long)]
    pub state: Option<PathBuf>,

    /// Print directives without running them or saving state
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create a new VPC
    CreateVpc {
        /// VPC name
        name: String,

        /// CIDR block (e.g., 10.0.0.0/16)
        cidr: String,

        /// Internet interface used for NAT
        #[arg(long)]
        interface: Option<String>,
    },

    /// Add a subnet to a VPC
    AddSubnet {
        /// VPC name
        vpc: String,

        /// Subnet name
        name: String,

        /// Subnet CIDR
        cidr: String,

        /// Subnet type
        #[arg(long = "type", value_enum, default_value_t = SubnetType::Private)]
        kind: SubnetType,
    },

    /// Peer two VPCs
    Peer {
        /// First VPC
        vpc1: String,

        /// Second VPC
        vpc2: String,
    },

    /// Remove the peering between two VPCs
    Unpeer {
        /// First VPC
        vpc1: String,

        /// Second VPC
        vpc2: String,
    },

    /// Apply firewall rules to a subnet
    ApplyFirewall {
        /// VPC name
        vpc: String,

        /// Subnet name
        subnet: String,

        /// Policy JSON file
        policy: PathBuf,
    },

    /// List all VPCs
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete a VPC and all of its subnets
    DeleteVpc {
        /// VPC name
        name: String,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Commands {
    /// Whether the command changes kernel state
    pub fn mutates(&self) -> bool {
        !matches!(self, Commands::List { .. } | Commands::Completion { .. })
    }
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "vpcctl", &mut std::io::stdout());
    }
}
