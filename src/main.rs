//! vpcctl - Linux VPC manager
//!
//! Builds isolated virtual networks on a single host from network
//! namespaces, bridges, veth pairs and iptables rules, and keeps the
//! resulting topology in a JSON state file.

mod cli;
mod config;
mod directive;
mod effector;
mod error;
mod firewall;
mod network;
mod orchestrator;
mod store;

use cli::{Cli, Commands};
use effector::{CommandEffector, DryRunEffector, Effector};
use error::{Error, Result};
use orchestrator::{Orchestrator, Phase, Report};
use store::{JsonFileStore, Topology, TopologyStore};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = config::load_or_default(cli.config.as_deref())?;
    let state_file = cli.state.clone().unwrap_or_else(|| config.state_file.clone());
    let store = JsonFileStore::new(state_file);
    tracing::debug!("Using state file {}", store.path().display());

    if cli.command.mutates() && !cli.dry_run && !nix::unistd::geteuid().is_root() {
        return Err(Error::PrivilegeRequired);
    }

    if cli.dry_run {
        println!("=== DRY RUN - No changes will be made ===\n");
        let orchestrator = Orchestrator::new(store, DryRunEffector::new()).dry_run(true);
        dispatch(cli.command, orchestrator, &config)
    } else {
        let orchestrator = Orchestrator::new(store, CommandEffector::new());
        dispatch(cli.command, orchestrator, &config)
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn dispatch<S: TopologyStore, E: Effector>(
    command: Commands,
    mut orchestrator: Orchestrator<S, E>,
    config: &config::Config,
) -> Result<()> {
    match command {
        Commands::CreateVpc {
            name,
            cidr,
            interface,
        } => {
            let interface = interface.unwrap_or_else(|| config.default_interface.clone());
            let report = orchestrator.create_vpc(&name, &cidr, &interface)?;
            summarize(&report, &format!("VPC '{}' created", name));
        }
        Commands::AddSubnet {
            vpc,
            name,
            cidr,
            kind,
        } => {
            let report = orchestrator.add_subnet(&vpc, &name, &cidr, kind)?;
            summarize(
                &report,
                &format!("Subnet '{}' ({}) added to VPC '{}'", name, kind, vpc),
            );
        }
        Commands::Peer { vpc1, vpc2 } => {
            let report = orchestrator.peer(&vpc1, &vpc2)?;
            summarize(&report, &format!("Peered '{}' <-> '{}'", vpc1, vpc2));
        }
        Commands::Unpeer { vpc1, vpc2 } => {
            let report = orchestrator.unpeer(&vpc1, &vpc2)?;
            summarize(&report, &format!("Unpeered '{}' <-> '{}'", vpc1, vpc2));
        }
        Commands::ApplyFirewall {
            vpc,
            subnet,
            policy,
        } => {
            let policy = firewall::load(&policy)?;
            let report = orchestrator.apply_firewall(&vpc, &subnet, &policy)?;
            summarize(
                &report,
                &format!(
                    "Applied {} firewall rule(s) to '{}/{}'",
                    policy.ingress.len(),
                    vpc,
                    subnet
                ),
            );
        }
        Commands::List { json } => {
            let topology = orchestrator.list()?;
            print_topology(&topology, json)?;
        }
        Commands::DeleteVpc { name } => {
            let report = orchestrator.delete_vpc(&name)?;
            summarize(&report, &format!("VPC '{}' deleted", name));
        }
        // Already handled before dispatch
        Commands::Completion { .. } => {}
    }

    Ok(())
}

fn summarize(report: &Report, message: &str) {
    for line in summary(report, message) {
        println!("{}", line);
    }
}

fn summary(report: &Report, message: &str) -> Vec<String> {
    let mut lines = vec![match report.phase {
        Phase::Committed => message.to_string(),
        _ => format!(
            "\n{} directive(s) planned for '{}'",
            report.applied, report.label
        ),
    }];

    if report.skipped > 0 {
        lines.push(format!(
            "  {} best-effort directive(s) failed and were skipped",
            report.skipped
        ));
    }

    lines
}

fn print_topology(topology: &Topology, json: bool) -> Result<()> {
    if json {
        let output = serde_json::to_string_pretty(topology).map_err(std::io::Error::other)?;
        println!("{}", output);
        return Ok(());
    }

    if topology.vpcs.is_empty() {
        println!("No VPCs found");
        return Ok(());
    }

    println!(
        "{:<14} {:<18} {:<16} {:<8} {:<18} {:<10}",
        "VPC", "CIDR", "SUBNET", "TYPE", "SUBNET CIDR", "IP"
    );
    println!("{}", "-".repeat(88));

    for (name, vpc) in &topology.vpcs {
        if vpc.subnets.is_empty() {
            println!(
                "{:<14} {:<18} {:<16} {:<8} {:<18} {:<10}",
                name, vpc.cidr, "-", "-", "-", "-"
            );
            continue;
        }

        for (subnet_name, subnet) in &vpc.subnets {
            println!(
                "{:<14} {:<18} {:<16} {:<8} {:<18} {:<10}",
                name,
                vpc.cidr,
                subnet_name,
                subnet.kind.to_string(),
                subnet.cidr,
                subnet.ip.to_string()
            );
        }
    }

    Ok(())
}
