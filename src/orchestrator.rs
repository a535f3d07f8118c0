//! Orchestrator for VPC topology operations
//!
//! Handles:
//! - Precondition checks against the topology store
//! - Building the ordered directive plan for each operation
//! - Running the plan through the effector, honoring each step's policy
//! - Persisting the topology only after the plan completes
//!
//! Nothing is rolled back. When a mandatory directive fails the remaining
//! directives are skipped and the store is left untouched, so any objects
//! created earlier in the plan are orphans the operator has to remove.

pub mod state;

use crate::directive::{Directive, FilterOp, FilterRule, Policy, Route, RouteVia, Step, Target};
use crate::effector::Effector;
use crate::error::{Error, Result};
use crate::firewall::FirewallPolicy;
use crate::network::{LinkPair, addressing, ident};
use crate::store::{Identifier, Subnet, SubnetType, Topology, TopologyStore, Vpc};
use ipnet::IpNet;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

pub use state::{Operation, Phase};

/// Outcome of a completed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub label: String,
    pub phase: Phase,
    pub applied: usize,
    pub skipped: usize,
}

impl From<&Operation> for Report {
    fn from(op: &Operation) -> Self {
        Self {
            label: op.label.clone(),
            phase: op.phase(),
            applied: op.applied,
            skipped: op.skipped,
        }
    }
}

/// Drives topology operations against a store and an effector
pub struct Orchestrator<S: TopologyStore, E: Effector> {
    store: S,
    effector: E,
    /// Run directives but never persist
    dry_run: bool,
}

impl<S: TopologyStore, E: Effector> Orchestrator<S, E> {
    pub fn new(store: S, effector: E) -> Self {
        Self {
            store,
            effector,
            dry_run: false,
        }
    }

    /// Skip persistence (pair with a non-executing effector)
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub fn effector_mut(&mut self) -> &mut E {
        &mut self.effector
    }

    /// Current topology snapshot
    pub fn list(&self) -> Result<Topology> {
        self.store.load()
    }

    /// Create a VPC: bridge, isolation rules, bridge address
    pub fn create_vpc(&mut self, name: &str, cidr: &str, interface: &str) -> Result<Report> {
        ident::validate_vpc_name(name)?;
        let mut topology = self.store.load()?;

        if topology.vpcs.contains_key(name) {
            return Err(Error::already_exists("VPC", name));
        }

        let block = ipv4_block(cidr)?;
        let cidr = block.to_string();
        let bridge_ip = addressing::plan_vpc(&cidr)?;
        addressing::validate_non_overlap(
            &block,
            topology
                .vpcs
                .iter()
                .map(|(n, v)| (n.as_str(), v.cidr.as_str())),
        )?;

        let bridge = ident::bridge_name(name);
        check_identifier(&topology, Identifier::Link, &bridge, &format!("VPC {}", name))?;

        info!("Creating VPC: {} with CIDR: {}", name, cidr);

        let mut op = Operation::new(format!("create-vpc {}", name));
        let steps = create_vpc_steps(&bridge, &bridge_ip.with_prefix());
        self.execute(&mut op, &steps)?;

        topology.vpcs.insert(
            name.to_string(),
            Vpc {
                cidr,
                bridge,
                bridge_ip: bridge_ip.addr,
                internet_interface: interface.to_string(),
                subnets: BTreeMap::new(),
            },
        );
        self.commit(&mut op, Some(&topology))?;

        Ok(Report::from(&op))
    }

    /// Add a subnet namespace to a VPC
    pub fn add_subnet(
        &mut self,
        vpc_name: &str,
        name: &str,
        cidr: &str,
        kind: SubnetType,
    ) -> Result<Report> {
        ident::validate_subnet_name(name)?;
        let mut topology = self.store.load()?;
        let vpc = topology.vpc(vpc_name)?;

        if vpc.subnets.contains_key(name) {
            return Err(Error::already_exists("Subnet", format!("{}/{}", vpc_name, name)));
        }

        let block = ipv4_block(cidr)?;
        let cidr = block.to_string();
        let plan = addressing::plan_subnet(&cidr)?;
        addressing::validate_non_overlap(
            &block,
            vpc.subnets
                .iter()
                .map(|(n, s)| (n.as_str(), s.cidr.as_str())),
        )?;

        let namespace = ident::namespace_name(vpc_name, name);
        let link = ident::subnet_link(vpc_name, name);
        let wanted = format!("subnet {}/{}", vpc_name, name);
        check_identifier(&topology, Identifier::Namespace, &namespace, &wanted)?;
        for id in [&link.host, &link.peer] {
            check_identifier(&topology, Identifier::Link, id, &wanted)?;
        }

        let subnet = Subnet {
            cidr,
            kind,
            namespace,
            ip: plan.host.addr,
            gateway: plan.gateway.addr,
            veth_host: link.host,
            veth_ns: link.peer,
        };

        info!("Creating {} subnet: {} in VPC {}", kind, name, vpc_name);

        let mut steps = subnet_steps(
            &vpc.bridge,
            &subnet,
            &plan.host.with_prefix(),
            &plan.gateway.with_prefix(),
        );
        if kind == SubnetType::Public {
            info!("Setting up NAT for subnet {}", subnet.cidr);
            steps.extend(nat_steps(&vpc.bridge, &vpc.internet_interface, &subnet.cidr));
        }

        let mut op = Operation::new(format!("add-subnet {} {}", vpc_name, name));
        self.execute(&mut op, &steps)?;

        topology
            .vpc_mut(vpc_name)?
            .subnets
            .insert(name.to_string(), subnet);
        self.commit(&mut op, Some(&topology))?;

        Ok(Report::from(&op))
    }

    /// Join two VPC bridges with a veth pair and routes
    ///
    /// Re-peering rebuilds the same link: any existing one is deleted first.
    pub fn peer(&mut self, vpc1: &str, vpc2: &str) -> Result<Report> {
        let topology = self.store.load()?;
        let (first, second) = peer_pair(&topology, vpc1, vpc2)?;

        info!("Peering VPC {} with {}", vpc1, vpc2);

        let link = ident::peer_link(vpc1, vpc2);
        let steps = peer_steps(&link, first, second);

        let mut op = Operation::new(format!("peer {} {}", vpc1, vpc2));
        self.execute(&mut op, &steps)?;
        self.commit(&mut op, None)?;

        Ok(Report::from(&op))
    }

    /// Remove the peering link, routes and accept rules between two VPCs
    pub fn unpeer(&mut self, vpc1: &str, vpc2: &str) -> Result<Report> {
        let topology = self.store.load()?;
        let (first, second) = peer_pair(&topology, vpc1, vpc2)?;

        info!("Removing peering between {} and {}", vpc1, vpc2);

        let link = ident::peer_link(vpc1, vpc2);
        let steps = unpeer_steps(&link, first, second);

        let mut op = Operation::new(format!("unpeer {} {}", vpc1, vpc2));
        self.execute(&mut op, &steps)?;
        self.commit(&mut op, None)?;

        Ok(Report::from(&op))
    }

    /// Append a policy's ingress rules inside a subnet namespace
    pub fn apply_firewall(
        &mut self,
        vpc_name: &str,
        subnet_name: &str,
        policy: &FirewallPolicy,
    ) -> Result<Report> {
        let topology = self.store.load()?;
        let subnet = topology.vpc(vpc_name)?.subnet(subnet_name)?;

        info!("Applying firewall rules to {}", subnet_name);

        let steps: Vec<Step> = policy
            .ingress
            .iter()
            .map(|rule| {
                info!("  - {}", rule);
                Step::mandatory(rule.directive(&subnet.namespace))
            })
            .collect();

        let mut op = Operation::new(format!("apply-firewall {} {}", vpc_name, subnet_name));
        self.execute(&mut op, &steps)?;
        self.commit(&mut op, None)?;

        Ok(Report::from(&op))
    }

    /// Tear down a VPC and all of its subnets
    ///
    /// Every cleanup directive is best-effort; the VPC record is removed
    /// even if some objects could not be deleted.
    pub fn delete_vpc(&mut self, name: &str) -> Result<Report> {
        let mut topology = self.store.load()?;
        let vpc = topology.vpc(name)?;

        info!("Deleting VPC: {}", name);

        let steps = delete_vpc_steps(vpc);

        let mut op = Operation::new(format!("delete-vpc {}", name));
        self.execute(&mut op, &steps)?;

        topology.vpcs.remove(name);
        self.commit(&mut op, Some(&topology))?;

        Ok(Report::from(&op))
    }

    /// Run steps in order; stop at the first mandatory failure
    fn execute(&mut self, op: &mut Operation, steps: &[Step]) -> Result<()> {
        op.begin();

        for (i, step) in steps.iter().enumerate() {
            match self.effector.apply(step) {
                Ok(()) => op.applied += 1,
                Err(e) if step.policy == Policy::BestEffort => {
                    warn!(operation = %op.label, "ignoring failed directive: {}", e);
                    op.skipped += 1;
                }
                Err(e) => {
                    op.abort();
                    error!(
                        operation = %op.label,
                        applied = op.applied,
                        "aborted at directive {} of {}",
                        i + 1,
                        steps.len()
                    );
                    let message = match e {
                        Error::CommandFailed { message, .. } => message,
                        other => other.to_string(),
                    };
                    return Err(Error::DirectiveFailed {
                        step: i + 1,
                        directive: step.directive.to_string(),
                        message,
                    });
                }
            }
        }

        op.finish();
        Ok(())
    }

    /// Persist the mutated topology (if any) and mark the operation committed
    fn commit(&mut self, op: &mut Operation, topology: Option<&Topology>) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        if let Some(topology) = topology {
            self.store.persist(topology)?;
        }
        op.commit();
        Ok(())
    }
}

/// Parse a block and require IPv4 (isolation and NAT rules are iptables rules)
fn ipv4_block(cidr: &str) -> Result<IpNet> {
    let block = addressing::parse_block(cidr)?;
    if let IpNet::V6(_) = block {
        return Err(Error::InvalidBlock {
            block: cidr.to_string(),
            reason: "only IPv4 blocks are supported".to_string(),
        });
    }
    Ok(block)
}

/// Reject a derived identifier already held by another object of the same kind
fn check_identifier(topology: &Topology, kind: Identifier, id: &str, wanted: &str) -> Result<()> {
    match topology.identifier_holder(kind, id) {
        Some(holder) => Err(Error::IdentifierCollision {
            id: id.to_string(),
            wanted: wanted.to_string(),
            holder,
        }),
        None => Ok(()),
    }
}

/// Look up both VPCs of a peering, in canonical order
fn peer_pair<'a>(topology: &'a Topology, vpc1: &str, vpc2: &str) -> Result<(&'a Vpc, &'a Vpc)> {
    topology.vpc(vpc1)?;
    topology.vpc(vpc2)?;

    if vpc1 == vpc2 {
        return Err(Error::InvalidName {
            name: vpc1.to_string(),
            reason: "a VPC cannot be peered with itself".to_string(),
        });
    }

    let (first, second) = ident::canonical_pair(vpc1, vpc2);
    Ok((topology.vpc(first)?, topology.vpc(second)?))
}

fn create_vpc_steps(bridge: &str, bridge_addr: &str) -> Vec<Step> {
    vec![
        Step::mandatory(Directive::CreateBridge {
            name: bridge.to_string(),
        }),
        Step::mandatory(Directive::SetLinkUp {
            link: bridge.to_string(),
            netns: None,
        }),
        Step::best_effort(Directive::EnableBridgeNetfilter),
        Step::best_effort(Directive::Filter {
            op: FilterOp::Append,
            rule: FilterRule::forward(bridge, bridge, Target::Accept),
            netns: None,
        }),
        Step::best_effort(Directive::Filter {
            op: FilterOp::Append,
            rule: FilterRule::forward_elsewhere(bridge, Target::Drop),
            netns: None,
        }),
        Step::mandatory(Directive::AddAddress {
            dev: bridge.to_string(),
            addr: bridge_addr.to_string(),
            netns: None,
        }),
        Step::best_effort(Directive::EnableIpForwarding),
    ]
}

fn subnet_steps(bridge: &str, subnet: &Subnet, host_addr: &str, gateway_addr: &str) -> Vec<Step> {
    let ns = Some(subnet.namespace.clone());

    vec![
        Step::mandatory(Directive::CreateNamespace {
            name: subnet.namespace.clone(),
        }),
        Step::mandatory(Directive::CreateVethPair {
            pair: LinkPair {
                host: subnet.veth_host.clone(),
                peer: subnet.veth_ns.clone(),
            },
        }),
        Step::mandatory(Directive::MoveToNamespace {
            link: subnet.veth_ns.clone(),
            netns: subnet.namespace.clone(),
        }),
        Step::mandatory(Directive::AttachToBridge {
            link: subnet.veth_host.clone(),
            bridge: bridge.to_string(),
        }),
        Step::mandatory(Directive::SetLinkUp {
            link: subnet.veth_host.clone(),
            netns: None,
        }),
        Step::mandatory(Directive::SetLinkUp {
            link: "lo".to_string(),
            netns: ns.clone(),
        }),
        Step::mandatory(Directive::AddAddress {
            dev: subnet.veth_ns.clone(),
            addr: host_addr.to_string(),
            netns: ns.clone(),
        }),
        Step::mandatory(Directive::SetLinkUp {
            link: subnet.veth_ns.clone(),
            netns: ns.clone(),
        }),
        // Every subnet's gateway lives on the shared VPC bridge
        Step::mandatory(Directive::AddAddress {
            dev: bridge.to_string(),
            addr: gateway_addr.to_string(),
            netns: None,
        }),
        Step::mandatory(Directive::AddRoute(Route {
            destination: "default".to_string(),
            via: RouteVia::Gateway(subnet.gateway),
            netns: ns,
        })),
    ]
}

/// NAT for one public subnet; the FORWARD rules repeat for every public subnet
fn nat_steps(bridge: &str, interface: &str, cidr: &str) -> Vec<Step> {
    vec![
        Step::mandatory(Directive::Filter {
            op: FilterOp::Append,
            rule: FilterRule::masquerade(cidr, interface),
            netns: None,
        }),
        Step::mandatory(Directive::Filter {
            op: FilterOp::Append,
            rule: FilterRule::forward(bridge, interface, Target::Accept),
            netns: None,
        }),
        Step::mandatory(Directive::Filter {
            op: FilterOp::Append,
            rule: FilterRule::forward(interface, bridge, Target::Accept),
            netns: None,
        }),
    ]
}

fn peer_steps(link: &LinkPair, first: &Vpc, second: &Vpc) -> Vec<Step> {
    vec![
        Step::best_effort(Directive::DeleteLink {
            name: link.host.clone(),
        }),
        Step::best_effort(Directive::DeleteLink {
            name: link.peer.clone(),
        }),
        Step::mandatory(Directive::CreateVethPair { pair: link.clone() }),
        // No addresses on the peer link: traffic follows the explicit routes below
        Step::mandatory(Directive::AttachToBridge {
            link: link.host.clone(),
            bridge: first.bridge.clone(),
        }),
        Step::mandatory(Directive::SetLinkUp {
            link: link.host.clone(),
            netns: None,
        }),
        Step::mandatory(Directive::AttachToBridge {
            link: link.peer.clone(),
            bridge: second.bridge.clone(),
        }),
        Step::mandatory(Directive::SetLinkUp {
            link: link.peer.clone(),
            netns: None,
        }),
        Step::mandatory(Directive::ReplaceRoute(peer_route(second, first))),
        Step::mandatory(Directive::ReplaceRoute(peer_route(first, second))),
        Step::best_effort(Directive::Filter {
            op: FilterOp::Insert,
            rule: FilterRule::forward(&first.bridge, &second.bridge, Target::Accept),
            netns: None,
        }),
        Step::best_effort(Directive::Filter {
            op: FilterOp::Insert,
            rule: FilterRule::forward(&second.bridge, &first.bridge, Target::Accept),
            netns: None,
        }),
    ]
}

fn unpeer_steps(link: &LinkPair, first: &Vpc, second: &Vpc) -> Vec<Step> {
    vec![
        Step::best_effort(Directive::DeleteLink {
            name: link.host.clone(),
        }),
        Step::best_effort(Directive::DeleteRoute(peer_route(second, first))),
        Step::best_effort(Directive::DeleteRoute(peer_route(first, second))),
        Step::best_effort(Directive::Filter {
            op: FilterOp::Delete,
            rule: FilterRule::forward(&first.bridge, &second.bridge, Target::Accept),
            netns: None,
        }),
        Step::best_effort(Directive::Filter {
            op: FilterOp::Delete,
            rule: FilterRule::forward(&second.bridge, &first.bridge, Target::Accept),
            netns: None,
        }),
    ]
}

/// Route making `remote`'s block reachable through `local`'s bridge
fn peer_route(remote: &Vpc, local: &Vpc) -> Route {
    Route {
        destination: remote.cidr.clone(),
        via: RouteVia::Device(local.bridge.clone()),
        netns: None,
    }
}

fn delete_vpc_steps(vpc: &Vpc) -> Vec<Step> {
    let mut steps = Vec::new();

    for subnet in vpc.subnets.values() {
        // Deleting the namespace removes the veth end inside it
        steps.push(Step::best_effort(Directive::DeleteNamespace {
            name: subnet.namespace.clone(),
        }));
        steps.push(Step::best_effort(Directive::DeleteLink {
            name: subnet.veth_host.clone(),
        }));
        if let Ok(block) = addressing::parse_block(&subnet.cidr) {
            steps.push(Step::best_effort(Directive::RemoveAddress {
                dev: vpc.bridge.clone(),
                addr: format!("{}/{}", subnet.gateway, block.prefix_len()),
                netns: None,
            }));
        }
    }

    for subnet in vpc.subnets.values().filter(|s| s.kind == SubnetType::Public) {
        for step in nat_steps(&vpc.bridge, &vpc.internet_interface, &subnet.cidr) {
            if let Directive::Filter { rule, netns, .. } = step.directive {
                steps.push(Step::best_effort(Directive::Filter {
                    op: FilterOp::Delete,
                    rule,
                    netns,
                }));
            }
        }
    }

    steps.push(Step::best_effort(Directive::Filter {
        op: FilterOp::Delete,
        rule: FilterRule::forward(&vpc.bridge, &vpc.bridge, Target::Accept),
        netns: None,
    }));
    steps.push(Step::best_effort(Directive::Filter {
        op: FilterOp::Delete,
        rule: FilterRule::forward_elsewhere(&vpc.bridge, Target::Drop),
        netns: None,
    }));
    steps.push(Step::best_effort(Directive::DeleteLink {
        name: vpc.bridge.clone(),
    }));

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effector::RecordingEffector;
    use crate::store::MemoryStore;

    type TestOrchestrator = Orchestrator<MemoryStore, RecordingEffector>;

    fn orchestrator() -> TestOrchestrator {
        Orchestrator::new(MemoryStore::default(), RecordingEffector::new())
    }

    fn failing_on(pattern: &str) -> TestOrchestrator {
        Orchestrator::new(
            MemoryStore::default(),
            RecordingEffector::new().fail_on(pattern),
        )
    }

    /// Fresh orchestrator over an existing topology with a different effector
    fn reseeded(orch: TestOrchestrator, effector: RecordingEffector) -> TestOrchestrator {
        let topology = orch.list().unwrap();
        Orchestrator::new(
            MemoryStore {
                topology,
                persists: 0,
            },
            effector,
        )
    }

    fn commands(orch: &mut TestOrchestrator) -> Vec<String> {
        orch.effector_mut().commands()
    }

    fn policy(json: &str) -> FirewallPolicy {
        FirewallPolicy::from_json(json).unwrap()
    }

    #[test]
    fn test_create_vpc() {
        let mut orch = orchestrator();
        let report = orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();

        assert_eq!(report.phase, Phase::Committed);
        assert_eq!(report.applied, 7);

        let vpc = orch.store().topology.vpc("app1").unwrap();
        assert_eq!(vpc.bridge, "br-app1");
        assert_eq!(vpc.bridge_ip.to_string(), "10.0.0.1");
        assert_eq!(vpc.internet_interface, "eth0");
        assert_eq!(orch.store().persists, 1);

        assert_eq!(
            commands(&mut orch),
            vec![
                "ip link add br-app1 type bridge",
                "ip link set br-app1 up",
                "sysctl -w net.bridge.bridge-nf-call-iptables=1",
                "iptables -A FORWARD -i br-app1 -o br-app1 -j ACCEPT",
                "iptables -A FORWARD -i br-app1 ! -o br-app1 -j DROP",
                "ip addr add 10.0.0.1/16 dev br-app1",
                "sysctl -w net.ipv4.ip_forward=1",
            ]
        );
    }

    #[test]
    fn test_create_vpc_twice() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.effector_mut().clear();

        let err = orch.create_vpc("app1", "10.5.0.0/16", "eth0").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { kind: "VPC", .. }));
        assert!(commands(&mut orch).is_empty());
        assert_eq!(orch.store().persists, 1);
    }

    #[test]
    fn test_create_vpc_rejects_bad_input() {
        let mut orch = orchestrator();

        assert!(matches!(
            orch.create_vpc("app1", "10.0.0.0/40", "eth0"),
            Err(Error::InvalidBlock { .. })
        ));
        assert!(matches!(
            orch.create_vpc("app1", "fd00::/64", "eth0"),
            Err(Error::InvalidBlock { .. })
        ));
        assert!(matches!(
            orch.create_vpc("much-too-long-name", "10.0.0.0/16", "eth0"),
            Err(Error::InvalidName { .. })
        ));
        assert!(commands(&mut orch).is_empty());
        assert_eq!(orch.store().persists, 0);
    }

    #[test]
    fn test_create_vpc_rejects_host_bits() {
        let mut orch = orchestrator();
        assert!(matches!(
            orch.create_vpc("app1", "10.0.5.0/16", "eth0"),
            Err(Error::InvalidBlock { .. })
        ));
        assert!(commands(&mut orch).is_empty());
        assert!(orch.store().topology.vpcs.is_empty());
    }

    #[test]
    fn test_blocks_are_stored_normalized() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", " 10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24 ", SubnetType::Public)
            .unwrap();
        assert!(matches!(
            orch.add_subnet("app1", "db", "10.0.2.9/24", SubnetType::Private),
            Err(Error::InvalidBlock { .. })
        ));

        let vpc = orch.store().topology.vpc("app1").unwrap();
        assert_eq!(vpc.cidr, "10.0.0.0/16");
        assert_eq!(vpc.subnet("web").unwrap().cidr, "10.0.1.0/24");
        assert!(commands(&mut orch).contains(
            &"iptables -t nat -A POSTROUTING -s 10.0.1.0/24 -o eth0 -j MASQUERADE".to_string()
        ));
    }

    #[test]
    fn test_create_vpc_overlap() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.effector_mut().clear();

        let err = orch.create_vpc("app2", "10.0.128.0/17", "eth0").unwrap_err();
        assert!(matches!(err, Error::Overlap { .. }));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_create_vpc_mandatory_failure_aborts() {
        let mut orch = failing_on("ip link set br-app1 up");
        let err = orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap_err();

        match err {
            Error::DirectiveFailed { step, directive, .. } => {
                assert_eq!(step, 2);
                assert_eq!(directive, "ip link set br-app1 up");
            }
            other => panic!("unexpected error: {}", other),
        }

        // The bridge was created, nothing after the failure ran, nothing was persisted
        assert_eq!(commands(&mut orch).len(), 2);
        assert!(orch.store().topology.vpcs.is_empty());
        assert_eq!(orch.store().persists, 0);
    }

    #[test]
    fn test_create_vpc_best_effort_failures_ignored() {
        let mut orch = failing_on("sysctl");
        let report = orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();

        assert_eq!(report.phase, Phase::Committed);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.applied, 5);
        assert!(orch.store().topology.vpcs.contains_key("app1"));
    }

    #[test]
    fn test_add_public_subnet() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.effector_mut().clear();

        let report = orch
            .add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Public)
            .unwrap();
        assert_eq!(report.phase, Phase::Committed);

        let web = orch
            .store()
            .topology
            .vpc("app1")
            .unwrap()
            .subnet("web")
            .unwrap()
            .clone();
        assert_eq!(web.ip.to_string(), "10.0.1.1");
        assert_eq!(web.gateway.to_string(), "10.0.1.2");
        assert_eq!(web.namespace, "app1-web");
        assert_eq!(web.kind, SubnetType::Public);

        let link = ident::subnet_link("app1", "web");
        assert_eq!(web.veth_host, link.host);
        assert_eq!(web.veth_ns, link.peer);

        let cmds = commands(&mut orch);
        let expected = vec![
            "ip netns add app1-web".to_string(),
            format!("ip link add {} type veth peer name {}", link.host, link.peer),
            format!("ip link set {} netns app1-web", link.peer),
            format!("ip link set {} master br-app1", link.host),
            format!("ip link set {} up", link.host),
            "ip netns exec app1-web ip link set lo up".to_string(),
            format!("ip netns exec app1-web ip addr add 10.0.1.1/24 dev {}", link.peer),
            format!("ip netns exec app1-web ip link set {} up", link.peer),
            "ip addr add 10.0.1.2/24 dev br-app1".to_string(),
            "ip netns exec app1-web ip route add default via 10.0.1.2".to_string(),
            "iptables -t nat -A POSTROUTING -s 10.0.1.0/24 -o eth0 -j MASQUERADE".to_string(),
            "iptables -A FORWARD -i br-app1 -o eth0 -j ACCEPT".to_string(),
            "iptables -A FORWARD -i eth0 -o br-app1 -j ACCEPT".to_string(),
        ];
        assert_eq!(cmds, expected);
    }

    #[test]
    fn test_add_private_subnet_has_no_nat() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.effector_mut().clear();

        orch.add_subnet("app1", "db", "10.0.2.0/24", SubnetType::Private)
            .unwrap();

        let cmds = commands(&mut orch);
        assert_eq!(cmds.len(), 10);
        assert!(!cmds.iter().any(|c| c.contains("MASQUERADE")));
    }

    #[test]
    fn test_public_subnets_duplicate_forward_rules() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Public)
            .unwrap();
        orch.add_subnet("app1", "api", "10.0.2.0/24", SubnetType::Public)
            .unwrap();

        let accepts = commands(&mut orch)
            .iter()
            .filter(|c| c.as_str() == "iptables -A FORWARD -i br-app1 -o eth0 -j ACCEPT")
            .count();
        assert_eq!(accepts, 2);
    }

    #[test]
    fn test_add_subnet_missing_vpc() {
        let mut orch = orchestrator();
        let err = orch
            .add_subnet("ghost", "web", "10.0.1.0/24", SubnetType::Public)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "VPC", .. }));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_add_subnet_twice() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Private)
            .unwrap();
        orch.effector_mut().clear();

        let err = orch
            .add_subnet("app1", "web", "10.0.9.0/24", SubnetType::Private)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { kind: "Subnet", .. }));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_add_subnet_overlapping_sibling() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Private)
            .unwrap();

        let err = orch
            .add_subnet("app1", "api", "10.0.1.128/25", SubnetType::Private)
            .unwrap_err();
        assert!(matches!(err, Error::Overlap { ref owner, .. } if owner == "web"));
    }

    #[test]
    fn test_add_subnet_block_too_small() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();

        let err = orch
            .add_subnet("app1", "tiny", "10.0.3.7/32", SubnetType::Private)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBlock { .. }));
    }

    #[test]
    fn test_add_subnet_failure_leaves_store_untouched() {
        let mut orch = failing_on("netns app1-web");
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.effector_mut().clear();

        let err = orch
            .add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Public)
            .unwrap_err();
        // Namespace and veth pair were created before the move failed
        assert!(matches!(err, Error::DirectiveFailed { step: 3, .. }));
        assert_eq!(commands(&mut orch).len(), 3);
        assert!(orch.store().topology.vpc("app1").unwrap().subnets.is_empty());
        assert_eq!(orch.store().persists, 1);
    }

    #[test]
    fn test_add_subnet_identifier_collision() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();

        // A subnet recorded under another name already owns the namespace "app1-web"
        let mut topology = orch.store().topology.clone();
        let vpc = topology.vpc_mut("app1").unwrap();
        vpc.subnets.insert(
            "legacy".to_string(),
            Subnet {
                cidr: "10.0.50.0/24".to_string(),
                kind: SubnetType::Private,
                namespace: "app1-web".to_string(),
                ip: "10.0.50.1".parse().unwrap(),
                gateway: "10.0.50.2".parse().unwrap(),
                veth_host: "vh000000".to_string(),
                veth_ns: "vn000000".to_string(),
            },
        );
        let mut orch = Orchestrator::new(
            MemoryStore {
                topology,
                persists: 0,
            },
            RecordingEffector::new(),
        );

        let err = orch
            .add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Private)
            .unwrap_err();
        assert!(matches!(err, Error::IdentifierCollision { ref holder, .. } if holder == "subnet app1/legacy"));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_namespace_and_bridge_may_share_a_name() {
        let mut orch = orchestrator();
        orch.create_vpc("br", "10.0.0.0/16", "eth0").unwrap();
        // Namespace "br-x"
        orch.add_subnet("br", "x", "10.0.1.0/24", SubnetType::Private)
            .unwrap();

        // Bridge "br-x"
        let report = orch.create_vpc("x", "10.1.0.0/16", "eth0").unwrap();
        assert_eq!(report.phase, Phase::Committed);
        assert_eq!(orch.store().topology.vpc("x").unwrap().bridge, "br-x");
    }

    fn two_vpcs() -> TestOrchestrator {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.create_vpc("app2", "10.1.0.0/16", "eth0").unwrap();
        orch.effector_mut().clear();
        orch
    }

    #[test]
    fn test_peer() {
        let mut orch = two_vpcs();
        let report = orch.peer("app1", "app2").unwrap();
        assert_eq!(report.phase, Phase::Committed);

        let link = ident::peer_link("app1", "app2");
        let cmds = commands(&mut orch);
        assert_eq!(cmds[0], format!("ip link del {}", link.host));
        assert_eq!(cmds[1], format!("ip link del {}", link.peer));
        assert_eq!(
            cmds[2],
            format!("ip link add {} type veth peer name {}", link.host, link.peer)
        );
        assert!(cmds.contains(&format!("ip link set {} master br-app1", link.host)));
        assert!(cmds.contains(&format!("ip link set {} master br-app2", link.peer)));
        assert!(cmds.contains(&"ip route replace 10.1.0.0/16 dev br-app1".to_string()));
        assert!(cmds.contains(&"ip route replace 10.0.0.0/16 dev br-app2".to_string()));
        assert!(cmds.contains(&"iptables -I FORWARD -i br-app1 -o br-app2 -j ACCEPT".to_string()));
        assert!(cmds.contains(&"iptables -I FORWARD -i br-app2 -o br-app1 -j ACCEPT".to_string()));
        assert!(!cmds.iter().any(|c| c.contains("addr add")));

        // Peering is not persisted
        assert_eq!(orch.store().persists, 2);
    }

    #[test]
    fn test_repeer_is_identical() {
        let mut orch = two_vpcs();

        orch.peer("app1", "app2").unwrap();
        let first = commands(&mut orch);
        orch.effector_mut().clear();

        orch.peer("app1", "app2").unwrap();
        let second = commands(&mut orch);
        orch.effector_mut().clear();

        orch.peer("app2", "app1").unwrap();
        let reversed = commands(&mut orch);

        assert_eq!(first, second);
        assert_eq!(first, reversed);
    }

    #[test]
    fn test_peer_tolerates_missing_old_link() {
        let link = ident::peer_link("app1", "app2");
        let mut orch = reseeded(
            two_vpcs(),
            RecordingEffector::new().fail_on(&format!("ip link del {}", link.host)),
        );

        let report = orch.peer("app1", "app2").unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.phase, Phase::Committed);
    }

    #[test]
    fn test_peer_missing_vpc() {
        let mut orch = two_vpcs();
        let err = orch.peer("app1", "ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "VPC", .. }));
        let err = orch.peer("ghost", "app2").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "VPC", .. }));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_peer_with_itself() {
        let mut orch = two_vpcs();
        assert!(matches!(
            orch.peer("app1", "app1"),
            Err(Error::InvalidName { .. })
        ));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_unpeer() {
        let mut orch = two_vpcs();
        let report = orch.unpeer("app2", "app1").unwrap();
        assert_eq!(report.applied, 5);

        let link = ident::peer_link("app1", "app2");
        let cmds = commands(&mut orch);
        assert_eq!(cmds[0], format!("ip link del {}", link.host));
        assert!(cmds.contains(&"ip route del 10.1.0.0/16 dev br-app1".to_string()));
        assert!(cmds.contains(&"iptables -D FORWARD -i br-app2 -o br-app1 -j ACCEPT".to_string()));
    }

    #[test]
    fn test_unpeer_missing_vpc() {
        let mut orch = two_vpcs();
        let err = orch.unpeer("app1", "ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "VPC", .. }));
        let err = orch.unpeer("ghost", "app2").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "VPC", .. }));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_unpeer_ignores_failures() {
        let mut orch = reseeded(two_vpcs(), RecordingEffector::new().fail_on("ip"));
        let report = orch.unpeer("app1", "app2").unwrap();
        assert_eq!(report.skipped, 5);
        assert_eq!(report.phase, Phase::Committed);
    }

    fn with_web_subnet() -> TestOrchestrator {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Public)
            .unwrap();
        orch.effector_mut().clear();
        orch
    }

    #[test]
    fn test_apply_firewall_single_rule() {
        let mut orch = with_web_subnet();
        let report = orch
            .apply_firewall(
                "app1",
                "web",
                &policy(r#"{"ingress":[{"port":80,"protocol":"tcp","action":"allow"}]}"#),
            )
            .unwrap();
        assert_eq!(report.applied, 1);

        assert_eq!(
            commands(&mut orch),
            vec!["ip netns exec app1-web iptables -A INPUT -p tcp --dport 80 -j ACCEPT"]
        );
    }

    #[test]
    fn test_apply_firewall_preserves_order_and_accumulates() {
        let mut orch = with_web_subnet();
        let rules = policy(
            r#"{"ingress":[
                {"port":22,"protocol":"tcp","action":"deny"},
                {"port":443,"protocol":"tcp","action":"allow"},
                {"port":53,"protocol":"udp","action":"allow"}
            ]}"#,
        );

        orch.apply_firewall("app1", "web", &rules).unwrap();
        orch.apply_firewall("app1", "web", &rules).unwrap();

        let expected = [
            "ip netns exec app1-web iptables -A INPUT -p tcp --dport 22 -j DROP",
            "ip netns exec app1-web iptables -A INPUT -p tcp --dport 443 -j ACCEPT",
            "ip netns exec app1-web iptables -A INPUT -p udp --dport 53 -j ACCEPT",
        ];
        let cmds = commands(&mut orch);
        assert_eq!(cmds.len(), 6);
        assert_eq!(cmds[..3], expected);
        assert_eq!(cmds[3..], expected);
    }

    #[test]
    fn test_apply_firewall_missing_targets() {
        let mut orch = with_web_subnet();
        let rules = policy(r#"{"ingress":[{"port":80,"protocol":"tcp","action":"allow"}]}"#);

        assert!(matches!(
            orch.apply_firewall("ghost", "web", &rules),
            Err(Error::NotFound { kind: "VPC", .. })
        ));
        assert!(matches!(
            orch.apply_firewall("app1", "ghost", &rules),
            Err(Error::NotFound { kind: "Subnet", .. })
        ));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_delete_vpc() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Public)
            .unwrap();
        orch.add_subnet("app1", "db", "10.0.2.0/24", SubnetType::Private)
            .unwrap();
        orch.effector_mut().clear();

        let report = orch.delete_vpc("app1").unwrap();
        assert_eq!(report.phase, Phase::Committed);
        assert!(orch.store().topology.vpcs.is_empty());

        let web = ident::subnet_link("app1", "web");
        let cmds = commands(&mut orch);
        assert!(cmds.contains(&"ip netns del app1-web".to_string()));
        assert!(cmds.contains(&"ip netns del app1-db".to_string()));
        assert!(cmds.contains(&format!("ip link del {}", web.host)));
        assert!(cmds.contains(&"ip addr del 10.0.1.2/24 dev br-app1".to_string()));
        assert!(cmds.contains(&"ip addr del 10.0.2.2/24 dev br-app1".to_string()));
        assert!(cmds.contains(
            &"iptables -t nat -D POSTROUTING -s 10.0.1.0/24 -o eth0 -j MASQUERADE".to_string()
        ));
        assert!(!cmds.iter().any(|c| c.contains("10.0.2.0/24")));
        assert_eq!(
            cmds[cmds.len() - 3..],
            [
                "iptables -D FORWARD -i br-app1 -o br-app1 -j ACCEPT",
                "iptables -D FORWARD -i br-app1 ! -o br-app1 -j DROP",
                "ip link del br-app1",
            ]
        );
    }

    #[test]
    fn test_delete_vpc_despite_cleanup_failures() {
        let mut orch = reseeded(with_web_subnet(), RecordingEffector::new().fail_on(""));

        let report = orch.delete_vpc("app1").unwrap();
        assert_eq!(report.applied, 0);
        assert!(report.skipped > 0);
        assert!(orch.store().topology.vpcs.is_empty());
        assert_eq!(orch.store().persists, 1);
    }

    #[test]
    fn test_delete_vpc_twice() {
        let mut orch = with_web_subnet();
        orch.delete_vpc("app1").unwrap();
        orch.effector_mut().clear();

        let err = orch.delete_vpc("app1").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "VPC", .. }));
        assert!(commands(&mut orch).is_empty());
    }

    #[test]
    fn test_dry_run_never_persists() {
        let mut orch = orchestrator().dry_run(true);
        let report = orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();

        assert_eq!(report.phase, Phase::Applied);
        assert_eq!(commands(&mut orch).len(), 7);
        assert!(orch.store().topology.vpcs.is_empty());
        assert_eq!(orch.store().persists, 0);
    }

    #[test]
    fn test_operations_reload_store() {
        let mut orch = orchestrator();
        orch.create_vpc("app1", "10.0.0.0/16", "eth0").unwrap();
        orch.add_subnet("app1", "web", "10.0.1.0/24", SubnetType::Private)
            .unwrap();

        let listed = orch.list().unwrap();
        assert_eq!(listed.vpcs.len(), 1);
        assert!(listed.vpc("app1").unwrap().subnets.contains_key("web"));
    }
}
