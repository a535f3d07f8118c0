//! Network directives emitted by the orchestrator
//!
//! A directive is one imperative instruction to the Linux networking stack.
//! Each renders to a single `ip`, `iptables` or `sysctl` invocation; the
//! effector decides how (or whether) to run it.

use crate::network::LinkPair;
use std::fmt;
use std::net::IpAddr;

/// How a directive failure affects the rest of its operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The new state depends on this directive; failure aborts the operation
    Mandatory,
    /// Failure is logged and the sequence continues
    BestEffort,
}

/// iptables rule operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Append,
    Insert,
    Delete,
}

impl FilterOp {
    fn flag(&self) -> &'static str {
        match self {
            FilterOp::Append => "-A",
            FilterOp::Insert => "-I",
            FilterOp::Delete => "-D",
        }
    }
}

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

/// iptables jump target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Masquerade,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Masquerade => "MASQUERADE",
        };
        write!(f, "{}", s)
    }
}

/// A packet-filter rule, independent of whether it is added or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub table: Table,
    pub chain: &'static str,
    pub source: Option<String>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    /// Match packets leaving through any interface except `out_iface`
    pub out_negated: bool,
    pub protocol: Option<String>,
    pub dport: Option<u16>,
    pub target: Target,
}

impl FilterRule {
    fn new(table: Table, chain: &'static str, target: Target) -> Self {
        Self {
            table,
            chain,
            source: None,
            in_iface: None,
            out_iface: None,
            out_negated: false,
            protocol: None,
            dport: None,
            target,
        }
    }

    /// FORWARD rule from `in_iface` to `out_iface`
    pub fn forward(in_iface: &str, out_iface: &str, target: Target) -> Self {
        let mut rule = Self::new(Table::Filter, "FORWARD", target);
        rule.in_iface = Some(in_iface.to_string());
        rule.out_iface = Some(out_iface.to_string());
        rule
    }

    /// FORWARD rule from `iface` to anything but `iface`
    pub fn forward_elsewhere(iface: &str, target: Target) -> Self {
        let mut rule = Self::forward(iface, iface, target);
        rule.out_negated = true;
        rule
    }

    /// POSTROUTING masquerade of `source` leaving through `out_iface`
    pub fn masquerade(source: &str, out_iface: &str) -> Self {
        let mut rule = Self::new(Table::Nat, "POSTROUTING", Target::Masquerade);
        rule.source = Some(source.to_string());
        rule.out_iface = Some(out_iface.to_string());
        rule
    }

    /// INPUT rule matching a destination port
    pub fn input_port(protocol: &str, port: u16, target: Target) -> Self {
        let mut rule = Self::new(Table::Filter, "INPUT", target);
        rule.protocol = Some(protocol.to_string());
        rule.dport = Some(port);
        rule
    }

    fn args(&self, op: FilterOp) -> Vec<String> {
        let mut args = Vec::new();

        if self.table == Table::Nat {
            args.extend(["-t".to_string(), "nat".to_string()]);
        }
        args.extend([op.flag().to_string(), self.chain.to_string()]);

        if let Some(source) = &self.source {
            args.extend(["-s".to_string(), source.clone()]);
        }
        if let Some(iface) = &self.in_iface {
            args.extend(["-i".to_string(), iface.clone()]);
        }
        if let Some(iface) = &self.out_iface {
            if self.out_negated {
                args.push("!".to_string());
            }
            args.extend(["-o".to_string(), iface.clone()]);
        }
        if let Some(protocol) = &self.protocol {
            args.extend(["-p".to_string(), protocol.clone()]);
        }
        if let Some(port) = self.dport {
            args.extend(["--dport".to_string(), port.to_string()]);
        }
        args.extend(["-j".to_string(), self.target.to_string()]);

        args
    }
}

/// Where a route sends traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteVia {
    Device(String),
    Gateway(IpAddr),
}

/// A route, inside a namespace or on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination block, or "default"
    pub destination: String,
    pub via: RouteVia,
    pub netns: Option<String>,
}

impl Route {
    fn args(&self, verb: &str) -> Vec<String> {
        let mut args = vec![
            "ip".to_string(),
            "route".to_string(),
            verb.to_string(),
            self.destination.clone(),
        ];
        match &self.via {
            RouteVia::Device(dev) => args.extend(["dev".to_string(), dev.clone()]),
            RouteVia::Gateway(gw) => args.extend(["via".to_string(), gw.to_string()]),
        }
        args
    }
}

/// One instruction to the networking stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    CreateBridge { name: String },
    /// Delete any link (bridge, veth end); deleting one veth end removes both
    DeleteLink { name: String },
    SetLinkUp { link: String, netns: Option<String> },
    CreateNamespace { name: String },
    DeleteNamespace { name: String },
    CreateVethPair { pair: LinkPair },
    MoveToNamespace { link: String, netns: String },
    AttachToBridge { link: String, bridge: String },
    AddAddress { dev: String, addr: String, netns: Option<String> },
    RemoveAddress { dev: String, addr: String, netns: Option<String> },
    AddRoute(Route),
    ReplaceRoute(Route),
    DeleteRoute(Route),
    Filter {
        op: FilterOp,
        rule: FilterRule,
        netns: Option<String>,
    },
    EnableIpForwarding,
    EnableBridgeNetfilter,
}

impl Directive {
    /// Render the directive as a program and its arguments
    pub fn argv(&self) -> Vec<String> {
        let (netns, cmd): (Option<&String>, Vec<String>) = match self {
            Directive::CreateBridge { name } => {
                (None, ip(&["link", "add", name, "type", "bridge"]))
            }
            Directive::DeleteLink { name } => (None, ip(&["link", "del", name])),
            Directive::SetLinkUp { link, netns } => {
                (netns.as_ref(), ip(&["link", "set", link, "up"]))
            }
            Directive::CreateNamespace { name } => (None, ip(&["netns", "add", name])),
            Directive::DeleteNamespace { name } => (None, ip(&["netns", "del", name])),
            Directive::CreateVethPair { pair } => (
                None,
                ip(&["link", "add", &pair.host, "type", "veth", "peer", "name", &pair.peer]),
            ),
            Directive::MoveToNamespace { link, netns } => {
                (None, ip(&["link", "set", link, "netns", netns]))
            }
            Directive::AttachToBridge { link, bridge } => {
                (None, ip(&["link", "set", link, "master", bridge]))
            }
            Directive::AddAddress { dev, addr, netns } => {
                (netns.as_ref(), ip(&["addr", "add", addr, "dev", dev]))
            }
            Directive::RemoveAddress { dev, addr, netns } => {
                (netns.as_ref(), ip(&["addr", "del", addr, "dev", dev]))
            }
            Directive::AddRoute(route) => (route.netns.as_ref(), route.args("add")),
            Directive::ReplaceRoute(route) => (route.netns.as_ref(), route.args("replace")),
            Directive::DeleteRoute(route) => (route.netns.as_ref(), route.args("del")),
            Directive::Filter { op, rule, netns } => {
                let mut cmd = vec!["iptables".to_string()];
                cmd.extend(rule.args(*op));
                (netns.as_ref(), cmd)
            }
            Directive::EnableIpForwarding => {
                (None, sysctl("net.ipv4.ip_forward=1"))
            }
            Directive::EnableBridgeNetfilter => {
                (None, sysctl("net.bridge.bridge-nf-call-iptables=1"))
            }
        };

        match netns {
            Some(ns) => {
                let mut wrapped = ip(&["netns", "exec", ns]);
                wrapped.extend(cmd);
                wrapped
            }
            None => cmd,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

fn ip(args: &[&str]) -> Vec<String> {
    std::iter::once("ip")
        .chain(args.iter().copied())
        .map(String::from)
        .collect()
}

fn sysctl(setting: &str) -> Vec<String> {
    vec!["sysctl".to_string(), "-w".to_string(), setting.to_string()]
}

/// A directive together with its failure policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub directive: Directive,
    pub policy: Policy,
}

impl Step {
    pub fn mandatory(directive: Directive) -> Self {
        Self {
            directive,
            policy: Policy::Mandatory,
        }
    }

    pub fn best_effort(directive: Directive) -> Self {
        Self {
            directive,
            policy: Policy::BestEffort,
        }
    }
}
