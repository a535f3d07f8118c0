//! Firewall policy documents for subnets
//!
//! A policy is a JSON file with an ordered `ingress` list:
//!
//! ```text
//! {"ingress": [{"port": 80, "protocol": "tcp", "action": "allow"}]}
//! ```
//!
//! Each rule becomes one INPUT rule appended inside the subnet namespace.
//! Rules are never diffed against what is already installed, so applying a
//! policy twice installs every rule twice.

use crate::directive::{Directive, FilterOp, FilterRule, Target};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

/// Rule verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[serde(alias = "ALLOW", alias = "Allow", alias = "accept")]
    Allow,
    #[serde(alias = "DENY", alias = "Deny", alias = "drop")]
    Deny,
}

impl Action {
    fn target(&self) -> Target {
        match self {
            Action::Allow => Target::Accept,
            Action::Deny => Target::Drop,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "ALLOW"),
            Action::Deny => write!(f, "DENY"),
        }
    }
}

/// Transport protocol matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(alias = "TCP")]
    Tcp,
    #[serde(alias = "UDP")]
    Udp,
    #[serde(alias = "SCTP")]
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        };
        write!(f, "{}", s)
    }
}

/// One ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    pub port: u16,
    pub protocol: Protocol,
    pub action: Action,
}

impl Rule {
    /// Directive appending this rule to the INPUT chain of `namespace`
    pub fn directive(&self, namespace: &str) -> Directive {
        Directive::Filter {
            op: FilterOp::Append,
            rule: FilterRule::input_port(
                &self.protocol.to_string(),
                self.port,
                self.action.target(),
            ),
            netns: Some(namespace.to_string()),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.action, self.protocol, self.port)
    }
}

/// A firewall policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FirewallPolicy {
    #[serde(default)]
    pub ingress: Vec<Rule>,
}

impl FirewallPolicy {
    /// Parse a policy from JSON text
    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }
}

/// Load a policy file
pub fn load(path: &Path) -> Result<FirewallPolicy> {
    let content = fs::read_to_string(path).map_err(|e| Error::PolicyRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    FirewallPolicy::from_json(&content).map_err(|e| Error::PolicyParse {
        path: path.to_path_buf(),
        source: e,
    })
}
