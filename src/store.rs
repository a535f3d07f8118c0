//! Topology store for VPC state
//!
//! The store is the only record of which VPCs and subnets were provisioned
//! and under which derived identifiers. Every operation loads a full
//! snapshot, mutates it in memory, and persists the whole snapshot again
//! once its directives have succeeded.
//!
//! There is no locking: two concurrent invocations against the same state
//! file can lose updates.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Subnet reachability from the internet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubnetType {
    /// NAT through the VPC's internet interface
    Public,
    /// No outbound NAT
    #[default]
    Private,
}

impl std::fmt::Display for SubnetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubnetType::Public => write!(f, "public"),
            SubnetType::Private => write!(f, "private"),
        }
    }
}

/// A subnet: one namespace attached to its VPC bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub cidr: String,
    #[serde(rename = "type")]
    pub kind: SubnetType,
    pub namespace: String,
    /// Address inside the namespace
    pub ip: IpAddr,
    /// Address on the VPC bridge, used as the namespace's default route
    pub gateway: IpAddr,
    pub veth_host: String,
    pub veth_ns: String,
}

/// A VPC: one bridge and the subnets attached to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    pub cidr: String,
    pub bridge: String,
    pub bridge_ip: IpAddr,
    pub internet_interface: String,
    #[serde(default)]
    pub subnets: BTreeMap<String, Subnet>,
}

impl Vpc {
    /// Look up a subnet by name
    pub fn subnet(&self, name: &str) -> Result<&Subnet> {
        self.subnets
            .get(name)
            .ok_or_else(|| Error::not_found("Subnet", name))
    }
}

/// Kernel name space an identifier lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier {
    /// Network interfaces: bridges and veth ends
    Link,
    /// Network namespaces
    Namespace,
}

/// Full persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub vpcs: BTreeMap<String, Vpc>,
}

impl Topology {
    /// Look up a VPC by name
    pub fn vpc(&self, name: &str) -> Result<&Vpc> {
        self.vpcs.get(name).ok_or_else(|| Error::not_found("VPC", name))
    }

    /// Look up a VPC by name for mutation
    pub fn vpc_mut(&mut self, name: &str) -> Result<&mut Vpc> {
        self.vpcs
            .get_mut(name)
            .ok_or_else(|| Error::not_found("VPC", name))
    }

    /// Find the object already holding a kernel identifier, if any
    ///
    /// Links and namespaces are separate name spaces, so a namespace never
    /// collides with a bridge or veth of the same name. Returns a
    /// description such as "subnet app1/web" for error messages.
    pub fn identifier_holder(&self, kind: Identifier, id: &str) -> Option<String> {
        for (vpc_name, vpc) in &self.vpcs {
            if kind == Identifier::Link && vpc.bridge == id {
                return Some(format!("VPC {}", vpc_name));
            }
            for (subnet_name, subnet) in &vpc.subnets {
                let held = match kind {
                    Identifier::Link => subnet.veth_host == id || subnet.veth_ns == id,
                    Identifier::Namespace => subnet.namespace == id,
                };
                if held {
                    return Some(format!("subnet {}/{}", vpc_name, subnet_name));
                }
            }
        }
        None
    }
}

/// Load/persist contract used by the orchestrator
pub trait TopologyStore {
    /// Load the current snapshot (empty if nothing was persisted yet)
    fn load(&self) -> Result<Topology>;

    /// Replace the persisted snapshot
    fn persist(&mut self, topology: &Topology) -> Result<()>;
}

/// JSON file store (default `~/.vpcctl/vpcs.json`)
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_error(&self, source: io::Error) -> Error {
        Error::StoreWrite {
            path: self.path.clone(),
            source,
        }
    }
}

impl TopologyStore for JsonFileStore {
    fn load(&self) -> Result<Topology> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no state file, starting empty");
            return Ok(Topology::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| Error::StoreRead {
            path: self.path.clone(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| Error::StoreParse {
            path: self.path.clone(),
            source: e,
        })
    }

    fn persist(&mut self, topology: &Topology) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }

        let content = serde_json::to_string_pretty(topology)
            .map_err(|e| self.write_error(io::Error::other(e)))?;

        // Write then rename so a crash never leaves a truncated state file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| self.write_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.write_error(e))?;

        debug!(path = %self.path.display(), vpcs = topology.vpcs.len(), "state persisted");
        Ok(())
    }
}

/// In-memory store counting persists
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub topology: Topology,
    pub persists: usize,
}

#[cfg(test)]
impl TopologyStore for MemoryStore {
    fn load(&self) -> Result<Topology> {
        Ok(self.topology.clone())
    }

    fn persist(&mut self, topology: &Topology) -> Result<()> {
        self.topology = topology.clone();
        self.persists += 1;
        Ok(())
    }
}
