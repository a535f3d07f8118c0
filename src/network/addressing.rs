//! Address planning for VPC and subnet blocks
//!
//! Provides:
//! - Reserved address derivation (bridge, subnet host, subnet gateway)
//! - Overlap validation between address blocks
//!
//! Every block is owned by exactly one VPC or subnet, so the lowest usable
//! hosts are reserved in fixed positions instead of tracking leases.

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;

/// An address reserved inside a block, kept with the block's prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserved {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Reserved {
    /// The address with its prefix, as assigned to an interface (e.g. "10.0.0.1/16")
    pub fn with_prefix(&self) -> String {
        format!("{}/{}", self.addr, self.prefix_len)
    }
}

/// Addresses reserved in a subnet block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPlan {
    /// First usable address, assigned inside the namespace
    pub host: Reserved,
    /// Second usable address, assigned to the VPC bridge
    pub gateway: Reserved,
}

/// Parse a CIDR block
///
/// Host bits must be clear: `ip route` rejects "10.0.5.0/16", so such a
/// block would only fail later, halfway through a peering.
pub fn parse_block(cidr: &str) -> Result<IpNet> {
    let net = cidr.trim().parse::<IpNet>().map_err(|e| Error::InvalidBlock {
        block: cidr.to_string(),
        reason: e.to_string(),
    })?;

    if net.trunc() != net {
        return Err(Error::InvalidBlock {
            block: cidr.to_string(),
            reason: format!("host bits set (did you mean {}?)", net.trunc()),
        });
    }

    Ok(net)
}

/// Return the first `count` usable host addresses of a block, ascending
pub fn plan(cidr: &str, count: usize) -> Result<Vec<Reserved>> {
    let net = parse_block(cidr)?;
    let prefix_len = net.prefix_len();

    let addrs: Vec<Reserved> = match net {
        IpNet::V4(v4) => v4
            .hosts()
            .take(count)
            .map(|a| Reserved {
                addr: IpAddr::V4(a),
                prefix_len,
            })
            .collect(),
        // IPv6 ranges start at the subnet-router anycast address
        IpNet::V6(v6) => v6
            .hosts()
            .filter(|a| *a != v6.network())
            .take(count)
            .map(|a| Reserved {
                addr: IpAddr::V6(a),
                prefix_len,
            })
            .collect(),
    };

    if addrs.len() < count {
        return Err(Error::InvalidBlock {
            block: cidr.to_string(),
            reason: format!(
                "needs {} usable address(es), has {}",
                count,
                addrs.len()
            ),
        });
    }

    Ok(addrs)
}

/// Plan the bridge address of a VPC block
pub fn plan_vpc(cidr: &str) -> Result<Reserved> {
    let mut addrs = plan(cidr, 1)?;
    Ok(addrs.remove(0))
}

/// Plan the host and gateway addresses of a subnet block
pub fn plan_subnet(cidr: &str) -> Result<SubnetPlan> {
    let addrs = plan(cidr, 2)?;
    Ok(SubnetPlan {
        host: addrs[0],
        gateway: addrs[1],
    })
}

/// Check that `candidate` overlaps none of the named blocks in `existing`
///
/// Entries in `existing` that fail to parse are skipped; they predate
/// validation and have already been provisioned.
pub fn validate_non_overlap<'a, I>(candidate: &IpNet, existing: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (owner, block) in existing {
        let Ok(other) = block.parse::<IpNet>() else {
            continue;
        };

        if overlaps(candidate, &other) {
            return Err(Error::Overlap {
                block: candidate.to_string(),
                other: other.to_string(),
                owner: owner.to_string(),
            });
        }
    }

    Ok(())
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}
