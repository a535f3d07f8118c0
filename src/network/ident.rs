//! Kernel object identifiers derived from VPC and subnet names
//!
//! Linux interface names are limited to 15 characters (IFNAMSIZ - 1), so
//! link endpoints use a short type prefix followed by a truncated hash of
//! the names they belong to. The same names always produce the same
//! identifiers, which is what lets peering and cleanup be re-derived from
//! the topology alone.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// Maximum length of a kernel interface name
pub const IFNAME_MAX: usize = 15;

/// Prefix for VPC bridges
const BRIDGE_PREFIX: &str = "br-";

/// Longest VPC name that still yields a valid bridge name
pub const VPC_NAME_MAX: usize = IFNAME_MAX - BRIDGE_PREFIX.len();

/// Hex characters kept from the seed hash
const HASH_LEN: usize = 6;

/// The two ends of a virtual link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPair {
    /// End that stays on the host (attached to a bridge)
    pub host: String,
    /// Other end (moved into a namespace, or attached to a second bridge)
    pub peer: String,
}

/// Bridge name for a VPC (e.g. "br-app1")
pub fn bridge_name(vpc: &str) -> String {
    format!("{}{}", BRIDGE_PREFIX, vpc)
}

/// Namespace name for a subnet (e.g. "app1-web")
pub fn namespace_name(vpc: &str, subnet: &str) -> String {
    format!("{}-{}", vpc, subnet)
}

/// Link endpoints connecting a subnet namespace to its VPC bridge
pub fn subnet_link(vpc: &str, subnet: &str) -> LinkPair {
    let hash = derive(&[vpc, subnet]);
    LinkPair {
        host: format!("vh{}", hash),
        peer: format!("vn{}", hash),
    }
}

/// Link endpoints joining two VPC bridges
///
/// Names are sorted before hashing, so both orders give the same pair.
/// `host` belongs to the bridge of the smaller name.
pub fn peer_link(a: &str, b: &str) -> LinkPair {
    let (first, second) = canonical_pair(a, b);
    let hash = derive(&[first, second]);
    LinkPair {
        host: format!("pr1{}", hash),
        peer: format!("pr2{}", hash),
    }
}

/// Order a VPC pair the way `peer_link` does
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Hash seed strings into a short hex identifier
///
/// Seeds are separated by a NUL byte so ("ab", "c") and ("a", "bc") differ.
pub fn derive(seeds: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, seed) in seeds.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(seed.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..HASH_LEN].to_string()
}

/// Validate a VPC name
pub fn validate_vpc_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name.len() > VPC_NAME_MAX {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!(
                "VPC names are limited to {} characters (bridge name '{}' exceeds {})",
                VPC_NAME_MAX,
                bridge_name(name),
                IFNAME_MAX
            ),
        });
    }
    Ok(())
}

/// Validate a subnet name
pub fn validate_subnet_name(name: &str) -> Result<()> {
    validate_name(name)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!("character '{}' is not allowed", c),
        });
    }

    Ok(())
}
