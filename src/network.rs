//! Address and identifier planning for VPC networks
//!
//! Provides:
//! - Reserved address derivation from CIDR blocks
//! - Short kernel object identifiers derived from VPC and subnet names

pub mod addressing;
pub mod ident;

pub use ident::LinkPair;
