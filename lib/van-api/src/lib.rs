//! Virtual application network API types
//!
//! This library defines the data exchanged between sites and stored in the
//! local configuration source:
//! - ServiceRecord: a declared, network-reachable service address
//! - Headless: per-replica addressable backing for a ServiceRecord
//! - ServiceTarget: the local workload a ServiceRecord forwards to
//! - Well-known names: qualifiers, sync subjects and the sync bus address

pub mod codec;
pub mod legacy;
pub mod names;
pub mod service;

pub use codec::{decode_record, decode_snapshot, encode_record, encode_snapshot};
pub use service::{Headless, ServiceRecord, ServiceTarget};
