//! Mesh Policy Controller Index
//!
//! Watches the discovery resources that describe the mesh group along with the
//! policies authored against them:
//!
//! - A `MeshService` describes a destination: a service in a registered
//!   cluster, its ports and its declared subsets.
//! - A `MeshWorkload` describes the controller that runs a mesh workload.
//! - A `Mesh` describes a control plane installed in a registered cluster.
//! - A `TrafficPolicy` selects workloads and destinations and describes how
//!   matching requests are handled.
//!
//! ```text
//! [ TrafficPolicy ] -> [ MeshService ] -> [ Mesh ]
//!          \-> [ MeshWorkload ]
//! ```
//!
//! Resources are converted into core types as they are applied. Reconciliation
//! works from an immutable [`Snapshot`] of the index.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod discovery;
mod index;
pub mod metrics;
pub mod traffic_policy;


pub use self::index::{Index, PolicyEntry, SharedIndex, Snapshot};
