#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_policy_controller_core as core;
pub use mesh_policy_controller_istio as istio;
pub use mesh_policy_controller_k8s_api as k8s;
pub use mesh_policy_controller_k8s_index as index;
pub use mesh_policy_controller_k8s_status as status;

mod admission;
mod args;
pub mod clusters;
mod index_list;
mod lease;
pub mod pipeline;

pub use self::args::Args;
