//! HTTP surfaces of the operator
//!
//! Health probes, Prometheus metrics and the LVMCluster admission webhook.

pub mod server;
pub mod webhook;

pub use server::*;
pub use webhook::*;
