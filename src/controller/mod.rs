//! Provision Controller Module
//!
//! Binds the provisioner port to the Kubernetes API: finds claims that need
//! storage and volumes that were released, and persists the results.

pub mod claims;
pub mod runner;

pub use claims::*;
pub use runner::*;
