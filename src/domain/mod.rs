//! Domain layer - Core types and port definitions
//!
//! Defines the provisioner capability the controller depends on, plus the
//! request and mode types that cross that boundary.

pub mod ports;

pub use ports::*;
