//! Filesystem Provisioner
//!
//! The volume allocator and the pinned configuration it works under.

pub mod allocator;
pub mod config;

pub use allocator::*;
pub use config::*;
