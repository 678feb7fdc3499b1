//! OCFS2 Simple Provisioner
//!
//! A Kubernetes volume provisioner that backs PersistentVolumes with plain
//! directories on a shared (OCFS2) filesystem.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Provision Controller                      │
//! │   (resync loop: pending claims, released volumes, retries)   │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │  Provisioner port
//!                                 │  provision() / delete()
//! ┌───────────────────────────────┴──────────────────────────────┐
//! │                      Volume Allocator                        │
//! │   dynamic: <base>/<dyn>/<volume>   (created and removed)     │
//! │   static:  <base>/<claim>          (pre-existing, retained)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`domain`]: Provisioner port, request and mode types
//! - [`provisioner`]: Volume allocator and its pinned configuration
//! - [`controller`]: Kubernetes binding driving the allocator
//! - [`metrics`]: Prometheus counters
//! - [`server`]: Health and metrics endpoints
//! - [`error`]: Error types and handling

pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod provisioner;
pub mod server;

// Re-export commonly used types
pub use controller::{ControllerConfig, FailureLedger, ProvisionController};

pub use domain::ports::{
    ProvisionedVolume, Provisioner, ProvisionerRef, ReclaimPolicy, VolumeMode, VolumeOptions,
    MODE_ANNOTATION,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::ProvisionerMetrics;

pub use provisioner::{AllocatorConfig, VolumeAllocator};

pub use server::{run_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
