//! Provisioner Metrics
//!
//! Prometheus counters for provision and delete outcomes, kept on a private
//! registry so tests and multiple controllers never collide.

use crate::domain::ports::VolumeMode;
use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported on `/metrics`
#[derive(Clone)]
pub struct ProvisionerMetrics {
    registry: Registry,
    provisions: IntCounterVec,
    provision_failures: IntCounter,
    deletions: IntCounterVec,
    deletion_failures: IntCounter,
}

impl ProvisionerMetrics {
    /// Create and register all counters
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let provisions = IntCounterVec::new(
            Opts::new(
                "ocfs2_provisioner_provisions_total",
                "Volumes provisioned, by allocation mode",
            ),
            &["mode"],
        )?;
        let provision_failures = IntCounter::new(
            "ocfs2_provisioner_provision_failures_total",
            "Failed provision attempts",
        )?;
        let deletions = IntCounterVec::new(
            Opts::new(
                "ocfs2_provisioner_deletions_total",
                "Volumes deleted, by allocation mode",
            ),
            &["mode"],
        )?;
        let deletion_failures = IntCounter::new(
            "ocfs2_provisioner_deletion_failures_total",
            "Failed delete attempts",
        )?;

        registry.register(Box::new(provisions.clone()))?;
        registry.register(Box::new(provision_failures.clone()))?;
        registry.register(Box::new(deletions.clone()))?;
        registry.register(Box::new(deletion_failures.clone()))?;

        Ok(Self {
            registry,
            provisions,
            provision_failures,
            deletions,
            deletion_failures,
        })
    }

    pub fn record_provision(&self, mode: VolumeMode) {
        self.provisions.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn record_provision_failure(&self) {
        self.provision_failures.inc();
    }

    pub fn record_deletion(&self, mode: VolumeMode) {
        self.deletions.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn record_deletion_failure(&self) {
        self.deletion_failures.inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
