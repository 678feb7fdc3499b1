//! Provision Controller
//!
//! Periodically lists claims and volumes, hands pending claims to the
//! provisioner and released volumes back to it. Failures are retried on the
//! next resync without backoff until the per-object threshold is reached.

use super::claims::{
    bind_to_claim, claim_class_name, claim_needs_provisioning, volume_needs_deletion,
    volume_options_for_claim,
};
use crate::domain::ports::ProvisionerRef;
use crate::error::{Error, Result};
use crate::server::ServerState;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the provision controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name claims and storage classes use to select this provisioner
    pub provisioner_name: String,
    /// Interval between full resyncs
    pub resync_period: Duration,
    /// Attempts per object before giving up
    pub failed_retry_threshold: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provisioner_name: "ocfs2-simple-provisioner".to_string(),
            resync_period: Duration::from_secs(15),
            failed_retry_threshold: 5,
        }
    }
}

// =============================================================================
// Failure Ledger
// =============================================================================

/// Per-object failure counts
#[derive(Debug)]
pub struct FailureLedger {
    threshold: u32,
    failures: HashMap<String, u32>,
}

impl FailureLedger {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: HashMap::new(),
        }
    }

    /// Whether another attempt is allowed for `key`
    pub fn should_attempt(&self, key: &str) -> bool {
        self.failures.get(key).map_or(true, |n| *n < self.threshold)
    }

    /// Count a failure; permanent errors exhaust the key at once
    pub fn record_failure(&mut self, key: &str, error: &Error) -> u32 {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count = if error.is_retryable() {
            count.saturating_add(1)
        } else {
            self.threshold
        };
        *count
    }

    pub fn record_success(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Forget objects that no longer need work
    pub fn retain_keys(&mut self, live: &HashSet<String>) {
        self.failures.retain(|key, _| live.contains(key));
    }
}

fn claim_key(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or_default(),
        claim.metadata.name.as_deref().unwrap_or_default(),
        claim.metadata.uid.as_deref().unwrap_or_default()
    )
}

fn is_api_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

/// Whether a create call made a new object; a conflict means an earlier
/// pass already made it
fn created<T>(result: std::result::Result<T, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_api_status(&e, 409) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Provision Controller
// =============================================================================

/// Drives a [`Provisioner`](crate::domain::ports::Provisioner) from cluster state
pub struct ProvisionController {
    client: Client,
    provisioner: ProvisionerRef,
    config: ControllerConfig,
    state: Arc<ServerState>,
    claim_failures: FailureLedger,
    volume_failures: FailureLedger,
}

impl ProvisionController {
    pub fn new(
        client: Client,
        provisioner: ProvisionerRef,
        config: ControllerConfig,
        state: Arc<ServerState>,
    ) -> Self {
        let threshold = config.failed_retry_threshold;
        Self {
            client,
            provisioner,
            config,
            state,
            claim_failures: FailureLedger::new(threshold),
            volume_failures: FailureLedger::new(threshold),
        }
    }

    /// Resync until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "Starting provision controller {} (resync every {:?}, {} attempts per object)",
            self.config.provisioner_name,
            self.config.resync_period,
            self.config.failed_retry_threshold
        );

        let mut ticker = tokio::time::interval(self.config.resync_period);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Provision controller stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.resync().await {
                        Ok(()) => self.state.mark_ready(),
                        Err(e) => warn!("Resync failed: {}", e),
                    }
                }
            }
        }
    }

    async fn resync(&mut self) -> Result<()> {
        self.sync_claims().await?;
        self.sync_volumes().await
    }

    async fn sync_claims(&mut self) -> Result<()> {
        let name = self.config.provisioner_name.clone();
        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let list = claims.list(&ListParams::default()).await?;

        let mut live = HashSet::new();
        for claim in list
            .items
            .iter()
            .filter(|c| claim_needs_provisioning(c, &name))
        {
            let key = claim_key(claim);
            live.insert(key.clone());
            if !self.claim_failures.should_attempt(&key) {
                continue;
            }

            match self.provision_claim(claim).await {
                Ok(volume_name) => {
                    debug!("Claim {} provisioned as {}", key, volume_name);
                    self.claim_failures.record_success(&key);
                }
                Err(e) => {
                    self.state.metrics.record_provision_failure();
                    let attempts = self.claim_failures.record_failure(&key, &e);
                    if self.claim_failures.should_attempt(&key) {
                        warn!("Failed to provision claim {} (attempt {}): {}", key, attempts, e);
                    } else {
                        warn!("Giving up on claim {}: {}", key, e);
                    }
                }
            }
        }

        self.claim_failures.retain_keys(&live);
        Ok(())
    }

    async fn provision_claim(&self, claim: &PersistentVolumeClaim) -> Result<String> {
        let class_name = claim_class_name(claim)
            .ok_or_else(|| Error::Configuration("Claim has no storage class".into()))?;
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let class = classes.get(class_name).await?;
        if class.provisioner != self.config.provisioner_name {
            return Err(Error::Configuration(format!(
                "Storage class {} belongs to provisioner {}",
                class_name, class.provisioner
            )));
        }

        let options = volume_options_for_claim(claim, &class)?;
        let provisioned = self.provisioner.provision(options).await?;
        let volume = bind_to_claim(
            provisioned.volume,
            claim,
            class_name,
            &self.config.provisioner_name,
        );
        let volume_name = volume.metadata.name.clone().unwrap_or_default();

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        if created(volumes.create(&PostParams::default(), &volume).await)? {
            info!("Created PersistentVolume {}", volume_name);
            self.state.metrics.record_provision(provisioned.mode);
        } else {
            debug!("PersistentVolume {} already exists", volume_name);
        }

        Ok(volume_name)
    }

    async fn sync_volumes(&mut self) -> Result<()> {
        let name = self.config.provisioner_name.clone();
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = volumes.list(&ListParams::default()).await?;

        let mut live = HashSet::new();
        for volume in list
            .items
            .iter()
            .filter(|v| volume_needs_deletion(v, &name))
        {
            let key = volume.metadata.name.clone().unwrap_or_default();
            live.insert(key.clone());
            if !self.volume_failures.should_attempt(&key) {
                continue;
            }

            match self.delete_volume(&volumes, volume).await {
                Ok(()) => self.volume_failures.record_success(&key),
                Err(e) => {
                    self.state.metrics.record_deletion_failure();
                    let attempts = self.volume_failures.record_failure(&key, &e);
                    if self.volume_failures.should_attempt(&key) {
                        warn!("Failed to delete volume {} (attempt {}): {}", key, attempts, e);
                    } else {
                        warn!("Giving up on volume {}: {}", key, e);
                    }
                }
            }
        }

        self.volume_failures.retain_keys(&live);
        Ok(())
    }

    async fn delete_volume(
        &self,
        volumes: &Api<PersistentVolume>,
        volume: &PersistentVolume,
    ) -> Result<()> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let mode = self.provisioner.delete(volume).await?;

        match volumes.delete(name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted PersistentVolume {}", name),
            Err(e) if is_api_status(&e, 404) => {
                debug!("PersistentVolume {} already deleted", name)
            }
            Err(e) => return Err(e.into()),
        }

        self.state.metrics.record_deletion(mode);
        Ok(())
    }
}
