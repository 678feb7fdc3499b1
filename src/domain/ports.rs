//! Domain Ports - Core trait definitions for the provisioner
//!
//! The provision controller only ever talks to a [`Provisioner`]. Everything
//! it needs to hand over or receive back is defined here.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Annotation Keys
// =============================================================================

/// Annotation selecting the allocation mode, on claims and on volumes
pub const MODE_ANNOTATION: &str = "modeDynamic";

/// Annotation the provision controller stamps on volumes it created
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Annotations naming the provisioner responsible for a claim
pub const STORAGE_PROVISIONER_ANNOTATIONS: [&str; 2] = [
    "volume.kubernetes.io/storage-provisioner",
    "volume.beta.kubernetes.io/storage-provisioner",
];

/// Resource name of the storage quantity in requests and capacity maps
pub const STORAGE_RESOURCE: &str = "storage";

// =============================================================================
// Volume Mode
// =============================================================================

/// Allocation mode of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeMode {
    /// Directory is created for the volume and removed with it
    Dynamic,
    /// Directory is pre-created by an administrator and never touched
    Static,
}

impl VolumeMode {
    /// Decode the mode from an annotation map.
    ///
    /// `object` names the annotated object in the error when the key is absent.
    pub fn from_annotations(
        annotations: Option<&BTreeMap<String, String>>,
        object: &str,
    ) -> Result<Self> {
        let value = annotations
            .and_then(|a| a.get(MODE_ANNOTATION))
            .ok_or_else(|| Error::MissingModeAnnotation {
                object: object.to_string(),
            })?;
        value.parse()
    }

    /// Value written back into the `modeDynamic` annotation
    pub fn annotation_value(&self) -> &'static str {
        match self {
            VolumeMode::Dynamic => "true",
            VolumeMode::Static => "false",
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Dynamic => "dynamic",
            VolumeMode::Static => "static",
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, VolumeMode::Dynamic)
    }
}

impl FromStr for VolumeMode {
    type Err = Error;

    /// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(VolumeMode::Dynamic),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(VolumeMode::Static),
            _ => Err(Error::InvalidModeAnnotation {
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Reclaim Policy
// =============================================================================

/// What happens to the backing storage once the volume is released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReclaimPolicy {
    Retain,
    #[default]
    Delete,
    Recycle,
}

impl ReclaimPolicy {
    /// Kubernetes string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Recycle => "Recycle",
        }
    }
}

impl FromStr for ReclaimPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Delete" => Ok(ReclaimPolicy::Delete),
            "Recycle" => Ok(ReclaimPolicy::Recycle),
            other => Err(Error::Configuration(format!(
                "Unknown reclaim policy: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Provisioning Request
// =============================================================================

/// Everything the provisioner is told about a pending claim
#[derive(Debug, Clone, Default)]
pub struct VolumeOptions {
    /// Name the controller wants for the new volume
    pub pv_name: String,
    /// Name of the claim requesting storage
    pub claim_name: String,
    /// Namespace of the claim
    pub claim_namespace: String,
    /// Annotations on the claim; must carry `modeDynamic`
    pub claim_annotations: BTreeMap<String, String>,
    /// Access modes, copied to the volume unchanged
    pub access_modes: Vec<String>,
    /// Requested storage quantity, copied to the volume unchanged
    pub capacity: Option<Quantity>,
    /// Reclaim policy requested by the storage class
    pub reclaim_policy: ReclaimPolicy,
    /// Storage class parameters
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// Provisioner Port
// =============================================================================

/// Volume descriptor returned by [`Provisioner::provision`], with the mode
/// the claim was decoded to
#[derive(Debug, Clone)]
pub struct ProvisionedVolume {
    pub volume: PersistentVolume,
    pub mode: VolumeMode,
}

/// Capability the provision controller drives: create and reverse volumes
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate backing storage for a claim and describe it as a volume
    async fn provision(&self, options: VolumeOptions) -> Result<ProvisionedVolume>;

    /// Release the backing storage of a volume previously returned by
    /// [`Provisioner::provision`]. Returns the mode read from the volume.
    async fn delete(&self, volume: &PersistentVolume) -> Result<VolumeMode>;
}

pub type ProvisionerRef = Arc<dyn Provisioner>;
