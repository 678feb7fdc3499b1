//! Claim and volume selection
//!
//! Pure translation between cluster objects and the provisioner port. The
//! runner decides what to do with each object by asking these functions.

use crate::domain::ports::{
    ReclaimPolicy, VolumeOptions, PROVISIONED_BY_ANNOTATION, STORAGE_PROVISIONER_ANNOTATIONS,
    STORAGE_RESOURCE,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;

const PHASE_PENDING: &str = "Pending";
const PHASE_RELEASED: &str = "Released";

/// Whether `claim` is waiting for a volume from `provisioner`
pub fn claim_needs_provisioning(claim: &PersistentVolumeClaim, provisioner: &str) -> bool {
    let pending = claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map_or(true, |phase| phase == PHASE_PENDING);
    let unbound = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .map_or(true, str::is_empty);
    let ours = claim.metadata.annotations.as_ref().map_or(false, |a| {
        STORAGE_PROVISIONER_ANNOTATIONS
            .iter()
            .any(|key| a.get(*key).map(String::as_str) == Some(provisioner))
    });

    pending && unbound && ours && claim.metadata.deletion_timestamp.is_none()
}

/// Storage class a claim asks for, if any
pub fn claim_class_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Name given to the volume provisioned for a claim
pub fn volume_name_for_claim(claim: &PersistentVolumeClaim) -> Result<String> {
    let uid = claim
        .metadata
        .uid
        .as_deref()
        .filter(|uid| !uid.is_empty())
        .ok_or_else(|| Error::Configuration("Claim has no uid".into()))?;
    Ok(format!("pvc-{}", uid))
}

/// Translate a claim and its storage class into a provisioning request
pub fn volume_options_for_claim(
    claim: &PersistentVolumeClaim,
    class: &StorageClass,
) -> Result<VolumeOptions> {
    let claim_name = claim
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::Configuration("Claim has no name".into()))?;
    let spec = claim.spec.clone().unwrap_or_default();

    let reclaim_policy = match class.reclaim_policy.as_deref() {
        Some(policy) => policy.parse::<ReclaimPolicy>()?,
        None => ReclaimPolicy::default(),
    };
    let capacity = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE_RESOURCE))
        .cloned();

    Ok(VolumeOptions {
        pv_name: volume_name_for_claim(claim)?,
        claim_name,
        claim_namespace: claim.metadata.namespace.clone().unwrap_or_default(),
        claim_annotations: claim.metadata.annotations.clone().unwrap_or_default(),
        access_modes: spec.access_modes.unwrap_or_default(),
        capacity,
        reclaim_policy,
        parameters: class.parameters.clone().unwrap_or_default(),
    })
}

/// Stamp the binding details the controller owns onto a provisioned volume
pub fn bind_to_claim(
    mut volume: PersistentVolume,
    claim: &PersistentVolumeClaim,
    class_name: &str,
    provisioner: &str,
) -> PersistentVolume {
    volume
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(PROVISIONED_BY_ANNOTATION.to_string(), provisioner.to_string());

    let spec = volume.spec.get_or_insert_with(Default::default);
    spec.storage_class_name = Some(class_name.to_string());
    spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        name: claim.metadata.name.clone(),
        namespace: claim.metadata.namespace.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    });

    volume
}

/// Whether `volume` was released and should be handed back to `provisioner`
pub fn volume_needs_deletion(volume: &PersistentVolume, provisioner: &str) -> bool {
    let released = volume
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some(PHASE_RELEASED);
    let delete_policy = volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        == Some(ReclaimPolicy::Delete.as_str());
    let ours = volume
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROVISIONED_BY_ANNOTATION))
        .map(String::as_str)
        == Some(provisioner);

    released && delete_policy && ours && volume.metadata.deletion_timestamp.is_none()
}
