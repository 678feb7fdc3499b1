//! Volume Allocator
//!
//! Maps a claim onto a directory of the shared filesystem and reverses the
//! mapping when the volume goes away. Dynamic volumes get a fresh directory
//! under the staging area; static volumes bind to a directory an
//! administrator created beforehand and are never removed.

use super::config::AllocatorConfig;
use crate::domain::ports::{
    ProvisionedVolume, Provisioner, ReclaimPolicy, VolumeMode, VolumeOptions, MODE_ANNOTATION,
    STORAGE_RESOURCE,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{HostPathVolumeSource, PersistentVolume, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Permission bits requested for dynamic volume directories (before umask)
pub const DYNAMIC_DIR_MODE: u32 = 0o777;

// =============================================================================
// Volume Allocator
// =============================================================================

/// Filesystem-backed provisioner
#[derive(Debug, Clone)]
pub struct VolumeAllocator {
    config: AllocatorConfig,
}

impl VolumeAllocator {
    /// Create an allocator over a pinned configuration
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Fail unless `path` is an existing directory
    async fn require_dir(path: &Path) -> Result<()> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(Error::DirectoryNotFound {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Create the directory of a dynamic volume, tolerating one that exists
    async fn create_dynamic(&self, volume_name: &str) -> Result<PathBuf> {
        Self::require_dir(&self.config.dynamic_root()).await?;
        let path = self.config.dynamic_volume_path(volume_name)?;

        info!("Creating dynamic volume directory {}", path.display());

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(DYNAMIC_DIR_MODE);
        builder
            .create(&path)
            .await
            .map_err(|source| Error::ProvisionFailed {
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }

    /// Locate the pre-created directory of a static volume
    async fn resolve_static(&self, claim_name: &str) -> Result<PathBuf> {
        let path = self.config.static_volume_path(claim_name)?;

        debug!("Checking if static directory {} exists", path.display());

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            _ => Err(Error::StaticPathMissing { path }),
        }
    }

    /// Remove whatever occupies the path of a dynamic volume.
    ///
    /// Symlinks and plain files are unlinked, never followed.
    async fn remove_dynamic(&self, volume_name: &str) -> Result<()> {
        let path = self.config.dynamic_volume_path(volume_name)?;

        let removed = match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                info!("Removing dynamic volume directory {}", path.display());
                fs::remove_dir_all(&path).await
            }
            Ok(_) => {
                info!("Removing non-directory entry {}", path.display());
                fs::remove_file(&path).await
            }
            Err(e) => Err(e),
        };

        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Volume directory {} already gone", path.display());
                Ok(())
            }
            Err(source) => Err(Error::DeleteFailed { path, source }),
        }
    }
}

/// Assemble the volume object describing an allocation
fn build_volume(
    name: String,
    mode: VolumeMode,
    reclaim_policy: ReclaimPolicy,
    options: &VolumeOptions,
    path: &Path,
) -> PersistentVolume {
    let annotations = BTreeMap::from([(
        MODE_ANNOTATION.to_string(),
        mode.annotation_value().to_string(),
    )]);
    let capacity = options
        .capacity
        .clone()
        .map(|quantity| BTreeMap::from([(STORAGE_RESOURCE.to_string(), quantity)]));

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some(reclaim_policy.to_string()),
            access_modes: Some(options.access_modes.clone()),
            capacity,
            host_path: Some(HostPathVolumeSource {
                path: path.to_string_lossy().into_owned(),
                type_: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Provisioner for VolumeAllocator {
    async fn provision(&self, options: VolumeOptions) -> Result<ProvisionedVolume> {
        self.config.check_parameters(&options.parameters)?;
        Self::require_dir(self.config.base_dir()).await?;

        let object = format!(
            "PersistentVolumeClaim/{}/{}",
            options.claim_namespace, options.claim_name
        );
        let mode = VolumeMode::from_annotations(Some(&options.claim_annotations), &object)?;

        debug!("Provisioning {} volume for {}", mode, object);

        let (name, reclaim_policy, path) = match mode {
            VolumeMode::Dynamic => {
                let path = self.create_dynamic(&options.pv_name).await?;
                (options.pv_name.clone(), options.reclaim_policy, path)
            }
            // Static directories belong to the administrator
            VolumeMode::Static => {
                let path = self.resolve_static(&options.claim_name).await?;
                (options.claim_name.clone(), ReclaimPolicy::Retain, path)
            }
        };

        info!(
            "Provisioned {} volume {} at {} (reclaim policy {})",
            mode,
            name,
            path.display(),
            reclaim_policy
        );

        Ok(ProvisionedVolume {
            volume: build_volume(name, mode, reclaim_policy, &options, &path),
            mode,
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<VolumeMode> {
        let name = volume.metadata.name.as_deref().unwrap_or_default();
        let object = format!("PersistentVolume/{}", name);
        let mode = VolumeMode::from_annotations(volume.metadata.annotations.as_ref(), &object)?;

        match mode {
            VolumeMode::Dynamic => self.remove_dynamic(name).await?,
            VolumeMode::Static => debug!("Leaving static volume {} in place", name),
        }

        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        allocator: VolumeAllocator,
    }

    impl Fixture {
        fn base(&self) -> PathBuf {
            self.tmp.path().join("export")
        }

        fn dyn_root(&self) -> PathBuf {
            self.base().join("dyn")
        }
    }

    fn fixture(create_dyn: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("export");
        std::fs::create_dir(&base).unwrap();
        if create_dyn {
            std::fs::create_dir(base.join("dyn")).unwrap();
        }
        let config = AllocatorConfig::new(&base, "dyn").unwrap();
        Fixture {
            tmp,
            allocator: VolumeAllocator::new(config),
        }
    }

    fn options(pv_name: &str, claim_name: &str, mode: Option<&str>) -> VolumeOptions {
        let mut claim_annotations = BTreeMap::new();
        if let Some(mode) = mode {
            claim_annotations.insert(MODE_ANNOTATION.to_string(), mode.to_string());
        }
        VolumeOptions {
            pv_name: pv_name.to_string(),
            claim_name: claim_name.to_string(),
            claim_namespace: "default".to_string(),
            claim_annotations,
            access_modes: vec!["ReadWriteMany".to_string()],
            capacity: Some(Quantity("5Gi".to_string())),
            reclaim_policy: ReclaimPolicy::Delete,
            parameters: BTreeMap::new(),
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn mode_of(pv: &PersistentVolume) -> &str {
        pv.metadata.annotations.as_ref().unwrap()[MODE_ANNOTATION].as_str()
    }

    fn spec_of(pv: &PersistentVolume) -> &PersistentVolumeSpec {
        pv.spec.as_ref().unwrap()
    }

    #[tokio::test]
    async fn test_dynamic_provision_and_delete() {
        let fx = fixture(true);

        let pv = fx
            .allocator
            .provision(options("pvc-123", "myclaim", Some("true")))
            .await
            .unwrap()
            .volume;

        let expected = fx.dyn_root().join("pvc-123");
        assert!(expected.is_dir());
        assert_eq!(pv.metadata.name.as_deref(), Some("pvc-123"));
        assert_eq!(mode_of(&pv), "true");

        let spec = spec_of(&pv);
        assert_eq!(
            spec.host_path.as_ref().unwrap().path,
            expected.to_string_lossy()
        );
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
        assert_eq!(
            spec.capacity.as_ref().unwrap()[STORAGE_RESOURCE],
            Quantity("5Gi".to_string())
        );

        assert_eq!(fx.allocator.delete(&pv).await.unwrap(), VolumeMode::Dynamic);
        assert!(!expected.exists());
        assert!(fx.dyn_root().is_dir());

        // Retried delete is a no-op
        fx.allocator.delete(&pv).await.unwrap();
    }

    #[tokio::test]
    async fn test_dynamic_propagates_requested_policy() {
        let fx = fixture(true);
        let mut opts = options("pvc-9", "claim", Some("1"));
        opts.reclaim_policy = ReclaimPolicy::Retain;

        let pv = fx.allocator.provision(opts).await.unwrap().volume;
        assert_eq!(
            spec_of(&pv).persistent_volume_reclaim_policy.as_deref(),
            Some("Retain")
        );
    }

    #[tokio::test]
    async fn test_dynamic_provision_is_idempotent() {
        let fx = fixture(true);
        let opts = options("pvc-123", "myclaim", Some("true"));

        fx.allocator.provision(opts.clone()).await.unwrap();
        std::fs::write(fx.dyn_root().join("pvc-123").join("data"), b"keep").unwrap();
        fx.allocator.provision(opts).await.unwrap();

        assert_eq!(entries(&fx.dyn_root()), vec!["pvc-123".to_string()]);
        assert!(fx.dyn_root().join("pvc-123").join("data").exists());
    }

    #[tokio::test]
    async fn test_delete_removes_only_its_directory() {
        let fx = fixture(true);
        let a = fx
            .allocator
            .provision(options("pvc-a", "a", Some("true")))
            .await
            .unwrap()
            .volume;
        fx.allocator
            .provision(options("pvc-b", "b", Some("true")))
            .await
            .unwrap();
        std::fs::create_dir(fx.base().join("static-claim")).unwrap();

        fx.allocator.delete(&a).await.unwrap();

        assert_eq!(entries(&fx.dyn_root()), vec!["pvc-b".to_string()]);
        assert_eq!(
            entries(&fx.base()),
            vec!["dyn".to_string(), "static-claim".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dynamic_requires_staging_directory() {
        let fx = fixture(false);

        let err = fx
            .allocator
            .provision(options("pvc-123", "myclaim", Some("true")))
            .await
            .unwrap_err();

        assert_matches!(err, Error::DirectoryNotFound { path } if path == fx.dyn_root());
        assert!(entries(&fx.base()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_base_directory() {
        let tmp = TempDir::new().unwrap();
        let config = AllocatorConfig::new(tmp.path().join("absent"), "dyn").unwrap();
        let allocator = VolumeAllocator::new(config);

        let err = allocator
            .provision(options("pvc-1", "c", Some("true")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::DirectoryNotFound { .. });
        assert!(!tmp.path().join("absent").exists());
    }

    #[tokio::test]
    async fn test_missing_mode_annotation() {
        let fx = fixture(true);

        let err = fx
            .allocator
            .provision(options("pvc-123", "myclaim", None))
            .await
            .unwrap_err();

        assert_matches!(err, Error::MissingModeAnnotation { .. });
        assert!(entries(&fx.dyn_root()).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_mode_annotation() {
        let fx = fixture(true);

        let err = fx
            .allocator
            .provision(options("pvc-123", "myclaim", Some("yes")))
            .await
            .unwrap_err();

        assert_matches!(err, Error::InvalidModeAnnotation { value } if value == "yes");
        assert!(entries(&fx.dyn_root()).is_empty());
    }

    #[tokio::test]
    async fn test_provision_failure_surfaces() {
        let fx = fixture(true);
        std::fs::write(fx.dyn_root().join("pvc-file"), b"not a directory").unwrap();

        let err = fx
            .allocator
            .provision(options("pvc-file", "c", Some("true")))
            .await
            .unwrap_err();

        assert_matches!(err, Error::ProvisionFailed { path, .. } if path == fx.dyn_root().join("pvc-file"));
    }

    #[tokio::test]
    async fn test_parameters_cannot_redirect_root() {
        let fx = fixture(true);
        let mut opts = options("pvc-1", "c", Some("true"));
        opts.parameters
            .insert("basedir".to_string(), "/somewhere/else".to_string());

        let err = fx.allocator.provision(opts).await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));
        assert!(entries(&fx.dyn_root()).is_empty());
    }

    #[tokio::test]
    async fn test_traversing_name_rejected() {
        let fx = fixture(true);

        let err = fx
            .allocator
            .provision(options("../escape", "c", Some("true")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidVolumeName { .. });

        let err = fx
            .allocator
            .provision(options("pvc-1", "..", Some("false")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidVolumeName { .. });
    }

    #[tokio::test]
    async fn test_static_provision() {
        let fx = fixture(true);
        let claim_dir = fx.base().join("myclaim");
        std::fs::create_dir(&claim_dir).unwrap();

        let provisioned = fx
            .allocator
            .provision(options("pvc-123", "myclaim", Some("false")))
            .await
            .unwrap();
        assert_eq!(provisioned.mode, VolumeMode::Static);
        let pv = provisioned.volume;

        assert_eq!(pv.metadata.name.as_deref(), Some("myclaim"));
        assert_eq!(mode_of(&pv), "false");
        let spec = spec_of(&pv);
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(
            spec.host_path.as_ref().unwrap().path,
            claim_dir.to_string_lossy()
        );
        // Nothing created in the staging area
        assert!(entries(&fx.dyn_root()).is_empty());
    }

    #[tokio::test]
    async fn test_static_forces_retain() {
        let fx = fixture(true);
        std::fs::create_dir(fx.base().join("myclaim")).unwrap();

        for policy in [ReclaimPolicy::Delete, ReclaimPolicy::Recycle, ReclaimPolicy::Retain] {
            let mut opts = options("pvc-123", "myclaim", Some("F"));
            opts.reclaim_policy = policy;
            let pv = fx.allocator.provision(opts).await.unwrap().volume;
            assert_eq!(
                spec_of(&pv).persistent_volume_reclaim_policy.as_deref(),
                Some("Retain")
            );
        }
    }

    #[tokio::test]
    async fn test_static_requires_existing_directory() {
        let fx = fixture(true);

        let err = fx
            .allocator
            .provision(options("pvc-123", "myclaim", Some("false")))
            .await
            .unwrap_err();

        assert_matches!(err, Error::StaticPathMissing { path } if path == fx.base().join("myclaim"));
        assert!(!fx.base().join("myclaim").exists());
    }

    #[tokio::test]
    async fn test_static_delete_never_touches_filesystem() {
        let fx = fixture(true);
        let claim_dir = fx.base().join("myclaim");
        std::fs::create_dir(&claim_dir).unwrap();

        let pv = fx
            .allocator
            .provision(options("pvc-123", "myclaim", Some("false")))
            .await
            .unwrap()
            .volume;
        assert_eq!(fx.allocator.delete(&pv).await.unwrap(), VolumeMode::Static);
        assert!(claim_dir.is_dir());

        // Even a static descriptor named like a dynamic directory is left alone
        let decoy = fx.dyn_root().join("myclaim");
        std::fs::create_dir(&decoy).unwrap();
        let mut pv = pv;
        if let Some(spec) = pv.spec.as_mut() {
            spec.persistent_volume_reclaim_policy = Some("Delete".to_string());
        }
        fx.allocator.delete(&pv).await.unwrap();
        assert!(decoy.is_dir());
        assert!(claim_dir.is_dir());
    }

    #[tokio::test]
    async fn test_delete_requires_mode_annotation() {
        let fx = fixture(true);
        let target = fx.dyn_root().join("pvc-1");
        std::fs::create_dir(&target).unwrap();

        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let err = fx.allocator.delete(&pv).await.unwrap_err();
        assert_matches!(err, Error::MissingModeAnnotation { object } if object == "PersistentVolume/pvc-1");
        assert!(target.is_dir());
    }

    #[test]
    fn test_provision_through_trait_object() {
        let fx = fixture(true);
        let provisioner: crate::domain::ports::ProvisionerRef =
            std::sync::Arc::new(fx.allocator.clone());

        let provisioned =
            tokio_test::block_on(provisioner.provision(options("pvc-7", "c", Some("t"))))
                .unwrap();
        assert_eq!(provisioned.mode, VolumeMode::Dynamic);
        assert_eq!(provisioned.volume.metadata.name.as_deref(), Some("pvc-7"));
        assert!(fx.dyn_root().join("pvc-7").is_dir());

        let mode = tokio_test::block_on(provisioner.delete(&provisioned.volume)).unwrap();
        assert_eq!(mode, VolumeMode::Dynamic);
        assert!(!fx.dyn_root().join("pvc-7").exists());
    }

    fn dynamic_descriptor(name: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    MODE_ANNOTATION.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_delete_removes_plain_file() {
        let fx = fixture(true);
        let target = fx.dyn_root().join("pvc-f");
        std::fs::write(&target, b"stray").unwrap();

        let pv = dynamic_descriptor("pvc-f");
        assert_eq!(fx.allocator.delete(&pv).await.unwrap(), VolumeMode::Dynamic);
        assert!(!target.exists());
        assert!(fx.dyn_root().is_dir());

        fx.allocator.delete(&pv).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_failure_surfaces() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture(true);
        let target = fx.dyn_root().join("pvc-ro");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("data"), b"locked").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Permission bits do not bind a privileged user
        let writable = std::fs::write(target.join("check"), b"").is_ok();

        let result = fx.allocator.delete(&dynamic_descriptor("pvc-ro")).await;
        let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755));

        if writable {
            return;
        }
        assert_matches!(result, Err(Error::DeleteFailed { path, .. }) if path == target);
        assert!(target.join("data").exists());
    }
}
