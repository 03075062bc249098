//! Driver Selection
//!
//! Maps a `StorageSpec` onto exactly one storage driver. A spec with no
//! backend can be completed from the cluster platform first.

use super::backends::{
    AzureDriver, DriverContext, FilesystemDriver, GcsDriver, S3Driver, SwiftDriver,
};
use crate::crd::{
    AzureStorage, FilesystemStorage, GcsStorage, Infrastructure, PlatformType, S3Storage,
    StorageBackend, StorageSpec, SwiftStorage,
};
use crate::domain::ports::StorageDriverBox;
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Build the driver for the single backend configured in `spec`.
///
/// Zero or several configured backends are rejected.
pub fn select_driver(spec: &StorageSpec, ctx: &DriverContext) -> Result<StorageDriverBox> {
    let backends = spec.configured_backends();
    let backend = match backends.as_slice() {
        [] => return Err(Error::StorageNotConfigured),
        [backend] => *backend,
        _ => return Err(Error::MultipleStorageBackends(backends)),
    };
    debug!("Selected {} storage driver", backend);

    let ctx = ctx.clone();
    let driver: StorageDriverBox = match backend {
        StorageBackend::S3 => Box::new(S3Driver::new(
            spec.s3.clone().unwrap_or_default(),
            ctx,
        )),
        StorageBackend::Azure => Box::new(AzureDriver::new(
            spec.azure.clone().unwrap_or_default(),
            ctx,
        )),
        StorageBackend::Gcs => Box::new(GcsDriver::new(
            spec.gcs.clone().unwrap_or_default(),
            ctx,
        )),
        StorageBackend::Swift => Box::new(SwiftDriver::new(
            spec.swift.clone().unwrap_or_default(),
            ctx,
        )),
        StorageBackend::Filesystem => Box::new(FilesystemDriver::new(
            spec.filesystem.clone().unwrap_or_default(),
            ctx,
        )),
    };
    Ok(driver)
}

/// Storage the registry uses by default on a platform
pub fn platform_default_spec(infra: &Infrastructure) -> StorageSpec {
    let mut spec = StorageSpec::default();
    match infra.platform() {
        PlatformType::AWS => spec.s3 = Some(S3Storage::default()),
        PlatformType::Azure => spec.azure = Some(AzureStorage::default()),
        PlatformType::GCP => spec.gcs = Some(GcsStorage::default()),
        PlatformType::OpenStack => spec.swift = Some(SwiftStorage::default()),
        _ => spec.filesystem = Some(FilesystemStorage::default()),
    }
    spec
}

/// Select a driver, completing an empty spec from the cluster platform.
///
/// Returns the spec the driver was built from so the caller can persist an
/// inferred backend.
pub async fn infer_driver(
    spec: &StorageSpec,
    ctx: &DriverContext,
) -> Result<(StorageDriverBox, StorageSpec)> {
    if !spec.is_empty() {
        return Ok((select_driver(spec, ctx)?, spec.clone()));
    }

    let infra = ctx.listers.infrastructure().await?;
    let inferred = platform_default_spec(&infra);
    info!(
        "No storage configured, using the {} platform default",
        infra.platform()
    );
    Ok((select_driver(&inferred, ctx)?, inferred))
}
