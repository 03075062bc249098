//! In-memory fakes of the cluster and cloud ports
//!
//! Every fake records the calls made against it so tests can assert on
//! which provider operations fired.

use crate::controlplane::backends::azure::{
    AccountParams, AzureConnector, AzureEnvironment, AzureStorageApi,
};
use crate::controlplane::backends::gcs::tags::{EffectiveTagPage, TagBindingApi, TagBindingConfig};
use crate::controlplane::backends::gcs::{GcsApi, GcsClients, GcsConnector, ObjectPage};
use crate::controlplane::backends::s3::{
    BucketEncryption, DeleteFailure, ObjectRef, ObjectVersionPage, S3Api, S3Connector, S3Endpoint,
    VersionMarker,
};
use crate::controlplane::backends::swift::{SwiftApi, SwiftConnector, SwiftObjectPage};
use crate::controlplane::backends::{Connectors, DriverContext};
use crate::controlplane::credentials::{
    keys, AzureCredentials, GcsCredentials, ResolverConfig, S3Credentials, SwiftCredentials,
    MINTED_SECRET_NAME, OPERATOR_NAMESPACE, USER_SECRET_NAME,
};
use crate::controlplane::provisioner::{
    CreateOutcome, HardeningStep, Presence, PresenceReasons, Provisioner, ResourceOps, WaitPolicy,
    BUCKET_REASONS,
};
use crate::crd::{
    AwsPlatformStatus, AzurePlatformStatus, GcpPlatformStatus, GcpResourceTag, Infrastructure,
    OpenStackPlatformStatus, PlatformStatus, PlatformType, ResourceTag, StorageBackend,
};
use crate::domain::ports::ClusterListers;
use crate::error::{Error, ProviderErrorKind, Result};
use crate::migration::{BlobContainer, CopyState};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Infrastructure name shared by every test environment
pub const INFRA_NAME: &str = "mycluster-x7k2p";

// =============================================================================
// Helpers
// =============================================================================

/// Secret in the operator namespace
pub fn secret(name: &str, pairs: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(OPERATOR_NAMESPACE.into()),
            ..Default::default()
        },
        data: Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

pub fn config_map(namespace: &str, name: &str, pairs: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        data: Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

fn object_key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace
            .clone()
            .unwrap_or_else(|| OPERATOR_NAMESPACE.to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

fn fake_error(backend: StorageBackend, operation: &str, resource: &str, kind: ProviderErrorKind) -> Error {
    Error::provider(backend, operation, resource, kind, "injected by fake")
}

/// Per method call counter
#[derive(Default)]
struct CallLog {
    calls: Mutex<BTreeMap<&'static str, usize>>,
}

impl CallLog {
    fn record(&self, method: &'static str) {
        *self.calls.lock().entry(method).or_default() += 1;
    }

    fn count(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or_default()
    }

    fn total(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

// =============================================================================
// Cluster Listers
// =============================================================================

#[derive(Default)]
pub struct FakeListers {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    config_maps: Mutex<BTreeMap<(String, String), ConfigMap>>,
    claims: Mutex<BTreeMap<(String, String), PersistentVolumeClaim>>,
    infrastructure: Mutex<Infrastructure>,
    secret_gets: AtomicUsize,
    fail_secrets: AtomicBool,
}

impl FakeListers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_infrastructure(infra: Infrastructure) -> Self {
        let listers = Self::default();
        *listers.infrastructure.lock() = infra;
        listers
    }

    pub fn put_secret(&self, secret: Secret) {
        self.secrets.lock().insert(object_key(&secret.metadata), secret);
    }

    pub fn put_config_map(&self, config_map: ConfigMap) {
        self.config_maps
            .lock()
            .insert(object_key(&config_map.metadata), config_map);
    }

    pub fn put_claim(&self, claim: PersistentVolumeClaim) {
        self.claims.lock().insert(object_key(&claim.metadata), claim);
    }

    /// Claim in the operator namespace
    pub fn claim(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.claims
            .lock()
            .get(&(OPERATOR_NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn secret_gets(&self) -> usize {
        self.secret_gets.load(Ordering::SeqCst)
    }

    /// Make every secret lookup fail
    pub fn fail_secret_gets(&self) {
        self.fail_secrets.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterListers for FakeListers {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.secret_gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_secrets.load(Ordering::SeqCst) {
            return Err(Error::Internal("secret lister unavailable".into()));
        }
        Ok(self
            .secrets
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self
            .config_maps
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn infrastructure(&self) -> Result<Infrastructure> {
        Ok(self.infrastructure.lock().clone())
    }

    async fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self
            .claims
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<()> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let mut claims = self.claims.lock();
        let key = (namespace.to_string(), name.clone());
        if claims.contains_key(&key) {
            return Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: format!("persistentvolumeclaims {:?} already exists", name),
                reason: "AlreadyExists".into(),
                code: 409,
            })));
        }
        claims.insert(key, claim.clone());
        Ok(())
    }

    async fn delete_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .claims
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }
}

// =============================================================================
// Resource Ops
// =============================================================================

/// Scriptable `ResourceOps` for exercising the provisioner directly
#[derive(Default)]
pub struct FakeOps {
    existing: Mutex<BTreeSet<String>>,
    taken: Mutex<BTreeSet<String>>,
    invisible: AtomicBool,
    failing_step: Mutex<Option<HardeningStep>>,
    delete_failure: Mutex<Option<ProviderErrorKind>>,
    fail_probes: AtomicBool,
    log: CallLog,
}

impl FakeOps {
    /// Names that exist and are accessible
    pub fn existing(&self, names: &[&str]) {
        self.existing
            .lock()
            .extend(names.iter().map(|n| n.to_string()));
    }

    /// Names owned by someone else: invisible to probes, rejected on create
    pub fn taken(&self, names: &[&str]) {
        self.taken.lock().extend(names.iter().map(|n| n.to_string()));
    }

    /// Created resources never show up in probes
    pub fn invisible(&self) {
        self.invisible.store(true, Ordering::SeqCst);
    }

    pub fn fail_step(&self, step: HardeningStep) {
        *self.failing_step.lock() = Some(step);
    }

    pub fn fail_delete(&self, kind: ProviderErrorKind) {
        *self.delete_failure.lock() = Some(kind);
    }

    pub fn fail_probes(&self) {
        self.fail_probes.store(true, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.log.count("create")
    }

    pub fn hardens(&self) -> usize {
        self.log.count("harden")
    }

    pub fn calls(&self) -> usize {
        self.log.total()
    }
}

#[async_trait]
impl ResourceOps for FakeOps {
    fn backend(&self) -> StorageBackend {
        StorageBackend::S3
    }

    fn kind(&self) -> &'static str {
        "bucket"
    }

    fn reasons(&self) -> PresenceReasons {
        BUCKET_REASONS
    }

    async fn probe(&self, name: &str) -> Result<Presence> {
        self.log.record("probe");
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(Error::Internal("probe failed".into()));
        }
        Ok(if self.existing.lock().contains(name) {
            Presence::Present
        } else {
            Presence::Absent
        })
    }

    async fn create(&self, name: &str) -> Result<CreateOutcome> {
        self.log.record("create");
        if self.taken.lock().contains(name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if !self.invisible.load(Ordering::SeqCst) {
            self.existing.lock().insert(name.to_string());
        }
        Ok(CreateOutcome::Created)
    }

    fn hardening_steps(&self) -> Vec<HardeningStep> {
        vec![
            HardeningStep::BlockPublicAccess,
            HardeningStep::Tag,
            HardeningStep::Encrypt,
            HardeningStep::AbortIncompleteUploads,
        ]
    }

    async fn harden(&self, name: &str, step: HardeningStep) -> Result<String> {
        self.log.record("harden");
        if *self.failing_step.lock() == Some(step) {
            return Err(fake_error(
                StorageBackend::S3,
                &step.to_string(),
                name,
                ProviderErrorKind::Other,
            ));
        }
        Ok(format!("{} applied", step))
    }

    async fn empty(&self, _name: &str) -> Result<()> {
        self.log.record("empty");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.log.record("delete");
        if let Some(kind) = *self.delete_failure.lock() {
            return Err(fake_error(StorageBackend::S3, "delete", name, kind));
        }
        if self.existing.lock().remove(name) {
            Ok(())
        } else {
            Err(fake_error(
                StorageBackend::S3,
                "delete",
                name,
                ProviderErrorKind::NotFound,
            ))
        }
    }
}

// =============================================================================
// S3
// =============================================================================

#[derive(Default)]
struct FakeBucket {
    region: String,
    tags: Option<BTreeMap<String, String>>,
    encryption: Option<BucketEncryption>,
    objects: Vec<ObjectRef>,
}

#[derive(Default)]
pub struct FakeS3 {
    buckets: Mutex<BTreeMap<String, FakeBucket>>,
    head_failure: Mutex<Option<ProviderErrorKind>>,
    log: CallLog,
}

impl FakeS3 {
    pub fn forbidden() -> ProviderErrorKind {
        ProviderErrorKind::Forbidden
    }

    pub fn add_bucket(&self, name: &str) {
        self.buckets.lock().insert(name.to_string(), FakeBucket::default());
    }

    pub fn add_objects(&self, bucket: &str, count: usize) {
        if let Some(b) = self.buckets.lock().get_mut(bucket) {
            b.objects.extend((0..count).map(|i| ObjectRef {
                key: format!("docker/registry/v2/blobs/{i}"),
                version_id: Some(format!("v{i}")),
            }));
        }
    }

    pub fn fail_head(&self, kind: ProviderErrorKind) {
        *self.head_failure.lock() = Some(kind);
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.lock().contains_key(name)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn region_of(&self, name: &str) -> Option<String> {
        self.buckets.lock().get(name).map(|b| b.region.clone())
    }

    pub fn tags_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.buckets.lock().get(name).and_then(|b| b.tags.clone())
    }

    pub fn encryption_of(&self, name: &str) -> Option<BucketEncryption> {
        self.buckets.lock().get(name).and_then(|b| b.encryption.clone())
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log.count(method)
    }

    pub fn total_calls(&self) -> usize {
        self.log.total()
    }

    pub fn hardening_calls(&self) -> usize {
        [
            "put_public_access_block",
            "put_bucket_tagging",
            "put_bucket_encryption",
            "put_abort_incomplete_uploads_rule",
        ]
        .iter()
        .map(|m| self.log.count(m))
        .sum()
    }

    fn with_bucket<T>(
        &self,
        operation: &str,
        bucket: &str,
        f: impl FnOnce(&mut FakeBucket) -> T,
    ) -> Result<T> {
        match self.buckets.lock().get_mut(bucket) {
            Some(b) => Ok(f(b)),
            None => Err(fake_error(
                StorageBackend::S3,
                operation,
                bucket,
                ProviderErrorKind::NotFound,
            )),
        }
    }
}

#[async_trait]
impl S3Api for FakeS3 {
    async fn head_bucket(&self, bucket: &str) -> Result<Presence> {
        self.log.record("head_bucket");
        if let Some(kind) = *self.head_failure.lock() {
            return Err(fake_error(StorageBackend::S3, "head-bucket", bucket, kind));
        }
        Ok(if self.has_bucket(bucket) {
            Presence::Present
        } else {
            Presence::Absent
        })
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<CreateOutcome> {
        self.log.record("create_bucket");
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        buckets.insert(
            bucket.to_string(),
            FakeBucket {
                region: region.to_string(),
                ..Default::default()
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn put_public_access_block(&self, bucket: &str) -> Result<()> {
        self.log.record("put_public_access_block");
        self.with_bucket("put-public-access-block", bucket, |_| ())
    }

    async fn put_bucket_tagging(
        &self,
        bucket: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.log.record("put_bucket_tagging");
        self.with_bucket("put-bucket-tagging", bucket, |b| b.tags = Some(tags.clone()))
    }

    async fn put_bucket_encryption(
        &self,
        bucket: &str,
        encryption: &BucketEncryption,
    ) -> Result<()> {
        self.log.record("put_bucket_encryption");
        self.with_bucket("put-bucket-encryption", bucket, |b| {
            b.encryption = Some(encryption.clone())
        })
    }

    async fn put_abort_incomplete_uploads_rule(
        &self,
        bucket: &str,
        _rule_id: &str,
        _days: i32,
    ) -> Result<()> {
        self.log.record("put_abort_incomplete_uploads_rule");
        self.with_bucket("put-lifecycle", bucket, |_| ())
    }

    async fn list_object_versions(
        &self,
        bucket: &str,
        _marker: Option<VersionMarker>,
    ) -> Result<ObjectVersionPage> {
        self.log.record("list_object_versions");
        self.with_bucket("list-object-versions", bucket, |b| ObjectVersionPage {
            objects: b.objects.clone(),
            next: None,
        })
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        objects: &[ObjectRef],
    ) -> Result<Vec<DeleteFailure>> {
        self.log.record("delete_objects");
        self.with_bucket("delete-objects", bucket, |b| {
            b.objects.retain(|o| !objects.contains(o));
            Vec::new()
        })
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.log.record("delete_bucket");
        match self.buckets.lock().remove(bucket) {
            Some(_) => Ok(()),
            None => Err(fake_error(
                StorageBackend::S3,
                "delete-bucket",
                bucket,
                ProviderErrorKind::NotFound,
            )),
        }
    }
}

// =============================================================================
// Azure
// =============================================================================

#[derive(Default)]
struct FakeAccount {
    tags: BTreeMap<String, String>,
    containers: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeAzure {
    accounts: Mutex<BTreeMap<String, FakeAccount>>,
    rejected_names: AtomicUsize,
    log: CallLog,
}

impl FakeAzure {
    pub fn add_account(&self, name: &str) {
        self.accounts.lock().insert(name.to_string(), FakeAccount::default());
    }

    /// The next `count` account creations report a globally taken name
    pub fn reject_next_account_names(&self, count: usize) {
        self.rejected_names.store(count, Ordering::SeqCst);
    }

    pub fn has_account(&self, name: &str) -> bool {
        self.accounts.lock().contains_key(name)
    }

    pub fn has_container(&self, account: &str, container: &str) -> bool {
        self.accounts
            .lock()
            .get(account)
            .is_some_and(|a| a.containers.contains(container))
    }

    pub fn account_tags(&self, account: &str) -> Option<BTreeMap<String, String>> {
        self.accounts.lock().get(account).map(|a| a.tags.clone())
    }

    pub fn account_count(&self) -> usize {
        self.accounts.lock().len()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log.count(method)
    }

    pub fn total_calls(&self) -> usize {
        self.log.total()
    }

    pub fn hardening_calls(&self) -> usize {
        self.log.count("disable_public_access") + self.log.count("update_account_tags")
    }

    fn with_account<T>(
        &self,
        operation: &str,
        account: &str,
        f: impl FnOnce(&mut FakeAccount) -> T,
    ) -> Result<T> {
        match self.accounts.lock().get_mut(account) {
            Some(a) => Ok(f(a)),
            None => Err(fake_error(
                StorageBackend::Azure,
                operation,
                account,
                ProviderErrorKind::NotFound,
            )),
        }
    }
}

#[async_trait]
impl AzureStorageApi for FakeAzure {
    async fn account_presence(&self, account: &str) -> Result<Presence> {
        self.log.record("account_presence");
        Ok(if self.has_account(account) {
            Presence::Present
        } else {
            Presence::Absent
        })
    }

    async fn create_account(
        &self,
        account: &str,
        params: &AccountParams,
    ) -> Result<CreateOutcome> {
        self.log.record("create_account");
        let rejected = self.rejected_names.load(Ordering::SeqCst);
        if rejected > 0 {
            self.rejected_names.store(rejected - 1, Ordering::SeqCst);
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(account) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        accounts.insert(
            account.to_string(),
            FakeAccount {
                tags: params.tags.clone(),
                ..Default::default()
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn update_account_tags(
        &self,
        account: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.log.record("update_account_tags");
        self.with_account("update-tags", account, |a| a.tags = tags.clone())
    }

    async fn disable_public_access(&self, account: &str) -> Result<()> {
        self.log.record("disable_public_access");
        self.with_account("disable-public-access", account, |_| ())
    }

    async fn delete_account(&self, account: &str) -> Result<()> {
        self.log.record("delete_account");
        match self.accounts.lock().remove(account) {
            Some(_) => Ok(()),
            None => Err(fake_error(
                StorageBackend::Azure,
                "delete-account",
                account,
                ProviderErrorKind::NotFound,
            )),
        }
    }

    async fn account_key(&self, account: &str) -> Result<String> {
        self.log.record("account_key");
        self.with_account("list-keys", account, |_| "primary-key".to_string())
    }

    async fn container_presence(&self, account: &str, container: &str) -> Result<Presence> {
        self.log.record("container_presence");
        self.with_account("get-container", account, |a| {
            if a.containers.contains(container) {
                Presence::Present
            } else {
                Presence::Absent
            }
        })
    }

    async fn create_container(&self, account: &str, container: &str) -> Result<CreateOutcome> {
        self.log.record("create_container");
        self.with_account("create-container", account, |a| {
            if a.containers.insert(container.to_string()) {
                CreateOutcome::Created
            } else {
                CreateOutcome::AlreadyExists
            }
        })
    }

    async fn delete_container(&self, account: &str, container: &str) -> Result<()> {
        self.log.record("delete_container");
        let removed = self.with_account("delete-container", account, |a| {
            a.containers.remove(container)
        })?;
        if removed {
            Ok(())
        } else {
            Err(fake_error(
                StorageBackend::Azure,
                "delete-container",
                container,
                ProviderErrorKind::NotFound,
            ))
        }
    }
}

// =============================================================================
// GCS
// =============================================================================

#[derive(Default)]
struct FakeGcsBucket {
    location: String,
    labels: Option<BTreeMap<String, String>>,
    public_access_prevented: bool,
    kms_key: Option<String>,
    objects: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeGcs {
    buckets: Mutex<BTreeMap<String, FakeGcsBucket>>,
    log: CallLog,
}

impl FakeGcs {
    pub fn add_bucket(&self, name: &str) {
        self.buckets
            .lock()
            .insert(name.to_string(), FakeGcsBucket::default());
    }

    pub fn add_objects(&self, bucket: &str, count: usize) {
        if let Some(b) = self.buckets.lock().get_mut(bucket) {
            b.objects
                .extend((0..count).map(|i| format!("docker/registry/v2/blobs/{i}")));
        }
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.lock().contains_key(name)
    }

    pub fn location_of(&self, name: &str) -> Option<String> {
        self.buckets.lock().get(name).map(|b| b.location.clone())
    }

    pub fn public_access_prevented(&self, name: &str) -> bool {
        self.buckets
            .lock()
            .get(name)
            .is_some_and(|b| b.public_access_prevented)
    }

    pub fn labels_of(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.buckets.lock().get(name).and_then(|b| b.labels.clone())
    }

    pub fn kms_key_of(&self, name: &str) -> Option<String> {
        self.buckets.lock().get(name).and_then(|b| b.kms_key.clone())
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log.count(method)
    }

    fn with_bucket<T>(
        &self,
        operation: &str,
        bucket: &str,
        f: impl FnOnce(&mut FakeGcsBucket) -> T,
    ) -> Result<T> {
        match self.buckets.lock().get_mut(bucket) {
            Some(b) => Ok(f(b)),
            None => Err(fake_error(
                StorageBackend::Gcs,
                operation,
                bucket,
                ProviderErrorKind::NotFound,
            )),
        }
    }
}

#[async_trait]
impl GcsApi for FakeGcs {
    async fn bucket_presence(&self, bucket: &str) -> Result<Presence> {
        self.log.record("bucket_presence");
        Ok(if self.has_bucket(bucket) {
            Presence::Present
        } else {
            Presence::Absent
        })
    }

    async fn create_bucket(
        &self,
        _project: &str,
        bucket: &str,
        location: &str,
    ) -> Result<CreateOutcome> {
        self.log.record("create_bucket");
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        buckets.insert(
            bucket.to_string(),
            FakeGcsBucket {
                location: location.to_string(),
                ..Default::default()
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn enforce_public_access_prevention(&self, bucket: &str) -> Result<()> {
        self.log.record("enforce_public_access_prevention");
        self.with_bucket("enforce-public-access-prevention", bucket, |b| {
            b.public_access_prevented = true
        })
    }

    async fn set_labels(&self, bucket: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        self.log.record("set_labels");
        self.with_bucket("set-labels", bucket, |b| b.labels = Some(labels.clone()))
    }

    async fn set_default_kms_key(&self, bucket: &str, key: &str) -> Result<()> {
        self.log.record("set_default_kms_key");
        self.with_bucket("set-default-kms-key", bucket, |b| {
            b.kms_key = Some(key.to_string())
        })
    }

    async fn list_objects(&self, bucket: &str, _page_token: Option<String>) -> Result<ObjectPage> {
        self.log.record("list_objects");
        self.with_bucket("list-objects", bucket, |b| ObjectPage {
            names: b.objects.iter().cloned().collect(),
            next_page_token: None,
        })
    }

    async fn delete_object(&self, bucket: &str, name: &str) -> Result<()> {
        self.log.record("delete_object");
        let removed = self.with_bucket("delete-object", bucket, |b| b.objects.remove(name))?;
        if removed {
            Ok(())
        } else {
            Err(fake_error(
                StorageBackend::Gcs,
                "delete-object",
                name,
                ProviderErrorKind::NotFound,
            ))
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.log.record("delete_bucket");
        match self.buckets.lock().remove(bucket) {
            Some(_) => Ok(()),
            None => Err(fake_error(
                StorageBackend::Gcs,
                "delete-bucket",
                bucket,
                ProviderErrorKind::NotFound,
            )),
        }
    }
}

// =============================================================================
// Tag Bindings
// =============================================================================

#[derive(Default)]
pub struct FakeTagBindings {
    effective: Mutex<BTreeMap<String, Vec<String>>>,
    bindings: Mutex<BTreeMap<String, Vec<String>>>,
    failures: Mutex<BTreeMap<String, (ProviderErrorKind, usize)>>,
    fail_listing: AtomicBool,
    endless_listing: AtomicBool,
    listing_delay: Mutex<Duration>,
    log: CallLog,
}

impl FakeTagBindings {
    /// A tag inherited by `parent` without a direct binding
    pub fn add_effective(&self, parent: &str, value: &str) {
        self.effective
            .lock()
            .entry(parent.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Bindings created on `parent`, in creation order
    pub fn bindings(&self, parent: &str) -> Vec<String> {
        self.bindings
            .lock()
            .get(parent)
            .cloned()
            .unwrap_or_default()
    }

    /// The first `times` bindings of `value` fail with `kind`
    pub fn fail_binding(&self, value: &str, kind: ProviderErrorKind, times: usize) {
        self.failures
            .lock()
            .insert(value.to_string(), (kind, times));
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    /// Every listing page takes `delay` to answer
    pub fn slow_listing(&self, delay: Duration) {
        *self.listing_delay.lock() = delay;
    }

    /// Every listing page points at another one
    pub fn endless_listing(&self) {
        self.endless_listing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log.count(method)
    }
}

#[async_trait]
impl TagBindingApi for FakeTagBindings {
    async fn list_effective_tags(
        &self,
        parent: &str,
        _page_token: Option<String>,
    ) -> Result<EffectiveTagPage> {
        self.log.record("list_effective_tags");
        let delay = *self.listing_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(fake_error(
                StorageBackend::Gcs,
                "list-effective-tags",
                parent,
                ProviderErrorKind::Other,
            ));
        }
        if self.endless_listing.load(Ordering::SeqCst) {
            return Ok(EffectiveTagPage {
                namespaced_values: Vec::new(),
                next_page_token: Some("more".into()),
            });
        }
        let mut values = self
            .effective
            .lock()
            .get(parent)
            .cloned()
            .unwrap_or_default();
        values.extend(self.bindings(parent));
        Ok(EffectiveTagPage {
            namespaced_values: values,
            next_page_token: None,
        })
    }

    async fn create_binding(&self, parent: &str, namespaced_value: &str) -> Result<()> {
        self.log.record("create_binding");
        if let Some((kind, remaining)) = self.failures.lock().get_mut(namespaced_value) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(fake_error(
                    StorageBackend::Gcs,
                    "bind-tag",
                    namespaced_value,
                    *kind,
                ));
            }
        }
        self.bindings
            .lock()
            .entry(parent.to_string())
            .or_default()
            .push(namespaced_value.to_string());
        Ok(())
    }
}

// =============================================================================
// Swift
// =============================================================================

const SWIFT_PAGE_SIZE: usize = 2;

#[derive(Default)]
pub struct FakeSwift {
    containers: Mutex<BTreeMap<String, BTreeSet<String>>>,
    log: CallLog,
}

impl FakeSwift {
    pub fn add_container(&self, name: &str) {
        self.containers.lock().insert(name.to_string(), BTreeSet::new());
    }

    pub fn add_objects(&self, container: &str, count: usize) {
        if let Some(objects) = self.containers.lock().get_mut(container) {
            objects.extend((0..count).map(|i| format!("docker/registry/v2/blobs/{i}")));
        }
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.lock().contains_key(name)
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log.count(method)
    }

    fn not_found(operation: &str, resource: &str) -> Error {
        fake_error(
            StorageBackend::Swift,
            operation,
            resource,
            ProviderErrorKind::NotFound,
        )
    }
}

#[async_trait]
impl SwiftApi for FakeSwift {
    async fn container_presence(&self, container: &str) -> Result<Presence> {
        self.log.record("container_presence");
        Ok(if self.has_container(container) {
            Presence::Present
        } else {
            Presence::Absent
        })
    }

    async fn create_container(&self, container: &str) -> Result<CreateOutcome> {
        self.log.record("create_container");
        self.containers
            .lock()
            .entry(container.to_string())
            .or_default();
        Ok(CreateOutcome::Created)
    }

    async fn list_objects(
        &self,
        container: &str,
        marker: Option<String>,
    ) -> Result<SwiftObjectPage> {
        self.log.record("list_objects");
        let containers = self.containers.lock();
        let objects = containers
            .get(container)
            .ok_or_else(|| Self::not_found("list-objects", container))?;
        let names: Vec<String> = objects
            .iter()
            .filter(|name| marker.as_ref().map_or(true, |m| name.as_str() > m.as_str()))
            .take(SWIFT_PAGE_SIZE)
            .cloned()
            .collect();
        let next_marker = if names.len() == SWIFT_PAGE_SIZE {
            names.last().cloned()
        } else {
            None
        };
        Ok(SwiftObjectPage { names, next_marker })
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.log.record("delete_object");
        let mut containers = self.containers.lock();
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| Self::not_found("delete-object", container))?;
        if objects.remove(name) {
            Ok(())
        } else {
            Err(Self::not_found("delete-object", name))
        }
    }

    async fn delete_container(&self, container: &str) -> Result<()> {
        self.log.record("delete_container");
        match self.containers.lock().remove(container) {
            Some(_) => Ok(()),
            None => Err(Self::not_found("delete-container", container)),
        }
    }
}

// =============================================================================
// Blob Container
// =============================================================================

#[derive(Default)]
pub struct FakeBlobContainer {
    blobs: Mutex<BTreeSet<String>>,
    /// destination -> polls seen so far
    pending: Mutex<BTreeMap<String, usize>>,
    /// Polls until a copy completes, zero for synchronous copies
    copy_polls: AtomicUsize,
    copy_failures: Mutex<BTreeSet<String>>,
    poll_failures: Mutex<BTreeSet<String>>,
    log: CallLog,
}

impl FakeBlobContainer {
    pub fn with_blobs(names: &[&str]) -> Self {
        let container = Self::default();
        container
            .blobs
            .lock()
            .extend(names.iter().map(|n| n.to_string()));
        container
    }

    /// Copies stay pending until their `polls`-th state poll
    pub fn async_copies(&self, polls: usize) {
        self.copy_polls.store(polls, Ordering::SeqCst);
    }

    pub fn fail_copy(&self, source: &str) {
        self.copy_failures.lock().insert(source.to_string());
    }

    pub fn fail_polls(&self, dest: &str) {
        self.poll_failures.lock().insert(dest.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        self.blobs.lock().iter().cloned().collect()
    }

    pub fn has_blob(&self, name: &str) -> bool {
        self.blobs.lock().contains(name)
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log.count(method)
    }

    fn error(operation: &str, blob: &str, kind: ProviderErrorKind) -> Error {
        fake_error(StorageBackend::Azure, operation, blob, kind)
    }
}

#[async_trait]
impl BlobContainer for FakeBlobContainer {
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>> {
        self.log.record("list_blobs");
        Ok(self
            .blobs
            .lock()
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn start_copy(&self, source: &str, dest: &str) -> Result<CopyState> {
        self.log.record("start_copy");
        if self.copy_failures.lock().contains(source) {
            return Err(Self::error("copy", source, ProviderErrorKind::Other));
        }
        if !self.has_blob(source) {
            return Err(Self::error("copy", source, ProviderErrorKind::NotFound));
        }
        if self.copy_polls.load(Ordering::SeqCst) == 0 {
            self.blobs.lock().insert(dest.to_string());
            return Ok(CopyState::Success);
        }
        self.pending.lock().insert(dest.to_string(), 0);
        Ok(CopyState::Pending)
    }

    async fn copy_state(&self, dest: &str) -> Result<CopyState> {
        self.log.record("copy_state");
        if self.poll_failures.lock().contains(dest) {
            return Err(Self::error("get-properties", dest, ProviderErrorKind::Other));
        }
        let mut pending = self.pending.lock();
        if let Some(polls) = pending.get_mut(dest) {
            *polls += 1;
            if *polls < self.copy_polls.load(Ordering::SeqCst) {
                return Ok(CopyState::Pending);
            }
            pending.remove(dest);
            self.blobs.lock().insert(dest.to_string());
            return Ok(CopyState::Success);
        }
        if self.has_blob(dest) {
            Ok(CopyState::Success)
        } else {
            Err(Self::error("get-properties", dest, ProviderErrorKind::NotFound))
        }
    }

    async fn delete_blob(&self, name: &str) -> Result<()> {
        self.log.record("delete_blob");
        if self.blobs.lock().remove(name) {
            Ok(())
        } else {
            Err(Self::error("delete", name, ProviderErrorKind::NotFound))
        }
    }
}

// =============================================================================
// Connectors
// =============================================================================

struct SharedS3(Arc<FakeS3>);

#[async_trait]
impl S3Connector for SharedS3 {
    async fn connect(
        &self,
        _credentials: &S3Credentials,
        _endpoint: &S3Endpoint,
    ) -> Result<Arc<dyn S3Api>> {
        let api: Arc<dyn S3Api> = self.0.clone();
        Ok(api)
    }
}

struct SharedAzure(Arc<FakeAzure>);

#[async_trait]
impl AzureConnector for SharedAzure {
    async fn connect(
        &self,
        _credentials: &AzureCredentials,
        _environment: &AzureEnvironment,
    ) -> Result<Arc<dyn AzureStorageApi>> {
        let api: Arc<dyn AzureStorageApi> = self.0.clone();
        Ok(api)
    }
}

struct SharedGcs {
    storage: Arc<FakeGcs>,
    tags: Arc<FakeTagBindings>,
}

#[async_trait]
impl GcsConnector for SharedGcs {
    async fn connect(&self, _credentials: &GcsCredentials, _location: &str) -> Result<GcsClients> {
        Ok(GcsClients {
            storage: self.storage.clone(),
            tags: self.tags.clone(),
        })
    }
}

struct SharedSwift(Arc<FakeSwift>);

#[async_trait]
impl SwiftConnector for SharedSwift {
    async fn connect(&self, _credentials: &SwiftCredentials) -> Result<Arc<dyn SwiftApi>> {
        let api: Arc<dyn SwiftApi> = self.0.clone();
        Ok(api)
    }
}

// =============================================================================
// Test Environment
// =============================================================================

/// A cluster on one platform with fake clouds behind every connector
pub struct TestEnv {
    pub listers: Arc<FakeListers>,
    pub s3: Arc<FakeS3>,
    pub azure: Arc<FakeAzure>,
    pub gcs: Arc<FakeGcs>,
    pub tags: Arc<FakeTagBindings>,
    pub swift: Arc<FakeSwift>,
}

impl TestEnv {
    fn new(platform_status: PlatformStatus) -> Self {
        let infra = Infrastructure {
            infrastructure_name: INFRA_NAME.into(),
            platform_status,
        };
        Self {
            listers: Arc::new(FakeListers::with_infrastructure(infra)),
            s3: Arc::default(),
            azure: Arc::default(),
            gcs: Arc::default(),
            tags: Arc::default(),
            swift: Arc::default(),
        }
    }

    /// AWS cluster with minted access keys
    pub fn aws(region: &str) -> Self {
        let env = Self::new(PlatformStatus {
            platform: PlatformType::AWS,
            aws: Some(AwsPlatformStatus {
                region: region.into(),
                resource_tags: vec![ResourceTag {
                    key: "team".into(),
                    value: "registry".into(),
                }],
            }),
            ..Default::default()
        });
        env.put_minted_secret(&[
            (keys::AWS_ACCESS_KEY_ID, "AKIA"),
            (keys::AWS_SECRET_ACCESS_KEY, "shh"),
        ]);
        env
    }

    /// Azure cluster with a minted client secret identity
    pub fn azure() -> Self {
        let env = Self::new(PlatformStatus {
            platform: PlatformType::Azure,
            azure: Some(AzurePlatformStatus {
                resource_group_name: "rg".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        env.put_minted_secret(&[
            (keys::AZURE_CLIENT_ID, "client-id"),
            (keys::AZURE_TENANT_ID, "tenant-id"),
            (keys::AZURE_SUBSCRIPTION_ID, "subscription-id"),
            (keys::AZURE_RESOURCE_GROUP, "rg"),
            (keys::AZURE_REGION, "eastus"),
            (keys::AZURE_CLIENT_SECRET, "client-secret"),
        ]);
        env
    }

    /// GCP cluster with labels, one resource tag and a minted key file
    pub fn gcp() -> Self {
        let env = Self::new(PlatformStatus {
            platform: PlatformType::GCP,
            gcp: Some(GcpPlatformStatus {
                project_id: "my-project".into(),
                region: "us-east1".into(),
                resource_labels: vec![ResourceTag {
                    key: "env".into(),
                    value: "prod".into(),
                }],
                resource_tags: vec![GcpResourceTag {
                    parent_id: "1234".into(),
                    key: "team".into(),
                    value: "registry".into(),
                }],
            }),
            ..Default::default()
        });
        env.put_minted_secret(&[(
            keys::GCP_SERVICE_ACCOUNT,
            r#"{"type":"service_account","project_id":"my-project"}"#,
        )]);
        env
    }

    /// OpenStack cluster with a minted clouds.yaml
    pub fn openstack() -> Self {
        let env = Self::new(PlatformStatus {
            platform: PlatformType::OpenStack,
            openstack: Some(OpenStackPlatformStatus {
                cloud_name: "openstack".into(),
            }),
            ..Default::default()
        });
        let clouds = r#"
clouds:
  openstack:
    auth:
      auth_url: https://keystone.example.com:5000/v3
      username: swift-user
      password: swift-password
      project_name: registry-project
      user_domain_name: Default
    region_name: regionOne
    identity_api_version: 3
"#;
        env.put_minted_secret(&[(keys::OPENSTACK_CLOUDS, clouds)]);
        env
    }

    /// Cluster without a cloud platform
    pub fn bare() -> Self {
        Self::new(PlatformStatus {
            platform: PlatformType::None,
            ..Default::default()
        })
    }

    pub fn put_user_secret(&self, pairs: &[(&str, &str)]) {
        self.listers.put_secret(secret(USER_SECRET_NAME, pairs));
    }

    fn put_minted_secret(&self, pairs: &[(&str, &str)]) {
        self.listers.put_secret(secret(MINTED_SECRET_NAME, pairs));
    }

    /// Driver context wired to the fakes with test sized timings
    pub fn ctx(&self) -> DriverContext {
        DriverContext {
            listers: self.listers.clone(),
            resolver: ResolverConfig {
                poll_interval: Duration::from_millis(1),
                poll_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            provisioner: Provisioner::new(WaitPolicy {
                interval: Duration::from_millis(1),
                timeout: Duration::from_millis(50),
            }),
            connectors: Connectors {
                s3: Arc::new(SharedS3(self.s3.clone())),
                azure: Arc::new(SharedAzure(self.azure.clone())),
                gcs: Arc::new(SharedGcs {
                    storage: self.gcs.clone(),
                    tags: self.tags.clone(),
                }),
                swift: Arc::new(SharedSwift(self.swift.clone())),
            },
            tag_binding: TagBindingConfig {
                write_interval: Duration::from_millis(1),
                initial_retry_interval: Duration::from_millis(1),
                retry_multiplier: 2.0,
                max_retry_elapsed: Duration::from_millis(100),
            },
        }
    }
}
