//! Shared Provisioning State Machine
//!
//! Every backend follows the same lifecycle:
//!
//! ```text
//! Unconfigured ──► Creating ──► Created (+ hardened) ──► Deleting ──► Removed
//! ```
//!
//! The state machine lives here once. Backends plug in a `ResourceOps`
//! strategy that knows how to probe, create, harden, empty and delete one
//! kind of resource.

use crate::crd::{
    reason, ConditionStatus, ConditionType, ManagementState, StorageBackend, StorageStatus,
};
use crate::error::{AggregateError, Error, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::naming::MAX_NAME_ATTEMPTS;

// =============================================================================
// Strategy Types
// =============================================================================

/// Result of an existence probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    /// The name exists but the credentials cannot access it
    Forbidden,
}

/// Result of a create call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The name is taken by someone else
    AlreadyExists,
}

/// Post-creation configuration applied to operator owned resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardeningStep {
    BlockPublicAccess,
    Tag,
    Encrypt,
    AbortIncompleteUploads,
}

impl HardeningStep {
    pub fn condition_type(&self) -> ConditionType {
        match self {
            HardeningStep::BlockPublicAccess => ConditionType::StoragePublicAccessBlocked,
            HardeningStep::Tag => ConditionType::StorageTagged,
            HardeningStep::Encrypt => ConditionType::StorageEncrypted,
            HardeningStep::AbortIncompleteUploads => {
                ConditionType::StorageIncompleteUploadCleanupEnabled
            }
        }
    }
}

impl fmt::Display for HardeningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardeningStep::BlockPublicAccess => write!(f, "block-public-access"),
            HardeningStep::Tag => write!(f, "tag"),
            HardeningStep::Encrypt => write!(f, "encrypt"),
            HardeningStep::AbortIncompleteUploads => write!(f, "abort-incomplete-uploads"),
        }
    }
}

/// Condition reasons a resource kind reports for presence and absence
#[derive(Debug, Clone, Copy)]
pub struct PresenceReasons {
    pub exists: &'static str,
    pub not_found: &'static str,
}

pub const BUCKET_REASONS: PresenceReasons = PresenceReasons {
    exists: reason::BUCKET_EXISTS,
    not_found: reason::BUCKET_NOT_FOUND,
};

pub const CONTAINER_REASONS: PresenceReasons = PresenceReasons {
    exists: reason::CONTAINER_EXISTS,
    not_found: reason::CONTAINER_NOT_FOUND,
};

pub const CLAIM_REASONS: PresenceReasons = PresenceReasons {
    exists: reason::CLAIM_EXISTS,
    not_found: reason::CLAIM_NOT_FOUND,
};

/// Backend specific operations on one kind of resource
#[async_trait]
pub trait ResourceOps: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// Human readable resource kind, e.g. "bucket"
    fn kind(&self) -> &'static str;

    fn reasons(&self) -> PresenceReasons;

    async fn probe(&self, name: &str) -> Result<Presence>;

    async fn create(&self, name: &str) -> Result<CreateOutcome>;

    /// Hardening steps this backend supports, in application order
    fn hardening_steps(&self) -> Vec<HardeningStep> {
        Vec::new()
    }

    /// Apply one hardening step, returning a message for the condition
    async fn harden(&self, name: &str, step: HardeningStep) -> Result<String> {
        Err(Error::Internal(format!(
            "{} does not support hardening step {} on {}",
            self.backend(),
            step,
            name
        )))
    }

    /// Delete the content of the resource
    async fn empty(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

/// How long and how often to wait for a created resource to become visible
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

// =============================================================================
// Provisioner
// =============================================================================

/// Runs the shared lifecycle against a `ResourceOps` strategy
#[derive(Clone, Default)]
pub struct Provisioner {
    pub wait: WaitPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl Provisioner {
    pub fn new(wait: WaitPolicy) -> Self {
        Self {
            wait,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Record that no resource name is configured yet
    pub fn not_configured(&self, status: &mut StorageStatus) -> bool {
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::False,
            reason::STORAGE_NOT_CONFIGURED,
            "Storage is not configured",
        );
        false
    }

    /// Report whether the named resource exists.
    ///
    /// An empty name is a valid pre-bootstrap state, not an error.
    pub async fn check_exists(
        &self,
        ops: &dyn ResourceOps,
        name: &str,
        status: &mut StorageStatus,
    ) -> Result<bool> {
        if name.is_empty() {
            return Ok(self.not_configured(status));
        }

        let reasons = ops.reasons();
        match ops.probe(name).await {
            Ok(Presence::Present) => {
                status.set_condition(
                    ConditionType::StorageExists,
                    ConditionStatus::True,
                    reasons.exists,
                    format!("{} {} exists", ops.kind(), name),
                );
                Ok(true)
            }
            Ok(Presence::Absent) => {
                status.set_condition(
                    ConditionType::StorageExists,
                    ConditionStatus::False,
                    reasons.not_found,
                    format!("{} {} does not exist", ops.kind(), name),
                );
                Ok(false)
            }
            Ok(Presence::Forbidden) => {
                let err = Error::provider(
                    ops.backend(),
                    "probe",
                    name,
                    crate::error::ProviderErrorKind::Forbidden,
                    format!("access to {} denied", ops.kind()),
                );
                self.unknown(status, &err);
                Err(err)
            }
            Err(e) => {
                self.unknown(status, &e);
                Err(e)
            }
        }
    }

    /// Flag drift between the desired and the last applied configuration.
    ///
    /// Drift is only surfaced, never resolved here.
    pub fn check_changed<T: PartialEq>(
        &self,
        desired: &Option<T>,
        applied: &Option<T>,
        status: &mut StorageStatus,
    ) -> bool {
        if desired == applied {
            return false;
        }
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::Unknown,
            reason::CONFIGURATION_CHANGED,
            "Configuration has changed",
        );
        true
    }

    /// Create or adopt a resource.
    ///
    /// `name` holds the user supplied name on entry (empty to generate one)
    /// and the final name on return. It is updated as soon as a resource is
    /// created, even if a later step fails, so the caller can persist it.
    pub async fn ensure_resource(
        &self,
        ops: &dyn ResourceOps,
        name: &mut String,
        generate: impl Fn() -> Result<String> + Send + Sync,
        status: &mut StorageStatus,
    ) -> Result<()> {
        let timer = self.metrics.as_ref().map(|m| m.start(ops.backend(), "create"));
        let result = self.ensure_resource_inner(ops, name, generate, status).await;
        if let Some(timer) = timer {
            timer.finish(&result);
        }
        result
    }

    async fn ensure_resource_inner(
        &self,
        ops: &dyn ResourceOps,
        name: &mut String,
        generate: impl Fn() -> Result<String> + Send + Sync,
        status: &mut StorageStatus,
    ) -> Result<()> {
        if !name.is_empty() {
            match ops.probe(name).await {
                Ok(Presence::Present) => {
                    if !status.is_managed() {
                        info!("Adopting existing {} {}: {}", ops.backend(), ops.kind(), name);
                        status.management_state = Some(ManagementState::Unmanaged);
                    }
                    status.set_condition(
                        ConditionType::StorageExists,
                        ConditionStatus::True,
                        ops.reasons().exists,
                        format!("{} {} exists", ops.kind(), name),
                    );
                    return Ok(());
                }
                Ok(Presence::Absent) | Ok(Presence::Forbidden) => {}
                Err(e) => {
                    self.unknown(status, &e);
                    return Err(e);
                }
            }

            info!("Creating {} {}: {}", ops.backend(), ops.kind(), name);
            return match ops.create(name).await {
                Ok(CreateOutcome::Created) => self.created(ops, name, status).await,
                Ok(CreateOutcome::AlreadyExists) => {
                    let message = format!(
                        "{} {} already exists and is not accessible with the configured credentials",
                        ops.kind(),
                        name
                    );
                    warn!("{}", message);
                    status.set_condition(
                        ConditionType::StorageExists,
                        ConditionStatus::False,
                        reason::NOT_ACCESSIBLE,
                        message.clone(),
                    );
                    Err(Error::Configuration(message))
                }
                Err(e) => {
                    self.creation_failed(status, &e);
                    Err(e)
                }
            };
        }

        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let candidate = match generate() {
                Ok(candidate) => candidate,
                Err(e) => {
                    self.creation_failed(status, &e);
                    return Err(e);
                }
            };

            debug!(
                "Creating {} {} (attempt {}): {}",
                ops.backend(),
                ops.kind(),
                attempt,
                candidate
            );
            match ops.create(&candidate).await {
                Ok(CreateOutcome::Created) => {
                    info!("Created {} {}: {}", ops.backend(), ops.kind(), candidate);
                    *name = candidate;
                    return self.created(ops, name, status).await;
                }
                Ok(CreateOutcome::AlreadyExists) => {
                    debug!("{} name {} is taken, regenerating", ops.kind(), candidate);
                }
                Err(e) => {
                    self.creation_failed(status, &e);
                    return Err(e);
                }
            }
        }

        let err = Error::Internal(format!(
            "unable to find an unused {} name after {} attempts",
            ops.kind(),
            MAX_NAME_ATTEMPTS
        ));
        self.creation_failed(status, &err);
        Err(err)
    }

    async fn created(
        &self,
        ops: &dyn ResourceOps,
        name: &str,
        status: &mut StorageStatus,
    ) -> Result<()> {
        status.management_state = Some(ManagementState::Managed);
        if let Err(e) = self.wait_until_visible(ops, name).await {
            self.creation_failed(status, &e);
            return Err(e);
        }
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::True,
            reason::CREATION_SUCCESSFUL,
            format!("{} {} was successfully created", ops.kind(), name),
        );
        Ok(())
    }

    /// Poll the existence probe until the resource is visible.
    ///
    /// Probe errors other than absence abort the wait; running out of time
    /// is an error, never silently ignored.
    pub async fn wait_until_visible(&self, ops: &dyn ResourceOps, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.wait.timeout;
        loop {
            if ops.probe(name).await? == Presence::Present {
                return Ok(());
            }
            if Instant::now() + self.wait.interval > deadline {
                return Err(Error::Timeout {
                    what: format!("{} {} to become visible", ops.kind(), name),
                    duration: self.wait.timeout,
                });
            }
            tokio::time::sleep(self.wait.interval).await;
        }
    }

    /// Apply all hardening steps to an operator owned resource.
    ///
    /// Steps run independently. Each reports its own condition and failures
    /// are returned together.
    pub async fn apply_hardening(
        &self,
        ops: &dyn ResourceOps,
        name: &str,
        status: &mut StorageStatus,
    ) -> Result<()> {
        if !status.is_managed() || name.is_empty() {
            return Ok(());
        }

        let mut failures = AggregateError::new();
        for step in ops.hardening_steps() {
            match ops.harden(name, step).await {
                Ok(message) => {
                    debug!("Applied {} to {} {}", step, ops.kind(), name);
                    status.set_condition(
                        step.condition_type(),
                        ConditionStatus::True,
                        reason::APPLIED,
                        message,
                    );
                }
                Err(e) => {
                    warn!("Failed to apply {} to {} {}: {}", step, ops.kind(), name, e);
                    status.set_condition(
                        step.condition_type(),
                        ConditionStatus::False,
                        reason::FAILED,
                        e.to_string(),
                    );
                    failures.record(&step.to_string(), name, &e);
                }
            }
        }
        failures.into_result()
    }

    /// Remove an operator owned resource.
    ///
    /// A no-op unless the resource is managed. Emptying tolerates missing
    /// objects and a missing resource counts as removed. Returns whether the
    /// resource was actually removed.
    pub async fn remove_resource(
        &self,
        ops: &dyn ResourceOps,
        name: &str,
        status: &mut StorageStatus,
    ) -> Result<bool> {
        if !status.is_managed() || name.is_empty() {
            debug!(
                "Not removing {} {} {:?}: not managed by the operator",
                ops.backend(),
                ops.kind(),
                name
            );
            return Ok(false);
        }

        let timer = self.metrics.as_ref().map(|m| m.start(ops.backend(), "remove"));
        let result = self.remove_resource_inner(ops, name, status).await;
        if let Some(timer) = timer {
            timer.finish(&result);
        }
        result.map(|_| true)
    }

    async fn remove_resource_inner(
        &self,
        ops: &dyn ResourceOps,
        name: &str,
        status: &mut StorageStatus,
    ) -> Result<()> {
        info!("Removing {} {}: {}", ops.backend(), ops.kind(), name);

        if let Err(e) = ops.empty(name).await {
            if !e.is_not_found() {
                self.deletion_failed(status, &e);
                return Err(e);
            }
        }

        match ops.delete(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("{} {} already gone", ops.kind(), name);
            }
            Err(e) => {
                self.deletion_failed(status, &e);
                return Err(e);
            }
        }

        status.management_state = Some(ManagementState::Removed);
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::False,
            reason::DELETED,
            format!("{} {} has been deleted", ops.kind(), name),
        );
        Ok(())
    }

    // =========================================================================
    // Condition Helpers
    // =========================================================================

    fn unknown(&self, status: &mut StorageStatus, err: &Error) {
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::Unknown,
            reason::UNKNOWN_ERROR,
            err.to_string(),
        );
    }

    fn creation_failed(&self, status: &mut StorageStatus, err: &Error) {
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::False,
            reason::CREATION_FAILED,
            err.to_string(),
        );
    }

    fn deletion_failed(&self, status: &mut StorageStatus, err: &Error) {
        status.set_condition(
            ConditionType::StorageExists,
            ConditionStatus::Unknown,
            reason::DELETION_FAILED,
            err.to_string(),
        );
    }
}
