//! Blob Migration Engine
//!
//! Moves every blob under one prefix of a container to the same relative
//! name under another prefix: server side copy, wait for asynchronous
//! copies to settle, then delete the originals that were confirmed copied.
//!
//! Runs once per CLI invocation. Re-running after a partial failure is safe;
//! copies are re-issued unconditionally.

use crate::error::{AggregateError, Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Blob Container Port
// =============================================================================

/// State of a server side copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyState {
    Success,
    Pending,
    Failed(String),
    Aborted(String),
}

/// Operations the engine needs from one resolved container
#[async_trait]
pub trait BlobContainer: Send + Sync {
    /// Names of all blobs starting with `prefix`, across every listing page
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<String>>;

    /// Start copying `source` onto `dest` in the same container
    async fn start_copy(&self, source: &str, dest: &str) -> Result<CopyState>;

    /// Copy state recorded on the destination blob
    async fn copy_state(&self, dest: &str) -> Result<CopyState>;

    async fn delete_blob(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Polling limits for asynchronous copies
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Delay between copy state polls
    pub poll_interval: Duration,
    /// Give up on one copy after this long
    pub copy_deadline: Duration,
    /// Give up on one copy after more consecutive poll errors than this
    pub max_poll_errors: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            copy_deadline: Duration::from_secs(600),
            max_poll_errors: 5,
        }
    }
}

/// Outcome of a migration run
#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Source names that were copied and then deleted
    pub moved: Vec<String>,
    pub failures: AggregateError,
}

impl MigrationReport {
    /// `Ok(moved)` when every blob moved, the aggregate error otherwise
    pub fn into_result(self) -> Result<Vec<String>> {
        self.failures.into_result()?;
        Ok(self.moved)
    }
}

/// Destination name of `name` when moving `source` onto `dest`
pub fn destination_name(name: &str, source: &str, dest: &str) -> String {
    format!("{}{}", dest, name.strip_prefix(source).unwrap_or(name))
}

// =============================================================================
// Migration
// =============================================================================

/// One migration over a container
pub struct BlobMigration<'a> {
    container: &'a dyn BlobContainer,
    config: MigrationConfig,
    cancel: CancellationToken,
}

impl<'a> BlobMigration<'a> {
    pub fn new(container: &'a dyn BlobContainer, config: MigrationConfig) -> Self {
        Self {
            container,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop polling and return `Error::Cancelled` once the token fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Move all blobs under `source` to `dest`.
    ///
    /// Listing failures and cancellation abort the run; per blob failures are
    /// collected into the report and the run continues.
    pub async fn run(&self, source: &str, dest: &str) -> Result<MigrationReport> {
        if source == dest {
            return Err(Error::Configuration(format!(
                "source and destination prefixes are both {:?}",
                source
            )));
        }

        let names = self.container.list_blobs(source).await?;
        info!(
            "Moving {} blob(s) from {:?} to {:?}",
            names.len(),
            source,
            dest
        );

        let mut report = MigrationReport::default();
        let mut copied = Vec::new();
        // destination -> source
        let mut pending = BTreeMap::new();

        for name in names {
            self.check_cancelled()?;
            let target = destination_name(&name, source, dest);
            debug!("Copying blob {} to {}", name, target);
            match self.container.start_copy(&name, &target).await {
                Ok(CopyState::Success) => copied.push(name),
                Ok(CopyState::Pending) => {
                    pending.insert(target, name);
                }
                Ok(CopyState::Failed(reason)) | Ok(CopyState::Aborted(reason)) => {
                    report.failures.record(
                        "copy",
                        &name,
                        &Error::Internal(format!("copy to {} did not complete: {}", target, reason)),
                    );
                }
                Err(e) => {
                    warn!("Failed to copy blob {}: {}", name, e);
                    report.failures.record("copy", &name, &e);
                }
            }
        }

        for (target, name) in pending {
            match self.wait_for_copy(&target).await {
                Ok(()) => copied.push(name),
                Err(Error::Cancelled(what)) => return Err(Error::Cancelled(what)),
                Err(e) => {
                    warn!("Copy of blob {} to {} failed: {}", name, target, e);
                    report.failures.record("copy", &name, &e);
                }
            }
        }

        for name in copied {
            self.check_cancelled()?;
            match self.container.delete_blob(&name).await {
                Ok(()) => report.moved.push(name),
                Err(e) if e.is_not_found() => report.moved.push(name),
                Err(e) => {
                    warn!("Failed to delete blob {}: {}", name, e);
                    report.failures.record("delete", &name, &e);
                }
            }
        }

        info!(
            "Moved {} blob(s), {} failure(s)",
            report.moved.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("blob migration".into()));
        }
        Ok(())
    }

    /// Poll a pending copy until it settles, the deadline passes, or polling
    /// keeps failing
    async fn wait_for_copy(&self, target: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.copy_deadline;
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("copy of {}", target)));
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            match self.container.copy_state(target).await {
                Ok(CopyState::Success) => return Ok(()),
                Ok(CopyState::Pending) => consecutive_errors = 0,
                Ok(CopyState::Failed(reason)) | Ok(CopyState::Aborted(reason)) => {
                    return Err(Error::Internal(format!(
                        "copy to {} did not complete: {}",
                        target, reason
                    )));
                }
                Err(e) => {
                    consecutive_errors += 1;
                    debug!(
                        "Polling copy state of {} failed ({} in a row): {}",
                        target, consecutive_errors, e
                    );
                    if consecutive_errors > self.config.max_poll_errors {
                        return Err(e);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: format!("copy to {}", target),
                    duration: self.config.copy_deadline,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBlobContainer;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_moves_blobs_under_new_prefix() {
        let container = FakeBlobContainer::with_blobs(&["docker/a", "docker/b", "other/c"]);
        let migration = BlobMigration::new(&container, MigrationConfig::default());

        let report = migration.run("docker", "/docker").await.unwrap();

        assert_eq!(report.moved, vec!["docker/a".to_string(), "docker/b".to_string()]);
        assert!(report.failures.is_empty());
        assert_eq!(
            container.names(),
            vec!["/docker/a".to_string(), "/docker/b".to_string(), "other/c".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_copies_are_polled_until_done() {
        let container = FakeBlobContainer::with_blobs(&["docker/a", "docker/b"]);
        container.async_copies(3);
        let migration = BlobMigration::new(&container, MigrationConfig::default());

        let moved = migration.run("docker", "/docker").await.unwrap().into_result().unwrap();

        assert_eq!(moved.len(), 2);
        assert_eq!(container.calls("copy_state"), 6);
        assert!(!container.has_blob("docker/a"));
        assert!(container.has_blob("/docker/b"));
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_source_and_continues() {
        let container = FakeBlobContainer::with_blobs(&["docker/a", "docker/b"]);
        container.fail_copy("docker/a");
        let migration = BlobMigration::new(&container, MigrationConfig::default());

        let report = migration.run("docker", "/docker").await.unwrap();

        assert_eq!(report.moved, vec!["docker/b".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures.failures[0].resource, "docker/a");
        assert!(container.has_blob("docker/a"));
        assert_matches!(report.into_result(), Err(Error::Aggregate(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_poll_errors_give_up_on_blob() {
        let container = FakeBlobContainer::with_blobs(&["docker/a"]);
        container.async_copies(2);
        container.fail_polls("/docker/a");
        let migration = BlobMigration::new(&container, MigrationConfig::default());

        let report = migration.run("docker", "/docker").await.unwrap();

        assert!(report.moved.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(container.calls("copy_state"), 6);
        assert!(container.has_blob("docker/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_that_never_settles_times_out() {
        let container = FakeBlobContainer::with_blobs(&["docker/a"]);
        container.async_copies(usize::MAX);
        let config = MigrationConfig {
            copy_deadline: Duration::from_secs(1),
            ..Default::default()
        };
        let migration = BlobMigration::new(&container, config);

        let report = migration.run("docker", "/docker").await.unwrap();

        assert!(report.moved.is_empty());
        assert!(report.failures.failures[0].cause.contains("timed out"));
        assert!(container.has_blob("docker/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let container = FakeBlobContainer::with_blobs(&["docker/a"]);
        container.async_copies(usize::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let migration =
            BlobMigration::new(&container, MigrationConfig::default()).with_cancellation(cancel);

        assert_matches!(
            migration.run("docker", "/docker").await,
            Err(Error::Cancelled(_))
        );
        assert!(container.has_blob("docker/a"));
    }

    #[tokio::test]
    async fn test_same_prefix_is_rejected() {
        let container = FakeBlobContainer::with_blobs(&["docker/a"]);
        let migration = BlobMigration::new(&container, MigrationConfig::default());
        assert_matches!(
            migration.run("docker", "docker").await,
            Err(Error::Configuration(_))
        );
        assert_eq!(container.calls("list_blobs"), 0);
    }

    #[test]
    fn test_destination_name() {
        assert_eq!(destination_name("docker/a", "docker", "/docker"), "/docker/a");
        assert_eq!(
            destination_name("docker/registry/v2/x", "docker/", "new/"),
            "new/registry/v2/x"
        );
    }
}
