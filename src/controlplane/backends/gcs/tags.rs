//! GCP Tag Bindings
//!
//! Binds organization or project tags to a bucket through the regional
//! Cloud Resource Manager v3 API. Tags the bucket already carries, directly
//! or inherited, are skipped. Writes are paced by a rate limiter and
//! throttled calls are retried with exponential backoff. Per tag failures do
//! not stop the remaining bindings.

use crate::crd::{GcpResourceTag, StorageBackend};
use crate::error::{AggregateError, Error, ProviderErrorKind, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Effective tag pages read before giving up on the listing; the provider
/// allows at most 50 tags per resource
pub const MAX_TAG_PAGES: usize = 50;

// =============================================================================
// Configuration
// =============================================================================

/// Pacing and retry settings for tag binding writes
#[derive(Debug, Clone)]
pub struct TagBindingConfig {
    /// Minimum spacing between binding writes
    pub write_interval: Duration,
    /// First retry delay after a throttled write
    pub initial_retry_interval: Duration,
    /// Growth factor between retries
    pub retry_multiplier: f64,
    /// Stop retrying a throttled write after this long
    pub max_retry_elapsed: Duration,
}

impl Default for TagBindingConfig {
    fn default() -> Self {
        Self {
            write_interval: Duration::from_millis(200),
            initial_retry_interval: Duration::from_secs(1),
            retry_multiplier: 2.0,
            max_retry_elapsed: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Tag Binding Port
// =============================================================================

/// One page of effective tags on a resource
#[derive(Debug, Clone, Default)]
pub struct EffectiveTagPage {
    /// `{parentID}/{key}/{value}` of every tag on the page
    pub namespaced_values: Vec<String>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait TagBindingApi: Send + Sync {
    async fn list_effective_tags(
        &self,
        parent: &str,
        page_token: Option<String>,
    ) -> Result<EffectiveTagPage>;

    async fn create_binding(&self, parent: &str, namespaced_value: &str) -> Result<()>;
}

/// Full resource name of a bucket, the parent of its tag bindings
pub fn bucket_resource_name(bucket: &str) -> String {
    format!("//storage.googleapis.com/projects/_/buckets/{}", bucket)
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Fixed rate limiter; the first permit is only granted after one interval,
/// so a burst is throttled from its first request
pub struct RateLimiter {
    interval: Mutex<Interval>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Mutex::new(interval),
        }
    }

    /// Wait for the next permit
    pub async fn acquire(&self) {
        self.interval.lock().await.tick().await;
    }
}

// =============================================================================
// Tag Binder
// =============================================================================

/// Binds tags to one resource, skipping the ones already effective
pub struct TagBinder {
    api: Arc<dyn TagBindingApi>,
    config: TagBindingConfig,
}

impl TagBinder {
    pub fn new(api: Arc<dyn TagBindingApi>, config: TagBindingConfig) -> Self {
        Self { api, config }
    }

    /// Tags effective on `parent`. Listing errors end the listing early and
    /// keep what was read so far.
    async fn effective_tags(&self, parent: &str) -> BTreeSet<String> {
        let mut effective = BTreeSet::new();
        let mut page_token = None;

        for _ in 0..MAX_TAG_PAGES {
            match self.api.list_effective_tags(parent, page_token).await {
                Ok(page) => {
                    effective.extend(page.namespaced_values);
                    match page.next_page_token.filter(|t| !t.is_empty()) {
                        Some(token) => page_token = Some(token),
                        None => return effective,
                    }
                }
                Err(e) => {
                    warn!("Listing effective tags of {} failed: {}", parent, e);
                    return effective;
                }
            }
        }

        warn!(
            "Effective tags of {} span more than {} pages, continuing with what was read",
            parent, MAX_TAG_PAGES
        );
        effective
    }

    /// Bind every tag of `desired` not yet effective on `parent`.
    ///
    /// Returns the namespaced values that were written.
    pub async fn bind(&self, parent: &str, desired: &[GcpResourceTag]) -> Result<Vec<String>> {
        let effective = self.effective_tags(parent).await;
        let pending: BTreeSet<String> = desired
            .iter()
            .map(GcpResourceTag::namespaced_value)
            .filter(|value| !effective.contains(value))
            .collect();

        if pending.is_empty() {
            debug!("All {} tag(s) already bound to {}", desired.len(), parent);
            return Ok(Vec::new());
        }

        // Pacing starts with the first write, not with the listing
        let limiter = RateLimiter::new(self.config.write_interval);
        let mut failures = AggregateError::new();
        let mut bound = Vec::new();
        for value in pending {
            limiter.acquire().await;
            match self.bind_one(parent, &value).await {
                Ok(()) => bound.push(value),
                Err(e) => {
                    warn!("Binding tag {} to {} failed: {}", value, parent, e);
                    failures.record("bind-tag", &value, &e);
                }
            }
        }

        info!("Bound {} tag(s) to {}", bound.len(), parent);
        failures.into_result()?;
        Ok(bound)
    }

    /// One binding write. Conflicts mean the tag is already bound; throttling
    /// is retried with backoff.
    async fn bind_one(&self, parent: &str, value: &str) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_interval)
            .with_multiplier(self.config.retry_multiplier)
            .with_max_elapsed_time(Some(self.config.max_retry_elapsed))
            .build();

        let api = &self.api;
        backoff::future::retry(policy, move || async move {
            match api.create_binding(parent, value).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_conflict() || e.is_already_exists() => {
                    debug!("Tag {} is already bound to {}", value, parent);
                    Ok(())
                }
                Err(e) if e.is_throttled() => Err(backoff::Error::transient(e)),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

// =============================================================================
// REST Client
// =============================================================================

/// Source of OAuth bearer tokens for Google APIs
#[async_trait]
pub trait BearerTokenSource: Send + Sync {
    /// Value of the `Authorization` header
    async fn authorization(&self) -> Result<String>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EffectiveTagsResponse {
    #[serde(default)]
    effective_tags: Vec<EffectiveTag>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EffectiveTag {
    #[serde(default)]
    namespaced_tag_value: String,
}

#[derive(Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: String,
}

/// `TagBindingApi` against the regional Cloud Resource Manager endpoint
pub struct RestTagBindingClient {
    http: Client,
    endpoint: String,
    token: Arc<dyn BearerTokenSource>,
}

impl RestTagBindingClient {
    /// Client for buckets in `location` (e.g. `us-central1`)
    pub fn new(location: &str, token: Arc<dyn BearerTokenSource>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "https://{}-cloudresourcemanager.googleapis.com/v3",
                location.to_ascii_lowercase()
            ),
            token,
        })
    }

    async fn error(operation: &str, resource: &str, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GoogleErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        Error::provider(
            StorageBackend::Gcs,
            operation,
            resource,
            ProviderErrorKind::from_status(status.as_u16()),
            format!("HTTP {}: {}", status.as_u16(), message),
        )
    }
}

#[async_trait]
impl TagBindingApi for RestTagBindingClient {
    async fn list_effective_tags(
        &self,
        parent: &str,
        page_token: Option<String>,
    ) -> Result<EffectiveTagPage> {
        let mut query = vec![("parent", parent.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let response = self
            .http
            .get(format!("{}/effectiveTags", self.endpoint))
            .header(
                reqwest::header::AUTHORIZATION,
                self.token.authorization().await?,
            )
            .query(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error("list-effective-tags", parent, response).await);
        }

        let body: EffectiveTagsResponse = response.json().await?;
        Ok(EffectiveTagPage {
            namespaced_values: body
                .effective_tags
                .into_iter()
                .map(|t| t.namespaced_tag_value)
                .collect(),
            next_page_token: body.next_page_token,
        })
    }

    async fn create_binding(&self, parent: &str, namespaced_value: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/tagBindings", self.endpoint))
            .header(
                reqwest::header::AUTHORIZATION,
                self.token.authorization().await?,
            )
            .json(&json!({
                "parent": parent,
                "tagValueNamespacedName": namespaced_value,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error("bind-tag", namespaced_value, response).await);
        }
        Ok(())
    }
}
