//! Source-control client capability interface
//!
//! This module provides:
//! - the `ForgeClient` trait the orchestrators consume
//! - normalized wire types shared by both forge implementations
//! - translation of platform throttling signals into typed errors
//! - a proactive per-client request budget

mod github;
mod gitlab;
mod rate_limit;

pub use github::*;
pub use gitlab::*;
pub use rate_limit::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{DeploymentStatus, ForgeType};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Arc;

/// Forge-specific capabilities gated by `ForgeClient::supports`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Merge-request timeline events
    TimelineEvents,
    /// Merge/close actor resolution
    MergeRequestActors,
    /// Default-branch commit history
    CommitHistory,
    /// Workflow-run-derived deployments
    RunDeployments,
}

/// Repository metadata as reported by the forge
#[derive(Debug, Clone)]
pub struct ForgeRepository {
    pub external_id: String,
    pub name: String,
    pub namespace_id: i64,
    pub namespace_name: String,
    pub default_branch: String,
}

/// A repository or namespace member
#[derive(Debug, Clone)]
pub struct ForgeMember {
    pub external_id: String,
    pub username: String,
    pub display_name: Option<String>,
}

/// Merge request as reported by the forge
#[derive(Debug, Clone)]
pub struct ForgeMergeRequest {
    pub external_id: String,
    pub sha_id: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// One page of a paginated merge-request fetch.
///
/// `reached_watermark` is true once the platform's most-recently-updated
/// ordering yields an item older than the window start; every later page is
/// guaranteed to fall outside the window too.
#[derive(Debug, Clone, Default)]
pub struct MergeRequestPage {
    pub items: Vec<ForgeMergeRequest>,
    pub has_more: bool,
    pub reached_watermark: bool,
}

/// One commit with its parent links
#[derive(Debug, Clone)]
pub struct ForgeCommit {
    pub sha: String,
    pub parents: Vec<String>,
}

/// Per-file diff stat for one merge request
#[derive(Debug, Clone)]
pub struct ForgeDiffStat {
    pub file_path: String,
    pub additions: i64,
    pub deletions: i64,
}

/// A review note / comment on a merge request
#[derive(Debug, Clone)]
pub struct ForgeNote {
    pub external_id: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

/// A timeline event on a merge request
#[derive(Debug, Clone)]
pub struct ForgeTimelineEvent {
    pub kind: String,
    pub actor: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Merge/close actors for one merge request
#[derive(Debug, Clone, Default)]
pub struct MergeRequestActors {
    pub merged_by: Option<String>,
    pub closed_by: Option<String>,
}

/// Deployment as reported by the forge
#[derive(Debug, Clone)]
pub struct ForgeDeployment {
    pub external_id: String,
    pub sha_id: String,
    pub status: String,
    pub deployed_at: DateTime<Utc>,
}

/// Capability interface over one source-control platform.
///
/// One instance per tenant and forge, built from explicit context so tests
/// can inject fakes; no process-global client caches.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    fn forge_type(&self) -> ForgeType;

    fn supports(&self, capability: Capability) -> bool;

    async fn fetch_repository(&self, repo: &str) -> Result<ForgeRepository>;

    async fn fetch_members(&self, repo: &str) -> Result<Vec<ForgeMember>>;

    async fn fetch_member(&self, username: &str) -> Result<ForgeMember>;

    async fn fetch_namespace_members(&self, namespace: &str) -> Result<Vec<ForgeMember>>;

    async fn fetch_merge_requests(
        &self,
        repo: &str,
        page: u32,
        per_page: u32,
        updated_after: DateTime<Utc>,
    ) -> Result<MergeRequestPage>;

    async fn fetch_merge_request_diffs(&self, repo: &str, mr: &str) -> Result<Vec<ForgeDiffStat>>;

    async fn fetch_merge_request_commits(&self, repo: &str, mr: &str) -> Result<Vec<ForgeCommit>>;

    async fn fetch_merge_request_notes(&self, repo: &str, mr: &str) -> Result<Vec<ForgeNote>>;

    async fn fetch_timeline_events(&self, repo: &str, mr: &str)
        -> Result<Vec<ForgeTimelineEvent>>;

    async fn fetch_merge_request_actors(&self, repo: &str, mr: &str)
        -> Result<MergeRequestActors>;

    async fn fetch_deployments(&self, repo: &str) -> Result<Vec<ForgeDeployment>>;

    async fn fetch_deployment_status(&self, repo: &str, deployment: &str)
        -> Result<DeploymentStatus>;

    async fn fetch_commit_history(
        &self,
        repo: &str,
        branch: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ForgeCommit>>;

    async fn fetch_run_deployments(
        &self,
        repo: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ForgeDeployment>>;
}

/// Build the client for one forge from config. Tokens come from the
/// environment variables named in config.
pub fn build_client(config: &Config, forge: ForgeType) -> Result<Arc<dyn ForgeClient>> {
    match forge {
        ForgeType::Github => {
            let token = config.github_token().ok_or_else(|| {
                Error::Config(format!(
                    "GitHub token not set (expected in ${})",
                    config.forge.github_token_env
                ))
            })?;
            Ok(Arc::new(GithubClient::new(config, token)?))
        }
        ForgeType::Gitlab => {
            let token = config.gitlab_token().ok_or_else(|| {
                Error::Config(format!(
                    "GitLab token not set (expected in ${})",
                    config.forge.gitlab_token_env
                ))
            })?;
            Ok(Arc::new(GitlabClient::new(config, token)?))
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Translate a throttling response into a typed rate-limit error, reading
/// whichever quota headers the platform sent.
///
/// GitHub reports `x-ratelimit-remaining`/`x-ratelimit-reset` (epoch
/// seconds) and signals exhaustion with 403 or 429; GitLab uses
/// `ratelimit-remaining`/`ratelimit-reset` and `retry-after` with 429.
pub(crate) fn classify_throttle(status: StatusCode, headers: &HeaderMap) -> Option<Error> {
    let remaining =
        header_u64(headers, "x-ratelimit-remaining").or_else(|| header_u64(headers, "ratelimit-remaining"));

    let quota_exhausted = remaining == Some(0);
    if status != StatusCode::TOO_MANY_REQUESTS && !(status == StatusCode::FORBIDDEN && quota_exhausted)
    {
        return None;
    }

    let reset_at = header_u64(headers, "x-ratelimit-reset")
        .or_else(|| header_u64(headers, "ratelimit-reset"))
        .and_then(|epoch| Utc.timestamp_opt(epoch as i64, 0).single())
        .or_else(|| {
            header_u64(headers, "retry-after")
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64))
        });

    Some(Error::RateLimited { remaining, reset_at })
}

/// Map a non-throttle error response onto the error taxonomy
pub(crate) fn classify_status(status: StatusCode, context: &str) -> Error {
    if status == StatusCode::NOT_FOUND {
        Error::NotFound(context.to_string())
    } else if status.is_server_error() {
        Error::Transient(format!("HTTP {} for {}", status, context))
    } else {
        Error::Other(format!("HTTP {} for {}", status, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn github_secondary_limit_is_classified() {
        let reset = (Utc::now() + chrono::Duration::seconds(120)).timestamp();
        let h = headers(&[
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", &reset.to_string()),
        ]);
        let err = classify_throttle(StatusCode::FORBIDDEN, &h).expect("throttle");
        match err {
            Error::RateLimited {
                remaining,
                reset_at,
            } => {
                assert_eq!(remaining, Some(0));
                assert_eq!(reset_at.unwrap().timestamp(), reset);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn gitlab_retry_after_sets_reset() {
        let h = headers(&[("retry-after", "42")]);
        let err = classify_throttle(StatusCode::TOO_MANY_REQUESTS, &h).expect("throttle");
        let wait = err.retry_after().expect("reset");
        assert!(wait.num_seconds() > 35 && wait.num_seconds() <= 42);
    }

    #[test]
    fn forbidden_with_quota_left_is_not_a_throttle() {
        let h = headers(&[("x-ratelimit-remaining", "55")]);
        assert!(classify_throttle(StatusCode::FORBIDDEN, &h).is_none());
    }

    #[test]
    fn not_found_maps_to_permanent_error() {
        let err = classify_status(StatusCode::NOT_FOUND, "repos/acme/api");
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_map_to_transient() {
        let err = classify_status(StatusCode::BAD_GATEWAY, "repos/acme/api");
        assert!(err.is_retryable());
    }
}
