//! Core data model shared across extraction, transform and storage.
//!
//! Rows derive `FromRow` for SQLx queries and `Serialize` for crawl-event
//! payloads and JSON CLI output.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Source-control platform a repository lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForgeType {
    Github,
    Gitlab,
}

impl fmt::Display for ForgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForgeType::Github => write!(f, "github"),
            ForgeType::Gitlab => write!(f, "gitlab"),
        }
    }
}

impl FromStr for ForgeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "github" => Ok(ForgeType::Github),
            "gitlab" => Ok(ForgeType::Gitlab),
            _ => Err(Error::Config(format!("Unknown forge type: {}", s))),
        }
    }
}

/// A tenant with its own isolated data store.
///
/// Provisioned out-of-band; this crate only reads tenant rows. Tenants
/// without a `crawl_user_id` have no usable credential and are skipped by
/// extraction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub db_locator: String,
    pub crawl_user_id: Option<String>,
}

/// A crawled repository. Identity is immutable after first extraction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub external_id: String,
    pub name: String,
    pub namespace_id: i64,
    pub namespace_name: String,
    pub forge_type: String,
}

impl Repository {
    pub fn forge(&self) -> Result<ForgeType> {
        self.forge_type.parse()
    }
}

/// Wall-clock interval scoping one extraction or transform run, inclusive
/// at both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePeriod {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimePeriod {
    /// Validate and construct a period. Rejected synchronously at the
    /// trigger boundary so malformed windows never enter the workflow tree.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from >= to {
            return Err(Error::Validation(format!(
                "time period start {} is not before end {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    /// Rolling window ending now
    pub fn last(duration: chrono::Duration) -> Self {
        let to = Utc::now();
        Self {
            from: to - duration,
            to,
        }
    }

    /// Shift the whole window back by `offset`
    pub fn offset_back(&self, offset: chrono::Duration) -> Self {
        Self {
            from: self.from - offset,
            to: self.to - offset,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from && instant <= self.to
    }

    /// Period start in epoch milliseconds, the component of deterministic
    /// workflow ids
    pub fn start_millis(&self) -> i64 {
        self.from.timestamp_millis()
    }
}

/// Merge request lifecycle state as reported by the forge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestState {
    Open,
    Merged,
    Closed,
}

impl fmt::Display for MergeRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeRequestState::Open => write!(f, "open"),
            MergeRequestState::Merged => write!(f, "merged"),
            MergeRequestState::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for MergeRequestState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open" | "opened" => Ok(MergeRequestState::Open),
            "merged" => Ok(MergeRequestState::Merged),
            "closed" => Ok(MergeRequestState::Closed),
            _ => Err(Error::Validation(format!(
                "Unknown merge request state: {}",
                s
            ))),
        }
    }
}

/// A merge request. Identity is `(repository_id, external_id)`; state and
/// timestamps are refreshed on every extraction pass.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: i64,
    pub external_id: String,
    pub repository_id: i64,
    pub sha_id: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_by: Option<String>,
    pub closed_by: Option<String>,
}

/// One parent link in the commit-ancestry DAG. Merge commits contribute one
/// edge per parent. Append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CommitEdge {
    pub sha_id: String,
    pub parent_id: String,
}

/// Deployment outcome reported by the forge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Success,
    Failed,
    Pending,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Success => write!(f, "success"),
            DeploymentStatus::Failed => write!(f, "failed"),
            DeploymentStatus::Pending => write!(f, "pending"),
        }
    }
}

impl FromStr for DeploymentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "success" => Ok(DeploymentStatus::Success),
            "failed" | "failure" | "error" => Ok(DeploymentStatus::Failed),
            _ => Ok(DeploymentStatus::Pending),
        }
    }
}

/// A deployment pinned to one commit. Only successful deployments
/// participate in correlation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub external_id: String,
    pub repository_id: i64,
    pub sha_id: String,
    pub status: String,
    pub deployed_at: DateTime<Utc>,
}

impl Deployment {
    pub fn is_success(&self) -> bool {
        self.status
            .parse::<DeploymentStatus>()
            .map(|s| s == DeploymentStatus::Success)
            .unwrap_or(false)
    }
}

/// A repository or namespace member
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub external_id: String,
    pub username: String,
    pub display_name: Option<String>,
}

/// Crawl-event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlEventDetail {
    Info,
    Complete,
    Failed,
}

impl fmt::Display for CrawlEventDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlEventDetail::Info => write!(f, "info"),
            CrawlEventDetail::Complete => write!(f, "complete"),
            CrawlEventDetail::Failed => write!(f, "failed"),
        }
    }
}

/// One row of the append-only crawl audit trail
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CrawlEvent {
    pub crawl_id: String,
    pub namespace: String,
    pub detail: String,
    pub data: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Derived delivery metrics for one merge request, upserted by merge-request
/// id so transform re-runs are no-ops.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MergeRequestMetrics {
    pub merge_request_id: i64,
    pub deployment_id: Option<i64>,
    pub cycle_time_secs: Option<i64>,
    pub review_time_secs: Option<i64>,
    pub lead_time_secs: Option<i64>,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_period_rejects_inverted_window() {
        let t0 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(2_000, 0).unwrap();
        assert!(TimePeriod::new(t1, t0).is_err());
        assert!(TimePeriod::new(t0, t0).is_err());
        assert!(TimePeriod::new(t0, t1).is_ok());
    }

    #[test]
    fn deployment_status_parses_platform_spellings() {
        assert_eq!(
            "failure".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::Failed
        );
        assert_eq!(
            "in_progress".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::Pending
        );
    }

    #[test]
    fn merge_request_state_accepts_gitlab_opened() {
        assert_eq!(
            "opened".parse::<MergeRequestState>().unwrap(),
            MergeRequestState::Open
        );
    }
}
