//! Deterministic workflow execution ids
//!
//! Re-issuing an identical extraction or transform request must derive the
//! same id so that duplicate submission collides instead of duplicating
//! work. Cron triggers fire more than once and platforms return overlapping
//! pages; this derivation is the idempotency contract the whole fan-out
//! tree relies on.

use crate::models::TimePeriod;
use std::fmt;

/// Deterministic id for one workflow execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn extract_tenants(tenant_id: Option<&str>, period: &TimePeriod) -> Self {
        Self(format!(
            "extract-tenants-{}-{}",
            tenant_id.unwrap_or("all"),
            period.start_millis()
        ))
    }

    pub fn extract_repository(tenant_id: &str, repository_id: i64, period: &TimePeriod) -> Self {
        Self(format!(
            "extract-repo-{}-{}-{}",
            tenant_id,
            repository_id,
            period.start_millis()
        ))
    }

    pub fn extract_merge_request(repository_id: i64, merge_request_id: &str) -> Self {
        Self(format!(
            "extract-mr-{}-{}",
            repository_id, merge_request_id
        ))
    }

    pub fn transform_tenants(tenant_id: Option<&str>, period: &TimePeriod) -> Self {
        Self(format!(
            "transform-tenants-{}-{}",
            tenant_id.unwrap_or("all"),
            period.start_millis()
        ))
    }

    pub fn transform_repository(tenant_id: &str, repository_id: i64, period: &TimePeriod) -> Self {
        Self(format!(
            "transform-repo-{}-{}-{}",
            tenant_id,
            repository_id,
            period.start_millis()
        ))
    }

    pub fn transform_merge_request(repository_id: i64, merge_request_id: i64) -> Self {
        Self(format!(
            "transform-mr-{}-{}",
            repository_id, merge_request_id
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
