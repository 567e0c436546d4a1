//! Stateless extraction and transform activities
//!
//! Activities are the leaf operations workflows invoke: fetch one thing
//! from the forge, persist it, report child-unit identifiers. They hold no
//! state of their own; everything they need travels in an explicit
//! [`ActivityContext`] so tests can inject fake forges and temp stores.
//! Re-running any activity is idempotent at the storage layer.

use crate::correlate::{correlate, CommitDag, MergeRequestDeploymentPair};
use crate::error::{Error, Result};
use crate::forge::{Capability, ForgeClient, MergeRequestPage};
use crate::ledger::CrawlLedger;
use crate::models::{MergeRequest, MergeRequestMetrics, Repository, Tenant, TimePeriod};
use crate::store::{ControlDb, NewDeployment, NewMergeRequest, NewRepository, TenantStore};
use crate::workflow::RetryPolicy;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Explicit per-invocation context, passed down the workflow tree instead
/// of process-global client caches
#[derive(Clone)]
pub struct ActivityContext {
    pub tenant: Tenant,
    pub store: TenantStore,
    pub forge: Arc<dyn ForgeClient>,
    pub retry: RetryPolicy,
    pub period: TimePeriod,
    /// Forge-side repository identifier, e.g. `acme/api`
    pub repo_path: String,
}

impl ActivityContext {
    pub fn supports(&self, capability: Capability) -> bool {
        self.forge.supports(capability)
    }
}

/// Resolve the tenant set for a run. With a filter, the tenant must exist;
/// an unknown id is a validation-stage failure, rejected before any
/// workflow starts.
pub async fn get_tenants(control: &ControlDb, filter: Option<&str>) -> Result<Vec<Tenant>> {
    match filter {
        Some(id) => {
            let tenant = control
                .get_tenant(id)
                .await?
                .ok_or_else(|| Error::TenantNotFound(id.to_string()))?;
            Ok(vec![tenant])
        }
        None => control.list_tenants().await,
    }
}

/// Repositories registered for one tenant
pub async fn get_repositories_for_tenant(store: &TenantStore) -> Result<Vec<Repository>> {
    store.list_repositories().await
}

/// Result of the repository-metadata activity; establishes the crawl
/// instance everything else in the run reports into
pub struct RepositoryExtract {
    pub repository: Repository,
    pub default_branch: String,
    pub ledger: CrawlLedger,
}

/// Extract repository metadata and namespace. Must succeed before any
/// other branch of the repository workflow runs.
pub async fn extract_repository(ctx: &ActivityContext) -> Result<RepositoryExtract> {
    let forge_repo = ctx
        .retry
        .critical()
        .run("extract_repository", || {
            ctx.forge.fetch_repository(&ctx.repo_path)
        })
        .await?;

    let repository = ctx
        .store
        .upsert_repository(&NewRepository {
            external_id: forge_repo.external_id.clone(),
            name: forge_repo.name.clone(),
            namespace_id: forge_repo.namespace_id,
            namespace_name: forge_repo.namespace_name.clone(),
            forge_type: ctx.forge.forge_type().to_string(),
        })
        .await?;

    let ledger = CrawlLedger::begin(ctx.store.clone());
    ledger
        .info(
            "repository",
            Some(json!({
                "repository_id": repository.id,
                "namespace_id": repository.namespace_id,
                "period_start": ctx.period.start_millis(),
            })),
        )
        .await?;

    info!(
        tenant = %ctx.tenant.id,
        repository = %ctx.repo_path,
        crawl_id = ledger.crawl_id(),
        "Repository metadata extracted"
    );

    Ok(RepositoryExtract {
        repository,
        default_branch: forge_repo.default_branch,
        ledger,
    })
}

/// Fetch and persist one page of merge requests updated after the window
/// start. Returns the external ids seen plus the pagination flags.
pub async fn extract_merge_requests(
    ctx: &ActivityContext,
    repository: &Repository,
    page: u32,
    per_page: u32,
) -> Result<(Vec<String>, MergeRequestPage)> {
    let fetched = ctx
        .retry
        .run("extract_merge_requests", || {
            ctx.forge
                .fetch_merge_requests(&ctx.repo_path, page, per_page, ctx.period.from)
        })
        .await?;

    let mut ids = Vec::with_capacity(fetched.items.len());
    for item in &fetched.items {
        ctx.store
            .upsert_merge_request(&NewMergeRequest {
                external_id: item.external_id.clone(),
                repository_id: repository.id,
                sha_id: item.sha_id.clone(),
                state: item.state.clone(),
                created_at: item.created_at,
                updated_at: item.updated_at,
                merged_at: item.merged_at,
                closed_at: item.closed_at,
            })
            .await?;
        ids.push(item.external_id.clone());
    }

    debug!(
        page,
        count = ids.len(),
        has_more = fetched.has_more,
        reached_watermark = fetched.reached_watermark,
        "Merge request page persisted"
    );
    Ok((ids, fetched))
}

async fn require_merge_request(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<MergeRequest> {
    ctx.store
        .get_merge_request(repository_id, external_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("merge request {}", external_id)))
}

pub async fn extract_merge_request_diffs(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    let mr = require_merge_request(ctx, repository_id, external_id).await?;
    let diffs = ctx
        .retry
        .run("extract_merge_request_diffs", || {
            ctx.forge
                .fetch_merge_request_diffs(&ctx.repo_path, external_id)
        })
        .await?;
    for diff in diffs {
        ctx.store
            .upsert_merge_request_diff(mr.id, &diff.file_path, diff.additions, diff.deletions)
            .await?;
    }
    Ok(())
}

/// Persist the merge request's commits as ancestry edges. This is what
/// feeds the correlator's DAG.
pub async fn extract_merge_request_commits(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    let commits = ctx
        .retry
        .run("extract_merge_request_commits", || {
            ctx.forge
                .fetch_merge_request_commits(&ctx.repo_path, external_id)
        })
        .await?;
    for commit in commits {
        for parent in &commit.parents {
            ctx.store
                .insert_commit_edge(repository_id, &commit.sha, parent)
                .await?;
        }
    }
    Ok(())
}

pub async fn extract_merge_request_notes(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    let mr = require_merge_request(ctx, repository_id, external_id).await?;
    let notes = ctx
        .retry
        .run("extract_merge_request_notes", || {
            ctx.forge
                .fetch_merge_request_notes(&ctx.repo_path, external_id)
        })
        .await?;
    for note in notes {
        ctx.store
            .upsert_merge_request_note(mr.id, &note.external_id, &note.author, note.created_at)
            .await?;
    }
    Ok(())
}

pub async fn extract_timeline_events(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    let mr = require_merge_request(ctx, repository_id, external_id).await?;
    let events = ctx
        .retry
        .run("extract_timeline_events", || {
            ctx.forge.fetch_timeline_events(&ctx.repo_path, external_id)
        })
        .await?;
    for event in events {
        ctx.store
            .upsert_timeline_event(mr.id, &event.kind, event.actor.as_deref(), event.created_at)
            .await?;
    }
    Ok(())
}

pub async fn extract_merge_request_actors(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    let mr = require_merge_request(ctx, repository_id, external_id).await?;
    let actors = ctx
        .retry
        .run("extract_merge_request_actors", || {
            ctx.forge
                .fetch_merge_request_actors(&ctx.repo_path, external_id)
        })
        .await?;
    ctx.store
        .set_merge_request_actors(mr.id, actors.merged_by.as_deref(), actors.closed_by.as_deref())
        .await?;
    Ok(())
}

/// Fetch repository members; returns usernames for the per-member detail
/// fan-out
pub async fn extract_members(
    ctx: &ActivityContext,
    repository_id: i64,
) -> Result<Vec<String>> {
    let members = ctx
        .retry
        .run("extract_members", || ctx.forge.fetch_members(&ctx.repo_path))
        .await?;

    let mut usernames = Vec::with_capacity(members.len());
    for member in members {
        let row = ctx
            .store
            .upsert_member(
                &member.external_id,
                &member.username,
                member.display_name.as_deref(),
            )
            .await?;
        ctx.store
            .link_repository_member(repository_id, row.id)
            .await?;
        usernames.push(member.username);
    }
    Ok(usernames)
}

pub async fn extract_member_info(ctx: &ActivityContext, username: &str) -> Result<()> {
    let member = ctx
        .retry
        .run("extract_member_info", || ctx.forge.fetch_member(username))
        .await?;
    ctx.store
        .upsert_member(
            &member.external_id,
            &member.username,
            member.display_name.as_deref(),
        )
        .await?;
    Ok(())
}

/// Namespace-level members affect repository-member associations, not
/// per-member detail
pub async fn extract_namespace_members(
    ctx: &ActivityContext,
    repository: &Repository,
) -> Result<()> {
    let members = ctx
        .retry
        .run("extract_namespace_members", || {
            ctx.forge.fetch_namespace_members(&repository.namespace_name)
        })
        .await?;
    for member in members {
        let row = ctx
            .store
            .upsert_member(
                &member.external_id,
                &member.username,
                member.display_name.as_deref(),
            )
            .await?;
        ctx.store
            .link_repository_member(repository.id, row.id)
            .await?;
    }
    Ok(())
}

/// Fetch the deployment list; returns external ids for the per-deployment
/// status fan-out
pub async fn extract_deployments(
    ctx: &ActivityContext,
    repository_id: i64,
) -> Result<Vec<String>> {
    let deployments = ctx
        .retry
        .run("extract_deployments", || {
            ctx.forge.fetch_deployments(&ctx.repo_path)
        })
        .await?;

    let mut ids = Vec::with_capacity(deployments.len());
    for deployment in deployments {
        ctx.store
            .upsert_deployment(&NewDeployment {
                external_id: deployment.external_id.clone(),
                repository_id,
                sha_id: deployment.sha_id.clone(),
                status: deployment.status.clone(),
                deployed_at: deployment.deployed_at,
            })
            .await?;
        ids.push(deployment.external_id);
    }
    Ok(ids)
}

pub async fn extract_deployment_status(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    let status = ctx
        .retry
        .run("extract_deployment_status", || {
            ctx.forge
                .fetch_deployment_status(&ctx.repo_path, external_id)
        })
        .await?;
    ctx.store
        .update_deployment_status(repository_id, external_id, &status.to_string())
        .await?;
    Ok(())
}

/// Forge extra: default-branch commit history into ancestry edges
pub async fn extract_commit_history(
    ctx: &ActivityContext,
    repository: &Repository,
    default_branch: &str,
) -> Result<()> {
    let commits = ctx
        .retry
        .run("extract_commit_history", || {
            ctx.forge
                .fetch_commit_history(&ctx.repo_path, default_branch, ctx.period.from)
        })
        .await?;
    for commit in commits {
        for parent in &commit.parents {
            ctx.store
                .insert_commit_edge(repository.id, &commit.sha, parent)
                .await?;
        }
    }
    Ok(())
}

/// Forge extra: workflow-run-derived deployments; returns external ids
/// for the per-item status fan-out
pub async fn extract_run_deployments(
    ctx: &ActivityContext,
    repository_id: i64,
) -> Result<Vec<String>> {
    let runs = ctx
        .retry
        .run("extract_run_deployments", || {
            ctx.forge.fetch_run_deployments(&ctx.repo_path, ctx.period.from)
        })
        .await?;

    let mut ids = Vec::with_capacity(runs.len());
    for run in runs {
        ctx.store
            .upsert_deployment(&NewDeployment {
                external_id: run.external_id.clone(),
                repository_id,
                sha_id: run.sha_id.clone(),
                status: run.status.clone(),
                deployed_at: run.deployed_at,
            })
            .await?;
        ids.push(run.external_id);
    }
    Ok(ids)
}

/// Run the correlator over bulk-fetched rows for one repository window
pub async fn get_merge_request_deployment_pairs(
    store: &TenantStore,
    repository_id: i64,
    period: &TimePeriod,
) -> Result<Vec<MergeRequestDeploymentPair>> {
    let edges = store.commit_edges(repository_id).await?;
    let deployments = store.successful_deployments(repository_id).await?;
    let merge_requests = store
        .merge_requests_updated_in(repository_id, period)
        .await?;

    let dag = CommitDag::from_edges(&edges);
    Ok(correlate(&dag, &deployments, &merge_requests, period))
}

/// Compute and upsert derived metrics for one merge request. Idempotent by
/// merge-request id, so reprocessing across overlapping windows is safe.
pub async fn transform_merge_request(
    store: &TenantStore,
    merge_request: &MergeRequest,
    pair: &MergeRequestDeploymentPair,
) -> Result<()> {
    let cycle_time_secs = merge_request
        .merged_at
        .map(|merged| (merged - merge_request.created_at).num_seconds());

    // Review runs from the first note to the merge; with no usable note the
    // whole cycle counts as review.
    let first_note = store.first_note_at(merge_request.id).await?;
    let review_time_secs = merge_request.merged_at.map(|merged| {
        let anchor = first_note
            .filter(|first| *first <= merged)
            .unwrap_or(merge_request.created_at);
        (merged - anchor).num_seconds()
    });

    // Lead time runs to the deployment when one shipped this merge request
    let lead_time_secs = match (pair.deployment_id, merge_request.merged_at) {
        (Some(_), Some(merged)) => {
            let deployed_at = store
                .successful_deployments(merge_request.repository_id)
                .await?
                .into_iter()
                .find(|d| Some(d.id) == pair.deployment_id)
                .map(|d| d.deployed_at);
            deployed_at.map(|at| (at - merged).num_seconds())
        }
        _ => None,
    };

    store
        .upsert_metrics(&MergeRequestMetrics {
            merge_request_id: merge_request.id,
            deployment_id: pair.deployment_id,
            cycle_time_secs,
            review_time_secs,
            lead_time_secs,
            computed_at: Utc::now(),
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewMergeRequest, NewRepository};
    use chrono::TimeZone;

    fn ts(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn seed_mr(
        store: &TenantStore,
        merged_at: Option<chrono::DateTime<Utc>>,
    ) -> MergeRequest {
        let repo = store
            .upsert_repository(&NewRepository {
                external_id: "1001".into(),
                name: "api".into(),
                namespace_id: 7,
                namespace_name: "acme".into(),
                forge_type: "github".into(),
            })
            .await
            .unwrap();
        store
            .upsert_merge_request(&NewMergeRequest {
                external_id: "42".into(),
                repository_id: repo.id,
                sha_id: "c1".into(),
                state: if merged_at.is_some() { "merged" } else { "open" }.into(),
                created_at: ts(1_000),
                updated_at: ts(1_500),
                merged_at,
                closed_at: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn review_time_falls_back_to_creation_without_a_usable_note() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TenantStore::open_path(&tmp.path().join("t.db")).await.unwrap();
        let mr = seed_mr(&store, Some(ts(1_500))).await;

        // only note lands after the merge
        store
            .upsert_merge_request_note(mr.id, "n1", "reviewer", ts(1_700))
            .await
            .unwrap();

        let pair = MergeRequestDeploymentPair {
            merge_request_id: mr.id,
            deployment_id: None,
        };
        transform_merge_request(&store, &mr, &pair).await.unwrap();

        let row = store.get_metrics(mr.id).await.unwrap().unwrap();
        assert_eq!(row.cycle_time_secs, Some(500));
        // the post-merge note is ignored; review spans the whole cycle
        assert_eq!(row.review_time_secs, Some(500));
        assert_eq!(row.lead_time_secs, None);
    }

    #[tokio::test]
    async fn unmerged_request_gets_no_durations() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TenantStore::open_path(&tmp.path().join("t.db")).await.unwrap();
        let mr = seed_mr(&store, None).await;

        let pair = MergeRequestDeploymentPair {
            merge_request_id: mr.id,
            deployment_id: None,
        };
        transform_merge_request(&store, &mr, &pair).await.unwrap();

        let row = store.get_metrics(mr.id).await.unwrap().unwrap();
        assert_eq!(row.cycle_time_secs, None);
        assert_eq!(row.review_time_secs, None);
        assert_eq!(row.lead_time_secs, None);
    }
}
