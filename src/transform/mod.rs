//! Transform orchestration
//!
//! Mirrors the extraction fan-out: tenants, then repositories, then one
//! metrics computation per correlated merge-request/deployment pair. The
//! correlator runs once per repository over bulk-fetched rows; only the
//! per-pair metric writes fan out.

use crate::activities;
use crate::config::Config;
use crate::error::Result;
use crate::models::{Repository, TimePeriod};
use crate::store::{ControlDb, TenantStore};
use crate::workflow::{Dispatcher, WorkflowId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Counts reported back to the CLI after one transform run
#[derive(Debug, Default, Clone, Serialize)]
pub struct TransformSummary {
    pub tenants: usize,
    pub repositories: usize,
    pub metrics: usize,
    pub failures: usize,
}

/// Top of the transform fan-out: correlate and compute metrics for every
/// repository of every tenant in scope
pub async fn transform_tenants(
    config: &Config,
    control: &ControlDb,
    dispatcher: &Dispatcher,
    tenant_filter: Option<&str>,
    period: TimePeriod,
) -> Result<TransformSummary> {
    let id = WorkflowId::transform_tenants(tenant_filter, &period);
    if !dispatcher.admit(&id) {
        return Ok(TransformSummary::default());
    }

    let tenants = activities::get_tenants(control, tenant_filter).await?;
    let mut summary = TransformSummary::default();

    for tenant in tenants {
        summary.tenants += 1;

        // One tenant's broken store must not abort the siblings
        let store = match TenantStore::open(config, &tenant).await {
            Ok(store) => store,
            Err(e) => {
                warn!(tenant = %tenant.id, "Tenant store unavailable: {}", e);
                summary.failures += 1;
                continue;
            }
        };
        let repositories = match activities::get_repositories_for_tenant(&store).await {
            Ok(repositories) => repositories,
            Err(e) => {
                warn!(tenant = %tenant.id, "Repository listing failed: {}", e);
                summary.failures += 1;
                continue;
            }
        };
        info!(
            tenant = %tenant.id,
            repositories = repositories.len(),
            "Starting tenant transform"
        );

        for repository in repositories {
            let id = WorkflowId::transform_repository(&tenant.id, repository.id, &period);
            if !dispatcher.admit(&id) {
                continue;
            }
            match transform_repository(
                &store,
                dispatcher,
                &repository,
                &period,
                config.crawl.fanout_limit,
            )
            .await
            {
                Ok((metrics, failures)) => {
                    summary.repositories += 1;
                    summary.metrics += metrics;
                    summary.failures += failures;
                }
                Err(e) => {
                    warn!(
                        tenant = %tenant.id,
                        repository = %repository.name,
                        "Repository transform failed: {}", e
                    );
                    summary.failures += 1;
                }
            }
        }
    }

    Ok(summary)
}

/// One repository's transform: correlate the window, then compute metrics
/// per pair concurrently. Returns `(metrics, failures)`.
pub async fn transform_repository(
    store: &TenantStore,
    dispatcher: &Dispatcher,
    repository: &Repository,
    period: &TimePeriod,
    fanout_limit: usize,
) -> Result<(usize, usize)> {
    let pairs =
        activities::get_merge_request_deployment_pairs(store, repository.id, period).await?;

    // The correlator consumed exactly this row set; every pair resolves here
    let by_id: HashMap<i64, _> = store
        .merge_requests_updated_in(repository.id, period)
        .await?
        .into_iter()
        .map(|mr| (mr.id, mr))
        .collect();

    let semaphore = Arc::new(Semaphore::new(fanout_limit));
    let mut tasks: JoinSet<bool> = JoinSet::new();

    for pair in pairs {
        let id = WorkflowId::transform_merge_request(repository.id, pair.merge_request_id);
        if !dispatcher.admit(&id) {
            continue;
        }
        let Some(merge_request) = by_id.get(&pair.merge_request_id).cloned() else {
            continue;
        };

        let store = store.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            match activities::transform_merge_request(&store, &merge_request, &pair).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        merge_request = merge_request.id,
                        "Metric computation failed: {}", e
                    );
                    false
                }
            }
        });
    }

    let mut metrics = 0;
    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => metrics += 1,
            _ => failures += 1,
        }
    }

    info!(
        repository = %repository.name,
        metrics, failures, "Repository transform complete"
    );
    Ok((metrics, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tenant;
    use crate::store::{NewDeployment, NewMergeRequest, NewRepository};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn seed(
        store: &TenantStore,
    ) -> (Repository, crate::models::MergeRequest) {
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

        // merged MR whose head commit got deployed inside the window
        let mr = store
            .upsert_merge_request(&NewMergeRequest {
                external_id: "42".into(),
                repository_id: repo.id,
                sha_id: "c2".into(),
                state: "merged".into(),
                created_at: ts(1_000),
                updated_at: ts(1_500),
                merged_at: Some(ts(1_500)),
                closed_at: None,
            })
            .await
            .unwrap();
        store.insert_commit_edge(repo.id, "c2", "c1").await.unwrap();
        store.insert_commit_edge(repo.id, "c3", "c2").await.unwrap();
        store
            .upsert_deployment(&NewDeployment {
                external_id: "d1".into(),
                repository_id: repo.id,
                sha_id: "c3".into(),
                status: "success".into(),
                deployed_at: ts(1_800),
            })
            .await
            .unwrap();
        (repo, mr)
    }

    #[tokio::test]
    async fn transform_computes_and_upserts_metrics() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TenantStore::open_path(&tmp.path().join("t.db")).await.unwrap();
        let (repo, mr) = seed(&store).await;

        store
            .upsert_merge_request_note(mr.id, "n1", "reviewer", ts(1_200))
            .await
            .unwrap();

        let period = TimePeriod::new(ts(1_000), ts(2_000)).unwrap();
        let dispatcher = Dispatcher::new();
        let (metrics, failures) =
            transform_repository(&store, &dispatcher, &repo, &period, 4)
                .await
                .unwrap();

        assert_eq!(metrics, 1);
        assert_eq!(failures, 0);

        let row = store.get_metrics(mr.id).await.unwrap().unwrap();
        assert_eq!(row.cycle_time_secs, Some(500));
        assert_eq!(row.review_time_secs, Some(300));
        assert_eq!(row.lead_time_secs, Some(300));
        assert!(row.deployment_id.is_some());
    }

    #[tokio::test]
    async fn rerun_is_suppressed_by_the_dispatcher() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TenantStore::open_path(&tmp.path().join("t.db")).await.unwrap();
        let (repo, _mr) = seed(&store).await;

        let period = TimePeriod::new(ts(1_000), ts(2_000)).unwrap();
        let dispatcher = Dispatcher::new();

        let (first, _) = transform_repository(&store, &dispatcher, &repo, &period, 4)
            .await
            .unwrap();
        let (second, _) = transform_repository(&store, &dispatcher, &repo, &period, 4)
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn broken_tenant_store_does_not_block_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_base_dir(Some(tmp.path().to_path_buf()));
        let control = ControlDb::open(&config.paths.control_db_file).await.unwrap();

        control
            .upsert_tenant(&Tenant {
                id: "a-bad".into(),
                name: "Bad".into(),
                db_locator: "/dev/null/nope.db".into(),
                crawl_user_id: Some("bot".into()),
            })
            .await
            .unwrap();
        control
            .upsert_tenant(&Tenant {
                id: "b-good".into(),
                name: "Good".into(),
                db_locator: "good.db".into(),
                crawl_user_id: Some("bot".into()),
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new();
        let period = TimePeriod::new(ts(1_000), ts(2_000)).unwrap();
        let summary = transform_tenants(&config, &control, &dispatcher, None, period)
            .await
            .unwrap();

        assert_eq!(summary.tenants, 2);
        assert_eq!(summary.failures, 1);
        assert!(config.paths.tenant_db_dir.join("good.db").exists());
    }

    #[tokio::test]
    async fn duplicate_run_submission_is_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_base_dir(Some(tmp.path().to_path_buf()));
        let control = ControlDb::open(&config.paths.control_db_file).await.unwrap();

        let dispatcher = Dispatcher::new();
        let period = TimePeriod::new(ts(1_000), ts(2_000)).unwrap();

        transform_tenants(&config, &control, &dispatcher, None, period)
            .await
            .unwrap();
        transform_tenants(&config, &control, &dispatcher, None, period)
            .await
            .unwrap();

        assert_eq!(dispatcher.admitted_count(), 1);
    }

    #[tokio::test]
    async fn unmerged_window_mr_gets_a_row_without_durations() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TenantStore::open_path(&tmp.path().join("t.db")).await.unwrap();
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
        let mr = store
            .upsert_merge_request(&NewMergeRequest {
                external_id: "7".into(),
                repository_id: repo.id,
                sha_id: "cX".into(),
                state: "open".into(),
                created_at: ts(1_100),
                updated_at: ts(1_400),
                merged_at: None,
                closed_at: None,
            })
            .await
            .unwrap();

        let period = TimePeriod::new(ts(1_000), ts(2_000)).unwrap();
        let dispatcher = Dispatcher::new();
        let (metrics, failures) =
            transform_repository(&store, &dispatcher, &repo, &period, 4)
                .await
                .unwrap();

        assert_eq!(metrics, 1);
        assert_eq!(failures, 0);
        let row = store.get_metrics(mr.id).await.unwrap().unwrap();
        assert_eq!(row.deployment_id, None);
        assert_eq!(row.cycle_time_secs, None);
        assert_eq!(row.lead_time_secs, None);
    }
}
