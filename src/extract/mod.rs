//! Extraction orchestration
//!
//! Fan-out tree: tenants, then repositories per tenant, then independent
//! branches per repository (merge requests, members, deployments, forge
//! extras), then one pipeline per merge request. Every spawn passes the
//! dispatcher so duplicate submissions collide instead of re-crawling, and
//! every unit failure is recorded in the crawl ledger and swallowed at the
//! fan-out level so sibling units keep going.

use crate::activities::{self, ActivityContext};
use crate::config::Config;
use crate::error::Result;
use crate::forge::{build_client, Capability};
use crate::ledger::CrawlLedger;
use crate::models::{Repository, TimePeriod};
use crate::store::{ControlDb, TenantStore};
use crate::workflow::{Dispatcher, RetryPolicy, WorkflowId};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Counts reported back to the CLI after one extraction run
#[derive(Debug, Default, Clone, Serialize)]
pub struct ExtractSummary {
    pub tenants: usize,
    pub repositories: usize,
    pub merge_requests: usize,
    pub failures: usize,
}

/// Outcome of one repository extraction workflow
#[derive(Debug, Default)]
pub struct RepositoryOutcome {
    pub merge_requests: usize,
    pub failures: usize,
}

/// Top of the fan-out tree: resolve tenants, then crawl every registered
/// repository of each tenant. Tenants without a crawl credential are
/// skipped, not failed.
pub async fn extract_tenants(
    config: &Config,
    control: &ControlDb,
    dispatcher: &Dispatcher,
    tenant_filter: Option<&str>,
    period: TimePeriod,
) -> Result<ExtractSummary> {
    let id = WorkflowId::extract_tenants(tenant_filter, &period);
    if !dispatcher.admit(&id) {
        return Ok(ExtractSummary::default());
    }

    let tenants = activities::get_tenants(control, tenant_filter).await?;
    let mut summary = ExtractSummary::default();

    for tenant in tenants {
        if tenant.crawl_user_id.is_none() {
            warn!(tenant = %tenant.id, "Tenant has no crawl credential, skipping");
            continue;
        }
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
            "Starting tenant extraction"
        );

        let semaphore = Arc::new(Semaphore::new(config.crawl.fanout_limit));
        let mut tasks: JoinSet<RepositoryOutcome> = JoinSet::new();

        for repository in repositories {
            let id = WorkflowId::extract_repository(&tenant.id, repository.id, &period);
            if !dispatcher.admit(&id) {
                continue;
            }

            let forge = match repository.forge().and_then(|f| build_client(config, f)) {
                Ok(client) => client,
                Err(e) => {
                    warn!(
                        tenant = %tenant.id,
                        repository = %repository.name,
                        "No usable forge client: {}", e
                    );
                    summary.failures += 1;
                    continue;
                }
            };

            let ctx = ActivityContext {
                tenant: tenant.clone(),
                store: store.clone(),
                forge,
                retry: RetryPolicy::from(&config.retry),
                period,
                repo_path: format!("{}/{}", repository.namespace_name, repository.name),
            };
            let dispatcher = dispatcher.clone();
            let crawl = config.crawl.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match extract_repository(&ctx, &dispatcher, crawl.per_page, crawl.max_pages, crawl.fanout_limit).await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Metadata failure: nothing downstream ran, no ledger exists
                        warn!(
                            tenant = %ctx.tenant.id,
                            repository = %ctx.repo_path,
                            "Repository extraction failed: {}", e
                        );
                        RepositoryOutcome {
                            failures: 1,
                            ..Default::default()
                        }
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok(outcome) = joined {
                summary.repositories += 1;
                summary.merge_requests += outcome.merge_requests;
                summary.failures += outcome.failures;
            }
        }
    }

    Ok(summary)
}

/// One repository's extraction workflow.
///
/// Repository metadata must land first; it establishes the crawl instance.
/// The four branches after it are independent and run concurrently, each
/// containing its own failures.
pub async fn extract_repository(
    ctx: &ActivityContext,
    dispatcher: &Dispatcher,
    per_page: u32,
    max_pages: u32,
    fanout_limit: usize,
) -> Result<RepositoryOutcome> {
    let extract = activities::extract_repository(ctx).await?;
    let repository = extract.repository;
    let ledger = extract.ledger;

    let (mr_outcome, member_failures, deployment_failures, extra_failures) = tokio::join!(
        merge_request_branch(ctx, dispatcher, &repository, &ledger, per_page, max_pages, fanout_limit),
        member_branch(ctx, &repository, &ledger),
        deployment_branch(ctx, &repository, &ledger),
        extras_branch(ctx, &repository, &extract.default_branch, &ledger),
    );

    let outcome = RepositoryOutcome {
        merge_requests: mr_outcome.merge_requests,
        failures: mr_outcome.failures + member_failures + deployment_failures + extra_failures,
    };

    let _ = ledger
        .complete(
            "repository",
            Some(json!({
                "merge_requests": outcome.merge_requests,
                "failures": outcome.failures,
            })),
        )
        .await;

    info!(
        repository = %ctx.repo_path,
        merge_requests = outcome.merge_requests,
        failures = outcome.failures,
        "Repository extraction complete"
    );
    Ok(outcome)
}

/// Walk merge-request pages newest-first until the platform runs out or an
/// item crosses the window watermark, spawning one pipeline per previously
/// unseen merge request.
async fn merge_request_branch(
    ctx: &ActivityContext,
    dispatcher: &Dispatcher,
    repository: &Repository,
    ledger: &CrawlLedger,
    per_page: u32,
    max_pages: u32,
    fanout_limit: usize,
) -> RepositoryOutcome {
    let mut outcome = RepositoryOutcome::default();
    let mut seen: HashSet<String> = HashSet::new();
    let semaphore = Arc::new(Semaphore::new(fanout_limit));
    let mut tasks: JoinSet<bool> = JoinSet::new();

    let mut page = 1u32;
    loop {
        let (ids, fetched) =
            match activities::extract_merge_requests(ctx, repository, page, per_page).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        repository = %ctx.repo_path,
                        page,
                        "Merge request page failed: {}", e
                    );
                    let _ = ledger.failed("merge_requests", &e, Some(page)).await;
                    outcome.failures += 1;
                    break;
                }
            };

        for external_id in ids {
            // Overlapping pages under concurrent updates: first sighting wins
            if !seen.insert(external_id.clone()) {
                continue;
            }
            let id = WorkflowId::extract_merge_request(repository.id, &external_id);
            if !dispatcher.admit(&id) {
                continue;
            }

            let ctx = ctx.clone();
            let ledger = ledger.clone();
            let semaphore = semaphore.clone();
            let repository_id = repository.id;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match merge_request_pipeline(&ctx, repository_id, &external_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            repository = %ctx.repo_path,
                            merge_request = %external_id,
                            "Merge request pipeline failed: {}", e
                        );
                        let _ = ledger.failed("merge_request", &e, None).await;
                        false
                    }
                }
            });
        }

        if !fetched.has_more || fetched.reached_watermark {
            break;
        }
        page += 1;
        if page > max_pages {
            warn!(
                repository = %ctx.repo_path,
                max_pages, "Page cap reached before watermark"
            );
            break;
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => outcome.merge_requests += 1,
            Ok(false) => outcome.failures += 1,
            Err(_) => outcome.failures += 1,
        }
    }
    outcome
}

/// Ordered per-merge-request pipeline. Later steps read rows earlier steps
/// wrote, so a failure aborts the remainder for this unit only.
async fn merge_request_pipeline(
    ctx: &ActivityContext,
    repository_id: i64,
    external_id: &str,
) -> Result<()> {
    activities::extract_merge_request_diffs(ctx, repository_id, external_id).await?;
    activities::extract_merge_request_commits(ctx, repository_id, external_id).await?;
    activities::extract_merge_request_notes(ctx, repository_id, external_id).await?;
    if ctx.supports(Capability::TimelineEvents) {
        activities::extract_timeline_events(ctx, repository_id, external_id).await?;
    }
    if ctx.supports(Capability::MergeRequestActors) {
        activities::extract_merge_request_actors(ctx, repository_id, external_id).await?;
    }
    Ok(())
}

async fn member_branch(
    ctx: &ActivityContext,
    repository: &Repository,
    ledger: &CrawlLedger,
) -> usize {
    let mut failures = 0;

    match activities::extract_members(ctx, repository.id).await {
        Ok(usernames) => {
            for username in usernames {
                if let Err(e) = activities::extract_member_info(ctx, &username).await {
                    warn!(member = %username, "Member detail failed: {}", e);
                    let _ = ledger.failed("member", &e, None).await;
                    failures += 1;
                }
            }
        }
        Err(e) => {
            warn!(repository = %ctx.repo_path, "Member list failed: {}", e);
            let _ = ledger.failed("members", &e, None).await;
            failures += 1;
        }
    }

    if let Err(e) = activities::extract_namespace_members(ctx, repository).await {
        warn!(namespace = %repository.namespace_name, "Namespace members failed: {}", e);
        let _ = ledger.failed("namespace_members", &e, None).await;
        failures += 1;
    }
    failures
}

async fn deployment_branch(
    ctx: &ActivityContext,
    repository: &Repository,
    ledger: &CrawlLedger,
) -> usize {
    let mut failures = 0;

    match activities::extract_deployments(ctx, repository.id).await {
        Ok(ids) => {
            for external_id in ids {
                if let Err(e) =
                    activities::extract_deployment_status(ctx, repository.id, &external_id).await
                {
                    warn!(deployment = %external_id, "Deployment status failed: {}", e);
                    let _ = ledger.failed("deployment", &e, None).await;
                    failures += 1;
                }
            }
        }
        Err(e) => {
            warn!(repository = %ctx.repo_path, "Deployment list failed: {}", e);
            let _ = ledger.failed("deployments", &e, None).await;
            failures += 1;
        }
    }
    failures
}

/// Capability-gated forge extras: default-branch ancestry backfill and
/// workflow-run-derived deployments
async fn extras_branch(
    ctx: &ActivityContext,
    repository: &Repository,
    default_branch: &str,
    ledger: &CrawlLedger,
) -> usize {
    let mut failures = 0;

    if ctx.supports(Capability::CommitHistory) {
        if let Err(e) = activities::extract_commit_history(ctx, repository, default_branch).await {
            warn!(repository = %ctx.repo_path, "Commit history failed: {}", e);
            let _ = ledger.failed("commit_history", &e, None).await;
            failures += 1;
        }
    }

    if ctx.supports(Capability::RunDeployments) {
        match activities::extract_run_deployments(ctx, repository.id).await {
            Ok(ids) => {
                for external_id in ids {
                    if let Err(e) =
                        activities::extract_deployment_status(ctx, repository.id, &external_id)
                            .await
                    {
                        warn!(deployment = %external_id, "Run deployment status failed: {}", e);
                        let _ = ledger.failed("run_deployment", &e, None).await;
                        failures += 1;
                    }
                }
            }
            Err(e) => {
                warn!(repository = %ctx.repo_path, "Run deployments failed: {}", e);
                let _ = ledger.failed("run_deployments", &e, None).await;
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::forge::{
        ForgeClient, ForgeCommit, ForgeDeployment, ForgeDiffStat, ForgeMember, ForgeMergeRequest,
        ForgeNote, ForgeRepository, ForgeTimelineEvent, MergeRequestActors, MergeRequestPage,
    };
    use crate::models::{DeploymentStatus, ForgeType, Tenant};
    use crate::store::TenantStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn mr(ext: &str, updated: i64) -> ForgeMergeRequest {
        ForgeMergeRequest {
            external_id: ext.to_string(),
            sha_id: format!("sha-{}", ext),
            state: "open".to_string(),
            created_at: ts(updated - 100),
            updated_at: ts(updated),
            merged_at: None,
            closed_at: None,
        }
    }

    /// Scripted forge for orchestrator tests
    struct FakeForge {
        pages: Mutex<Vec<MergeRequestPage>>,
        members_fail: bool,
        pipeline_calls: AtomicUsize,
    }

    impl FakeForge {
        fn with_pages(pages: Vec<MergeRequestPage>) -> Self {
            Self {
                pages: Mutex::new(pages),
                members_fail: false,
                pipeline_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ForgeClient for FakeForge {
        fn forge_type(&self) -> ForgeType {
            ForgeType::Github
        }

        fn supports(&self, _capability: Capability) -> bool {
            false
        }

        async fn fetch_repository(&self, _repo: &str) -> crate::error::Result<ForgeRepository> {
            Ok(ForgeRepository {
                external_id: "1001".into(),
                name: "api".into(),
                namespace_id: 7,
                namespace_name: "acme".into(),
                default_branch: "main".into(),
            })
        }

        async fn fetch_members(&self, _repo: &str) -> crate::error::Result<Vec<ForgeMember>> {
            if self.members_fail {
                return Err(Error::Transient("member service down".into()));
            }
            Ok(vec![])
        }

        async fn fetch_member(&self, username: &str) -> crate::error::Result<ForgeMember> {
            Ok(ForgeMember {
                external_id: format!("u-{}", username),
                username: username.to_string(),
                display_name: None,
            })
        }

        async fn fetch_namespace_members(
            &self,
            _namespace: &str,
        ) -> crate::error::Result<Vec<ForgeMember>> {
            Ok(vec![])
        }

        async fn fetch_merge_requests(
            &self,
            _repo: &str,
            page: u32,
            _per_page: u32,
            _updated_after: DateTime<Utc>,
        ) -> crate::error::Result<MergeRequestPage> {
            let pages = self.pages.lock().unwrap();
            Ok(pages
                .get((page - 1) as usize)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_merge_request_diffs(
            &self,
            _repo: &str,
            _mr: &str,
        ) -> crate::error::Result<Vec<ForgeDiffStat>> {
            self.pipeline_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn fetch_merge_request_commits(
            &self,
            _repo: &str,
            _mr: &str,
        ) -> crate::error::Result<Vec<ForgeCommit>> {
            Ok(vec![])
        }

        async fn fetch_merge_request_notes(
            &self,
            _repo: &str,
            _mr: &str,
        ) -> crate::error::Result<Vec<ForgeNote>> {
            Ok(vec![])
        }

        async fn fetch_timeline_events(
            &self,
            _repo: &str,
            _mr: &str,
        ) -> crate::error::Result<Vec<ForgeTimelineEvent>> {
            Err(Error::Unsupported("timeline".into()))
        }

        async fn fetch_merge_request_actors(
            &self,
            _repo: &str,
            _mr: &str,
        ) -> crate::error::Result<MergeRequestActors> {
            Err(Error::Unsupported("actors".into()))
        }

        async fn fetch_deployments(
            &self,
            _repo: &str,
        ) -> crate::error::Result<Vec<ForgeDeployment>> {
            Ok(vec![])
        }

        async fn fetch_deployment_status(
            &self,
            _repo: &str,
            _deployment: &str,
        ) -> crate::error::Result<DeploymentStatus> {
            Ok(DeploymentStatus::Success)
        }

        async fn fetch_commit_history(
            &self,
            _repo: &str,
            _branch: &str,
            _since: DateTime<Utc>,
        ) -> crate::error::Result<Vec<ForgeCommit>> {
            Ok(vec![])
        }

        async fn fetch_run_deployments(
            &self,
            _repo: &str,
            _since: DateTime<Utc>,
        ) -> crate::error::Result<Vec<ForgeDeployment>> {
            Ok(vec![])
        }
    }

    async fn test_ctx(forge: Arc<FakeForge>) -> (tempfile::TempDir, ActivityContext) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TenantStore::open_path(&tmp.path().join("t.db")).await.unwrap();
        let ctx = ActivityContext {
            tenant: Tenant {
                id: "acme".into(),
                name: "Acme".into(),
                db_locator: "t.db".into(),
                crawl_user_id: Some("bot".into()),
            },
            store,
            forge,
            retry: RetryPolicy {
                max_attempts: 1,
                ..Default::default()
            },
            period: TimePeriod::new(ts(1_000), ts(2_000)).unwrap(),
            repo_path: "acme/api".into(),
        };
        (tmp, ctx)
    }

    #[tokio::test]
    async fn pagination_stops_at_watermark_and_dedupes() {
        // page 2 repeats mr "2" and crosses the watermark; no page 3 fetch
        let forge = Arc::new(FakeForge::with_pages(vec![
            MergeRequestPage {
                items: vec![mr("1", 1_900), mr("2", 1_800)],
                has_more: true,
                reached_watermark: false,
            },
            MergeRequestPage {
                items: vec![mr("2", 1_800), mr("3", 1_500)],
                has_more: true,
                reached_watermark: true,
            },
        ]));
        let (_tmp, ctx) = test_ctx(forge.clone()).await;
        let dispatcher = Dispatcher::new();

        let outcome = extract_repository(&ctx, &dispatcher, 2, 10, 4).await.unwrap();

        assert_eq!(outcome.merge_requests, 3);
        assert_eq!(outcome.failures, 0);
        // one diff fetch per unique merge request
        assert_eq!(forge.pipeline_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn member_failure_does_not_stop_merge_requests() {
        let forge = Arc::new(FakeForge {
            pages: Mutex::new(vec![MergeRequestPage {
                items: vec![mr("1", 1_900)],
                has_more: false,
                reached_watermark: false,
            }]),
            members_fail: true,
            pipeline_calls: AtomicUsize::new(0),
        });
        let (_tmp, ctx) = test_ctx(forge.clone()).await;
        let dispatcher = Dispatcher::new();

        let outcome = extract_repository(&ctx, &dispatcher, 50, 10, 4).await.unwrap();

        assert_eq!(outcome.merge_requests, 1);
        assert_eq!(outcome.failures, 1);

        // failure left an audit event behind
        let repo = ctx.store.get_repository(1).await.unwrap().unwrap();
        assert_eq!(repo.external_id, "1001");
        let mr = ctx.store.get_merge_request(repo.id, "1").await.unwrap();
        assert!(mr.is_some());
    }

    #[tokio::test]
    async fn resubmitted_merge_request_is_not_recrawled() {
        let page = MergeRequestPage {
            items: vec![mr("1", 1_900)],
            has_more: false,
            reached_watermark: false,
        };
        let forge = Arc::new(FakeForge::with_pages(vec![page.clone(), page]));
        let (_tmp, ctx) = test_ctx(forge.clone()).await;
        let dispatcher = Dispatcher::new();

        let first = extract_repository(&ctx, &dispatcher, 50, 10, 4).await.unwrap();
        let second = extract_repository(&ctx, &dispatcher, 50, 10, 4).await.unwrap();

        assert_eq!(first.merge_requests, 1);
        assert_eq!(second.merge_requests, 0);
        assert_eq!(forge.pipeline_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_tenant_store_does_not_block_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_base_dir(Some(tmp.path().to_path_buf()));
        let control = ControlDb::open(&config.paths.control_db_file).await.unwrap();

        // locator under /dev/null cannot be created
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
        let summary = extract_tenants(&config, &control, &dispatcher, None, period)
            .await
            .unwrap();

        assert_eq!(summary.tenants, 2);
        assert_eq!(summary.failures, 1);
        // the healthy tenant's database was opened and initialized
        assert!(config.paths.tenant_db_dir.join("good.db").exists());
    }

    #[tokio::test]
    async fn duplicate_run_submission_is_suppressed() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_base_dir(Some(tmp.path().to_path_buf()));
        let control = ControlDb::open(&config.paths.control_db_file).await.unwrap();

        let dispatcher = Dispatcher::new();
        let period = TimePeriod::new(ts(1_000), ts(2_000)).unwrap();

        extract_tenants(&config, &control, &dispatcher, None, period)
            .await
            .unwrap();
        extract_tenants(&config, &control, &dispatcher, None, period)
            .await
            .unwrap();

        // the second submission collided on the run-level workflow id
        assert_eq!(dispatcher.admitted_count(), 1);
    }

    #[tokio::test]
    async fn page_cap_halts_runaway_pagination() {
        // platform always claims more pages
        let endless = MergeRequestPage {
            items: vec![mr("1", 1_900)],
            has_more: true,
            reached_watermark: false,
        };
        let forge = Arc::new(FakeForge::with_pages(vec![
            endless.clone(),
            endless.clone(),
            endless.clone(),
            endless,
        ]));
        let (_tmp, ctx) = test_ctx(forge.clone()).await;
        let dispatcher = Dispatcher::new();

        let outcome = extract_repository(&ctx, &dispatcher, 50, 2, 4).await.unwrap();
        assert_eq!(outcome.merge_requests, 1);
    }
}
