//! Typed persistence over SQLite
//!
//! Two database shapes:
//! - the control database holding the tenant registry
//! - one isolated database per tenant holding repositories, merge requests,
//!   commit ancestry edges, deployments, members, crawl events and derived
//!   metrics
//!
//! Every write is an idempotent upsert keyed by the row's natural unique
//! key, which is the only serialization point the concurrent fan-out relies
//! on.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::Result;
use crate::models::{
    CommitEdge, CrawlEvent, CrawlEventDetail, Deployment, Member, MergeRequest,
    MergeRequestMetrics, Repository, Tenant, TimePeriod,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    debug!("Connecting to SQLite database at {:?}", db_path);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Control database handle (tenant registry)
#[derive(Clone)]
pub struct ControlDb {
    pool: SqlitePool,
}

impl ControlDb {
    /// Connect to the control database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.control_db_file).await
    }

    /// Open a control database at a specific path
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = open_pool(db_path).await?;
        sqlx::raw_sql(CONTROL_SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(tenants)
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tenant)
    }

    /// Register or refresh a tenant row. Provisioning is out-of-band in
    /// production; this exists for operators and tests.
    pub async fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO tenants (id, name, db_locator, crawl_user_id)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 db_locator = excluded.db_locator,
                 crawl_user_id = excluded.crawl_user_id"#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.db_locator)
        .bind(&tenant.crawl_user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// New repository fields prior to first persistence
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub external_id: String,
    pub name: String,
    pub namespace_id: i64,
    pub namespace_name: String,
    pub forge_type: String,
}

/// New merge request fields prior to persistence
#[derive(Debug, Clone)]
pub struct NewMergeRequest {
    pub external_id: String,
    pub repository_id: i64,
    pub sha_id: String,
    pub state: String,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub merged_at: Option<chrono::DateTime<Utc>>,
    pub closed_at: Option<chrono::DateTime<Utc>>,
}

/// New deployment fields prior to persistence
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub external_id: String,
    pub repository_id: i64,
    pub sha_id: String,
    pub status: String,
    pub deployed_at: chrono::DateTime<Utc>,
}

/// One tenant's isolated database handle
#[derive(Clone)]
pub struct TenantStore {
    pool: SqlitePool,
}

impl TenantStore {
    /// Open the store for a tenant, resolving its locator against the
    /// configured tenant database directory when relative
    pub async fn open(config: &Config, tenant: &Tenant) -> Result<Self> {
        let locator = PathBuf::from(&tenant.db_locator);
        let db_path = if locator.is_absolute() {
            locator
        } else {
            config.paths.tenant_db_dir.join(locator)
        };
        Self::open_path(&db_path).await
    }

    /// Open a tenant store at a specific path
    pub async fn open_path(db_path: &Path) -> Result<Self> {
        let pool = open_pool(db_path).await?;
        sqlx::raw_sql(TENANT_SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    // --- repositories ---

    pub async fn upsert_repository(&self, repo: &NewRepository) -> Result<Repository> {
        let row = sqlx::query_as::<_, Repository>(
            r#"INSERT INTO repositories (external_id, name, namespace_id, namespace_name, forge_type)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(external_id) DO UPDATE SET
                 name = excluded.name,
                 namespace_id = excluded.namespace_id,
                 namespace_name = excluded.namespace_name
               RETURNING *"#,
        )
        .bind(&repo.external_id)
        .bind(&repo.name)
        .bind(repo.namespace_id)
        .bind(&repo.namespace_name)
        .bind(&repo.forge_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let row = sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // --- merge requests ---

    pub async fn upsert_merge_request(&self, mr: &NewMergeRequest) -> Result<MergeRequest> {
        let row = sqlx::query_as::<_, MergeRequest>(
            r#"INSERT INTO merge_requests
                 (external_id, repository_id, sha_id, state, created_at, updated_at, merged_at, closed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(repository_id, external_id) DO UPDATE SET
                 sha_id = excluded.sha_id,
                 state = excluded.state,
                 updated_at = excluded.updated_at,
                 merged_at = excluded.merged_at,
                 closed_at = excluded.closed_at
               RETURNING *"#,
        )
        .bind(&mr.external_id)
        .bind(mr.repository_id)
        .bind(&mr.sha_id)
        .bind(&mr.state)
        .bind(mr.created_at)
        .bind(mr.updated_at)
        .bind(mr.merged_at)
        .bind(mr.closed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_merge_request(
        &self,
        repository_id: i64,
        external_id: &str,
    ) -> Result<Option<MergeRequest>> {
        let row = sqlx::query_as::<_, MergeRequest>(
            "SELECT * FROM merge_requests WHERE repository_id = ? AND external_id = ?",
        )
        .bind(repository_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Merge requests touched inside the window, the transform input set
    pub async fn merge_requests_updated_in(
        &self,
        repository_id: i64,
        period: &TimePeriod,
    ) -> Result<Vec<MergeRequest>> {
        let rows = sqlx::query_as::<_, MergeRequest>(
            r#"SELECT * FROM merge_requests
               WHERE repository_id = ? AND updated_at >= ? AND updated_at <= ?
               ORDER BY id"#,
        )
        .bind(repository_id)
        .bind(period.from)
        .bind(period.to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_merge_request_diff(
        &self,
        merge_request_id: i64,
        file_path: &str,
        additions: i64,
        deletions: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO merge_request_diffs (merge_request_id, file_path, additions, deletions)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(merge_request_id, file_path) DO UPDATE SET
                 additions = excluded.additions,
                 deletions = excluded.deletions"#,
        )
        .bind(merge_request_id)
        .bind(file_path)
        .bind(additions)
        .bind(deletions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_merge_request_note(
        &self,
        merge_request_id: i64,
        external_id: &str,
        author: &str,
        created_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO merge_request_notes (merge_request_id, external_id, author, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(merge_request_id, external_id) DO UPDATE SET
                 author = excluded.author,
                 created_at = excluded.created_at"#,
        )
        .bind(merge_request_id)
        .bind(external_id)
        .bind(author)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Earliest note timestamp for one merge request, the review-time anchor
    pub async fn first_note_at(
        &self,
        merge_request_id: i64,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        let row: (Option<chrono::DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MIN(created_at) FROM merge_request_notes WHERE merge_request_id = ?",
        )
        .bind(merge_request_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn upsert_timeline_event(
        &self,
        merge_request_id: i64,
        kind: &str,
        actor: Option<&str>,
        created_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT OR IGNORE INTO merge_request_timeline (merge_request_id, kind, actor, created_at)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(merge_request_id)
        .bind(kind)
        .bind(actor)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_merge_request_actors(
        &self,
        merge_request_id: i64,
        merged_by: Option<&str>,
        closed_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE merge_requests SET merged_by = ?, closed_by = ? WHERE id = ?")
            .bind(merged_by)
            .bind(closed_by)
            .bind(merge_request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- commit ancestry ---

    pub async fn insert_commit_edge(
        &self,
        repository_id: i64,
        sha_id: &str,
        parent_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT OR IGNORE INTO commit_edges (repository_id, sha_id, parent_id)
               VALUES (?, ?, ?)"#,
        )
        .bind(repository_id)
        .bind(sha_id)
        .bind(parent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All ancestry edges for one repository, bulk-fetched for the in-process
    /// graph walk
    pub async fn commit_edges(&self, repository_id: i64) -> Result<Vec<CommitEdge>> {
        let rows = sqlx::query_as::<_, CommitEdge>(
            "SELECT sha_id, parent_id FROM commit_edges WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- deployments ---

    pub async fn upsert_deployment(&self, deployment: &NewDeployment) -> Result<Deployment> {
        let row = sqlx::query_as::<_, Deployment>(
            r#"INSERT INTO deployments (external_id, repository_id, sha_id, status, deployed_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(repository_id, external_id) DO UPDATE SET
                 sha_id = excluded.sha_id,
                 status = excluded.status,
                 deployed_at = excluded.deployed_at
               RETURNING *"#,
        )
        .bind(&deployment.external_id)
        .bind(deployment.repository_id)
        .bind(&deployment.sha_id)
        .bind(&deployment.status)
        .bind(deployment.deployed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn update_deployment_status(
        &self,
        repository_id: i64,
        external_id: &str,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET status = ? WHERE repository_id = ? AND external_id = ?",
        )
        .bind(status)
        .bind(repository_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All successful deployments for one repository, ordered by time
    pub async fn successful_deployments(&self, repository_id: i64) -> Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, Deployment>(
            r#"SELECT * FROM deployments
               WHERE repository_id = ? AND status = 'success'
               ORDER BY deployed_at"#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- members ---

    pub async fn upsert_member(
        &self,
        external_id: &str,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<Member> {
        let row = sqlx::query_as::<_, Member>(
            r#"INSERT INTO members (external_id, username, display_name)
               VALUES (?, ?, ?)
               ON CONFLICT(external_id) DO UPDATE SET
                 username = excluded.username,
                 display_name = excluded.display_name
               RETURNING *"#,
        )
        .bind(external_id)
        .bind(username)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn link_repository_member(&self, repository_id: i64, member_id: i64) -> Result<()> {
        sqlx::query(
            r#"INSERT OR IGNORE INTO repository_members (repository_id, member_id)
               VALUES (?, ?)"#,
        )
        .bind(repository_id)
        .bind(member_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- crawl events ---

    pub async fn append_crawl_event(
        &self,
        crawl_id: &str,
        namespace: &str,
        detail: CrawlEventDetail,
        data: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO crawl_events (crawl_id, namespace, detail, data, timestamp)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(crawl_id)
        .bind(namespace)
        .bind(detail.to_string())
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn crawl_events(&self, crawl_id: &str) -> Result<Vec<CrawlEvent>> {
        let rows = sqlx::query_as::<_, CrawlEvent>(
            "SELECT * FROM crawl_events WHERE crawl_id = ? ORDER BY timestamp",
        )
        .bind(crawl_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- derived metrics ---

    pub async fn upsert_metrics(&self, metrics: &MergeRequestMetrics) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO merge_request_metrics
                 (merge_request_id, deployment_id, cycle_time_secs, review_time_secs, lead_time_secs, computed_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(merge_request_id) DO UPDATE SET
                 deployment_id = excluded.deployment_id,
                 cycle_time_secs = excluded.cycle_time_secs,
                 review_time_secs = excluded.review_time_secs,
                 lead_time_secs = excluded.lead_time_secs,
                 computed_at = excluded.computed_at"#,
        )
        .bind(metrics.merge_request_id)
        .bind(metrics.deployment_id)
        .bind(metrics.cycle_time_secs)
        .bind(metrics.review_time_secs)
        .bind(metrics.lead_time_secs)
        .bind(metrics.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metrics(
        &self,
        merge_request_id: i64,
    ) -> Result<Option<MergeRequestMetrics>> {
        let row = sqlx::query_as::<_, MergeRequestMetrics>(
            "SELECT * FROM merge_request_metrics WHERE merge_request_id = ?",
        )
        .bind(merge_request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
