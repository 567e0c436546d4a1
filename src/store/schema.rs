//! SQLite schema definitions

/// SQL schema for the control database (tenant registry)
pub const CONTROL_SCHEMA_SQL: &str = r#"
-- Tenants: provisioned out-of-band, read-only to the crawler
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    db_locator TEXT NOT NULL,
    crawl_user_id TEXT
);
"#;

/// SQL schema for one tenant's isolated database
pub const TENANT_SCHEMA_SQL: &str = r#"
-- Repositories: identity immutable after first extraction
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    namespace_id INTEGER NOT NULL,
    namespace_name TEXT NOT NULL,
    forge_type TEXT NOT NULL
);

-- Merge requests: identity is (repository_id, external_id)
CREATE TABLE IF NOT EXISTS merge_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL,
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    sha_id TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    merged_at TEXT,
    closed_at TEXT,
    merged_by TEXT,
    closed_by TEXT,
    UNIQUE(repository_id, external_id)
);

-- Per-file diff stats for one merge request
CREATE TABLE IF NOT EXISTS merge_request_diffs (
    merge_request_id INTEGER NOT NULL REFERENCES merge_requests(id),
    file_path TEXT NOT NULL,
    additions INTEGER NOT NULL DEFAULT 0,
    deletions INTEGER NOT NULL DEFAULT 0,
    UNIQUE(merge_request_id, file_path)
);

-- Review notes / comments on one merge request
CREATE TABLE IF NOT EXISTS merge_request_notes (
    merge_request_id INTEGER NOT NULL REFERENCES merge_requests(id),
    external_id TEXT NOT NULL,
    author TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(merge_request_id, external_id)
);

-- Timeline events on one merge request (forge-specific)
CREATE TABLE IF NOT EXISTS merge_request_timeline (
    merge_request_id INTEGER NOT NULL REFERENCES merge_requests(id),
    kind TEXT NOT NULL,
    actor TEXT,
    created_at TEXT,
    UNIQUE(merge_request_id, kind, created_at)
);

-- Commit ancestry edges: one row per parent link, append-only
CREATE TABLE IF NOT EXISTS commit_edges (
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    sha_id TEXT NOT NULL,
    parent_id TEXT NOT NULL,
    UNIQUE(repository_id, sha_id, parent_id)
);

-- Deployments: pinned to one commit
CREATE TABLE IF NOT EXISTS deployments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL,
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    sha_id TEXT NOT NULL,
    status TEXT NOT NULL,
    deployed_at TEXT NOT NULL,
    UNIQUE(repository_id, external_id)
);

-- Members
CREATE TABLE IF NOT EXISTS members (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL,
    display_name TEXT
);

-- Repository membership associations
CREATE TABLE IF NOT EXISTS repository_members (
    repository_id INTEGER NOT NULL REFERENCES repositories(id),
    member_id INTEGER NOT NULL REFERENCES members(id),
    UNIQUE(repository_id, member_id)
);

-- Crawl events: append-only audit trail, one crawl instance per
-- repository extraction run
CREATE TABLE IF NOT EXISTS crawl_events (
    crawl_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    detail TEXT NOT NULL,
    data TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_crawl_events_crawl_id ON crawl_events(crawl_id);

-- Derived delivery metrics, upserted by merge-request id
CREATE TABLE IF NOT EXISTS merge_request_metrics (
    merge_request_id INTEGER PRIMARY KEY REFERENCES merge_requests(id),
    deployment_id INTEGER,
    cycle_time_secs INTEGER,
    review_time_secs INTEGER,
    lead_time_secs INTEGER,
    computed_at TEXT NOT NULL
);
"#;
