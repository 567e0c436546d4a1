//! GitHub implementation of the forge capability interface

use super::{
    classify_status, classify_throttle, Capability, ForgeClient, ForgeCommit, ForgeDeployment,
    ForgeDiffStat, ForgeMember, ForgeMergeRequest, ForgeNote, ForgeRepository,
    ForgeTimelineEvent, MergeRequestActors, MergeRequestPage, RequestBudget,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{DeploymentStatus, ForgeType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, LINK};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// GitHub REST API client
pub struct GithubClient {
    client: Client,
    base_url: String,
    budget: RequestBudget,
    link_next: Regex,
}

#[derive(Deserialize)]
struct GhRepo {
    id: i64,
    name: String,
    owner: GhAccount,
    default_branch: String,
}

#[derive(Deserialize)]
struct GhAccount {
    id: i64,
    login: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct GhPull {
    number: i64,
    state: String,
    head: GhRef,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    merged_by: Option<GhAccount>,
}

#[derive(Deserialize)]
struct GhRef {
    sha: String,
}

#[derive(Deserialize)]
struct GhFile {
    filename: String,
    additions: i64,
    deletions: i64,
}

#[derive(Deserialize)]
struct GhCommit {
    sha: String,
    parents: Vec<GhRef>,
}

#[derive(Deserialize)]
struct GhComment {
    id: i64,
    user: GhAccount,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GhTimelineEvent {
    event: String,
    actor: Option<GhAccount>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct GhIssue {
    closed_by: Option<GhAccount>,
}

#[derive(Deserialize)]
struct GhDeployment {
    id: i64,
    sha: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GhDeploymentStatus {
    state: String,
}

#[derive(Deserialize)]
struct GhWorkflowRuns {
    workflow_runs: Vec<GhWorkflowRun>,
}

#[derive(Deserialize)]
struct GhWorkflowRun {
    id: i64,
    head_sha: String,
    conclusion: Option<String>,
    updated_at: DateTime<Utc>,
}

impl GithubClient {
    pub fn new(config: &Config, token: String) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Config(format!("Invalid GitHub token: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        let client = Client::builder()
            .user_agent(&config.forge.user_agent)
            .timeout(Duration::from_secs(config.forge.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.forge.github_base_url.trim_end_matches('/').to_string(),
            budget: RequestBudget::new(config.forge.requests_per_second),
            link_next: Regex::new(r#"<[^>]+>;\s*rel="next""#).expect("static regex"),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        self.budget.acquire().await;
        let url = format!("{}/{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if let Some(throttle) = classify_throttle(status, response.headers()) {
            return Err(throttle);
        }
        Err(classify_status(status, path))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.get(path, query).await?;
        Ok(response.json().await?)
    }

    fn has_next_page(&self, headers: &HeaderMap) -> bool {
        headers
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(|link| self.link_next.is_match(link))
            .unwrap_or(false)
    }
}

fn pull_state(pull: &GhPull) -> String {
    if pull.merged_at.is_some() {
        "merged".to_string()
    } else if pull.state == "closed" {
        "closed".to_string()
    } else {
        "open".to_string()
    }
}

#[async_trait]
impl ForgeClient for GithubClient {
    fn forge_type(&self) -> ForgeType {
        ForgeType::Github
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::TimelineEvents
                | Capability::MergeRequestActors
                | Capability::CommitHistory
                | Capability::RunDeployments
        )
    }

    async fn fetch_repository(&self, repo: &str) -> Result<ForgeRepository> {
        let gh: GhRepo = self.get_json(&format!("repos/{}", repo), &[]).await?;
        Ok(ForgeRepository {
            external_id: gh.id.to_string(),
            name: gh.name,
            namespace_id: gh.owner.id,
            namespace_name: gh.owner.login,
            default_branch: gh.default_branch,
        })
    }

    async fn fetch_members(&self, repo: &str) -> Result<Vec<ForgeMember>> {
        let accounts: Vec<GhAccount> = self
            .get_json(&format!("repos/{}/collaborators", repo), &[])
            .await?;
        Ok(accounts
            .into_iter()
            .map(|a| ForgeMember {
                external_id: a.id.to_string(),
                username: a.login,
                display_name: a.name,
            })
            .collect())
    }

    async fn fetch_member(&self, username: &str) -> Result<ForgeMember> {
        let account: GhAccount = self.get_json(&format!("users/{}", username), &[]).await?;
        Ok(ForgeMember {
            external_id: account.id.to_string(),
            username: account.login,
            display_name: account.name,
        })
    }

    async fn fetch_namespace_members(&self, namespace: &str) -> Result<Vec<ForgeMember>> {
        let accounts: Vec<GhAccount> = self
            .get_json(&format!("orgs/{}/members", namespace), &[])
            .await?;
        Ok(accounts
            .into_iter()
            .map(|a| ForgeMember {
                external_id: a.id.to_string(),
                username: a.login,
                display_name: a.name,
            })
            .collect())
    }

    async fn fetch_merge_requests(
        &self,
        repo: &str,
        page: u32,
        per_page: u32,
        updated_after: DateTime<Utc>,
    ) -> Result<MergeRequestPage> {
        // The pulls list cannot filter on update time server-side; ordering
        // by most-recently-updated makes the first stale item a watermark.
        let response = self
            .get(
                &format!("repos/{}/pulls", repo),
                &[
                    ("state", "all".to_string()),
                    ("sort", "updated".to_string()),
                    ("direction", "desc".to_string()),
                    ("per_page", per_page.to_string()),
                    ("page", page.to_string()),
                ],
            )
            .await?;
        let has_more = self.has_next_page(response.headers());
        let pulls: Vec<GhPull> = response.json().await?;

        let reached_watermark = pulls.iter().any(|p| p.updated_at < updated_after);
        let items = pulls
            .iter()
            .filter(|p| p.updated_at >= updated_after)
            .map(|p| ForgeMergeRequest {
                external_id: p.number.to_string(),
                sha_id: p.head.sha.clone(),
                state: pull_state(p),
                created_at: p.created_at,
                updated_at: p.updated_at,
                merged_at: p.merged_at,
                closed_at: p.closed_at,
            })
            .collect();

        Ok(MergeRequestPage {
            items,
            has_more,
            reached_watermark,
        })
    }

    async fn fetch_merge_request_diffs(&self, repo: &str, mr: &str) -> Result<Vec<ForgeDiffStat>> {
        let files: Vec<GhFile> = self
            .get_json(&format!("repos/{}/pulls/{}/files", repo, mr), &[])
            .await?;
        Ok(files
            .into_iter()
            .map(|f| ForgeDiffStat {
                file_path: f.filename,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect())
    }

    async fn fetch_merge_request_commits(&self, repo: &str, mr: &str) -> Result<Vec<ForgeCommit>> {
        let commits: Vec<GhCommit> = self
            .get_json(&format!("repos/{}/pulls/{}/commits", repo, mr), &[])
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| ForgeCommit {
                sha: c.sha,
                parents: c.parents.into_iter().map(|p| p.sha).collect(),
            })
            .collect())
    }

    async fn fetch_merge_request_notes(&self, repo: &str, mr: &str) -> Result<Vec<ForgeNote>> {
        let comments: Vec<GhComment> = self
            .get_json(&format!("repos/{}/issues/{}/comments", repo, mr), &[])
            .await?;
        Ok(comments
            .into_iter()
            .map(|c| ForgeNote {
                external_id: c.id.to_string(),
                author: c.user.login,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn fetch_timeline_events(
        &self,
        repo: &str,
        mr: &str,
    ) -> Result<Vec<ForgeTimelineEvent>> {
        let events: Vec<GhTimelineEvent> = self
            .get_json(&format!("repos/{}/issues/{}/timeline", repo, mr), &[])
            .await?;
        Ok(events
            .into_iter()
            .map(|e| ForgeTimelineEvent {
                kind: e.event,
                actor: e.actor.map(|a| a.login),
                created_at: e.created_at,
            })
            .collect())
    }

    async fn fetch_merge_request_actors(
        &self,
        repo: &str,
        mr: &str,
    ) -> Result<MergeRequestActors> {
        let pull: GhPull = self
            .get_json(&format!("repos/{}/pulls/{}", repo, mr), &[])
            .await?;
        let issue: GhIssue = self
            .get_json(&format!("repos/{}/issues/{}", repo, mr), &[])
            .await?;
        Ok(MergeRequestActors {
            merged_by: pull.merged_by.map(|a| a.login),
            closed_by: issue.closed_by.map(|a| a.login),
        })
    }

    async fn fetch_deployments(&self, repo: &str) -> Result<Vec<ForgeDeployment>> {
        let deployments: Vec<GhDeployment> = self
            .get_json(&format!("repos/{}/deployments", repo), &[])
            .await?;
        Ok(deployments
            .into_iter()
            .map(|d| ForgeDeployment {
                external_id: d.id.to_string(),
                sha_id: d.sha,
                status: DeploymentStatus::Pending.to_string(),
                deployed_at: d.created_at,
            })
            .collect())
    }

    async fn fetch_deployment_status(
        &self,
        repo: &str,
        deployment: &str,
    ) -> Result<DeploymentStatus> {
        // Statuses are newest-first; the head entry is the current state
        let statuses: Vec<GhDeploymentStatus> = self
            .get_json(
                &format!("repos/{}/deployments/{}/statuses", repo, deployment),
                &[],
            )
            .await?;
        match statuses.first() {
            Some(s) => s.state.parse(),
            None => Ok(DeploymentStatus::Pending),
        }
    }

    async fn fetch_commit_history(
        &self,
        repo: &str,
        branch: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ForgeCommit>> {
        let commits: Vec<GhCommit> = self
            .get_json(
                &format!("repos/{}/commits", repo),
                &[
                    ("sha", branch.to_string()),
                    ("since", since.to_rfc3339()),
                ],
            )
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| ForgeCommit {
                sha: c.sha,
                parents: c.parents.into_iter().map(|p| p.sha).collect(),
            })
            .collect())
    }

    async fn fetch_run_deployments(
        &self,
        repo: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ForgeDeployment>> {
        let runs: GhWorkflowRuns = self
            .get_json(
                &format!("repos/{}/actions/runs", repo),
                &[("created", format!(">={}", since.to_rfc3339()))],
            )
            .await?;
        Ok(runs
            .workflow_runs
            .into_iter()
            .map(|r| ForgeDeployment {
                external_id: format!("run-{}", r.id),
                sha_id: r.head_sha,
                status: r
                    .conclusion
                    .as_deref()
                    .unwrap_or("pending")
                    .parse::<DeploymentStatus>()
                    .unwrap_or(DeploymentStatus::Pending)
                    .to_string(),
                deployed_at: r.updated_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> Config {
        let mut config = Config::default();
        config.forge.github_base_url = base_url.to_string();
        config.forge.requests_per_second = 1000;
        config
    }

    fn client(server: &MockServer) -> GithubClient {
        GithubClient::new(&test_config(&server.uri()), "token".into()).unwrap()
    }

    #[tokio::test]
    async fn fetch_repository_normalizes_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 1001,
                "name": "api",
                "owner": {"id": 7, "login": "acme"},
                "default_branch": "main"
            })))
            .mount(&server)
            .await;

        let repo = client(&server).fetch_repository("acme/api").await.unwrap();
        assert_eq!(repo.external_id, "1001");
        assert_eq!(repo.namespace_name, "acme");
        assert_eq!(repo.default_branch, "main");
    }

    #[tokio::test]
    async fn merge_request_page_computes_watermark() {
        let server = MockServer::start().await;
        let pull = |number: i64, updated: &str| {
            serde_json::json!({
                "number": number,
                "state": "open",
                "head": {"sha": format!("sha-{}", number)},
                "created_at": "2026-01-01T00:00:00Z",
                "updated_at": updated,
                "merged_at": null,
                "closed_at": null,
                "merged_by": null
            })
        };
        Mock::given(method("GET"))
            .and(path("/repos/acme/api/pulls"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(
                        "link",
                        r#"<https://example.com/page2>; rel="next""#,
                    )
                    .set_body_json(serde_json::json!([
                        pull(3, "2026-02-10T00:00:00Z"),
                        pull(2, "2026-02-05T00:00:00Z"),
                        pull(1, "2026-01-02T00:00:00Z"),
                    ])),
            )
            .mount(&server)
            .await;

        let watermark = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let page = client(&server)
            .fetch_merge_requests("acme/api", 1, 50, watermark)
            .await
            .unwrap();

        // the stale pull is dropped but flips the watermark flag
        assert_eq!(page.items.len(), 2);
        assert!(page.reached_watermark);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn quota_exhaustion_becomes_rate_limited_error() {
        let server = MockServer::start().await;
        let reset = (Utc::now() + chrono::Duration::minutes(5)).timestamp();
        Mock::given(method("GET"))
            .and(path("/repos/acme/api"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", reset.to_string().as_str()),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_repository("acme/api")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
        assert!(err.retry_after().is_some());
    }

    #[tokio::test]
    async fn missing_repository_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_repository("acme/gone")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn deployment_status_reads_head_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/api/deployments/9/statuses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"state": "success"},
                {"state": "in_progress"}
            ])))
            .mount(&server)
            .await;

        let status = client(&server)
            .fetch_deployment_status("acme/api", "9")
            .await
            .unwrap();
        assert_eq!(status, DeploymentStatus::Success);
    }
}
