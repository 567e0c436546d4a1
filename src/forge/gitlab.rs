//! GitLab implementation of the forge capability interface

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
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// GitLab REST API client
pub struct GitlabClient {
    client: Client,
    base_url: String,
    budget: RequestBudget,
}

#[derive(Deserialize)]
struct GlProject {
    id: i64,
    path: String,
    namespace: GlNamespace,
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct GlNamespace {
    id: i64,
    path: String,
}

#[derive(Deserialize)]
struct GlUser {
    id: i64,
    username: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct GlMergeRequest {
    iid: i64,
    state: String,
    sha: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    merged_by: Option<GlUser>,
    closed_by: Option<GlUser>,
}

#[derive(Deserialize)]
struct GlChanges {
    changes: Vec<GlChange>,
}

#[derive(Deserialize)]
struct GlChange {
    new_path: String,
}

#[derive(Deserialize)]
struct GlCommit {
    id: String,
    parent_ids: Vec<String>,
}

#[derive(Deserialize)]
struct GlNote {
    id: i64,
    author: GlUser,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct GlDeployment {
    id: i64,
    sha: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl GitlabClient {
    pub fn new(config: &Config, token: String) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&token)
            .map_err(|e| Error::Config(format!("Invalid GitLab token: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", auth);

        let client = Client::builder()
            .user_agent(&config.forge.user_agent)
            .timeout(Duration::from_secs(config.forge.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.forge.gitlab_base_url.trim_end_matches('/').to_string(),
            budget: RequestBudget::new(config.forge.requests_per_second),
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

    fn project_path(repo: &str) -> String {
        urlencode(repo)
    }
}

fn urlencode(path: &str) -> String {
    path.replace('/', "%2F")
}

fn member(user: GlUser) -> ForgeMember {
    ForgeMember {
        external_id: user.id.to_string(),
        username: user.username,
        display_name: user.name,
    }
}

#[async_trait]
impl ForgeClient for GitlabClient {
    fn forge_type(&self) -> ForgeType {
        ForgeType::Gitlab
    }

    fn supports(&self, capability: Capability) -> bool {
        // Timeline events and workflow-run extras are GitHub-shaped; merge
        // actors come from the merge request detail endpoint.
        matches!(capability, Capability::MergeRequestActors)
    }

    async fn fetch_repository(&self, repo: &str) -> Result<ForgeRepository> {
        let project: GlProject = self
            .get_json(&format!("projects/{}", Self::project_path(repo)), &[])
            .await?;
        Ok(ForgeRepository {
            external_id: project.id.to_string(),
            name: project.path,
            namespace_id: project.namespace.id,
            namespace_name: project.namespace.path,
            default_branch: project.default_branch.unwrap_or_else(|| "main".to_string()),
        })
    }

    async fn fetch_members(&self, repo: &str) -> Result<Vec<ForgeMember>> {
        let users: Vec<GlUser> = self
            .get_json(
                &format!("projects/{}/members/all", Self::project_path(repo)),
                &[],
            )
            .await?;
        Ok(users.into_iter().map(member).collect())
    }

    async fn fetch_member(&self, username: &str) -> Result<ForgeMember> {
        let users: Vec<GlUser> = self
            .get_json("users", &[("username", username.to_string())])
            .await?;
        users
            .into_iter()
            .next()
            .map(member)
            .ok_or_else(|| Error::NotFound(format!("user {}", username)))
    }

    async fn fetch_namespace_members(&self, namespace: &str) -> Result<Vec<ForgeMember>> {
        let users: Vec<GlUser> = self
            .get_json(&format!("groups/{}/members", urlencode(namespace)), &[])
            .await?;
        Ok(users.into_iter().map(member).collect())
    }

    async fn fetch_merge_requests(
        &self,
        repo: &str,
        page: u32,
        per_page: u32,
        updated_after: DateTime<Utc>,
    ) -> Result<MergeRequestPage> {
        let response = self
            .get(
                &format!("projects/{}/merge_requests", Self::project_path(repo)),
                &[
                    ("state", "all".to_string()),
                    ("order_by", "updated_at".to_string()),
                    ("sort", "desc".to_string()),
                    ("per_page", per_page.to_string()),
                    ("page", page.to_string()),
                ],
            )
            .await?;
        let has_more = response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        let mrs: Vec<GlMergeRequest> = response.json().await?;

        let reached_watermark = mrs.iter().any(|m| m.updated_at < updated_after);
        let items = mrs
            .into_iter()
            .filter(|m| m.updated_at >= updated_after)
            .map(|m| ForgeMergeRequest {
                external_id: m.iid.to_string(),
                sha_id: m.sha.unwrap_or_default(),
                state: m.state,
                created_at: m.created_at,
                updated_at: m.updated_at,
                merged_at: m.merged_at,
                closed_at: m.closed_at,
            })
            .collect();

        Ok(MergeRequestPage {
            items,
            has_more,
            reached_watermark,
        })
    }

    async fn fetch_merge_request_diffs(&self, repo: &str, mr: &str) -> Result<Vec<ForgeDiffStat>> {
        let changes: GlChanges = self
            .get_json(
                &format!(
                    "projects/{}/merge_requests/{}/changes",
                    Self::project_path(repo),
                    mr
                ),
                &[],
            )
            .await?;
        // GitLab reports no per-file line counts on this endpoint
        Ok(changes
            .changes
            .into_iter()
            .map(|c| ForgeDiffStat {
                file_path: c.new_path,
                additions: 0,
                deletions: 0,
            })
            .collect())
    }

    async fn fetch_merge_request_commits(&self, repo: &str, mr: &str) -> Result<Vec<ForgeCommit>> {
        let commits: Vec<GlCommit> = self
            .get_json(
                &format!(
                    "projects/{}/merge_requests/{}/commits",
                    Self::project_path(repo),
                    mr
                ),
                &[],
            )
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| ForgeCommit {
                sha: c.id,
                parents: c.parent_ids,
            })
            .collect())
    }

    async fn fetch_merge_request_notes(&self, repo: &str, mr: &str) -> Result<Vec<ForgeNote>> {
        let notes: Vec<GlNote> = self
            .get_json(
                &format!(
                    "projects/{}/merge_requests/{}/notes",
                    Self::project_path(repo),
                    mr
                ),
                &[],
            )
            .await?;
        Ok(notes
            .into_iter()
            .map(|n| ForgeNote {
                external_id: n.id.to_string(),
                author: n.author.username,
                created_at: n.created_at,
            })
            .collect())
    }

    async fn fetch_timeline_events(
        &self,
        _repo: &str,
        _mr: &str,
    ) -> Result<Vec<ForgeTimelineEvent>> {
        Err(Error::Unsupported("timeline events".into()))
    }

    async fn fetch_merge_request_actors(
        &self,
        repo: &str,
        mr: &str,
    ) -> Result<MergeRequestActors> {
        let detail: GlMergeRequest = self
            .get_json(
                &format!(
                    "projects/{}/merge_requests/{}",
                    Self::project_path(repo),
                    mr
                ),
                &[],
            )
            .await?;
        Ok(MergeRequestActors {
            merged_by: detail.merged_by.map(|u| u.username),
            closed_by: detail.closed_by.map(|u| u.username),
        })
    }

    async fn fetch_deployments(&self, repo: &str) -> Result<Vec<ForgeDeployment>> {
        let deployments: Vec<GlDeployment> = self
            .get_json(
                &format!("projects/{}/deployments", Self::project_path(repo)),
                &[],
            )
            .await?;
        Ok(deployments
            .into_iter()
            .map(|d| ForgeDeployment {
                external_id: d.id.to_string(),
                sha_id: d.sha,
                status: d
                    .status
                    .parse::<DeploymentStatus>()
                    .unwrap_or(DeploymentStatus::Pending)
                    .to_string(),
                deployed_at: d.created_at,
            })
            .collect())
    }

    async fn fetch_deployment_status(
        &self,
        repo: &str,
        deployment: &str,
    ) -> Result<DeploymentStatus> {
        let detail: GlDeployment = self
            .get_json(
                &format!(
                    "projects/{}/deployments/{}",
                    Self::project_path(repo),
                    deployment
                ),
                &[],
            )
            .await?;
        detail.status.parse()
    }

    async fn fetch_commit_history(
        &self,
        _repo: &str,
        _branch: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<ForgeCommit>> {
        Err(Error::Unsupported("commit history".into()))
    }

    async fn fetch_run_deployments(
        &self,
        _repo: &str,
        _since: DateTime<Utc>,
    ) -> Result<Vec<ForgeDeployment>> {
        Err(Error::Unsupported("run deployments".into()))
    }
}
