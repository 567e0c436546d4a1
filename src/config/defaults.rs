//! Default values for configuration

/// Default GitHub API base URL
pub fn default_github_base_url() -> String {
    std::env::var("FORGEFLOW_GITHUB_URL").unwrap_or_else(|_| "https://api.github.com".to_string())
}

/// Default environment variable name for the GitHub token
pub fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

/// Default GitLab API base URL
pub fn default_gitlab_base_url() -> String {
    std::env::var("FORGEFLOW_GITLAB_URL")
        .unwrap_or_else(|_| "https://gitlab.com/api/v4".to_string())
}

/// Default environment variable name for the GitLab token
pub fn default_gitlab_token_env() -> String {
    "GITLAB_TOKEN".to_string()
}

/// Default forge request timeout in seconds
pub fn default_forge_timeout() -> u64 {
    30
}

/// Default proactive request budget per forge client
pub fn default_forge_rate_limit() -> u32 {
    10
}

/// Default user agent
pub fn default_user_agent() -> String {
    format!("forgeflow/{}", env!("CARGO_PKG_VERSION"))
}

/// Default page size for merge-request pagination
pub fn default_per_page() -> u32 {
    50
}

/// Default hard cap on pages per repository per run
pub fn default_max_pages() -> u32 {
    200
}

/// Default fan-out concurrency limit
pub fn default_fanout_limit() -> usize {
    8
}

/// Default first backoff interval in seconds
pub fn default_retry_initial_secs() -> u64 {
    5
}

/// Default backoff multiplier
pub fn default_retry_multiplier() -> f64 {
    2.0
}

/// Default backoff cap in seconds
pub fn default_retry_cap_secs() -> u64 {
    60
}

/// Default maximum attempts per activity
pub fn default_retry_max_attempts() -> u32 {
    5
}

/// Default extraction window length in minutes
pub fn default_extract_interval_mins() -> i64 {
    15
}

/// Default transform window offset in minutes
pub fn default_transform_offset_mins() -> i64 {
    5
}
