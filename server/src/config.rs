use std::time::Duration;

use serde::Deserialize;
use shared::{BranchScan, FetchConfig, RepoId, RetryPolicy};

fn default_fetch_concurrency() -> usize {
    8
}

fn default_fetch_max_attempts() -> u32 {
    3
}

fn default_fetch_initial_backoff_ms() -> u64 {
    500
}

fn default_fetch_max_backoff_ms() -> u64 {
    10_000
}

fn default_rate_limit_max_wait_secs() -> u64 {
    15 * 60
}

fn default_rate_limit_fallback_secs() -> u64 {
    60
}

fn default_per_page() -> u8 {
    100
}

fn default_refresh_timeout_secs() -> u64 {
    30 * 60
}

fn default_branch_lookback_days() -> u32 {
    90
}

fn default_cors_origins() -> String {
    "http://localhost:3000".to_string()
}

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
    pub github_token: String,
    pub github_repo: String,
    pub github_api_url: Option<String>,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,
    #[serde(default = "default_fetch_initial_backoff_ms")]
    pub fetch_initial_backoff_ms: u64,
    #[serde(default = "default_fetch_max_backoff_ms")]
    pub fetch_max_backoff_ms: u64,
    #[serde(default = "default_rate_limit_max_wait_secs")]
    pub rate_limit_max_wait_secs: u64,
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u8,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    #[serde(default)]
    pub scan_branches: bool,
    #[serde(default = "default_branch_lookback_days")]
    pub branch_lookback_days: u32,
    /// Comma separated list of allowed origins.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,
    #[serde(default)]
    pub use_database: bool,
}

impl Env {
    pub fn repo(&self) -> anyhow::Result<RepoId> {
        Ok(RepoId::parse(&self.github_repo)?)
    }

    pub fn fetch_config(&self) -> anyhow::Result<FetchConfig> {
        anyhow::ensure!(
            (1..=100).contains(&self.per_page),
            "PER_PAGE must be between 1 and 100, got {}",
            self.per_page
        );
        anyhow::ensure!(
            self.fetch_concurrency > 0,
            "FETCH_CONCURRENCY must be positive"
        );
        anyhow::ensure!(
            self.fetch_max_attempts > 0,
            "FETCH_MAX_ATTEMPTS must be positive"
        );

        let branches = if self.scan_branches {
            BranchScan::RecentBranches {
                lookback_days: self.branch_lookback_days,
            }
        } else {
            BranchScan::DefaultBranch
        };

        Ok(FetchConfig {
            per_page: self.per_page,
            concurrency: self.fetch_concurrency,
            retry: RetryPolicy {
                max_attempts: self.fetch_max_attempts,
                initial_backoff: Duration::from_millis(self.fetch_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.fetch_max_backoff_ms),
                max_rate_limit_wait: Duration::from_secs(self.rate_limit_max_wait_secs),
                rate_limit_fallback: Duration::from_secs(self.rate_limit_fallback_secs),
            },
            branches,
        })
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}
