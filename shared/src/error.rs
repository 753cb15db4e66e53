use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid repository identifier `{0}`, expected `owner/repository`")]
pub struct InvalidRepoId(pub String);

#[derive(Debug, Clone, thiserror::Error)]
#[error("`from` ({from}) is after `to` ({to})")]
pub struct InvalidDateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Failure of a single hosting API call, before any retry policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("credentials rejected: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limit exhausted")]
    RateLimited { reset_at: Option<DateTime<Utc>> },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("unexpected response: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("repository not found: {0}")]
    NotFound(String),
    #[error("rate limit exhausted{}", retry_hint(.retry_after))]
    RateLimit { retry_after: Option<Duration> },
    #[error("network failure after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },
    #[error("unexpected response from hosting API: {0}")]
    Unexpected(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|wait| format!(", retry after {}s", wait.as_secs()))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("commit {sha} has negative {field}: {value}")]
    InvalidRecord {
        sha: String,
        field: &'static str,
        value: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("a refresh of {0} is already in progress")]
    Busy(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("failed to persist snapshot: {0}")]
    Store(String),
    #[error("refresh cancelled after {0:?}")]
    Cancelled(Duration),
}
