use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rocket::{
    http::{Header, Status},
    response::{self, Responder},
    serde::json::Json,
    Request, Response,
};
use serde::{Deserialize, Serialize};
use shared::{
    DailyCommitCount, DateRange, FetchError, OverallMetrics, RefreshError, RefreshFailure,
    RefreshSummary, UserTotals,
};
use utoipa::ToSchema;

/// Row of the `overall_metrics` table, named the way the display client reads it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct UserMetricsResponse {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Total Coding Days")]
    pub total_coding_days: u64,
    #[serde(rename = "Total Commits")]
    pub total_commits: u64,
    #[serde(rename = "Files Changed")]
    pub files_changed: u64,
    #[serde(rename = "Lines Added")]
    pub lines_added: u64,
    #[serde(rename = "Lines Removed")]
    pub lines_removed: u64,
}

impl From<UserTotals> for UserMetricsResponse {
    fn from(row: UserTotals) -> Self {
        Self {
            user: row.user,
            total_coding_days: row.total_coding_days,
            total_commits: row.total_commits,
            files_changed: row.files_changed,
            lines_added: row.lines_added,
            lines_removed: row.lines_removed,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CommitsPerDayResponse {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Commits")]
    pub commits: u64,
}

impl From<DailyCommitCount> for CommitsPerDayResponse {
    fn from(row: DailyCommitCount) -> Self {
        Self {
            user: row.user,
            date: row.date,
            commits: row.commit_count,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct OverallMetricsResponse {
    #[serde(rename = "Total Coding Days")]
    pub total_coding_days: u64,
    #[serde(rename = "Total Commits")]
    pub total_commits: u64,
    #[serde(rename = "Files Changed")]
    pub files_changed: u64,
    #[serde(rename = "Lines Added")]
    pub lines_added: u64,
    #[serde(rename = "Lines Removed")]
    pub lines_removed: u64,
    #[serde(rename = "Net Lines Changed")]
    pub net_lines_changed: i64,
}

impl From<OverallMetrics> for OverallMetricsResponse {
    fn from(overall: OverallMetrics) -> Self {
        Self {
            net_lines_changed: overall.net_lines_changed(),
            total_coding_days: overall.total_coding_days,
            total_commits: overall.total_commits,
            files_changed: overall.files_changed,
            lines_added: overall.lines_added,
            lines_removed: overall.lines_removed,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RefreshResponse {
    pub message: String,
    pub repo: String,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub generated_at: DateTime<Utc>,
    pub users: usize,
    pub commits: u64,
    pub daily_rows: usize,
}

impl From<RefreshSummary> for RefreshResponse {
    fn from(summary: RefreshSummary) -> Self {
        Self {
            message: "Metrics refreshed successfully".to_string(),
            repo: summary.repo.to_string(),
            from: summary.range.from,
            to: summary.range.to,
            generated_at: summary.generated_at,
            users: summary.users,
            commits: summary.commits,
            daily_rows: summary.daily_rows,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RefreshFailureResponse {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

impl From<RefreshFailure> for RefreshFailureResponse {
    fn from(failure: RefreshFailure) -> Self {
        Self {
            from: failure.range.from,
            to: failure.range.to,
            failed_at: failure.failed_at,
            error: failure.error,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct StatusResponse {
    pub repo: String,
    pub in_progress: bool,
    /// Generation time of the snapshot currently served, if any.
    pub snapshot_generated_at: Option<DateTime<Utc>>,
    pub last_success: Option<RefreshResponse>,
    pub last_failure: Option<RefreshFailureResponse>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

/// JSON error with an HTTP status and, for rate limits, a `Retry-After` header.
#[derive(Debug)]
pub struct ErrorResponse {
    status: Status,
    body: ErrorBody,
    retry_after: Option<Duration>,
}

impl ErrorResponse {
    pub fn new(status: Status, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
            },
            retry_after: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, error)
    }

    pub fn internal(error: impl Into<String>) -> Self {
        Self::new(Status::InternalServerError, error)
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl From<RefreshError> for ErrorResponse {
    fn from(error: RefreshError) -> Self {
        let status = match &error {
            RefreshError::Busy(_) => Status::Conflict,
            RefreshError::Fetch(FetchError::RateLimit { .. }) => Status::TooManyRequests,
            RefreshError::Fetch(FetchError::Auth(_) | FetchError::NotFound(_)) => Status::BadGateway,
            RefreshError::Fetch(FetchError::TransientNetwork { .. }) => Status::ServiceUnavailable,
            RefreshError::Cancelled(_) => Status::GatewayTimeout,
            _ => Status::InternalServerError,
        };
        let retry_after = match &error {
            RefreshError::Fetch(FetchError::RateLimit { retry_after }) => *retry_after,
            _ => None,
        };

        let message = match &error {
            RefreshError::Busy(_) => error.to_string(),
            _ => format!("Failed to refresh metrics: {error}"),
        };
        Self {
            retry_after,
            ..Self::new(status, message)
        }
    }
}

impl<'r> Responder<'r, 'static> for ErrorResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let mut response = Response::build_from(Json(self.body).respond_to(req)?);
        response.status(self.status);
        if let Some(wait) = self.retry_after {
            // Round up so clients never retry before the reset.
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            response.header(Header::new("Retry-After", secs.to_string()));
        }
        response.ok()
    }
}

/// Parses the optional `from`/`to` query parameters (`YYYY-MM-DD`).
///
/// Empty values count as absent, which is what the display client sends for
/// an unset date picker.
pub fn date_range(from: Option<&str>, to: Option<&str>) -> Result<DateRange, ErrorResponse> {
    fn parse(name: &str, value: Option<&str>) -> Result<Option<NaiveDate>, ErrorResponse> {
        match value.map(str::trim).filter(|value| !value.is_empty()) {
            None => Ok(None),
            Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| {
                    ErrorResponse::bad_request(format!(
                        "Invalid `{name}` date `{value}`, expected YYYY-MM-DD"
                    ))
                }),
        }
    }

    DateRange::new(parse("from", from)?, parse("to", to)?)
        .map_err(|e| ErrorResponse::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_dates() {
        assert_eq!(date_range(None, None).unwrap(), DateRange::full_history());
        assert_eq!(date_range(Some(""), Some(" ")).unwrap(), DateRange::full_history());

        let range = date_range(Some("2024-01-01"), Some("2024-01-31")).unwrap();
        assert_eq!(range.from, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(range.to, NaiveDate::from_ymd_opt(2024, 1, 31));
    }

    #[test]
    fn rejects_bad_dates() {
        let error = date_range(Some("01/02/2024"), None).unwrap_err();
        assert_eq!(error.status(), Status::BadRequest);

        let error = date_range(Some("2024-02-01"), Some("2024-01-01")).unwrap_err();
        assert_eq!(error.status(), Status::BadRequest);
    }

    #[test]
    fn maps_refresh_errors_to_statuses() {
        let cases = [
            (RefreshError::Busy("a/b".to_string()), Status::Conflict),
            (
                FetchError::RateLimit { retry_after: None }.into(),
                Status::TooManyRequests,
            ),
            (FetchError::Auth("bad".to_string()).into(), Status::BadGateway),
            (FetchError::NotFound("a/b".to_string()).into(), Status::BadGateway),
            (
                FetchError::TransientNetwork {
                    attempts: 3,
                    message: "timeout".to_string(),
                }
                .into(),
                Status::ServiceUnavailable,
            ),
            (
                RefreshError::Cancelled(Duration::from_secs(1)),
                Status::GatewayTimeout,
            ),
            (
                RefreshError::Store("disk full".to_string()),
                Status::InternalServerError,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(ErrorResponse::from(error).status(), status);
        }
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let response = ErrorResponse::from(RefreshError::Fetch(FetchError::RateLimit {
            retry_after: Some(Duration::from_millis(1500)),
        }));
        assert_eq!(response.retry_after, Some(Duration::from_millis(1500)));
        assert!(response.body.error.contains("rate limit"));
    }
}
