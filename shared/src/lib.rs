use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod aggregate;
mod error;
mod fetch;
mod refresh;
mod source;
mod store;

#[cfg(feature = "github")]
pub mod github;

pub use aggregate::*;
pub use error::*;
pub use fetch::*;
pub use refresh::*;
pub use source::*;
pub use store::*;

pub type GithubHandle = String;

/// Author used when a commit carries neither an account login nor a name.
pub const UNKNOWN_AUTHOR: &str = "unknown";

/// User name of the synthetic row that sums every contributor.
pub const ALL_USERS: &str = "All Users";

/// `owner/repository` pair identifying the repository to analyse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    pub fn parse(full_name: &str) -> Result<Self, InvalidRepoId> {
        let invalid = || InvalidRepoId(full_name.to_string());
        let (owner, repo) = full_name.trim().split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(owner, repo))
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Optional calendar range, inclusive on both ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Self, InvalidDateRange> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(InvalidDateRange { from, to });
            }
        }
        Ok(Self { from, to })
    }

    pub fn full_history() -> Self {
        Self::default()
    }

    /// Start of `from` in UTC.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.from
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|start| start.and_utc())
    }

    /// Last second of `to` in UTC, so the whole day is included.
    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.to
            .and_then(|date| date.and_hms_opt(23, 59, 59))
            .map(|end_of_day| end_of_day.and_utc())
    }

    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        let date = timestamp.date_naive();
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.from, self.to) {
            (None, None) => write!(f, "full history"),
            (Some(from), None) => write!(f, "{from}.."),
            (None, Some(to)) => write!(f, "..={to}"),
            (Some(from), Some(to)) => write!(f, "{from}..={to}"),
        }
    }
}

/// One commit with its change statistics, as produced by the fetcher.
///
/// Counters are signed so that corrupt upstream data can be detected by the
/// aggregator instead of wrapping silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub sha: String,
    pub author: GithubHandle,
    pub timestamp: DateTime<Utc>,
    pub files_changed: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
}

impl CommitRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTotals {
    pub user: GithubHandle,
    pub total_coding_days: u64,
    pub total_commits: u64,
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCommitCount {
    pub user: GithubHandle,
    pub date: NaiveDate,
    pub commit_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallMetrics {
    pub total_coding_days: u64,
    pub total_commits: u64,
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

impl OverallMetrics {
    pub fn net_lines_changed(&self) -> i64 {
        self.lines_added as i64 - self.lines_removed as i64
    }

    pub fn as_row(&self) -> UserTotals {
        UserTotals {
            user: ALL_USERS.to_string(),
            total_coding_days: self.total_coding_days,
            total_commits: self.total_commits,
            files_changed: self.files_changed,
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
        }
    }
}

/// The pair of tables produced by one aggregation run.
///
/// `overall_metrics` holds one row per user in lexicographic order followed by
/// the synthetic [`ALL_USERS`] row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub repo: RepoId,
    pub range: DateRange,
    pub generated_at: DateTime<Utc>,
    pub overall_metrics: Vec<UserTotals>,
    pub commits_per_day: Vec<DailyCommitCount>,
}

impl Snapshot {
    pub fn build(
        repo: RepoId,
        range: DateRange,
        commits: &[CommitRecord],
        generated_at: DateTime<Utc>,
    ) -> Result<Self, AggregateError> {
        let (users, daily) = aggregate(commits)?;
        let overall = overall(&users, &daily);
        let mut overall_metrics = users;
        overall_metrics.push(overall.as_row());

        Ok(Self {
            repo,
            range,
            generated_at,
            overall_metrics,
            commits_per_day: daily,
        })
    }

    pub fn users(&self) -> &[UserTotals] {
        match self.overall_metrics.split_last() {
            Some((last, users)) if last.user == ALL_USERS => users,
            _ => &self.overall_metrics,
        }
    }

    pub fn overall(&self) -> OverallMetrics {
        overall(self.users(), &self.commits_per_day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_parses_owner_and_name() {
        let repo = RepoId::parse("near/nearcore").unwrap();
        assert_eq!(repo, RepoId::new("near", "nearcore"));
        assert_eq!(repo.to_string(), "near/nearcore");
    }

    #[test]
    fn repo_id_rejects_malformed_names() {
        for name in ["", "owner", "/repo", "owner/", "a/b/c"] {
            assert!(RepoId::parse(name).is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn date_range_is_inclusive_through_end_of_day() {
        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let range = DateRange::new(Some(from), Some(to)).unwrap();

        assert_eq!(range.since().unwrap().to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(range.until().unwrap().to_rfc3339(), "2024-01-31T23:59:59+00:00");

        let late = to.and_hms_opt(23, 30, 0).unwrap().and_utc();
        assert!(range.contains(&late));
        let next_day = NaiveDate::from_ymd_opt(2024, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        assert!(!range.contains(&next_day));
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let from = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(DateRange::new(Some(from), Some(to)).is_err());
    }

    #[test]
    fn empty_range_means_full_history() {
        let range = DateRange::full_history();
        assert!(range.since().is_none());
        assert!(range.until().is_none());
        assert_eq!(range.to_string(), "full history");
    }
}
