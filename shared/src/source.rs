use chrono::{DateTime, Utc};

use crate::{ApiError, CommitRecord, RepoId, UNKNOWN_AUTHOR};

/// One page of a paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, has_next: bool) -> Self {
        Self { items, has_next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, false)
    }

    /// Whether the listing ends here: either an empty page or an explicit
    /// "no more pages" signal.
    pub fn is_last(&self) -> bool {
        self.items.is_empty() || !self.has_next
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitQuery {
    /// Branch or commit to start listing from, default branch when empty.
    pub sha: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub per_page: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchHead {
    pub name: String,
    pub sha: String,
}

/// Per-commit detail as reported by the hosting API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDetail {
    pub sha: String,
    /// Verified account identity, if the commit is linked to one.
    pub login: Option<String>,
    /// Raw author name from the commit metadata.
    pub author_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub files_changed: i64,
    pub lines_added: i64,
    pub lines_removed: i64,
}

impl CommitDetail {
    pub fn author(&self) -> &str {
        fn non_empty(value: &Option<String>) -> Option<&str> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        }

        non_empty(&self.login)
            .or_else(|| non_empty(&self.author_name))
            .unwrap_or(UNKNOWN_AUTHOR)
    }
}

impl From<CommitDetail> for CommitRecord {
    fn from(detail: CommitDetail) -> Self {
        let author = detail.author().to_string();
        Self {
            sha: detail.sha,
            author,
            timestamp: detail.timestamp,
            files_changed: detail.files_changed,
            lines_added: detail.lines_added,
            lines_removed: detail.lines_removed,
        }
    }
}

/// Read access to a repository's history on the hosting service.
#[async_trait::async_trait]
pub trait CommitSource: Send + Sync {
    async fn list_commits(
        &self,
        repo: &RepoId,
        query: &CommitQuery,
        page: u32,
    ) -> Result<Page<String>, ApiError>;

    async fn commit_detail(&self, repo: &RepoId, sha: &str) -> Result<CommitDetail, ApiError>;

    async fn list_branches(
        &self,
        repo: &RepoId,
        per_page: u8,
        page: u32,
    ) -> Result<Page<BranchHead>, ApiError>;
}
