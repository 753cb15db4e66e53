use chrono::{DateTime, SecondsFormat, Utc};
use octocrab::{FromResponse, Octocrab};
use serde::{de::IgnoredAny, Deserialize};
use tracing::{debug, instrument, warn};

use crate::{ApiError, BranchHead, CommitDetail, CommitQuery, CommitSource, Page, RepoId};

#[derive(Debug, Deserialize)]
struct ListedCommit {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Signature {
    name: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CommitMeta {
    author: Option<Signature>,
    committer: Option<Signature>,
}

#[derive(Debug, Default, Deserialize)]
struct CommitStats {
    #[serde(default)]
    additions: i64,
    #[serde(default)]
    deletions: i64,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    author: Option<Account>,
    commit: CommitMeta,
    #[serde(default)]
    stats: Option<CommitStats>,
    #[serde(default)]
    files: Vec<IgnoredAny>,
}

/// Later pages of a commit only differ in their file listing.
#[derive(Debug, Deserialize)]
struct CommitFilesPage {
    #[serde(default)]
    files: Vec<IgnoredAny>,
}

/// Files GitHub lists per page of a single commit.
const FILES_PER_PAGE: usize = 300;
/// GitHub stops listing the files of a commit past this many.
const MAX_LISTED_FILES: usize = 3000;

#[derive(Debug, Deserialize)]
struct BranchCommit {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    name: String,
    commit: BranchCommit,
}

/// Percent-encodes a query value, keeping RFC 3986 unreserved characters.
fn encode(value: &str) -> String {
    value
        .bytes()
        .map(|byte| match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (byte as char).to_string()
            }
            _ => format!("%{byte:02X}"),
        })
        .collect()
}

fn with_query(route: &str, params: &[(&str, String)]) -> String {
    let query = params
        .iter()
        .map(|(key, value)| format!("{key}={}", encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{route}?{query}")
}

fn list_query(query: &CommitQuery, page: u32) -> Vec<(&'static str, String)> {
    let mut params = Vec::with_capacity(5);
    if let Some(sha) = &query.sha {
        params.push(("sha", sha.clone()));
    }
    if let Some(since) = query.since {
        params.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    if let Some(until) = query.until {
        params.push(("until", until.to_rfc3339_opts(SecondsFormat::Secs, true)));
    }
    params.push(("per_page", query.per_page.to_string()));
    params.push(("page", page.to_string()));
    params
}

/// Reset time announced by a rate-limited response.
///
/// `Retry-After` (seconds) wins over the `x-ratelimit-reset` epoch, which only
/// counts once `x-ratelimit-remaining` has dropped to zero.
fn rate_limit_hint(
    retry_after: Option<&str>,
    remaining: Option<&str>,
    reset: Option<&str>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(secs) = retry_after.and_then(|value| value.trim().parse::<u32>().ok()) {
        return Some(now + chrono::Duration::seconds(i64::from(secs)));
    }
    if remaining.map(str::trim) != Some("0") {
        return None;
    }
    reset
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
}

/// Whether another page of files has to be fetched after one of `page_len` files.
fn more_files(listed: usize, page_len: usize, what: &str) -> Result<bool, ApiError> {
    if page_len < FILES_PER_PAGE {
        return Ok(false);
    }
    if listed >= MAX_LISTED_FILES {
        return Err(ApiError::Other(format!(
            "{what}: at least {MAX_LISTED_FILES} files changed, more than GitHub lists"
        )));
    }
    Ok(true)
}

impl CommitResponse {
    fn into_detail(self, files_changed: usize) -> Result<CommitDetail, ApiError> {
        let (author_name, authored_at) = self
            .commit
            .author
            .map(|author| (author.name, author.date))
            .unwrap_or_default();
        let timestamp = authored_at
            .or_else(|| self.commit.committer.and_then(|c| c.date))
            .ok_or_else(|| ApiError::Other(format!("commit {} has no date", self.sha)))?;
        let stats = self.stats.unwrap_or_default();

        Ok(CommitDetail {
            sha: self.sha,
            login: self.author.map(|account| account.login),
            author_name,
            timestamp,
            files_changed: files_changed as i64,
            lines_added: stats.additions,
            lines_removed: stats.deletions,
        })
    }
}

/// A failed request and the reset time its headers announced, if any.
#[derive(Debug)]
struct Failure {
    error: octocrab::Error,
    reset_at: Option<DateTime<Utc>>,
}

impl From<octocrab::Error> for Failure {
    fn from(error: octocrab::Error) -> Self {
        Self {
            error,
            reset_at: None,
        }
    }
}

fn status_of(error: &octocrab::Error) -> Option<u16> {
    match error {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

/// GitHub REST API access through octocrab.
#[derive(Clone, Debug)]
pub struct GithubClient {
    octocrab: Octocrab,
}

impl GithubClient {
    pub fn new(github_token: String) -> anyhow::Result<Self> {
        let octocrab = Octocrab::builder().personal_token(github_token).build()?;
        Ok(Self { octocrab })
    }

    /// Client for a GitHub Enterprise instance or any API-compatible host.
    pub fn with_base_uri(github_token: String, base_uri: &str) -> anyhow::Result<Self> {
        let octocrab = Octocrab::builder()
            .base_uri(base_uri)?
            .personal_token(github_token)
            .build()?;
        Ok(Self { octocrab })
    }

    async fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        match self.octocrab.ratelimit().get().await {
            Ok(limits) if limits.resources.core.remaining == 0 => {
                DateTime::from_timestamp(limits.resources.core.reset as i64, 0)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read rate limit status: {e}");
                None
            }
        }
    }

    /// GET a route and decode the body.
    ///
    /// Rate-limit headers are read before the body is consumed so the reset
    /// time survives into the error.
    async fn get_json<R: FromResponse>(&self, route: String) -> Result<R, Failure> {
        let response = self.octocrab._get(route).await?;
        let reset_at = {
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
            };
            rate_limit_hint(
                header("retry-after"),
                header("x-ratelimit-remaining"),
                header("x-ratelimit-reset"),
                Utc::now(),
            )
        };

        let response = octocrab::map_github_error(response)
            .await
            .map_err(|error| Failure { error, reset_at })?;
        Ok(R::from_response(response).await?)
    }

    async fn classify(&self, failure: Failure, what: &str) -> ApiError {
        let Failure { error, reset_at } = failure;
        let message = match &error {
            octocrab::Error::GitHub { source, .. } => source.message.clone(),
            other => other.to_string(),
        };
        let rate_limited = message.to_lowercase().contains("rate limit");

        match status_of(&error) {
            Some(401) => ApiError::Unauthorized(message),
            Some(403 | 429) if reset_at.is_some() => ApiError::RateLimited { reset_at },
            // Secondary limits are not reflected in the rate limit endpoint.
            Some(403 | 429) if message.to_lowercase().contains("secondary rate limit") => {
                ApiError::RateLimited { reset_at: None }
            }
            Some(429) => ApiError::RateLimited {
                reset_at: self.rate_limit_reset().await,
            },
            Some(403) if rate_limited => ApiError::RateLimited {
                reset_at: self.rate_limit_reset().await,
            },
            Some(403) => ApiError::Unauthorized(message),
            Some(404) => ApiError::NotFound(format!("{what}: {message}")),
            Some(500..=599) => ApiError::Transient(message),
            Some(status) => ApiError::Other(format!("{what}: {status} {message}")),
            None => ApiError::Transient(message),
        }
    }
}

#[async_trait::async_trait]
impl CommitSource for GithubClient {
    #[instrument(skip(self, query), fields(start = ?query.sha))]
    async fn list_commits(
        &self,
        repo: &RepoId,
        query: &CommitQuery,
        page: u32,
    ) -> Result<Page<String>, ApiError> {
        let route = with_query(
            &format!("/repos/{}/{}/commits", repo.owner, repo.repo),
            &list_query(query, page),
        );
        let commits: Vec<ListedCommit> = match self.get_json(route).await {
            Ok(commits) => commits,
            // An empty repository has no history to list.
            Err(failure) if status_of(&failure.error) == Some(409) => {
                return Ok(Page::last(vec![]))
            }
            Err(failure) => return Err(self.classify(failure, &repo.to_string()).await),
        };

        let has_next = commits.len() == usize::from(query.per_page);
        Ok(Page::new(
            commits.into_iter().map(|commit| commit.sha).collect(),
            has_next,
        ))
    }

    #[instrument(skip(self))]
    async fn commit_detail(&self, repo: &RepoId, sha: &str) -> Result<CommitDetail, ApiError> {
        let what = format!("{repo}@{sha}");
        let route = format!("/repos/{}/{}/commits/{}", repo.owner, repo.repo, sha);
        let response: CommitResponse = match self.get_json(route.clone()).await {
            Ok(response) => response,
            Err(failure) => return Err(self.classify(failure, &what).await),
        };

        // Large commits list their files over several pages.
        let mut files = response.files.len();
        let mut page_len = files;
        let mut page = 1;
        while more_files(files, page_len, &what)? {
            page += 1;
            let route = with_query(&route, &[("page", page.to_string())]);
            let next: CommitFilesPage = match self.get_json(route).await {
                Ok(next) => next,
                Err(failure) => return Err(self.classify(failure, &what).await),
            };
            page_len = next.files.len();
            files += page_len;
        }
        if page > 1 {
            debug!("{what} changed {files} files over {page} pages");
        }

        response.into_detail(files)
    }

    #[instrument(skip(self))]
    async fn list_branches(
        &self,
        repo: &RepoId,
        per_page: u8,
        page: u32,
    ) -> Result<Page<BranchHead>, ApiError> {
        let route = with_query(
            &format!("/repos/{}/{}/branches", repo.owner, repo.repo),
            &[("per_page", per_page.to_string()), ("page", page.to_string())],
        );
        let branches: Vec<BranchResponse> = match self.get_json(route).await {
            Ok(branches) => branches,
            Err(failure) => return Err(self.classify(failure, &repo.to_string()).await),
        };

        let has_next = branches.len() == usize::from(per_page);
        Ok(Page::new(
            branches
                .into_iter()
                .map(|branch| BranchHead {
                    name: branch.name,
                    sha: branch.commit.sha,
                })
                .collect(),
            has_next,
        ))
    }
}
