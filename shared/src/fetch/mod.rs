use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, error, info, instrument};

use crate::{
    BranchHead, CommitDetail, CommitQuery, CommitRecord, CommitSource, DateRange, FetchError,
    Page, RepoId,
};

mod retry;

pub use retry::*;

/// Which parts of the history are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchScan {
    DefaultBranch,
    /// Every branch whose head commit is younger than `lookback_days`.
    RecentBranches { lookback_days: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub per_page: u8,
    /// Upper bound of concurrent per-commit detail requests.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub branches: BranchScan,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            per_page: 100,
            concurrency: 8,
            retry: RetryPolicy::default(),
            branches: BranchScan::DefaultBranch,
        }
    }
}

#[derive(Debug)]
enum FetchPhase {
    ListingBranches { page: u32, lookback_days: u32 },
    SelectingBranches { lookback_days: u32 },
    ListingCommits { scope: usize, page: u32 },
    FetchingDetails,
    Done(Vec<CommitRecord>),
    Failed(FetchError),
}

/// Progress accumulated while walking through the phases.
#[derive(Default)]
struct FetchRun {
    branches: Vec<BranchHead>,
    /// Starting points to list from, `None` is the default branch.
    scopes: Vec<Option<String>>,
    seen: HashSet<String>,
    listed: Vec<String>,
}

impl FetchRun {
    fn record_listed(&mut self, shas: Vec<String>) -> usize {
        let before = self.listed.len();
        for sha in shas {
            if self.seen.insert(sha.clone()) {
                self.listed.push(sha);
            }
        }
        self.listed.len() - before
    }
}

/// Keeps the first record for every sha.
pub fn dedup_by_sha(records: Vec<CommitRecord>) -> Vec<CommitRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.sha.clone()))
        .collect()
}

/// Retrieves the commit history of a repository with per-commit statistics.
pub struct Fetcher {
    source: Arc<dyn CommitSource>,
    config: FetchConfig,
    gate: RateLimitGate,
}

impl Fetcher {
    pub fn new(source: Arc<dyn CommitSource>, config: FetchConfig) -> Self {
        Self {
            source,
            config,
            gate: RateLimitGate::default(),
        }
    }

    /// Lists every commit in `range` and resolves its statistics and author.
    ///
    /// Either the whole history is returned or an error: a partial listing is
    /// never reported as complete.
    #[instrument(skip_all, fields(repo = %repo, range = %range))]
    pub async fn fetch_commits(
        &self,
        repo: &RepoId,
        range: &DateRange,
    ) -> Result<Vec<CommitRecord>, FetchError> {
        let mut run = FetchRun::default();
        let mut phase = match self.config.branches {
            BranchScan::DefaultBranch => {
                run.scopes.push(None);
                FetchPhase::ListingCommits { scope: 0, page: 1 }
            }
            BranchScan::RecentBranches { lookback_days } => FetchPhase::ListingBranches {
                page: 1,
                lookback_days,
            },
        };

        loop {
            phase = match phase {
                FetchPhase::ListingBranches {
                    page,
                    lookback_days,
                } => match self.branch_page(repo, page).await {
                    Ok(branches) => {
                        let last = branches.is_last();
                        run.branches.extend(branches.items);
                        if last {
                            FetchPhase::SelectingBranches { lookback_days }
                        } else {
                            FetchPhase::ListingBranches {
                                page: page + 1,
                                lookback_days,
                            }
                        }
                    }
                    Err(e) => FetchPhase::Failed(e),
                },
                FetchPhase::SelectingBranches { lookback_days } => {
                    match self
                        .recent_branch_heads(repo, &run.branches, lookback_days)
                        .await
                    {
                        Ok(heads) => {
                            info!(
                                "Scanning {} of {} branches",
                                heads.len(),
                                run.branches.len()
                            );
                            run.scopes = heads.into_iter().map(Some).collect();
                            FetchPhase::ListingCommits { scope: 0, page: 1 }
                        }
                        Err(e) => FetchPhase::Failed(e),
                    }
                }
                FetchPhase::ListingCommits { scope, page } => {
                    self.list_scope(&mut run, repo, range, scope, page).await
                }
                FetchPhase::FetchingDetails => match self.details(repo, &run.listed).await {
                    Ok(records) => FetchPhase::Done(records),
                    Err(e) => FetchPhase::Failed(e),
                },
                FetchPhase::Done(records) => {
                    let listed = records.len();
                    // The API filters on committer date, records are dated by author.
                    let records: Vec<CommitRecord> = dedup_by_sha(records)
                        .into_iter()
                        .filter(|record| range.contains(&record.timestamp))
                        .collect();
                    if records.len() < listed {
                        debug!(
                            "Dropped {} commits authored outside {range}",
                            listed - records.len()
                        );
                    }
                    info!("Fetched {} commits", records.len());
                    return Ok(records);
                }
                FetchPhase::Failed(e) => {
                    error!("Failed to fetch commits: {e}");
                    return Err(e);
                }
            };
        }
    }

    async fn list_scope(
        &self,
        run: &mut FetchRun,
        repo: &RepoId,
        range: &DateRange,
        scope: usize,
        page: u32,
    ) -> FetchPhase {
        let Some(start) = run.scopes.get(scope).cloned() else {
            debug!("Listed {} commits", run.listed.len());
            return FetchPhase::FetchingDetails;
        };
        let query = CommitQuery {
            sha: start,
            since: range.since(),
            until: range.until(),
            per_page: self.config.per_page,
        };

        match self.commit_page(repo, &query, page).await {
            Ok(commits) => {
                let last = commits.is_last();
                let listed = commits.items.len();
                let new = run.record_listed(commits.items);
                debug!("Page {page} of scope {scope}: {listed} commits, {new} new");
                if last {
                    FetchPhase::ListingCommits {
                        scope: scope + 1,
                        page: 1,
                    }
                } else {
                    FetchPhase::ListingCommits {
                        scope,
                        page: page + 1,
                    }
                }
            }
            Err(e) => FetchPhase::Failed(e),
        }
    }

    async fn branch_page(&self, repo: &RepoId, page: u32) -> Result<Page<BranchHead>, FetchError> {
        with_retry(&self.config.retry, &self.gate, "list branches", || {
            self.source.list_branches(repo, self.config.per_page, page)
        })
        .await
    }

    async fn commit_page(
        &self,
        repo: &RepoId,
        query: &CommitQuery,
        page: u32,
    ) -> Result<Page<String>, FetchError> {
        with_retry(&self.config.retry, &self.gate, "list commits", || {
            self.source.list_commits(repo, query, page)
        })
        .await
    }

    async fn commit_detail(&self, repo: &RepoId, sha: &str) -> Result<CommitDetail, FetchError> {
        with_retry(&self.config.retry, &self.gate, sha, || {
            self.source.commit_detail(repo, sha)
        })
        .await
    }

    async fn details(
        &self,
        repo: &RepoId,
        shas: &[String],
    ) -> Result<Vec<CommitRecord>, FetchError> {
        stream::iter(shas.to_vec())
            .map(move |sha| async move { self.commit_detail(repo, &sha).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .map_ok(CommitRecord::from)
            .try_collect()
            .await
    }

    async fn recent_branch_heads(
        &self,
        repo: &RepoId,
        branches: &[BranchHead],
        lookback_days: u32,
    ) -> Result<Vec<String>, FetchError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(lookback_days));
        let heads: Vec<(BranchHead, CommitDetail)> = stream::iter(branches.to_vec())
            .map(move |branch| async move {
                self.commit_detail(repo, &branch.sha)
                    .await
                    .map(|head| (branch, head))
            })
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        let mut seen = HashSet::new();
        Ok(heads
            .into_iter()
            .filter(|(branch, head)| {
                let recent = head.timestamp >= cutoff;
                if !recent {
                    debug!("Skipping branch {}: last commit {}", branch.name, head.timestamp);
                }
                recent
            })
            .map(|(branch, _)| branch.sha)
            .filter(|sha| seen.insert(sha.clone()))
            .collect())
    }
}
