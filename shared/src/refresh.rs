use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::{DateRange, Fetcher, RefreshError, RepoId, Snapshot, SnapshotStore};

/// Admits one in-flight refresh per repository.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    in_flight: Mutex<HashSet<RepoId>>,
}

impl RefreshCoordinator {
    pub fn try_begin(&self, repo: &RepoId) -> Result<RefreshGuard<'_>, RefreshError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(repo.clone()) {
            return Err(RefreshError::Busy(repo.to_string()));
        }
        Ok(RefreshGuard {
            coordinator: self,
            repo: repo.clone(),
        })
    }

    pub fn is_busy(&self, repo: &RepoId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(repo)
    }
}

/// Releases the repository when dropped, including when the refresh future is cancelled.
#[derive(Debug)]
pub struct RefreshGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    repo: RepoId,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.repo);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub repo: RepoId,
    pub range: DateRange,
    pub generated_at: DateTime<Utc>,
    pub users: usize,
    pub commits: u64,
    pub daily_rows: usize,
}

impl From<&Snapshot> for RefreshSummary {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            repo: snapshot.repo.clone(),
            range: snapshot.range,
            generated_at: snapshot.generated_at,
            users: snapshot.users().len(),
            commits: snapshot.overall().total_commits,
            daily_rows: snapshot.commits_per_day.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshFailure {
    pub range: DateRange,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub in_progress: bool,
    pub last_success: Option<RefreshSummary>,
    pub last_failure: Option<RefreshFailure>,
}

#[derive(Debug, Default)]
struct RefreshHistory {
    last_success: Option<RefreshSummary>,
    last_failure: Option<RefreshFailure>,
}

/// Runs fetch, aggregation and persistence for the configured repository.
pub struct MetricsEngine {
    repo: RepoId,
    fetcher: Fetcher,
    timeout: Duration,
    coordinator: RefreshCoordinator,
    history: Mutex<RefreshHistory>,
}

impl MetricsEngine {
    pub fn new(repo: RepoId, fetcher: Fetcher, timeout: Duration) -> Self {
        Self {
            repo,
            fetcher,
            timeout,
            coordinator: RefreshCoordinator::default(),
            history: Mutex::default(),
        }
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    pub fn status(&self) -> RefreshStatus {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        RefreshStatus {
            in_progress: self.coordinator.is_busy(&self.repo),
            last_success: history.last_success.clone(),
            last_failure: history.last_failure.clone(),
        }
    }

    /// Recomputes both tables for `range` and replaces the stored snapshot.
    ///
    /// The store is written only after the whole history has been fetched and
    /// aggregated, so any failure or cancellation leaves the previous snapshot
    /// in place. A second refresh while one is running is rejected with
    /// [`RefreshError::Busy`].
    #[instrument(skip(self, store), fields(repo = %self.repo))]
    pub async fn refresh(
        &self,
        store: &dyn SnapshotStore,
        range: DateRange,
    ) -> Result<RefreshSummary, RefreshError> {
        let _guard = self.coordinator.try_begin(&self.repo).inspect_err(|e| {
            warn!("Rejected refresh: {e}");
        })?;

        let result = self.run(store, range).await;
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(summary) => {
                info!(
                    "Refreshed {} users, {} commits",
                    summary.users, summary.commits
                );
                history.last_success = Some(summary.clone());
            }
            Err(e) => {
                error!("Refresh failed: {e}");
                history.last_failure = Some(RefreshFailure {
                    range,
                    failed_at: Utc::now(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        store: &dyn SnapshotStore,
        range: DateRange,
    ) -> Result<RefreshSummary, RefreshError> {
        let commits = tokio::time::timeout(
            self.timeout,
            self.fetcher.fetch_commits(&self.repo, &range),
        )
        .await
        .map_err(|_| RefreshError::Cancelled(self.timeout))??;

        let snapshot = Snapshot::build(self.repo.clone(), range, &commits, Utc::now())?;
        let summary = RefreshSummary::from(&snapshot);
        store
            .replace(snapshot)
            .await
            .map_err(|e| RefreshError::Store(format!("{e:#}")))?;
        Ok(summary)
    }
}
