use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rocket::{
    fairing::{self, AdHoc},
    Build, Rocket,
};
use rocket_db_pools::Database;
use shared::{DailyCommitCount, DateRange, RepoId, Snapshot, SnapshotStore, UserTotals};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

#[derive(Database, Clone, Debug)]
#[database("commit-metrics")]
pub struct DB(PgPool);

#[derive(Debug, sqlx::FromRow)]
struct SnapshotMetaRow {
    owner: String,
    repo: String,
    range_from: Option<NaiveDate>,
    range_to: Option<NaiveDate>,
    generated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OverallMetricsRow {
    user_name: String,
    total_coding_days: i64,
    total_commits: i64,
    files_changed: i64,
    lines_added: i64,
    lines_removed: i64,
}

impl From<OverallMetricsRow> for UserTotals {
    fn from(row: OverallMetricsRow) -> Self {
        Self {
            user: row.user_name,
            total_coding_days: row.total_coding_days as u64,
            total_commits: row.total_commits as u64,
            files_changed: row.files_changed as u64,
            lines_added: row.lines_added as u64,
            lines_removed: row.lines_removed as u64,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommitsPerDayRow {
    user_name: String,
    date: NaiveDate,
    commit_count: i64,
}

impl From<CommitsPerDayRow> for DailyCommitCount {
    fn from(row: CommitsPerDayRow) -> Self {
        Self {
            user: row.user_name,
            date: row.date,
            commit_count: row.commit_count as u64,
        }
    }
}

impl DB {
    async fn clear(tx: &mut Transaction<'static, Postgres>) -> anyhow::Result<()> {
        for table in ["overall_metrics", "commits_per_day", "snapshot_meta"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(tx.as_mut())
                .await?;
        }
        Ok(())
    }

    async fn insert_meta(
        tx: &mut Transaction<'static, Postgres>,
        snapshot: &Snapshot,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshot_meta (id, owner, repo, range_from, range_to, generated_at)
            VALUES (1, $1, $2, $3, $4, $5)
            "#,
        )
        .bind(&snapshot.repo.owner)
        .bind(&snapshot.repo.repo)
        .bind(snapshot.range.from)
        .bind(snapshot.range.to)
        .bind(snapshot.generated_at)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    async fn insert_overall_metrics(
        tx: &mut Transaction<'static, Postgres>,
        rows: &[UserTotals],
    ) -> anyhow::Result<()> {
        for (position, row) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO overall_metrics (position, user_name, total_coding_days, total_commits, files_changed, lines_added, lines_removed)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(position as i32)
            .bind(&row.user)
            .bind(row.total_coding_days as i64)
            .bind(row.total_commits as i64)
            .bind(row.files_changed as i64)
            .bind(row.lines_added as i64)
            .bind(row.lines_removed as i64)
            .execute(tx.as_mut())
            .await?;
        }
        Ok(())
    }

    async fn insert_commits_per_day(
        tx: &mut Transaction<'static, Postgres>,
        rows: &[DailyCommitCount],
    ) -> anyhow::Result<()> {
        for (position, row) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO commits_per_day (position, user_name, date, commit_count)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(position as i32)
            .bind(&row.user)
            .bind(row.date)
            .bind(row.commit_count as i64)
            .execute(tx.as_mut())
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for DB {
    #[instrument(skip_all, fields(repo = %snapshot.repo))]
    async fn replace(&self, snapshot: Snapshot) -> anyhow::Result<()> {
        let mut tx = self.0.begin().await?;
        Self::clear(&mut tx).await?;
        Self::insert_meta(&mut tx, &snapshot).await?;
        Self::insert_overall_metrics(&mut tx, &snapshot.overall_metrics).await?;
        Self::insert_commits_per_day(&mut tx, &snapshot.commits_per_day).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn current(&self) -> anyhow::Result<Option<Snapshot>> {
        let mut tx = self.0.begin().await?;
        // Both tables must come from the same committed snapshot.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(tx.as_mut())
            .await?;

        let meta: Option<SnapshotMetaRow> = sqlx::query_as(
            r#"
            SELECT owner, repo, range_from, range_to, generated_at
            FROM snapshot_meta
            WHERE id = 1
            "#,
        )
        .fetch_optional(tx.as_mut())
        .await?;
        let Some(meta) = meta else {
            return Ok(None);
        };

        let overall_metrics: Vec<OverallMetricsRow> = sqlx::query_as(
            r#"
            SELECT user_name, total_coding_days, total_commits, files_changed, lines_added, lines_removed
            FROM overall_metrics
            ORDER BY position
            "#,
        )
        .fetch_all(tx.as_mut())
        .await?;
        let commits_per_day: Vec<CommitsPerDayRow> = sqlx::query_as(
            r#"
            SELECT user_name, date, commit_count
            FROM commits_per_day
            ORDER BY position
            "#,
        )
        .fetch_all(tx.as_mut())
        .await?;
        tx.commit().await?;

        Ok(Some(Snapshot {
            repo: RepoId::new(meta.owner, meta.repo),
            range: DateRange {
                from: meta.range_from,
                to: meta.range_to,
            },
            generated_at: meta.generated_at,
            overall_metrics: overall_metrics.into_iter().map(Into::into).collect(),
            commits_per_day: commits_per_day.into_iter().map(Into::into).collect(),
        }))
    }
}

async fn run_migrations(rocket: Rocket<Build>) -> fairing::Result {
    match DB::fetch(&rocket) {
        Some(db) => match sqlx::migrate!("./migrations").run(&**db).await {
            Ok(_) => Ok(rocket),
            Err(e) => {
                rocket::error!("Failed to initialize SQLx database: {}", e);
                Err(rocket)
            }
        },
        None => Err(rocket),
    }
}

async fn manage_store(rocket: Rocket<Build>) -> fairing::Result {
    match DB::fetch(&rocket) {
        Some(db) => {
            let store: Arc<dyn SnapshotStore> = Arc::new(db.clone());
            Ok(rocket.manage(store))
        }
        None => Err(rocket),
    }
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("SQLx Stage", |rocket| async {
        rocket
            .attach(DB::init())
            .attach(AdHoc::try_on_ignite("SQLx Migrations", run_migrations))
            .attach(AdHoc::try_on_ignite("Snapshot store", manage_store))
    })
}
