use std::sync::Arc;

use rocket::{fairing::AdHoc, http::Status, serde::json::Json, State};
use shared::{Snapshot, SnapshotStore};
use tracing::{debug, error};

use super::types::{
    date_range, CommitsPerDayResponse, ErrorBody, ErrorResponse, OverallMetricsResponse,
    UserMetricsResponse,
};

pub(super) async fn current_snapshot(
    store: &dyn SnapshotStore,
) -> Result<Option<Snapshot>, ErrorResponse> {
    store.current().await.map_err(|e| {
        error!("Failed to read snapshot: {e:#}");
        ErrorResponse::internal(format!("Failed to read metrics: {e}"))
    })
}

async fn persisted_snapshot(store: &dyn SnapshotStore) -> Result<Snapshot, ErrorResponse> {
    current_snapshot(store)
        .await?
        .ok_or_else(|| ErrorResponse::new(Status::NotFound, "Metrics not found"))
}

/// The persisted snapshot is served as computed by the last refresh; `from`
/// and `to` are validated but select nothing, recompute with `POST /refresh`.
#[utoipa::path(responses(
    (status = 200, description = "Per-user totals followed by the All Users row", body = [UserMetricsResponse]),
    (status = 400, description = "Malformed date range", body = ErrorBody),
    (status = 404, description = "No metrics have been computed yet", body = ErrorBody)
))]
#[get("/metrics?<from>&<to>")]
pub async fn get_metrics(
    store: &State<Arc<dyn SnapshotStore>>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Json<Vec<UserMetricsResponse>>, ErrorResponse> {
    let requested = date_range(from, to)?;
    let snapshot = persisted_snapshot(store.inner().as_ref()).await?;
    if requested != snapshot.range {
        debug!(
            "Serving snapshot for {} while {} was requested",
            snapshot.range, requested
        );
    }

    Ok(Json(
        snapshot
            .overall_metrics
            .into_iter()
            .map(Into::into)
            .collect(),
    ))
}

#[utoipa::path(responses(
    (status = 200, description = "Overall reduction across every user", body = OverallMetricsResponse),
    (status = 404, description = "No metrics have been computed yet", body = ErrorBody)
))]
#[get("/metrics/overall")]
pub async fn get_overall_metrics(
    store: &State<Arc<dyn SnapshotStore>>,
) -> Result<Json<OverallMetricsResponse>, ErrorResponse> {
    let snapshot = persisted_snapshot(store.inner().as_ref()).await?;
    Ok(Json(snapshot.overall().into()))
}

#[utoipa::path(responses(
    (status = 200, description = "Commit counts per user and day", body = [CommitsPerDayResponse]),
    (status = 404, description = "No metrics have been computed yet", body = ErrorBody)
))]
#[get("/commits_per_day")]
pub async fn get_commits_per_day(
    store: &State<Arc<dyn SnapshotStore>>,
) -> Result<Json<Vec<CommitsPerDayResponse>>, ErrorResponse> {
    let snapshot = persisted_snapshot(store.inner().as_ref()).await?;
    Ok(Json(
        snapshot
            .commits_per_day
            .into_iter()
            .map(Into::into)
            .collect(),
    ))
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing metrics entrypoints", |rocket| async {
        rocket.mount(
            "/",
            routes![get_metrics, get_overall_metrics, get_commits_per_day],
        )
    })
}
