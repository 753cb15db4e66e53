use std::sync::Arc;

use rocket::{fairing::AdHoc, serde::json::Json, State};
use shared::{MetricsEngine, SnapshotStore};

use super::types::{date_range, ErrorBody, ErrorResponse, RefreshResponse};

/// Fetches and aggregates the configured repository for the given range and
/// replaces the persisted snapshot. Runs synchronously; on failure the previous
/// snapshot keeps being served.
#[utoipa::path(responses(
    (status = 200, description = "Snapshot recomputed and stored", body = RefreshResponse),
    (status = 400, description = "Malformed date range", body = ErrorBody),
    (status = 409, description = "A refresh is already running", body = ErrorBody),
    (status = 429, description = "Rate limit exhausted, see Retry-After", body = ErrorBody),
    (status = 502, description = "Credentials or repository rejected by GitHub", body = ErrorBody),
    (status = 503, description = "GitHub unreachable after retries", body = ErrorBody),
    (status = 504, description = "Refresh timed out", body = ErrorBody)
))]
#[post("/refresh?<from>&<to>")]
pub async fn refresh_metrics(
    engine: &State<Arc<MetricsEngine>>,
    store: &State<Arc<dyn SnapshotStore>>,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Json<RefreshResponse>, ErrorResponse> {
    let range = date_range(from, to)?;
    let summary = engine.refresh(store.inner().as_ref(), range).await?;
    Ok(Json(summary.into()))
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing refresh entrypoint", |rocket| async {
        rocket.mount("/", routes![refresh_metrics])
    })
}
