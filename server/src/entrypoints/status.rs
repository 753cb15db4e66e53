use std::sync::Arc;

use rocket::{fairing::AdHoc, serde::json::Json, State};
use shared::{MetricsEngine, SnapshotStore};

use super::{
    metrics::current_snapshot,
    types::{ErrorBody, ErrorResponse, StatusResponse},
};

#[utoipa::path(responses(
    (status = 200, description = "Outcome of the last refresh and the snapshot being served", body = StatusResponse),
    (status = 500, description = "Snapshot store unavailable", body = ErrorBody)
))]
#[get("/status")]
pub async fn get_status(
    engine: &State<Arc<MetricsEngine>>,
    store: &State<Arc<dyn SnapshotStore>>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let snapshot = current_snapshot(store.inner().as_ref()).await?;
    let status = engine.status();

    Ok(Json(StatusResponse {
        repo: engine.repo().to_string(),
        in_progress: status.in_progress,
        snapshot_generated_at: snapshot.map(|snapshot| snapshot.generated_at),
        last_success: status.last_success.map(Into::into),
        last_failure: status.last_failure.map(Into::into),
    }))
}

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing status entrypoint", |rocket| async {
        rocket.mount("/", routes![get_status])
    })
}
