use rocket::fairing::AdHoc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod metrics;
pub mod refresh;
pub mod status;
pub mod types;

use types::{
    CommitsPerDayResponse, ErrorBody, OverallMetricsResponse, RefreshFailureResponse,
    RefreshResponse, StatusResponse, UserMetricsResponse,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        metrics::get_metrics,
        metrics::get_overall_metrics,
        metrics::get_commits_per_day,
        refresh::refresh_metrics,
        status::get_status,
    ),
    components(schemas(
        UserMetricsResponse,
        OverallMetricsResponse,
        CommitsPerDayResponse,
        RefreshResponse,
        RefreshFailureResponse,
        StatusResponse,
        ErrorBody,
    ))
)]
pub struct ApiDoc;

pub fn stage() -> AdHoc {
    AdHoc::on_ignite("Installing entrypoints", |rocket| async {
        rocket
            .attach(metrics::stage())
            .attach(refresh::stage())
            .attach(status::stage())
            .mount(
                "/",
                SwaggerUi::new("/swagger-ui/<_..>").url("/api-docs/openapi.json", ApiDoc::openapi()),
            )
    })
}
