#[macro_use]
extern crate rocket;

use std::sync::Arc;

use rocket::{
    fairing::AdHoc,
    figment::{
        providers::{Env as FigmentEnv, Format, Toml},
        Figment,
    },
    http::Method,
    Build, Rocket,
};
use rocket_cors::{AllowedOrigins, Cors, CorsOptions};
use shared::{CommitSource, Fetcher, MemoryStore, MetricsEngine, SnapshotStore};

pub mod config;
pub mod db;
pub mod entrypoints;

use config::Env;

/// Port the display client talks to unless `ROCKET_PORT` says otherwise.
pub const DEFAULT_PORT: u16 = 5001;

/// Where snapshots are kept.
pub enum Storage {
    /// Postgres through `rocket_db_pools`, configured under `databases.commit-metrics`.
    Postgres,
    Memory(Arc<MemoryStore>),
}

pub fn engine(env: &Env, source: Arc<dyn CommitSource>) -> anyhow::Result<MetricsEngine> {
    let fetcher = Fetcher::new(source, env.fetch_config()?);
    Ok(MetricsEngine::new(env.repo()?, fetcher, env.refresh_timeout()))
}

pub fn figment() -> Figment {
    Figment::from(rocket::Config::default())
        .merge(("port", DEFAULT_PORT))
        .merge(Toml::file(FigmentEnv::var_or("ROCKET_CONFIG", "Rocket.toml")).nested())
        .merge(FigmentEnv::prefixed("ROCKET_").ignore(&["PROFILE"]).global())
}

fn cors(origins: &[String]) -> anyhow::Result<Cors> {
    Ok(CorsOptions {
        allowed_origins: AllowedOrigins::some_exact(origins),
        allowed_methods: [Method::Get, Method::Post]
            .into_iter()
            .map(From::from)
            .collect(),
        ..Default::default()
    }
    .to_cors()?)
}

fn request_logger() -> AdHoc {
    AdHoc::on_request("Request logger", |req, _| {
        Box::pin(async move {
            let headers = req
                .headers()
                .iter()
                .map(|header| format!("{}: {}", header.name(), header.value()))
                .collect::<Vec<_>>();
            tracing::debug!(method = %req.method(), uri = %req.uri(), ?headers, "Incoming request");
        })
    })
}

pub fn build(
    figment: Figment,
    engine: Arc<MetricsEngine>,
    storage: Storage,
    cors_origins: &[String],
) -> anyhow::Result<Rocket<Build>> {
    let rocket = rocket::custom(figment)
        .manage(engine)
        .attach(cors(cors_origins)?)
        .attach(request_logger())
        .attach(entrypoints::stage());

    Ok(match storage {
        Storage::Postgres => rocket.attach(db::stage()),
        Storage::Memory(store) => {
            let store: Arc<dyn SnapshotStore> = store;
            rocket.manage(store)
        }
    })
}
