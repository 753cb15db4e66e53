use std::sync::Arc;

use anyhow::Context;
use commit_metrics_server::{config::Env, Storage};
use shared::github::GithubClient;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let env = envy::from_env::<Env>().context("Failed to load environment variables")?;
    let client = match &env.github_api_url {
        Some(url) => GithubClient::with_base_uri(env.github_token.clone(), url)?,
        None => GithubClient::new(env.github_token.clone())?,
    };
    let engine = Arc::new(commit_metrics_server::engine(&env, Arc::new(client))?);
    let storage = if env.use_database {
        Storage::Postgres
    } else {
        Storage::Memory(Arc::default())
    };

    tracing::info!(repo = %engine.repo(), "Starting Rocket");

    commit_metrics_server::build(
        commit_metrics_server::figment(),
        engine,
        storage,
        &env.cors_origins(),
    )?
    .launch()
    .await?;

    Ok(())
}
