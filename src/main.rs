use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use embed_edge::{AppConfig, EdgeApplicationServer, Logger};

// edge proxy binary - stateless, nothing to connect to before serving
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards are kept alive to flush logs and keep the sentry connection open
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!("logger and env prepped, starting edge proxy...");

    EdgeApplicationServer::serve(config)
        .await
        .context("edge server failed to start")?;

    Ok(())
}
