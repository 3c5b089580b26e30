//! hostgate - authenticated front door for cluster hosts

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostgate::{
    auth::{MemorySessionStore, OAuth2Client, OAuth2Config},
    bootstrap::{self, BootContext},
    config::{Args, SettingsStore},
    proxy::{AuthorityPortResolver, HeuristicRegistry, ProxyRouter},
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("hostgate={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let settings = match SettingsStore::load(&args.settings).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to load settings from {}: {}", args.settings.display(), e);
            std::process::exit(1);
        }
    };
    let snapshot = settings.get();

    info!("======================================");
    info!(
        "  hostgate {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_SHORT"),
        env!("BUILD_TIMESTAMP")
    );
    info!("======================================");
    info!("Hostnames: {:?}", snapshot.hostnames);
    info!("Authority: {}", args.authority_url);
    info!(
        "Transport: {}",
        if snapshot.security.force_http {
            "plain HTTP"
        } else if snapshot.security.force_insecure {
            "HTTPS (self-signed)"
        } else {
            "HTTPS (ACME)"
        }
    );
    info!("Ports: http={} https={}", snapshot.ports.http, snapshot.ports.https);
    info!("Docker TLS: {} (port {})", args.docker_tls_dir.display(), args.docker_tls_port);
    info!("Settings: {}", settings.path().display());
    info!("======================================");

    let oauth2 = Arc::new(OAuth2Client::new(OAuth2Config {
        authority_url: args.authority_url.clone(),
        client_id: args.client_id.clone(),
        client_secret: args.client_secret.clone(),
        scope: args.scope.clone(),
    })?);

    let boot = BootContext::new(args.clone(), Arc::clone(&settings), Arc::clone(&oauth2));
    if let Err(e) = bootstrap::run(&boot).await {
        error!(stage = e.stage, task = e.task, "Boot failed: {}", e.source);
        std::process::exit(1);
    }
    info!("Boot complete");

    let heuristics = HeuristicRegistry::from_settings(&settings.get().proxy);
    info!("Proxy heuristics registered for {} port(s)", heuristics.len());
    let router = ProxyRouter::new(
        heuristics,
        Arc::new(AuthorityPortResolver::new(Arc::clone(&oauth2))),
    );

    let state = Arc::new(AppState::new(
        args,
        settings,
        Arc::new(MemorySessionStore::new()),
        oauth2,
        router,
    ));
    server::run(state).await?;

    Ok(())
}
