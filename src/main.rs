use anyhow::{Context, Result};
use clap::Parser;
use crop_data_processor::clients::ipfs::ContentStoreClient;
use crop_data_processor::clients::planet::SatelliteClient;
use crop_data_processor::clients::weatherxm::WeatherStationClient;
use crop_data_processor::jobs::{JobService, JobSubmitter, TaskContext};
use crop_data_processor::services::events::EventBus;
use crop_data_processor::services::evidence::EvidenceBundler;
use crop_data_processor::services::satellite::SubscriptionManager;
use crop_data_processor::storage::cache::CacheStore;
use crop_data_processor::storage::timeseries::TimeseriesStore;
use crop_data_processor::{cli, config, db, routes, state};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind listener on {addr}: port already in use. Stop the other service or re-run with --port.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind listener on {addr}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ProcessorConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;
    let cache = CacheStore::connect(&config.redis_url).await?;
    let http = reqwest::Client::new();
    let store = TimeseriesStore::new(pool.clone());

    let weather = Arc::new(WeatherStationClient::from_config(&config, http.clone()));
    let planet = Arc::new(SatelliteClient::from_config(&config, http.clone()));
    let content = Arc::new(ContentStoreClient::from_config(&config, http.clone()));
    let satellite = Arc::new(SubscriptionManager::new(
        store.clone(),
        planet.clone(),
        &config,
    ));
    let bundler = Arc::new(EvidenceBundler::new(
        store.clone(),
        satellite.clone(),
        content.clone(),
    ));
    let events = EventBus::new();
    let submitter = Arc::new(JobSubmitter::new(
        pool.clone(),
        cache.clone(),
        config.dedup_ttl,
    ));

    let ctx = Arc::new(TaskContext {
        config: config.clone(),
        store: store.clone(),
        cache: cache.clone(),
        weather,
        satellite: satellite.clone(),
        bundler,
        events: events.clone(),
        submitter,
    });
    let jobs = Arc::new(JobService::new(pool.clone(), ctx));

    let cancel = CancellationToken::new();
    jobs.clone().start(cancel.clone(), !args.no_scheduler);
    if args.no_scheduler {
        tracing::info!("periodic scheduler disabled; serving API only");
    }

    let state = state::AppState {
        config,
        db: pool,
        store,
        cache,
        events,
        jobs,
        satellite,
        content,
        http,
    };

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(60)
            .methods(vec![
                axum::http::Method::POST,
                axum::http::Method::PUT,
                axum::http::Method::DELETE,
            ])
            .use_headers()
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        governor_limiter.retain_recent();
    });

    let app = routes::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(tower_http::cors::CorsLayer::permissive());
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(addr = %addr, "crop-data-processor listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_cancel.cancel();
    })
    .await?;
    cancel.cancel();
    Ok(())
}
