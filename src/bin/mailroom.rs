use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

use mailroom::{
    config::AppConfig,
    db,
    default_handlers,
    delivery::HttpMsgSender,
    flows::HttpFlowEngine,
    ivr::HttpCallProvider,
    routes::create_router,
    shared::{MemoryStore, RedisStore, SharedStore},
    state::{AppState, Services},
    workers::cron,
    Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "mailroom",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        redis_url = ?config.redacted_redis_url(),
        flow_engine_url = %config.flow_engine_url,
        courier_url = %config.courier_url,
        retry_workers = config.retry.workers,
        retry_max_rps = config.retry.max_requests_per_second,
        "loaded mailroom configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let store: Arc<dyn SharedStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .context("failed to connect to redis")?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set, using in-process store; run a single instance only");
            Arc::new(MemoryStore::new())
        }
    };
    let services = Services {
        store,
        sender: Arc::new(HttpMsgSender::new(&config.courier_url)?),
        engine: Arc::new(HttpFlowEngine::new(&config.flow_engine_url)?),
        calls: Arc::new(HttpCallProvider::new(&config.ivr_url)?),
    };

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let state = AppState::new(pool, config, services);
    let shared_state = Arc::new(state.clone());

    let worker = Worker::new(shared_state.clone(), default_handlers(), Duration::from_secs(2));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "mailroom listening");

    tokio::select! {
        result = axum::serve(listener, create_router(state)) => {
            result.context("http server stopped")?;
        }
        _ = worker.run() => {}
        _ = cron::run_all(shared_state) => {}
        _ = signal::ctrl_c() => {
            tracing::info!("mailroom received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
