use std::{env, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;

use mailroom::{
    config::AppConfig,
    db,
    delivery::HttpMsgSender,
    flows::HttpFlowEngine,
    ivr::HttpCallProvider,
    retry::{expire_sessions, sweep_stale_connections, sweep_stale_msgs},
    shared::{MemoryStore, RedisStore, SharedStore},
    state::{AppState, Services},
};

const USAGE: &str = "Usage: maintenance <migrate|sweep-stale|expire-sessions>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("migrate") => migrate()?,
        Some("sweep-stale") => sweep_stale()?,
        Some("expire-sessions") => expire().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        "loaded mailroom configuration"
    );
    Ok(config)
}

fn migrate() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let applied = db::run_migrations(&mut conn)?;
    println!("Applied {applied} migrations.");
    Ok(())
}

fn sweep_stale() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;
    let stale_after = config.retry.stale_connection_after;
    let now = Utc::now();
    let swept = sweep_stale_connections(&mut conn, stale_after, now)
        .context("failed to sweep stale connections")?;
    let msgs = sweep_stale_msgs(&mut conn, stale_after, now)
        .context("failed to sweep stale messages")?;
    println!("Failed {swept} stale connections and {msgs} stale messages.");
    Ok(())
}

async fn expire() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 2)?;
    let store: Arc<dyn SharedStore> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let services = Services {
        store,
        sender: Arc::new(HttpMsgSender::new(&config.courier_url)?),
        engine: Arc::new(HttpFlowEngine::new(&config.flow_engine_url)?),
        calls: Arc::new(HttpCallProvider::new(&config.ivr_url)?),
    };
    let state = AppState::new(pool, config, services);

    let summary = expire_sessions(&state, Utc::now())
        .await
        .context("failed to expire sessions")?;
    println!(
        "Expired {} sessions ({} calls hung up, {} left for later).",
        summary.expired, summary.hung_up, summary.skipped
    );
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
