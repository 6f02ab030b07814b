use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};
use tokio::task;
use uuid::Uuid;

use crate::{
    assets::{AssetCache, OrgAssets, PgAssetLoader},
    config::AppConfig,
    db::PgPool,
    delivery::MsgSender,
    error::{AppError, AppResult, CoreResult},
    flows::FlowEngine,
    ivr::CallProvider,
    shared::SharedStore,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Outbound collaborators, kept behind traits so tests can swap them out.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn SharedStore>,
    pub sender: Arc<dyn MsgSender>,
    pub engine: Arc<dyn FlowEngine>,
    pub calls: Arc<dyn CallProvider>,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub assets: AssetCache,
    pub store: Arc<dyn SharedStore>,
    pub sender: Arc<dyn MsgSender>,
    pub engine: Arc<dyn FlowEngine>,
    pub calls: Arc<dyn CallProvider>,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig, services: Services) -> Self {
        let assets = AssetCache::new(
            Arc::new(PgAssetLoader::new(pool.clone())),
            config.asset_cache_ttl,
        );
        Self {
            pool,
            config: Arc::new(config),
            assets,
            store: services.store,
            sender: services.sender,
            engine: services.engine,
            calls: services.calls,
        }
    }

    /// Snapshot of the org's assets, loading them off the async runtime on a miss.
    pub async fn org_assets(&self, org_id: Uuid) -> CoreResult<Arc<OrgAssets>> {
        let cache = self.assets.clone();
        task::spawn_blocking(move || cache.get(org_id)).await?
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
