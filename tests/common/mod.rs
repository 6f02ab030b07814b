use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use mailroom::assets::Channel;
use mailroom::config::{AppConfig, RetryConfig};
use mailroom::db::{self, PgPool};
use mailroom::delivery::{DeliveryError, MsgSender, SendOutcome};
use mailroom::flows::{EngineError, FlowEngine, FlowStart, FlowStartResult};
use mailroom::ivr::{CallError, CallOutcome, CallProvider};
use mailroom::models::{Job, Msg};
use mailroom::routes;
use mailroom::shared::MemoryStore;
use mailroom::state::{AppState, Services};
use mailroom::{default_handlers, Worker};
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Accepts every message and remembers what it was asked to send.
#[derive(Default)]
pub struct FakeSender {
    sent: std::sync::Mutex<Vec<Uuid>>,
}

#[async_trait]
impl MsgSender for FakeSender {
    async fn send(&self, _channel: &Channel, msg: &Msg) -> Result<SendOutcome, DeliveryError> {
        self.sent.lock().unwrap().push(msg.id);
        Ok(SendOutcome::Accepted {
            external_id: Some(format!("ext-{}", msg.id)),
        })
    }
}

impl FakeSender {
    #[allow(dead_code)]
    pub fn sent(&self) -> Vec<Uuid> {
        self.sent.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeEngine {
    starts: std::sync::Mutex<Vec<FlowStart>>,
    failing: AtomicBool,
}

#[async_trait]
impl FlowEngine for FakeEngine {
    async fn start_flow(&self, start: &FlowStart) -> Result<FlowStartResult, EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "engine down".to_string(),
            });
        }
        self.starts.lock().unwrap().push(start.clone());
        Ok(FlowStartResult {
            session_ids: start.contact_ids.iter().map(|_| Uuid::new_v4()).collect(),
            broadcasts: vec![],
        })
    }
}

impl FakeEngine {
    #[allow(dead_code)]
    pub fn starts(&self) -> Vec<FlowStart> {
        self.starts.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeCalls {
    hangups: std::sync::Mutex<Vec<String>>,
    failing: AtomicBool,
}

#[async_trait]
impl CallProvider for FakeCalls {
    async fn request_call(
        &self,
        _channel: &Channel,
        connection_id: Uuid,
        _urn: &str,
    ) -> Result<CallOutcome, CallError> {
        Ok(CallOutcome::Accepted {
            external_id: format!("call-{connection_id}"),
        })
    }

    async fn hangup(&self, _channel: &Channel, external_id: &str) -> Result<(), CallError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CallError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: "provider down".to_string(),
            });
        }
        self.hangups.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}

impl FakeCalls {
    #[allow(dead_code)]
    pub fn hangups(&self) -> Vec<String> {
        self.hangups.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

/// Ids of the rows created by [`TestApp::seed_org`].
#[allow(dead_code)]
pub struct Seeded {
    pub org_id: Uuid,
    pub channel_id: Uuid,
    pub group_id: Uuid,
    pub flow_id: Uuid,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    pub sender: Arc<FakeSender>,
    pub engine: Arc<FakeEngine>,
    pub calls: Arc<FakeCalls>,
}

impl TestApp {
    /// `None` when no test database is configured, in which case the test is skipped.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return Ok(None);
        };

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            redis_url: None,
            flow_engine_url: "http://engine.invalid".to_string(),
            courier_url: "http://courier.invalid".to_string(),
            ivr_url: "http://ivr.invalid".to_string(),
            asset_cache_ttl: Duration::from_secs(60),
            task_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let sender = Arc::new(FakeSender::default());
        let engine = Arc::new(FakeEngine::default());
        let calls = Arc::new(FakeCalls::default());
        let services = Services {
            store: Arc::new(MemoryStore::new()),
            sender: sender.clone(),
            engine: engine.clone(),
            calls: calls.clone(),
        };
        let state = AppState::new(pool, config, services);
        let router = routes::create_router(state.clone());

        Ok(Some(Self {
            state,
            router,
            sender,
            engine,
            calls,
        }))
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    /// An org with one tel channel, one group and one active flow.
    pub async fn seed_org(&self) -> Result<Seeded> {
        let seeded = Seeded {
            org_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
        };
        let sql = format!(
            "INSERT INTO orgs (id, name, default_language, allowed_languages) VALUES ('{org}', 'Nyaruka', 'eng', '{{eng,spa}}');
             INSERT INTO channels (id, org_id, name, channel_type, schemes, roles) VALUES ('{channel}', '{org}', 'Twilio', 'T', '{{tel}}', 'SR');
             INSERT INTO contact_groups (id, org_id, name) VALUES ('{group}', '{org}', 'Reporters');
             INSERT INTO flows (id, org_id, name) VALUES ('{flow}', '{org}', 'Registration');",
            org = seeded.org_id,
            channel = seeded.channel_id,
            group = seeded.group_id,
            flow = seeded.flow_id,
        );
        self.execute(sql).await?;
        Ok(seeded)
    }

    /// A contact with a single tel URN. Returns `(contact_id, urn_id)`.
    pub async fn seed_contact(&self, org_id: Uuid, name: &str, phone: &str) -> Result<(Uuid, Uuid)> {
        let contact_id = Uuid::new_v4();
        let urn_id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO contacts (id, org_id, name, language) VALUES ('{contact_id}', '{org_id}', '{name}', 'eng');
             INSERT INTO contact_urns (id, org_id, contact_id, scheme, path, identity)
             VALUES ('{urn_id}', '{org_id}', '{contact_id}', 'tel', '{phone}', 'tel:{phone}');"
        );
        self.execute(sql).await?;
        Ok((contact_id, urn_id))
    }

    pub async fn execute(&self, sql: String) -> Result<()> {
        self.with_conn(move |conn| {
            conn.batch_execute(&sql).context("failed to run seed sql")?;
            Ok(())
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn worker_tick(&self) -> Result<bool> {
        let worker = Worker::new(
            Arc::new(self.state.clone()),
            default_handlers(),
            Duration::from_millis(10),
        );
        worker.tick().await.map_err(|err| anyhow!("worker tick failed: {err}"))
    }

    /// Runs queued jobs until none are left or `limit` jobs ran.
    #[allow(dead_code)]
    pub async fn drain_jobs(&self, limit: usize) -> Result<usize> {
        let mut ran = 0;
        while ran < limit && self.worker_tick().await? {
            ran += 1;
        }
        Ok(ran)
    }

    #[allow(dead_code)]
    pub async fn jobs_by_type(&self, ty: &str) -> Result<Vec<Job>> {
        let ty = ty.to_string();
        self.with_conn(move |conn| {
            use mailroom::schema::jobs::dsl::{job_type as job_type_col, jobs as jobs_table};
            let rows = jobs_table
                .filter(job_type_col.eq(&ty))
                .load::<Job>(conn)
                .context("failed to load jobs")?;
            Ok(rows)
        })
        .await
    }

    #[allow(dead_code)]
    pub async fn msgs_for(&self, org_id: Uuid) -> Result<Vec<Msg>> {
        self.with_conn(move |conn| {
            use mailroom::schema::msgs;
            msgs::table
                .filter(msgs::org_id.eq(org_id))
                .order(msgs::created_on.asc())
                .load::<Msg>(conn)
                .context("failed to load msgs")
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str) -> Result<hyper::Response<Body>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

#[allow(dead_code)]
pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE jobs, flow_sessions, msgs, channel_connections, broadcasts, topups, globals, \
         templates, event_fires, campaign_events, campaigns, triggers, flows, contact_group_members, \
         contact_urns, contacts, contact_groups, channels, orgs RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
