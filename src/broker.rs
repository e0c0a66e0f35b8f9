use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::TokenStore;
use crate::config::Config;
use crate::db::{Db, DbError, recover};
use crate::error::{ApiError, RequestError};
use crate::fanout::Fanout;
use crate::metrics::BrokerMetrics;
use crate::queue::PriorityQueue;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::rooms::RoomEngine;
use crate::router::MessageCore;
use crate::ttl::ExpiryIndex;

/// All broker-owned state. There is no module-level state anywhere; every
/// shared collection hangs off this value, whose lifecycle is
/// init → run → graceful shutdown.
pub struct Broker {
    pub config: Config,
    pub db: Arc<Db>,
    pub registry: Arc<SessionRegistry>,
    pub expiry: Arc<ExpiryIndex>,
    pub metrics: Arc<BrokerMetrics>,
    pub core: Arc<MessageCore>,
    pub fanout: Arc<Fanout>,
    pub engine: Arc<RoomEngine>,
    pub tokens: Arc<TokenStore>,
    pub limiter: RateLimiter,
    pub shutdown: broadcast::Sender<()>,
    pub started_at: String,
}

impl Broker {
    /// Open the store, recover persisted state, and wire the components
    /// together. Store failures here are fatal (exit code 2 territory).
    pub fn init(config: Config) -> Result<Arc<Broker>, DbError> {
        let db = Arc::new(Db::open(&config.db_path())?);
        let recovered = recover(&db).map_err(DbError::Open)?;

        let registry = Arc::new(SessionRegistry::new(
            config.max_connections,
            config.max_connections_per_client,
        ));
        let metrics = Arc::new(BrokerMetrics::new());
        let expiry = Arc::new(ExpiryIndex::new());
        let queue = Arc::new(PriorityQueue::with_defaults());
        let core = Arc::new(MessageCore::new(
            db.clone(),
            registry.clone(),
            queue,
            expiry.clone(),
            metrics.clone(),
        ));
        let fanout = Arc::new(Fanout::new(registry.clone(), metrics.clone()));
        let tokens = Arc::new(TokenStore::new(recovered.tokens.clone()));
        let engine = Arc::new(RoomEngine::new(
            db.clone(),
            fanout.clone(),
            core.clone(),
            config.code_exec_enabled,
            config.sandbox_endpoint.clone(),
        ));
        engine.hydrate(recovered);

        let limiter = RateLimiter::new(config.rate_limit_per_minute);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Arc::new(Broker {
            config,
            db,
            registry,
            expiry,
            metrics,
            core,
            fanout,
            engine,
            tokens,
            limiter,
            shutdown,
            started_at: chrono::Utc::now().to_rfc3339(),
        }))
    }

    /// Wrap an error for a specific request, counting it by taxonomy code.
    pub fn request_error(&self, error: ApiError, request_id: &str) -> RequestError {
        self.metrics.record_error(error.code());
        RequestError::new(error, request_id)
    }

    /// Stop background workers; live socket loops observe the same signal
    /// and announce server_shutdown to their clients.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
