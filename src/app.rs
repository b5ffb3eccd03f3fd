use std::sync::Arc;

use actix_web::web;
use sqlx::SqlitePool;

use crate::auth::{AuthConfig, AuthService};
use crate::config::AppConfig;
use crate::game::session::SessionManager;
use crate::handlers;
use crate::observability::Observability;
use crate::queue::MatchQueue;
use crate::rating::RatingService;
use crate::realtime::RealtimeHub;
use crate::reconnect::ReconnectService;
use crate::results::ResultService;

/// Shared service graph, built once and handed to every worker.
pub struct Services {
    pub config: AppConfig,
    pub pool: SqlitePool,
    pub observability: Arc<Observability>,
    pub auth: Arc<AuthService>,
    pub reconnect: Arc<ReconnectService>,
    pub hub: Arc<RealtimeHub>,
    pub rating: Arc<RatingService>,
    pub results: Arc<ResultService>,
    pub session_manager: Arc<SessionManager>,
    pub match_queue: Arc<MatchQueue>,
}

impl Services {
    pub fn build(config: AppConfig, pool: SqlitePool) -> Arc<Self> {
        let observability = Arc::new(Observability::default());
        let auth = Arc::new(AuthService::new(AuthConfig {
            token_ttl_seconds: config.auth_token_ttl_seconds,
            login_window_seconds: config.login_rate_window_seconds,
            login_max_attempts: config.login_rate_limit_max,
        }));
        let reconnect = Arc::new(ReconnectService::new());
        let hub = Arc::new(RealtimeHub::new(observability.clone()));
        let rating = Arc::new(RatingService::new(pool.clone()));
        let results = Arc::new(ResultService::new(pool.clone()));
        let session_manager = SessionManager::new(
            hub.clone(),
            results.clone(),
            config.tick_interval(),
            config.session_max_ticks,
        );
        let match_queue = MatchQueue::new(
            session_manager.clone(),
            hub.clone(),
            config.default_queue_timeout(),
        );
        Arc::new(Self {
            config,
            pool,
            observability,
            auth,
            reconnect,
            hub,
            rating,
            results,
            session_manager,
            match_queue,
        })
    }
}

/// Registers shared state and the route table on an actix `App`.
pub fn configure_app(cfg: &mut web::ServiceConfig, services: &Services) {
    cfg.app_data(web::Data::new(services.config.clone()))
        .app_data(web::Data::from(services.observability.clone()))
        .app_data(web::Data::from(services.auth.clone()))
        .app_data(web::Data::from(services.reconnect.clone()))
        .app_data(web::Data::from(services.hub.clone()))
        .app_data(web::Data::from(services.rating.clone()))
        .app_data(web::Data::from(services.session_manager.clone()))
        .app_data(web::Data::from(services.match_queue.clone()))
        .route("/api/health", web::get().to(handlers::health))
        .route("/metrics", web::get().to(handlers::metrics))
        .route("/ops/status", web::get().to(handlers::ops_status))
        .route("/api/auth/register", web::post().to(handlers::register))
        .route("/api/auth/login", web::post().to(handlers::login))
        .route("/api/auth/logout", web::post().to(handlers::logout))
        .route("/api/queue/join", web::post().to(handlers::queue_join))
        .route("/api/queue/cancel", web::post().to(handlers::queue_cancel))
        .route("/api/leaderboard", web::get().to(handlers::leaderboard))
        .route("/api/profile", web::get().to(handlers::profile))
        .route("/ws", web::get().to(handlers::ws_handler));
}
