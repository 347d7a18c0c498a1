use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use chatvault_access::{AdminService, ScopeResolver};
use chatvault_bridge::RealtimeBridge;
use chatvault_core::config::ChatvaultConfig;
use chatvault_sessions::SessionManager;
use chatvault_storage::StorageAdapter;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::avatar::AvatarCache;
use crate::ws::broadcast::ConnRegistry;

/// Central shared state — passed as `Arc<AppState>` to every Axum handler.
pub struct AppState {
    pub config: ChatvaultConfig,
    pub storage: Arc<dyn StorageAdapter>,
    pub scope: Arc<ScopeResolver>,
    pub sessions: Arc<SessionManager>,
    pub admin: Arc<AdminService>,
    pub bridge: Arc<RealtimeBridge>,
    pub ws_registry: ConnRegistry,
    pub avatar_cache: AvatarCache,
    pub media_root: PathBuf,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChatvaultConfig,
        storage: Arc<dyn StorageAdapter>,
        scope: Arc<ScopeResolver>,
        sessions: Arc<SessionManager>,
        admin: Arc<AdminService>,
        bridge: Arc<RealtimeBridge>,
    ) -> Self {
        let media_root = PathBuf::from(&config.media.root);
        Self {
            config,
            storage,
            scope,
            sessions,
            admin,
            bridge,
            ws_registry: ConnRegistry::new(),
            avatar_cache: AvatarCache::new(),
            media_root,
        }
    }
}

/// CSP allowing the front-end's own origin plus whatever CDNs it declares
/// for scripts/styles/fonts. The front-end bundle itself is out of scope
/// for this service (§1), so the allow-list stays conservative.
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; font-src 'self' data:; img-src 'self' data: blob:; connect-src 'self' ws: wss:";

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
    }
}

/// Assemble the full Axum router: the 26-endpoint surface from the external
/// interfaces table, with security headers, CORS, and request tracing.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{admin, auth_routes, chats, health, media, push, stats};

    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/auth/check", get(auth_routes::check_handler))
        .route("/api/login", post(auth_routes::login_handler))
        .route("/api/logout", post(auth_routes::logout_handler))
        .route("/api/chats", get(chats::list_chats_handler))
        .route("/api/chats/{id}/messages", get(chats::chat_messages_handler))
        .route("/api/chats/{id}/pinned", get(chats::pinned_handler))
        .route("/api/folders", get(chats::folders_handler))
        .route("/api/chats/{id}/topics", get(chats::topics_handler))
        .route("/api/archived/count", get(chats::archived_count_handler))
        .route("/api/stats", get(stats::stats_handler))
        .route("/api/stats/refresh", post(stats::refresh_stats_handler))
        .route(
            "/api/chats/{id}/messages/by-date",
            get(chats::messages_by_date_handler),
        )
        .route("/api/chats/{id}/export", get(chats::export_handler))
        .route("/api/chats/{id}/stats", get(chats::chat_stats_handler))
        .route("/api/push/config", get(push::config_handler))
        .route("/api/push/subscribe", post(push::subscribe_handler))
        .route("/api/push/unsubscribe", post(push::unsubscribe_handler))
        .route("/internal/push", post(push::internal_push_handler))
        .route("/api/admin/viewers", get(admin::list_viewers_handler).post(admin::create_viewer_handler))
        .route(
            "/api/admin/viewers/{id}",
            put(admin::update_viewer_handler).delete(admin::delete_viewer_handler),
        )
        .route("/api/admin/audit", get(admin::audit_log_handler))
        .route("/api/admin/chats", get(admin::admin_chats_handler))
        .route("/ws/updates", get(crate::ws::connection::ws_handler))
        .route("/media/{*path}", get(media::media_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
}
