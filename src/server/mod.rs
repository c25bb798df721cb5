//! Axum HTTP server: routing, shared state, and the response envelope.
//!
//! - Proper HTTP/1.1 parsing and compliance (hyper)
//! - Request body size limits (64KB max) and request timeouts (30s)
//! - Cookie transport for the token pair (tower-cookies)
//! - Every response is JSON with a top-level `status` field mirroring the
//!   HTTP status code, including the 404/405 fallbacks
//!
//! Handlers live in the `auth`, `catalog`, and `users` submodules; this
//! module owns the router, the middleware stack, and the helpers they
//! share.

mod auth;
mod catalog;
mod users;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_cookies::cookie::SameSite;
use tower_cookies::{Cookie, CookieManagerLayer, Cookies};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::error::ApiError;
use crate::session::{self, PresentedTokens, SessionManager};
use crate::store::{DocumentStore, Page, StoreError, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::tokens::{TokenCodec, TokenKind};

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Concrete return type for handlers (avoids `impl IntoResponse` inference
/// issues).
pub(crate) type ApiResponse = (StatusCode, Json<Value>);

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub sessions: Arc<SessionManager>,
    /// Whether issued cookies carry the `Secure` attribute.
    pub cookie_secure: bool,
}

/// Register the five collections and the unique indexes the session layer
/// relies on. Idempotent; runs at every startup.
pub fn seed_collections(store: &DocumentStore) -> Result<(), StoreError> {
    for name in [
        session::USERS,
        session::SESSIONS,
        catalog::MOVIES,
        catalog::THEATERS,
        catalog::COMMENTS,
    ] {
        store.ensure_collection(name)?;
    }
    store.ensure_unique_field(session::USERS, "email")?;
    store.ensure_unique_field(session::SESSIONS, "user_id")?;
    Ok(())
}

/// Build the application router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // ── CORS — allow browser clients from any origin ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/login", post(auth::handle_login))
        .route("/auth/register", post(auth::handle_register))
        .route("/auth/logout", post(auth::handle_logout))
        .route("/auth/refresh-token", get(auth::handle_refresh))
        .route("/users/{id}", delete(users::handle_delete_account))
        .route(
            "/movies",
            get(catalog::handle_movies_list).post(catalog::handle_movie_create),
        )
        .route(
            "/movies/{id}",
            get(catalog::handle_movie_get)
                .put(catalog::handle_movie_update)
                .delete(catalog::handle_movie_delete),
        )
        .route(
            "/theaters",
            get(catalog::handle_theaters_list).post(catalog::handle_theater_create),
        )
        .route(
            "/theaters/{id}",
            get(catalog::handle_theater_get)
                .put(catalog::handle_theater_update)
                .delete(catalog::handle_theater_delete),
        )
        .route(
            "/movies/{movie_id}/comments",
            get(catalog::handle_comments_list).post(catalog::handle_comment_create),
        )
        .route(
            "/movies/{movie_id}/comments/{comment_id}",
            get(catalog::handle_comment_get)
                .put(catalog::handle_comment_update)
                .delete(catalog::handle_comment_delete),
        )
        .fallback(handle_not_found)
        .method_not_allowed_fallback(handle_method_not_allowed)
        .with_state(state)
        .layer(CookieManagerLayer::new())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Open the store, seed collections, and serve until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let store = Arc::new(DocumentStore::open(Path::new(&config.store.path))?);
    seed_collections(&store)?;
    tracing::info!(path = %config.store.path, "document store ready");

    let codec = TokenCodec::new(&config.auth.access_secret, &config.auth.refresh_secret)?;
    let sessions = Arc::new(SessionManager::new(Arc::clone(&store), codec));
    let state = AppState {
        store,
        sessions,
        cookie_secure: config.server.cookie_secure,
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();
    let display_addr = format!("{}:{}", config.server.host, actual_port);

    println!("🎬 Marquee API listening on http://{display_addr}");
    println!("  POST   /auth/login          — {{\"email\", \"password\"}}, sets token cookies");
    println!("  POST   /auth/register       — {{\"name\", \"email\", \"password\"}}");
    println!("  POST   /auth/logout         — requires token + refreshToken cookies");
    println!("  GET    /auth/refresh-token  — re-issues the access token");
    println!("  DELETE /users/{{id}}          — delete your own account");
    println!("  CRUD   /movies, /theaters, /movies/{{id}}/comments");
    println!("  GET    /health              — health check");
    println!("  Press Ctrl+C to stop.\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    println!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
    }
}

// ── Response Envelope ───────────────────────────────────────────────

/// Wrap a JSON object into the response envelope, stamping the `status`
/// field with the HTTP status code.
pub(crate) fn respond(status: StatusCode, mut body: Value) -> ApiResponse {
    if let Value::Object(ref mut map) = body {
        map.insert("status".to_string(), json!(status.as_u16()));
    }
    (status, Json(body))
}

/// GET /health, always public.
async fn handle_health(State(state): State<AppState>) -> ApiResponse {
    let store = match state.store.collection_exists(session::USERS) {
        Ok(_) => "ok",
        Err(_) => "unreachable",
    };
    respond(StatusCode::OK, json!({ "data": { "store": store } }))
}

/// Fallback for unknown paths.
async fn handle_not_found() -> ApiError {
    ApiError::not_found("Resource not found")
}

/// Fallback for known paths hit with an unsupported method.
async fn handle_method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

// ── Pagination ──────────────────────────────────────────────────────

/// Raw `?limit=&page=` query input. Parsed wide so out-of-range values can
/// be reported instead of rejected by deserialization.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<i64>,
    page: Option<i64>,
}

impl ListQuery {
    /// Validate the requested window. Out-of-range input is a client
    /// error here, never silently clamped.
    pub(crate) fn validate(&self) -> Result<Page, ApiError> {
        let limit = match self.limit {
            None => DEFAULT_PAGE_LIMIT,
            Some(l) if (1..=i64::from(MAX_PAGE_LIMIT)).contains(&l) => l as u32,
            Some(_) => {
                return Err(ApiError::validation(format!(
                    "limit must be between 1 and {MAX_PAGE_LIMIT}"
                )))
            }
        };
        let page = match self.page {
            None => 1,
            Some(p) if p >= 1 => u32::try_from(p).unwrap_or(u32::MAX),
            Some(_) => return Err(ApiError::validation("page must be 1 or greater")),
        };
        Ok(Page { limit, page })
    }
}

// ── Cookies ─────────────────────────────────────────────────────────

/// Build the Set-Cookie for a freshly issued token. Max-Age matches the
/// token's own TTL.
pub(crate) fn token_cookie(kind: TokenKind, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((kind.cookie_name(), value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(time::Duration::seconds(kind.ttl().as_secs() as i64))
        .build()
}

/// Build a removal cookie (immediate expiry).
pub(crate) fn clear_cookie(kind: TokenKind) -> Cookie<'static> {
    Cookie::build((kind.cookie_name(), ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
}

/// Read both token cookies off the request, untouched and unverified.
pub(crate) fn read_tokens(cookies: &Cookies) -> (Option<String>, Option<String>) {
    let access = cookies
        .get(TokenKind::Access.cookie_name())
        .map(|c| c.value().to_string());
    let refresh = cookies
        .get(TokenKind::Refresh.cookie_name())
        .map(|c| c.value().to_string());
    (access, refresh)
}

/// Borrow the cookie pair for the session layer.
pub(crate) fn presented<'a>(
    access: &'a Option<String>,
    refresh: &'a Option<String>,
) -> PresentedTokens<'a> {
    PresentedTokens {
        access: access.as_deref(),
        refresh: refresh.as_deref(),
    }
}

// ── Test Scaffolding ────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, Request};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub(crate) struct TestResponse {
        pub status: StatusCode,
        pub headers: HeaderMap,
        pub body: Value,
    }

    pub(crate) fn test_state() -> (TempDir, AppState) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(DocumentStore::open(&tmp.path().join("api.db")).unwrap());
        seed_collections(&store).unwrap();
        let codec =
            TokenCodec::new("access-secret-for-tests", "refresh-secret-for-tests").unwrap();
        let sessions = Arc::new(SessionManager::new(Arc::clone(&store), codec));
        let state = AppState {
            store,
            sessions,
            cookie_secure: false,
        };
        (tmp, state)
    }

    pub(crate) fn test_app() -> (TempDir, Router) {
        let (tmp, state) = test_state();
        (tmp, build_router(state))
    }

    pub(crate) async fn send(app: &Router, request: Request<Body>) -> TestResponse {
        let response = app.clone().oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        TestResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    pub(crate) fn req(method: Method, uri: &str) -> axum::http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    pub(crate) fn json_body(
        builder: axum::http::request::Builder,
        body: &Value,
    ) -> Request<Body> {
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub(crate) fn empty_body(builder: axum::http::request::Builder) -> Request<Body> {
        builder.body(Body::empty()).unwrap()
    }

    /// Format a Cookie request header carrying both tokens.
    pub(crate) fn auth_cookies(access: &str, refresh: &str) -> String {
        format!("token={access}; refreshToken={refresh}")
    }

    /// Pull a cookie value out of the Set-Cookie response headers.
    pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
        for raw in headers.get_all(header::SET_COOKIE) {
            let raw = raw.to_str().ok()?;
            let pair = raw.split(';').next().unwrap_or("");
            if let Some((key, value)) = pair.split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    /// The full Set-Cookie line for a cookie, attributes included.
    pub(crate) fn set_cookie_line(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|raw| raw.to_str().ok())
            .find(|raw| raw.starts_with(&format!("{name}=")))
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{empty_body, req, send, test_app};
    use super::*;
    use axum::http::Method;

    #[test]
    fn security_body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }

    #[test]
    fn security_timeout_is_30_seconds() {
        assert_eq!(REQUEST_TIMEOUT_SECS, 30);
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[tokio::test]
    async fn health_reports_store_state() {
        let (_tmp, app) = test_app();

        let res = send(&app, empty_body(req(Method::GET, "/health"))).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["status"], 200);
        assert_eq!(res.body["data"]["store"], "ok");
    }

    #[tokio::test]
    async fn unknown_path_is_a_json_404() {
        let (_tmp, app) = test_app();

        let res = send(&app, empty_body(req(Method::GET, "/no-such-route"))).await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(res.body["status"], 404);
        assert_eq!(res.body["message"], "Resource not found");
    }

    #[tokio::test]
    async fn wrong_method_is_a_json_405() {
        let (_tmp, app) = test_app();

        let res = send(&app, empty_body(req(Method::DELETE, "/auth/login"))).await;
        assert_eq!(res.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.body["status"], 405);
        assert_eq!(res.body["message"], "Method not allowed");
    }

    #[tokio::test]
    async fn list_limit_is_bounded_not_clamped() {
        let (_tmp, app) = test_app();

        for uri in ["/movies?limit=0", "/movies?limit=51", "/movies?limit=-3"] {
            let res = send(&app, empty_body(req(Method::GET, uri))).await;
            assert_eq!(res.status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(res.body["message"], "limit must be between 1 and 50");
        }
    }

    #[tokio::test]
    async fn list_page_must_be_positive() {
        let (_tmp, app) = test_app();

        let res = send(&app, empty_body(req(Method::GET, "/theaters?page=0"))).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body["message"], "page must be 1 or greater");
    }

    #[tokio::test]
    async fn non_numeric_pagination_is_rejected() {
        let (_tmp, app) = test_app();

        let res = send(&app, empty_body(req(Method::GET, "/movies?limit=ten"))).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body["status"], 400);
    }

    #[test]
    fn list_query_defaults_apply() {
        let query = ListQuery::default();
        let page = query.validate().unwrap();
        assert_eq!(page.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(page.page, 1);
    }

    #[test]
    fn token_cookie_carries_the_contract_attributes() {
        let cookie = token_cookie(TokenKind::Access, "abc".into(), true);
        let line = cookie.to_string();
        assert!(line.starts_with("token=abc"));
        assert!(line.contains("HttpOnly"));
        assert!(line.contains("Secure"));
        assert!(line.contains("SameSite=Strict"));
        assert!(line.contains("Max-Age=900"));

        let cleared = clear_cookie(TokenKind::Refresh).to_string();
        assert!(cleared.starts_with("refreshToken="));
        assert!(cleared.contains("Max-Age=0"));
    }
}
