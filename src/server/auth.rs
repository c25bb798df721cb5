//! Authentication endpoints: login, register, logout, and token refresh.
//!
//! Cookie writing stays up here in the handler layer; the session rules
//! themselves live in [`crate::session`]. The refresh endpoint remaps an
//! unverifiable refresh token to 403 instead of the taxonomy's 401.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::json;
use tower_cookies::Cookies;

use crate::error::ApiError;
use crate::session::SessionError;
use crate::tokens::TokenKind;

use super::{clear_cookie, presented, read_tokens, respond, token_cookie, ApiResponse, AppState};

#[derive(Deserialize)]
pub(super) struct LoginBody {
    email: String,
    password: String,
}

#[derive(Deserialize)]
pub(super) struct RegisterBody {
    name: String,
    email: String,
    password: String,
}

/// POST /auth/login: authenticate and set both token cookies.
pub(super) async fn handle_login(
    State(state): State<AppState>,
    cookies: Cookies,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let Json(body) = body.map_err(|_| {
        ApiError::validation("Invalid JSON body. Expected: {\"email\": \"...\", \"password\": \"...\"}")
    })?;

    let (access, _) = read_tokens(&cookies);
    let issued = state
        .sessions
        .login(&body.email, &body.password, access.as_deref())?;

    cookies.add(token_cookie(
        TokenKind::Access,
        issued.access_token.clone(),
        state.cookie_secure,
    ));
    cookies.add(token_cookie(
        TokenKind::Refresh,
        issued.refresh_token.clone(),
        state.cookie_secure,
    ));

    Ok(respond(
        StatusCode::OK,
        json!({
            "message": format!("Welcome back, {}!", issued.name),
            "data": {
                "user_id": issued.user_id.as_str(),
                "name": issued.name,
                "email": issued.email,
            },
        }),
    ))
}

/// POST /auth/register: create an account and open its first session.
pub(super) async fn handle_register(
    State(state): State<AppState>,
    cookies: Cookies,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let Json(body) = body.map_err(|_| {
        ApiError::validation(
            "Invalid JSON body. Expected: {\"name\": \"...\", \"email\": \"...\", \"password\": \"...\"}",
        )
    })?;

    let issued = state
        .sessions
        .register(&body.name, &body.email, &body.password)?;

    cookies.add(token_cookie(
        TokenKind::Access,
        issued.access_token.clone(),
        state.cookie_secure,
    ));
    cookies.add(token_cookie(
        TokenKind::Refresh,
        issued.refresh_token.clone(),
        state.cookie_secure,
    ));

    Ok(respond(
        StatusCode::CREATED,
        json!({
            "message": format!("Welcome, {}! Your account has been created.", issued.name),
            "data": {
                "user_id": issued.user_id.as_str(),
                "name": issued.name,
                "email": issued.email,
            },
        }),
    ))
}

/// POST /auth/logout: close the session and expire both cookies.
pub(super) async fn handle_logout(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<ApiResponse, ApiError> {
    let (access, refresh) = read_tokens(&cookies);
    let closed = state.sessions.logout(presented(&access, &refresh))?;

    cookies.add(clear_cookie(TokenKind::Access));
    cookies.add(clear_cookie(TokenKind::Refresh));

    Ok(respond(
        StatusCode::OK,
        json!({ "message": format!("Goodbye, {}!", closed.name) }),
    ))
}

/// GET /auth/refresh-token: re-issue the access token cookie. The
/// refresh token itself is not rotated.
pub(super) async fn handle_refresh(
    State(state): State<AppState>,
    cookies: Cookies,
) -> Result<ApiResponse, ApiError> {
    let (access, refresh) = read_tokens(&cookies);
    let refreshed = state
        .sessions
        .refresh(presented(&access, &refresh))
        .map_err(|err| {
            // An unverifiable refresh token answers 403 here, not 401.
            if matches!(err, SessionError::InvalidRefreshToken(_)) {
                ApiError::forbidden(err.to_string())
            } else {
                ApiError::from(err)
            }
        })?;

    cookies.add(token_cookie(
        TokenKind::Access,
        refreshed.access_token.clone(),
        state.cookie_secure,
    ));

    Ok(respond(StatusCode::OK, json!({ "message": "Token refreshed" })))
}

// ── Tests ───────────────────────────────────────────────────────────
