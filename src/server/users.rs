//! Account deletion endpoint.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::json;
use tower_cookies::Cookies;

use crate::error::ApiError;
use crate::tokens::TokenKind;

use super::{clear_cookie, presented, read_tokens, respond, ApiResponse, AppState};

/// DELETE /users/{id}: remove the caller's own account and its sessions,
/// then expire both cookies.
pub(super) async fn handle_delete_account(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiError> {
    let (access, refresh) = read_tokens(&cookies);
    let closed = state
        .sessions
        .delete_account(presented(&access, &refresh), &id)?;

    cookies.add(clear_cookie(TokenKind::Access));
    cookies.add(clear_cookie(TokenKind::Refresh));

    Ok(respond(
        StatusCode::OK,
        json!({ "message": format!("Goodbye, {}! Your account has been deleted.", closed.name) }),
    ))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::testutil::{
        auth_cookies, cookie_value, empty_body, json_body, req, send, set_cookie_line, test_state,
        TestResponse,
    };
    use super::super::build_router;
    use crate::session::{SESSIONS, USERS};
    use crate::store::Filter;
    use axum::http::{header, Method, StatusCode};
    use axum::Router;
    use serde_json::json;

    async fn register(app: &Router, name: &str, email: &str) -> TestResponse {
        send(
            app,
            json_body(
                req(Method::POST, "/auth/register"),
                &json!({ "name": name, "email": email, "password": "Matrix1999!" }),
            ),
        )
        .await
    }

    #[tokio::test]
    async fn delete_own_account_removes_everything() {
        let (_tmp, state) = test_state();
        let app = build_router(state.clone());
        let registered = register(&app, "Neo", "neo@matrix.com").await;
        let user_id = registered.body["data"]["user_id"].as_str().unwrap().to_string();
        let access = cookie_value(&registered.headers, "token").unwrap();
        let refresh = cookie_value(&registered.headers, "refreshToken").unwrap();

        let res = send(
            &app,
            empty_body(
                req(Method::DELETE, &format!("/users/{user_id}"))
                    .header(header::COOKIE, auth_cookies(&access, &refresh)),
            ),
        )
        .await;
        assert_eq!(res.status, StatusCode::OK);
        assert!(res.body["message"].as_str().unwrap().contains("Neo"));
        assert!(set_cookie_line(&res.headers, "token")
            .unwrap()
            .contains("Max-Age=0"));

        assert_eq!(state.store.count(USERS, &Filter::new()).unwrap(), 0);
        assert_eq!(state.store.count(SESSIONS, &Filter::new()).unwrap(), 0);

        // The account is gone; the still-valid tokens cannot act again.
        let res = send(
            &app,
            empty_body(
                req(Method::DELETE, &format!("/users/{user_id}"))
                    .header(header::COOKIE, auth_cookies(&access, &refresh)),
            ),
        )
        .await;
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(res.body["message"], "User not found");
    }

    #[tokio::test]
    async fn deleting_another_account_is_forbidden() {
        let (_tmp, state) = test_state();
        let app = build_router(state.clone());
        let neo = register(&app, "Neo", "neo@matrix.com").await;
        let smith = register(&app, "Agent Smith", "smith@matrix.com").await;
        let smith_id = smith.body["data"]["user_id"].as_str().unwrap().to_string();
        let access = cookie_value(&neo.headers, "token").unwrap();
        let refresh = cookie_value(&neo.headers, "refreshToken").unwrap();

        let res = send(
            &app,
            empty_body(
                req(Method::DELETE, &format!("/users/{smith_id}"))
                    .header(header::COOKIE, auth_cookies(&access, &refresh)),
            ),
        )
        .await;
        assert_eq!(res.status, StatusCode::FORBIDDEN);
        assert_eq!(res.body["message"], "You can only delete your own account");

        // Nothing was deleted.
        assert_eq!(state.store.count(USERS, &Filter::new()).unwrap(), 2);
        assert_eq!(state.store.count(SESSIONS, &Filter::new()).unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_requires_both_cookies() {
        let (_tmp, state) = test_state();
        let app = build_router(state);

        let res = send(&app, empty_body(req(Method::DELETE, "/users/someone"))).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body["message"], "Missing token cookie");
    }

    #[tokio::test]
    async fn delete_with_garbage_tokens_is_unauthorized() {
        let (_tmp, state) = test_state();
        let app = build_router(state);

        // Verification fails before ownership is ever considered, so this
        // is a 401 rather than the authorization 403.
        let res = send(
            &app,
            empty_body(
                req(Method::DELETE, "/users/someone")
                    .header(header::COOKIE, auth_cookies("garbage", "garbage")),
            ),
        )
        .await;
        assert_eq!(res.status, StatusCode::UNAUTHORIZED);
        assert_eq!(res.body["message"], "Invalid token");
    }
}
