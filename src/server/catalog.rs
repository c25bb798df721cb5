//! Catalog endpoints: movies, theaters, and the comments nested under a
//! movie.
//!
//! Movies and theaters share one set of CRUD cores parameterized by
//! collection and label. One inherited quirk is kept on purpose: a
//! single GET for a well-formed but unknown movie or theater id answers
//! 200 with empty data and a "not found" message, while the same miss on
//! a comment answers a plain 404.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Map, Value};

use crate::error::ApiError;
use crate::store::{DocId, Document, Filter, UpdateOutcome};

use super::{respond, ApiResponse, AppState, ListQuery};

/// Collection holding movie documents.
pub(crate) const MOVIES: &str = "movies";

/// Collection holding theater documents.
pub(crate) const THEATERS: &str = "theaters";

/// Collection holding comment documents, each tied to a movie.
pub(crate) const COMMENTS: &str = "comments";

// ── Shared Cores ────────────────────────────────────────────────────

fn guard_collection(state: &AppState, name: &str) -> Result<(), ApiError> {
    if !state.store.collection_exists(name)? {
        return Err(ApiError::not_found(format!(
            "Collection '{name}' does not exist"
        )));
    }
    Ok(())
}

/// Reject anything that is not a non-empty JSON object, and any attempt
/// to write a server-controlled field.
fn validate_body(
    body: Result<Json<Value>, JsonRejection>,
    reserved: &[&str],
) -> Result<Map<String, Value>, ApiError> {
    let Json(value) = body.map_err(|_| ApiError::validation("Invalid JSON body"))?;
    let Value::Object(map) = value else {
        return Err(ApiError::validation("Request body must be a JSON object"));
    };
    if map.is_empty() {
        return Err(ApiError::validation("Request body cannot be empty"));
    }
    for field in reserved {
        if map.contains_key(*field) {
            return Err(ApiError::validation(format!(
                "Field '{field}' is server-controlled"
            )));
        }
    }
    Ok(map)
}

fn list_documents(
    state: &AppState,
    collection: &str,
    query: Result<Query<ListQuery>, QueryRejection>,
    filter: &Filter,
) -> Result<ApiResponse, ApiError> {
    let Query(query) = query.map_err(|_| ApiError::validation("Invalid pagination parameters"))?;
    let page = query.validate()?;
    guard_collection(state, collection)?;

    let docs = state.store.find_many(collection, filter, page)?;
    let total = state.store.count(collection, filter)?;
    let data: Vec<Value> = docs.into_iter().map(Document::into_json).collect();
    Ok(respond(
        StatusCode::OK,
        json!({
            "data": data,
            "page": page.page,
            "limit": page.limit,
            "total": total,
        }),
    ))
}

/// Single-entity GET for movies and theaters: an unknown id is a 200
/// with empty data, not a 404.
fn fetch_single_soft(
    state: &AppState,
    collection: &str,
    raw_id: &str,
    label: &str,
) -> Result<ApiResponse, ApiError> {
    let id = DocId::parse(raw_id)?;
    guard_collection(state, collection)?;
    match state.store.find_one(collection, &Filter::id(&id))? {
        Some(doc) => Ok(respond(StatusCode::OK, json!({ "data": doc.into_json() }))),
        None => Ok(respond(
            StatusCode::OK,
            json!({ "data": {}, "message": format!("{label} not found") }),
        )),
    }
}

fn create_document(
    state: &AppState,
    collection: &str,
    body: Result<Json<Value>, JsonRejection>,
    label: &str,
) -> Result<ApiResponse, ApiError> {
    let map = validate_body(body, &["id"])?;
    guard_collection(state, collection)?;

    let id = state.store.insert_one(collection, map.clone())?;
    tracing::info!(collection, id = %id, "document created");
    let doc = Document { id, body: map };
    Ok(respond(
        StatusCode::CREATED,
        json!({ "message": format!("{label} created"), "data": doc.into_json() }),
    ))
}

fn update_document(
    state: &AppState,
    collection: &str,
    filter: &Filter,
    body: Result<Json<Value>, JsonRejection>,
    reserved: &[&str],
    label: &str,
) -> Result<ApiResponse, ApiError> {
    let patch = validate_body(body, reserved)?;
    guard_collection(state, collection)?;

    let outcome = state.store.update_one(collection, filter, &patch, false)?;
    if outcome == UpdateOutcome::NoMatch {
        return Err(ApiError::not_found(format!("{label} not found")));
    }
    let doc = state
        .store
        .find_one(collection, filter)?
        .ok_or_else(|| ApiError::internal(format!("{label} vanished mid-update")))?;
    Ok(respond(
        StatusCode::OK,
        json!({ "message": format!("{label} updated"), "data": doc.into_json() }),
    ))
}

fn delete_document(
    state: &AppState,
    collection: &str,
    filter: &Filter,
    label: &str,
) -> Result<ApiResponse, ApiError> {
    guard_collection(state, collection)?;
    let deleted = state.store.delete_one(collection, filter)?;
    if deleted == 0 {
        return Err(ApiError::not_found(format!("{label} not found")));
    }
    tracing::info!(collection, "document deleted");
    Ok(respond(
        StatusCode::OK,
        json!({ "message": format!("{label} deleted") }),
    ))
}

// ── Movies ──────────────────────────────────────────────────────────

pub(super) async fn handle_movies_list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<ApiResponse, ApiError> {
    list_documents(&state, MOVIES, query, &Filter::new())
}

pub(super) async fn handle_movie_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiError> {
    fetch_single_soft(&state, MOVIES, &id, "Movie")
}

pub(super) async fn handle_movie_create(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    create_document(&state, MOVIES, body, "Movie")
}

pub(super) async fn handle_movie_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let id = DocId::parse(&id)?;
    update_document(&state, MOVIES, &Filter::id(&id), body, &["id"], "Movie")
}

pub(super) async fn handle_movie_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiError> {
    let id = DocId::parse(&id)?;
    delete_document(&state, MOVIES, &Filter::id(&id), "Movie")
}

// ── Theaters ────────────────────────────────────────────────────────

pub(super) async fn handle_theaters_list(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<ApiResponse, ApiError> {
    list_documents(&state, THEATERS, query, &Filter::new())
}

pub(super) async fn handle_theater_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiError> {
    fetch_single_soft(&state, THEATERS, &id, "Theater")
}

pub(super) async fn handle_theater_create(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    create_document(&state, THEATERS, body, "Theater")
}

pub(super) async fn handle_theater_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let id = DocId::parse(&id)?;
    update_document(&state, THEATERS, &Filter::id(&id), body, &["id"], "Theater")
}

pub(super) async fn handle_theater_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiError> {
    let id = DocId::parse(&id)?;
    delete_document(&state, THEATERS, &Filter::id(&id), "Theater")
}

// ── Comments ────────────────────────────────────────────────────────

pub(super) async fn handle_comments_list(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<ApiResponse, ApiError> {
    // A movie with no comments and a movie that does not exist both
    // answer an empty page here.
    let movie_id = DocId::parse(&movie_id)?;
    let filter = Filter::new().eq("movie_id", movie_id.as_str());
    list_documents(&state, COMMENTS, query, &filter)
}

pub(super) async fn handle_comment_get(
    State(state): State<AppState>,
    Path((movie_id, comment_id)): Path<(String, String)>,
) -> Result<ApiResponse, ApiError> {
    let movie_id = DocId::parse(&movie_id)?;
    let comment_id = DocId::parse(&comment_id)?;
    guard_collection(&state, COMMENTS)?;

    let filter = Filter::id(&comment_id).eq("movie_id", movie_id.as_str());
    match state.store.find_one(COMMENTS, &filter)? {
        Some(doc) => Ok(respond(StatusCode::OK, json!({ "data": doc.into_json() }))),
        None => Err(ApiError::not_found("Comment not found")),
    }
}

pub(super) async fn handle_comment_create(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let movie_id = DocId::parse(&movie_id)?;
    let mut comment = validate_body(body, &["id", "movie_id"])?;
    guard_collection(&state, MOVIES)?;
    guard_collection(&state, COMMENTS)?;

    // Comments require their movie; the soft 200-with-empty-data rule
    // does not apply to writes.
    if state
        .store
        .find_one(MOVIES, &Filter::id(&movie_id))?
        .is_none()
    {
        return Err(ApiError::not_found("Movie not found"));
    }

    comment.insert(
        "movie_id".to_string(),
        Value::String(movie_id.to_string()),
    );
    let id = state.store.insert_one(COMMENTS, comment.clone())?;
    tracing::info!(movie_id = %movie_id, comment_id = %id, "comment created");
    let doc = Document { id, body: comment };
    Ok(respond(
        StatusCode::CREATED,
        json!({ "message": "Comment created", "data": doc.into_json() }),
    ))
}

pub(super) async fn handle_comment_update(
    State(state): State<AppState>,
    Path((movie_id, comment_id)): Path<(String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<ApiResponse, ApiError> {
    let movie_id = DocId::parse(&movie_id)?;
    let comment_id = DocId::parse(&comment_id)?;
    let filter = Filter::id(&comment_id).eq("movie_id", movie_id.as_str());
    update_document(
        &state,
        COMMENTS,
        &filter,
        body,
        &["id", "movie_id"],
        "Comment",
    )
}

pub(super) async fn handle_comment_delete(
    State(state): State<AppState>,
    Path((movie_id, comment_id)): Path<(String, String)>,
) -> Result<ApiResponse, ApiError> {
    let movie_id = DocId::parse(&movie_id)?;
    let comment_id = DocId::parse(&comment_id)?;
    let filter = Filter::id(&comment_id).eq("movie_id", movie_id.as_str());
    delete_document(&state, COMMENTS, &filter, "Comment")
}

// ── Tests ───────────────────────────────────────────────────────────
