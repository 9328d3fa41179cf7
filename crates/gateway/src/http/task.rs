use std::collections::HashMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use taskline_policy::RequestSource;
use taskline_routines::Shaped;

use super::{ApiError, AppState, command_error, extract_credential, invalid_json, serve};
use crate::command::Command;
use crate::task::{TaskChanged, TaskCreated, TaskOverview, TaskRecord};

pub(super) const COLLECTION_ROUTE: &str = "/api/v1/internal/task";
pub(super) const OVERVIEW_ROUTE: &str = "/api/v1/internal/task/overview";
pub(super) const ITEM_ROUTE: &str = "/api/v1/internal/task/{id}";

async fn execute(
    state: &AppState,
    headers: &HeaderMap,
    command: &Command,
    source: RequestSource<'_>,
) -> Result<Shaped, ApiError> {
    let credential = extract_credential(state, headers)?;
    state
        .commands
        .execute(command, &credential, source)
        .await
        .map_err(command_error)
}

pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    serve(COLLECTION_ROUTE, "POST", &headers, async {
        let Json(body) = body.map_err(|_| invalid_json())?;
        let shaped = execute(
            &state,
            &headers,
            &state.tasks.create,
            RequestSource::Body(&body),
        )
        .await?;
        TaskCreated::from_shaped(&shaped).map_err(command_error)
    })
    .await
}

pub(super) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    serve(COLLECTION_ROUTE, "GET", &headers, async {
        let shaped = execute(
            &state,
            &headers,
            &state.tasks.list,
            RequestSource::Query(&query),
        )
        .await?;
        shaped
            .rows()
            .map(TaskRecord::from_table)
            .unwrap_or_else(|| Ok(Vec::new()))
            .map_err(command_error)
    })
    .await
}

pub(super) async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(route): Path<HashMap<String, String>>,
) -> Response {
    serve(ITEM_ROUTE, "GET", &headers, async {
        let shaped = execute(
            &state,
            &headers,
            &state.tasks.get,
            RequestSource::Route(&route),
        )
        .await?;
        TaskRecord::from_shaped(&shaped).map_err(command_error)
    })
    .await
}

pub(super) async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(route): Path<HashMap<String, String>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    serve(ITEM_ROUTE, "PUT", &headers, async {
        let Json(body) = body.map_err(|_| invalid_json())?;
        let shaped = execute(
            &state,
            &headers,
            &state.tasks.update,
            RequestSource::RouteAndBody {
                route: &route,
                body: &body,
            },
        )
        .await?;
        TaskChanged::from_shaped(&shaped).map_err(command_error)
    })
    .await
}

pub(super) async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(route): Path<HashMap<String, String>>,
) -> Response {
    serve(ITEM_ROUTE, "DELETE", &headers, async {
        let shaped = execute(
            &state,
            &headers,
            &state.tasks.delete,
            RequestSource::Route(&route),
        )
        .await?;
        TaskChanged::from_shaped(&shaped).map_err(command_error)
    })
    .await
}

pub(super) async fn overview(State(state): State<AppState>, headers: HeaderMap) -> Response {
    serve(OVERVIEW_ROUTE, "GET", &headers, async {
        let query = HashMap::new();
        let shaped = execute(
            &state,
            &headers,
            &state.tasks.overview,
            RequestSource::Query(&query),
        )
        .await?;
        TaskOverview::from_shaped(&shaped).map_err(command_error)
    })
    .await
}
