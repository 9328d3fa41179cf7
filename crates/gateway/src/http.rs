use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use taskline_contracts::{Envelope, ErrorBody};
use taskline_policy::Credential;
use taskline_routines::{PgBackend, RoutineBackend};
use tracing::Instrument;
use ulid::Ulid;

use crate::command::{CommandError, Commands};
use crate::config::{GatewayConfig, StartupError};
use crate::credentials::{CredentialSource, LocalCredentials};
use crate::task::TaskCommands;

mod task;

pub const REQUEST_ID_HEADER: &str = "x-taskline-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    commands: Commands,
    tasks: Arc<TaskCommands>,
    credentials: Arc<dyn CredentialSource>,
    backend: Arc<dyn RoutineBackend>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        backend: Arc<dyn RoutineBackend>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, StartupError> {
        let tasks = TaskCommands::new().map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("invalid task routine declaration: {}", err),
        })?;

        Ok(Self {
            config,
            commands: Commands::new(backend.clone()),
            tasks: Arc::new(tasks),
            credentials,
            backend,
        })
    }
}

type ApiError = (StatusCode, Json<Envelope>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let backend = PgBackend::connect(
        &config.db_url,
        &config.pool_settings(),
        config.backend_options(),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to initialize database pool: {}", err),
    })?;

    if config.run_migrations {
        backend.migrate().await.map_err(|err| StartupError {
            code: "ERR_MIGRATION_FAILED",
            message: format!("failed to apply task routine migrations: {}", err),
        })?;
    }

    let credentials = Arc::new(LocalCredentials::from_config(&config));
    let state = AppState::new(config, Arc::new(backend), credentials)?;
    Ok(app(state))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(task::COLLECTION_ROUTE, get(task::list).post(task::create))
        .route(task::OVERVIEW_ROUTE, get(task::overview))
        .route(
            task::ITEM_ROUTE,
            get(task::get).put(task::update).delete(task::delete),
        )
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("database", state.backend.ping().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(err) = extract_credential(&state, &headers)
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Unknown paths and unrouted methods on known paths share one 404 body.
async fn not_found(method: Method, uri: Uri) -> Response {
    let started = Instant::now();
    let err = (
        StatusCode::NOT_FOUND,
        Json(Envelope::failure(ErrorBody {
            code: Some("NOT_FOUND".to_string()),
            message: format!("Route {} {} not found", method, uri.path()),
            details: Some(serde_json::json!({
                "path": uri.path(),
                "method": method.as_str(),
            })),
        })),
    );
    crate::metrics::observe_http_request(
        "fallback",
        method.as_str(),
        err.0.as_u16(),
        started.elapsed(),
    );
    err.into_response()
}

/// Wraps one API handler: request id, span, envelope and metrics.
async fn serve<T, F>(
    route: &'static str,
    method: &'static str,
    headers: &HeaderMap,
    handler: F,
) -> Response
where
    T: Serialize,
    F: Future<Output = Result<T, ApiError>>,
{
    let request_id = extract_request_id(headers);
    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        route = route,
        method = method,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let result = handler.await;
        let status = match &result {
            Ok(_) => StatusCode::OK,
            Err((status, _)) => *status,
        };
        tracing::Span::current().record("status", status.as_u16());
        tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
        result
    }
    .instrument(span)
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());

    let mut response = match result {
        Ok(data) => (StatusCode::OK, Json(Envelope::ok(data))).into_response(),
        Err(err) => err.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn extract_credential(state: &AppState, headers: &HeaderMap) -> Result<Credential, ApiError> {
    state
        .credentials
        .credential(headers)
        .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.code, err.message))
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ApiError {
    (
        status,
        Json(Envelope::failure(ErrorBody {
            code: Some(code.into()),
            message: message.into(),
            details: None,
        })),
    )
}

fn invalid_json() -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_JSON",
        "request body must be valid JSON",
    )
}

/// Maps a facade failure to a status and a client-safe message. Only
/// business-rule messages from routines reach the caller verbatim.
fn command_error(err: CommandError) -> ApiError {
    match err {
        CommandError::Validation(violations) => (
            StatusCode::BAD_REQUEST,
            Json(Envelope::failure(ErrorBody {
                code: Some("ERR_VALIDATION".to_string()),
                message: "Validation failed".to_string(),
                details: serde_json::to_value(&violations).ok(),
            })),
        ),
        CommandError::Unauthorized => json_error(
            StatusCode::FORBIDDEN,
            "ERR_FORBIDDEN",
            "insufficient permission",
        ),
        CommandError::RoutineBusiness { code, message } => {
            json_error(StatusCode::BAD_REQUEST, code, message)
        }
        CommandError::RoutineExecution(_)
        | CommandError::TransactionClosed
        | CommandError::Internal(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "Internal Server Error",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskline_policy::Violation;
    use taskline_routines::{ParamSummary, RoutineError};

    #[test]
    fn business_messages_pass_through_but_faults_are_generic() {
        let (status, Json(body)) = command_error(CommandError::RoutineBusiness {
            code: "51000".to_string(),
            message: "TaskDoesntExist".to_string(),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error = body.error.expect("failure carries an error");
        assert_eq!(error.message, "TaskDoesntExist");
        assert!(!body.success);

        let (status, Json(body)) = command_error(CommandError::RoutineExecution(
            RoutineError::Execution {
                routine: "functional.spTaskGet".to_string(),
                params: ParamSummary::default(),
                cause: taskline_routines::Fault::Timeout,
            },
        ));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let error = body.error.expect("failure carries an error");
        assert_eq!(error.message, "Internal Server Error");
        assert!(!error.message.contains("spTaskGet"));
    }

    #[test]
    fn validation_failures_list_every_violation() {
        let (status, Json(body)) = command_error(CommandError::Validation(vec![
            Violation::new("title", "required"),
            Violation::new("priority", "must be <= 2"),
        ]));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let details = body
            .error
            .and_then(|e| e.details)
            .expect("validation failure carries details");
        assert_eq!(details[0]["field"], "title");
        assert_eq!(details[1]["field"], "priority");
    }

    #[test]
    fn unauthorized_maps_to_forbidden() {
        let (status, _) = command_error(CommandError::Unauthorized);
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn request_ids_are_sanitized() {
        assert_eq!(
            sanitize_request_id("abc-123 <script>"),
            Some("abc-123script".to_string())
        );
        assert_eq!(sanitize_request_id("!!!"), None);
    }
}
