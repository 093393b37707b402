use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use quiz_funnel_api::{
    ApiError, CompleteRequest, CompleteResponse, QuizApi, ResultResponse, SessionRequest,
    SessionResponse, API_CONTRACT_VERSION,
};
use quiz_funnel_core::{ResultId, SessionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
struct ServiceState {
    api: QuizApi,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    error: String,
    error_code: &'static str,
}

struct ServiceError(ApiError);

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ApiError::Validation(_)
            | ApiError::InvalidSession
            | ApiError::FingerprintMismatch => (StatusCode::BAD_REQUEST, self.0.to_string()),
            ApiError::AccessDenied => (StatusCode::FORBIDDEN, self.0.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.0.to_string()),
            ApiError::Internal(err) => {
                // Details stay in the log; the wire gets a generic message.
                tracing::error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        let body = ErrorBody { success: false, error: message, error_code: self.0.code() };
        (status, Json(body)).into_response()
    }
}

/// `Json` that answers a body axum cannot deserialize with the same
/// `{success: false, error, errorCode}` envelope as semantic validation
/// failures, instead of axum's plain-text rejection.
struct ContractJson<T>(T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ContractJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::Validation(rejection.body_text()).into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    contract: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultQuery {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "quiz-funnel-service")]
#[command(about = "HTTP service for the archetype quiz funnel")]
struct Args {
    #[arg(long, default_value = "./quiz_funnel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/quiz/session", post(quiz_session))
        .route("/v1/quiz/complete", post(quiz_complete))
        .route("/v1/quiz/result/:result_id", get(quiz_result))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: QuizApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "quiz funnel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", contract: API_CONTRACT_VERSION })
}

async fn quiz_session(
    State(state): State<ServiceState>,
    ContractJson(request): ContractJson<SessionRequest>,
) -> Result<Json<SessionResponse>, ServiceError> {
    let response = state.api.session(&request)?;
    Ok(Json(response))
}

async fn quiz_complete(
    State(state): State<ServiceState>,
    ContractJson(request): ContractJson<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ServiceError> {
    let response = state.api.complete(&request)?;
    Ok(Json(response))
}

async fn quiz_result(
    State(state): State<ServiceState>,
    Path(result_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Json<ResultResponse>, ServiceError> {
    let result_id = ResultId::parse(&result_id)
        .ok_or_else(|| ApiError::Validation("resultId is not a valid id".to_string()))?;
    let session_id = query
        .session_id
        .as_deref()
        .map(|raw| {
            SessionId::parse(raw)
                .ok_or_else(|| ApiError::Validation("sessionId is not a valid id".to_string()))
        })
        .transpose()?;
    let response = state.api.result(result_id, session_id)?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("quizfunnel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn get_uri(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn answers_payload() -> serde_json::Value {
        serde_json::json!({
            "S1": {"v": 5, "t": 100},
            "S2": {"v": 4, "t": 150},
            "COM_ASSERTIVE_1": {"v": 5, "t": 200},
            "COM_SCENARIO_1": {"k": "D", "t": 300}
        })
    }

    async fn create_session(router: Router) -> String {
        let response = post_json(
            router,
            "/v1/quiz/session",
            &serde_json::json!({"fingerprintHash": "fp-abc"}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        value
            .get("sessionId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing sessionId in response: {value}"))
            .to_string()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { api: QuizApi::new(unique_temp_db_path()) };
        let response = get_uri(app(state), "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.get("status").and_then(serde_json::Value::as_str), Some("ok"));
        assert_eq!(
            value.get("contract").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn session_complete_and_result_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: QuizApi::new(db_path.clone()) };
        let router = app(state);

        let session_id = create_session(router.clone()).await;

        let complete_payload = serde_json::json!({
            "sessionId": session_id,
            "fingerprintHash": "fp-abc",
            "answers": answers_payload(),
            "durationSeconds": 180
        });
        let complete_response =
            post_json(router.clone(), "/v1/quiz/complete", &complete_payload).await;
        assert_eq!(complete_response.status(), StatusCode::OK);

        let complete_value = response_json(complete_response).await;
        assert_eq!(complete_value.get("success"), Some(&serde_json::json!(true)));
        assert_eq!(
            complete_value.get("archetypeSlug").and_then(serde_json::Value::as_str),
            Some("golden-partner")
        );
        let result_id = complete_value
            .get("resultId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing resultId in response: {complete_value}"))
            .to_string();

        // Retry the identical submission: same result id back, still 200.
        let retry_response =
            post_json(router.clone(), "/v1/quiz/complete", &complete_payload).await;
        assert_eq!(retry_response.status(), StatusCode::OK);
        let retry_value = response_json(retry_response).await;
        assert_eq!(
            retry_value.get("resultId").and_then(serde_json::Value::as_str),
            Some(result_id.as_str())
        );

        let result_response = get_uri(
            router.clone(),
            &format!("/v1/quiz/result/{result_id}?sessionId={session_id}"),
        )
        .await;
        assert_eq!(result_response.status(), StatusCode::OK);
        let result_value = response_json(result_response).await;
        assert_eq!(
            result_value
                .get("result")
                .and_then(|result| result.get("resultId"))
                .and_then(serde_json::Value::as_str),
            Some(result_id.as_str())
        );

        // A foreign session is shut out with 403.
        let foreign_session = quiz_funnel_core::SessionId::new();
        let denied = get_uri(
            router,
            &format!("/v1/quiz/result/{result_id}?sessionId={foreign_session}"),
        )
        .await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let denied_value = response_json(denied).await;
        assert_eq!(
            denied_value.get("errorCode").and_then(serde_json::Value::as_str),
            Some("ACCESS_DENIED")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn malformed_submission_maps_to_400_with_error_code() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: QuizApi::new(db_path.clone()) };
        let router = app(state);

        let session_id = create_session(router.clone()).await;

        let payload = serde_json::json!({
            "sessionId": session_id,
            "fingerprintHash": "fp-abc",
            "answers": {"S1": {"v": 9, "t": 100}}
        });
        let response = post_json(router, "/v1/quiz/complete", &payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value.get("success"), Some(&serde_json::json!(false)));
        assert_eq!(
            value.get("errorCode").and_then(serde_json::Value::as_str),
            Some("VALIDATION_ERROR")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn undeserializable_input_gets_the_json_error_envelope() {
        let state = ServiceState { api: QuizApi::new(unique_temp_db_path()) };
        let router = app(state);

        // Body missing the sessionId field entirely.
        let payload = serde_json::json!({
            "fingerprintHash": "fp-abc",
            "answers": {"S1": {"v": 5, "t": 100}}
        });
        let response = post_json(router.clone(), "/v1/quiz/complete", &payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value.get("success"), Some(&serde_json::json!(false)));
        assert_eq!(
            value.get("errorCode").and_then(serde_json::Value::as_str),
            Some("VALIDATION_ERROR")
        );

        // An unparseable sessionId in the result query string.
        let result_id = quiz_funnel_core::ResultId::new();
        let response = get_uri(
            router,
            &format!("/v1/quiz/result/{result_id}?sessionId=not-a-ulid"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(
            value.get("errorCode").and_then(serde_json::Value::as_str),
            Some("VALIDATION_ERROR")
        );
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_result_id_maps_to_404() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: QuizApi::new(db_path.clone()) };
        let router = app(state);

        let missing = quiz_funnel_core::ResultId::new();
        let response = get_uri(router, &format!("/v1/quiz/result/{missing}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(
            value.get("errorCode").and_then(serde_json::Value::as_str),
            Some("NOT_FOUND")
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
