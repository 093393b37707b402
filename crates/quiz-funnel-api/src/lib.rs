use std::path::PathBuf;

use anyhow::{anyhow, Result};
use quiz_funnel_core::{
    derive_idempotency_key, score_quiz, validate_answers, AnswerMap, QuizError, QuizScores,
    ResultId, SessionId,
};
use quiz_funnel_store_sqlite::{NewResult, QuizSession, SqliteStore, StoreError, StoredResult, UtmParams};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Caller-facing error taxonomy. The service layer maps these onto HTTP
/// status codes; everything that would leak internals collapses into
/// `Internal` before it reaches the wire.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("session is unknown or expired")]
    InvalidSession,
    #[error("fingerprint does not match session")]
    FingerprintMismatch,
    #[error("result not found")]
    NotFound,
    #[error("result belongs to a different session")]
    AccessDenied,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Stable machine-readable code for the wire contract.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidSession => "INVALID_SESSION",
            Self::FingerprintMismatch => "FINGERPRINT_MISMATCH",
            Self::NotFound => "NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<QuizError> for ApiError {
    fn from(err: QuizError) -> Self {
        match err {
            QuizError::Validation(message) => Self::Validation(message),
            QuizError::KeyDerivation(message) => {
                Self::Internal(anyhow!("key derivation failed: {message}"))
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidSession => Self::InvalidSession,
            StoreError::FingerprintMismatch => Self::FingerprintMismatch,
            // The reconciler consumes this variant before conversion; one
            // surviving here means a submit path skipped reconciliation.
            StoreError::DuplicateIdempotencyKey => {
                Self::Internal(anyhow!("unreconciled idempotency conflict"))
            }
            StoreError::Internal(inner) => Self::Internal(inner),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub fingerprint_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub success: bool,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub session_id: SessionId,
    pub fingerprint_hash: String,
    pub answers: AnswerMap,
    /// Advisory only. The server derives its own key and never trusts this
    /// value for deduplication.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    pub result_id: ResultId,
    pub archetype_slug: String,
    pub scores: QuizScores,
    pub confidence: f64,
    pub is_balanced: bool,
}

impl From<StoredResult> for CompleteResponse {
    fn from(stored: StoredResult) -> Self {
        Self {
            success: true,
            result_id: stored.result_id,
            archetype_slug: stored.archetype_slug,
            scores: stored.scores,
            confidence: stored.confidence,
            is_balanced: stored.is_balanced,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultResponse {
    pub success: bool,
    pub result: StoredResult,
}

/// Persistence seam for the submission orchestrator. `SqliteStore` is the
/// production implementation; tests substitute their own to exercise
/// reconciliation edge cases the real store cannot produce on demand.
pub trait ResultStore {
    /// # Errors
    /// Implementations surface [`StoreError`] per the store contract.
    fn create_result(&mut self, new: &NewResult) -> Result<StoredResult, StoreError>;

    /// # Errors
    /// Implementations surface [`StoreError::Internal`] on read failures.
    fn find_result_by_key(&self, key: &str) -> Result<Option<StoredResult>, StoreError>;
}

impl ResultStore for SqliteStore {
    fn create_result(&mut self, new: &NewResult) -> Result<StoredResult, StoreError> {
        SqliteStore::create_result(self, new)
    }

    fn find_result_by_key(&self, key: &str) -> Result<Option<StoredResult>, StoreError> {
        SqliteStore::find_result_by_key(self, key)
    }
}

const MAX_EMAIL_LENGTH: usize = 320;

fn validate_request(request: &CompleteRequest) -> Result<(), ApiError> {
    if request.fingerprint_hash.trim().is_empty() {
        return Err(ApiError::Validation("fingerprintHash MUST be non-empty".to_string()));
    }
    if request.answers.is_empty() {
        return Err(ApiError::Validation("answers MUST be non-empty".to_string()));
    }
    validate_answers(&request.answers)?;

    if let Some(email) = &request.email {
        let trimmed = email.trim();
        if trimmed.len() > MAX_EMAIL_LENGTH
            || !trimmed.contains('@')
            || trimmed.chars().any(char::is_whitespace)
        {
            return Err(ApiError::Validation("email is not a valid address".to_string()));
        }
    }
    if let Some(duration) = request.duration_seconds {
        if duration < 0 {
            return Err(ApiError::Validation("durationSeconds MUST be non-negative".to_string()));
        }
    }

    Ok(())
}

/// Run one submission end to end: validate, derive the server-trusted key,
/// score, persist, and reconcile a duplicate-key conflict by re-reading the
/// winner's row. Malformed input short-circuits before scoring or any write.
///
/// # Errors
/// Returns [`ApiError::Validation`] for malformed input, the session-class
/// errors from the store, and [`ApiError::Internal`] when the store reports
/// a conflict but no stored result exists for the derived key.
pub fn submit_quiz<S: ResultStore>(
    store: &mut S,
    request: &CompleteRequest,
) -> Result<CompleteResponse, ApiError> {
    validate_request(request)?;

    let session_id = request.session_id.to_string();
    let derived_key =
        derive_idempotency_key(&session_id, &request.fingerprint_hash, &request.answers)?;

    if let Some(client_key) = &request.idempotency_key {
        if *client_key != derived_key {
            tracing::debug!(
                session_id = %request.session_id,
                "client-supplied idempotency key differs from derived key; ignoring it"
            );
        }
    }

    let scored = score_quiz(&request.answers);
    let new = NewResult {
        session_id: request.session_id,
        fingerprint_hash: request.fingerprint_hash.clone(),
        idempotency_key: derived_key.clone(),
        archetype_slug: scored.archetype_slug,
        scores: scored.scores,
        answers: request.answers.clone(),
        confidence: scored.confidence,
        is_balanced: scored.is_balanced,
        email: request.email.as_deref().map(|email| email.trim().to_string()),
        duration_seconds: request.duration_seconds,
        utm: UtmParams {
            source: request.utm_source.clone(),
            medium: request.utm_medium.clone(),
            campaign: request.utm_campaign.clone(),
        },
    };

    match store.create_result(&new) {
        Ok(stored) => Ok(stored.into()),
        Err(StoreError::DuplicateIdempotencyKey) => reconcile_conflict(store, &derived_key),
        Err(err) => Err(err.into()),
    }
}

/// A duplicate-key conflict means an identical logical submission already
/// committed. Return the stored row as success; if the row is missing the
/// storage invariant is broken and fabricating a success would hide it.
fn reconcile_conflict<S: ResultStore>(
    store: &S,
    derived_key: &str,
) -> Result<CompleteResponse, ApiError> {
    match store.find_result_by_key(derived_key)? {
        Some(existing) => {
            tracing::info!(result_id = %existing.result_id, "returning stored result for replayed submission");
            Ok(existing.into())
        }
        None => Err(ApiError::Internal(anyhow!(
            "idempotency conflict reported but no stored result exists for the derived key"
        ))),
    }
}

/// Facade the service and CLI binaries share. Opens the store per call so a
/// single value can be cloned across handlers without holding a connection.
#[derive(Debug, Clone)]
pub struct QuizApi {
    db_path: PathBuf,
}

impl QuizApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, ApiError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Create or reuse the anonymous session that submissions attach to.
    ///
    /// # Errors
    /// Returns [`ApiError::Validation`] for an empty fingerprint and
    /// [`ApiError::Internal`] when the store fails.
    pub fn session(&self, request: &SessionRequest) -> Result<SessionResponse, ApiError> {
        if request.fingerprint_hash.trim().is_empty() {
            return Err(ApiError::Validation("fingerprintHash MUST be non-empty".to_string()));
        }

        let mut store = self.open_store()?;
        let session: QuizSession =
            store.verify_or_create_session(request.session_id, &request.fingerprint_hash)?;
        Ok(SessionResponse { success: true, session_id: session.session_id })
    }

    /// Submit a completed quiz; see [`submit_quiz`].
    ///
    /// # Errors
    /// See [`submit_quiz`].
    pub fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, ApiError> {
        let mut store = self.open_store()?;
        submit_quiz(&mut store, request)
    }

    /// Fetch a stored result by id. When the caller presents a session id it
    /// must own the result; callers without a session (shared links) may read
    /// any result.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown id and
    /// [`ApiError::AccessDenied`] when the presented session does not own it.
    pub fn result(
        &self,
        result_id: ResultId,
        requester_session: Option<SessionId>,
    ) -> Result<ResultResponse, ApiError> {
        let store = self.open_store()?;
        let stored = store.get_result(result_id)?.ok_or(ApiError::NotFound)?;

        if let Some(session_id) = requester_session {
            if session_id != stored.session_id {
                return Err(ApiError::AccessDenied);
            }
        }

        Ok(ResultResponse { success: true, result: stored })
    }
}
