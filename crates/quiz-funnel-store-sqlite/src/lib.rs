use std::path::Path;

use anyhow::{anyhow, Context, Result};
use quiz_funnel_core::{AnswerMap, QuizScores, ResultId, SessionId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS quiz_sessions (
  session_id TEXT PRIMARY KEY,
  fingerprint_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  last_seen_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quiz_results (
  result_id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL UNIQUE,
  session_id TEXT NOT NULL,
  fingerprint_hash TEXT NOT NULL,
  archetype_slug TEXT NOT NULL,
  scores_json TEXT NOT NULL,
  answers_json TEXT NOT NULL,
  confidence REAL NOT NULL,
  is_balanced INTEGER NOT NULL CHECK (is_balanced IN (0, 1)),
  email TEXT,
  duration_seconds INTEGER,
  utm_source TEXT,
  utm_medium TEXT,
  utm_campaign TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (session_id) REFERENCES quiz_sessions(session_id)
);

CREATE INDEX IF NOT EXISTS idx_quiz_results_session ON quiz_results(session_id);
CREATE INDEX IF NOT EXISTS idx_quiz_sessions_fingerprint ON quiz_sessions(fingerprint_hash);
";

/// Typed store failures the API layer maps onto its error taxonomy.
/// `DuplicateIdempotencyKey` is the conflict signal the reconciler reacts to.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("idempotency key already exists")]
    DuplicateIdempotencyKey,
    #[error("unknown session")]
    InvalidSession,
    #[error("fingerprint does not match session")]
    FingerprintMismatch,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizSession {
    pub session_id: SessionId,
    pub fingerprint_hash: String,
    pub created_at: String,
    pub last_seen_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UtmParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
}

/// Insert input for one scored submission.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub session_id: SessionId,
    pub fingerprint_hash: String,
    pub idempotency_key: String,
    pub archetype_slug: String,
    pub scores: QuizScores,
    pub answers: AnswerMap,
    pub confidence: f64,
    pub is_balanced: bool,
    pub email: Option<String>,
    pub duration_seconds: Option<i64>,
    pub utm: UtmParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub result_id: ResultId,
    pub session_id: SessionId,
    pub idempotency_key: String,
    pub archetype_slug: String,
    pub scores: QuizScores,
    pub answers: AnswerMap,
    pub confidence: f64,
    pub is_balanced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    pub utm: UtmParams,
    pub created_at: String,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed quiz store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Reuse the caller's session when it exists and the fingerprint matches,
    /// otherwise mint a fresh anonymous session. Never fails the funnel entry
    /// point over a stale or foreign session id.
    ///
    /// # Errors
    /// Returns [`StoreError::Internal`] when session reads or writes fail.
    pub fn verify_or_create_session(
        &mut self,
        existing: Option<SessionId>,
        fingerprint_hash: &str,
    ) -> Result<QuizSession, StoreError> {
        if let Some(session_id) = existing {
            if let Some(session) = self.find_session(session_id)? {
                if session.fingerprint_hash == fingerprint_hash {
                    let last_seen_at = now_rfc3339()?;
                    self.conn
                        .execute(
                            "UPDATE quiz_sessions SET last_seen_at = ?1 WHERE session_id = ?2",
                            params![last_seen_at, session_id.to_string()],
                        )
                        .context("failed to touch session")?;
                    return Ok(QuizSession { last_seen_at, ..session });
                }
            }
        }

        self.create_session(fingerprint_hash)
    }

    /// Check that a submission's session exists and belongs to the caller.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidSession`] for an unknown session id and
    /// [`StoreError::FingerprintMismatch`] when the session belongs to a
    /// different browser fingerprint.
    pub fn verify_session(
        &self,
        session_id: SessionId,
        fingerprint_hash: &str,
    ) -> Result<(), StoreError> {
        let session = self.find_session(session_id)?.ok_or(StoreError::InvalidSession)?;
        if session.fingerprint_hash != fingerprint_hash {
            return Err(StoreError::FingerprintMismatch);
        }
        Ok(())
    }

    fn create_session(&mut self, fingerprint_hash: &str) -> Result<QuizSession, StoreError> {
        let session = QuizSession {
            session_id: SessionId::new(),
            fingerprint_hash: fingerprint_hash.to_string(),
            created_at: now_rfc3339()?,
            last_seen_at: now_rfc3339()?,
        };

        self.conn
            .execute(
                "INSERT INTO quiz_sessions(session_id, fingerprint_hash, created_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.session_id.to_string(),
                    session.fingerprint_hash,
                    session.created_at,
                    session.last_seen_at,
                ],
            )
            .context("failed to insert session")?;

        Ok(session)
    }

    fn find_session(&self, session_id: SessionId) -> Result<Option<QuizSession>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT session_id, fingerprint_hash, created_at, last_seen_at
                 FROM quiz_sessions WHERE session_id = ?1",
            )
            .context("failed to prepare session lookup")?;

        let row = stmt
            .query_row(params![session_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()
            .context("failed to read session row")?;

        match row {
            Some((raw_id, fingerprint_hash, created_at, last_seen_at)) => {
                let session_id = SessionId::parse(&raw_id)
                    .ok_or_else(|| anyhow!("invalid session id in store: {raw_id}"))?;
                Ok(Some(QuizSession { session_id, fingerprint_hash, created_at, last_seen_at }))
            }
            None => Ok(None),
        }
    }

    /// Persist one scored submission. The UNIQUE index on `idempotency_key`
    /// is the single atomic dedupe point for concurrent duplicates.
    ///
    /// # Errors
    /// Returns [`StoreError::DuplicateIdempotencyKey`] when a row with the
    /// same derived key already exists, [`StoreError::InvalidSession`] /
    /// [`StoreError::FingerprintMismatch`] for session problems, and
    /// [`StoreError::Internal`] for everything else.
    pub fn create_result(&mut self, new: &NewResult) -> Result<StoredResult, StoreError> {
        self.verify_session(new.session_id, &new.fingerprint_hash)?;

        let result_id = ResultId::new();
        let created_at = now_rfc3339()?;
        let scores_json =
            serde_json::to_string(&new.scores).context("failed to serialize scores")?;
        let answers_json =
            serde_json::to_string(&new.answers).context("failed to serialize answers")?;

        let tx = self.conn.transaction().context("failed to start transaction")?;

        let insert = tx.execute(
            "INSERT INTO quiz_results(
                result_id, idempotency_key, session_id, fingerprint_hash,
                archetype_slug, scores_json, answers_json, confidence, is_balanced,
                email, duration_seconds, utm_source, utm_medium, utm_campaign, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14, ?15
            )",
            params![
                result_id.to_string(),
                new.idempotency_key,
                new.session_id.to_string(),
                new.fingerprint_hash,
                new.archetype_slug,
                scores_json,
                answers_json,
                new.confidence,
                i64::from(new.is_balanced),
                new.email,
                new.duration_seconds,
                new.utm.source,
                new.utm.medium,
                new.utm.campaign,
                created_at,
            ],
        );

        if let Err(err) = insert {
            if is_idempotency_conflict(&err) {
                return Err(StoreError::DuplicateIdempotencyKey);
            }
            return Err(StoreError::Internal(
                anyhow::Error::new(err).context("failed to insert quiz result"),
            ));
        }

        tx.commit().context("failed to commit result transaction")?;

        Ok(StoredResult {
            result_id,
            session_id: new.session_id,
            idempotency_key: new.idempotency_key.clone(),
            archetype_slug: new.archetype_slug.clone(),
            scores: new.scores.clone(),
            answers: new.answers.clone(),
            confidence: new.confidence,
            is_balanced: new.is_balanced,
            email: new.email.clone(),
            duration_seconds: new.duration_seconds,
            utm: new.utm.clone(),
            created_at,
        })
    }

    /// Look up the stored result for a derived idempotency key.
    ///
    /// # Errors
    /// Returns [`StoreError::Internal`] when the row cannot be read or decoded.
    pub fn find_result_by_key(&self, key: &str) -> Result<Option<StoredResult>, StoreError> {
        self.query_result("idempotency_key", key)
    }

    /// Look up a stored result by its public result id.
    ///
    /// # Errors
    /// Returns [`StoreError::Internal`] when the row cannot be read or decoded.
    pub fn get_result(&self, result_id: ResultId) -> Result<Option<StoredResult>, StoreError> {
        self.query_result("result_id", &result_id.to_string())
    }

    fn query_result(&self, column: &str, value: &str) -> Result<Option<StoredResult>, StoreError> {
        // `column` is one of two fixed identifiers, never caller input.
        let query = format!(
            "SELECT
                result_id, idempotency_key, session_id, archetype_slug,
                scores_json, answers_json, confidence, is_balanced,
                email, duration_seconds, utm_source, utm_medium, utm_campaign, created_at
             FROM quiz_results WHERE {column} = ?1"
        );
        let mut stmt =
            self.conn.prepare(&query).context("failed to prepare result lookup")?;

        let row = stmt
            .query_row(params![value], |row| {
                Ok(ResultRow {
                    result_id: row.get(0)?,
                    idempotency_key: row.get(1)?,
                    session_id: row.get(2)?,
                    archetype_slug: row.get(3)?,
                    scores_json: row.get(4)?,
                    answers_json: row.get(5)?,
                    confidence: row.get(6)?,
                    is_balanced: row.get(7)?,
                    email: row.get(8)?,
                    duration_seconds: row.get(9)?,
                    utm_source: row.get(10)?,
                    utm_medium: row.get(11)?,
                    utm_campaign: row.get(12)?,
                    created_at: row.get(13)?,
                })
            })
            .optional()
            .context("failed to read result row")?;

        match row {
            Some(row) => Ok(Some(decode_result_row(row)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
struct ResultRow {
    result_id: String,
    idempotency_key: String,
    session_id: String,
    archetype_slug: String,
    scores_json: String,
    answers_json: String,
    confidence: f64,
    is_balanced: i64,
    email: Option<String>,
    duration_seconds: Option<i64>,
    utm_source: Option<String>,
    utm_medium: Option<String>,
    utm_campaign: Option<String>,
    created_at: String,
}

fn decode_result_row(row: ResultRow) -> Result<StoredResult> {
    let result_id = ResultId::parse(&row.result_id)
        .ok_or_else(|| anyhow!("invalid result id in store: {}", row.result_id))?;
    let session_id = SessionId::parse(&row.session_id)
        .ok_or_else(|| anyhow!("invalid session id in store: {}", row.session_id))?;

    Ok(StoredResult {
        result_id,
        session_id,
        idempotency_key: row.idempotency_key,
        archetype_slug: row.archetype_slug,
        scores: serde_json::from_str(&row.scores_json)
            .context("failed to deserialize stored scores")?,
        answers: serde_json::from_str(&row.answers_json)
            .context("failed to deserialize stored answers")?,
        confidence: row.confidence,
        is_balanced: row.is_balanced != 0,
        email: row.email,
        duration_seconds: row.duration_seconds,
        utm: UtmParams { source: row.utm_source, medium: row.utm_medium, campaign: row.utm_campaign },
        created_at: row.created_at,
    })
}

fn is_idempotency_conflict(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, Some(message))
            if code.code == rusqlite::ErrorCode::ConstraintViolation
                && message.contains("idempotency_key")
    )
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use quiz_funnel_core::{score_quiz, AnswerEntry};

    use super::*;

    fn open_migrated() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("failed to open in-memory store: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration failed: {err}");
        }
        store
    }

    fn fixture_answers() -> AnswerMap {
        let mut answers = AnswerMap::new();
        answers.insert("S1".to_string(), AnswerEntry { v: Some(5), t: 100, k: None });
        answers.insert("C1".to_string(), AnswerEntry { v: Some(4), t: 200, k: None });
        answers
            .insert("COM_SCENARIO_1".to_string(), AnswerEntry { v: None, t: 300, k: Some("D".to_string()) });
        answers
    }

    fn fixture_result(store: &mut SqliteStore, key: &str) -> NewResult {
        let session = match store.verify_or_create_session(None, "fp-abc") {
            Ok(session) => session,
            Err(err) => panic!("session creation failed: {err}"),
        };
        let answers = fixture_answers();
        let scored = score_quiz(&answers);

        NewResult {
            session_id: session.session_id,
            fingerprint_hash: "fp-abc".to_string(),
            idempotency_key: key.to_string(),
            archetype_slug: scored.archetype_slug,
            scores: scored.scores,
            answers,
            confidence: scored.confidence,
            is_balanced: scored.is_balanced,
            email: Some("user@example.com".to_string()),
            duration_seconds: Some(412),
            utm: UtmParams {
                source: Some("newsletter".to_string()),
                medium: None,
                campaign: None,
            },
        }
    }

    // Test IDs: TSTORE-001
    #[test]
    fn migrate_is_idempotent() {
        let mut store = open_migrated();
        if let Err(err) = store.migrate() {
            panic!("second migrate should be a no-op: {err}");
        }
    }

    // Test IDs: TSTORE-002
    #[test]
    fn create_result_round_trips_through_both_lookups() {
        let mut store = open_migrated();
        let new = fixture_result(&mut store, "quiz:v1:aaa");

        let created = match store.create_result(&new) {
            Ok(created) => created,
            Err(err) => panic!("insert failed: {err}"),
        };

        let by_id = match store.get_result(created.result_id) {
            Ok(Some(result)) => result,
            Ok(None) => panic!("result missing by id"),
            Err(err) => panic!("lookup by id failed: {err}"),
        };
        assert_eq!(by_id, created);

        let by_key = match store.find_result_by_key("quiz:v1:aaa") {
            Ok(Some(result)) => result,
            Ok(None) => panic!("result missing by key"),
            Err(err) => panic!("lookup by key failed: {err}"),
        };
        assert_eq!(by_key.result_id, created.result_id);
        assert_eq!(by_key.email.as_deref(), Some("user@example.com"));
        assert_eq!(by_key.utm.source.as_deref(), Some("newsletter"));
    }

    // Test IDs: TSTORE-003
    #[test]
    fn duplicate_idempotency_key_is_a_typed_conflict() {
        let mut store = open_migrated();
        let first = fixture_result(&mut store, "quiz:v1:bbb");
        if let Err(err) = store.create_result(&first) {
            panic!("first insert failed: {err}");
        }

        let mut second = first.clone();
        second.email = None;
        match store.create_result(&second) {
            Err(StoreError::DuplicateIdempotencyKey) => {}
            Err(err) => panic!("expected duplicate-key error, got {err}"),
            Ok(_) => panic!("duplicate key insert should fail"),
        }

        let stored = match store.find_result_by_key("quiz:v1:bbb") {
            Ok(Some(result)) => result,
            Ok(None) => panic!("first insert should remain readable"),
            Err(err) => panic!("lookup failed: {err}"),
        };
        assert_eq!(stored.email.as_deref(), Some("user@example.com"));
    }

    // Test IDs: TSTORE-004
    #[test]
    fn unknown_session_and_foreign_fingerprint_are_rejected() {
        let mut store = open_migrated();
        let mut new = fixture_result(&mut store, "quiz:v1:ccc");

        let original_session = new.session_id;
        new.session_id = SessionId::new();
        match store.create_result(&new) {
            Err(StoreError::InvalidSession) => {}
            Err(err) => panic!("expected invalid-session error, got {err}"),
            Ok(_) => panic!("unknown session should be rejected"),
        }

        new.session_id = original_session;
        new.fingerprint_hash = "fp-other".to_string();
        match store.create_result(&new) {
            Err(StoreError::FingerprintMismatch) => {}
            Err(err) => panic!("expected fingerprint-mismatch error, got {err}"),
            Ok(_) => panic!("foreign fingerprint should be rejected"),
        }
    }

    // Test IDs: TSTORE-005
    #[test]
    fn verify_or_create_session_reuses_only_matching_sessions() {
        let mut store = open_migrated();
        let first = match store.verify_or_create_session(None, "fp-abc") {
            Ok(session) => session,
            Err(err) => panic!("session creation failed: {err}"),
        };

        let reused = match store.verify_or_create_session(Some(first.session_id), "fp-abc") {
            Ok(session) => session,
            Err(err) => panic!("session reuse failed: {err}"),
        };
        assert_eq!(reused.session_id, first.session_id);

        let replaced = match store.verify_or_create_session(Some(first.session_id), "fp-other") {
            Ok(session) => session,
            Err(err) => panic!("session replacement failed: {err}"),
        };
        assert_ne!(replaced.session_id, first.session_id);
        assert_eq!(replaced.fingerprint_hash, "fp-other");
    }

    // Test IDs: TSTORE-006
    #[test]
    fn missing_lookups_return_none() {
        let store = open_migrated();
        match store.get_result(ResultId::new()) {
            Ok(None) => {}
            Ok(Some(_)) => panic!("empty store should not return a result"),
            Err(err) => panic!("lookup failed: {err}"),
        }
        match store.find_result_by_key("quiz:v1:missing") {
            Ok(None) => {}
            Ok(Some(_)) => panic!("empty store should not return a result"),
            Err(err) => panic!("lookup failed: {err}"),
        }
    }
}
