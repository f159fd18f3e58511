//! Request handling for the public API, independent of the HTTP server.
//!
//! Routes:
//! - `POST /api/signup` creates an account and returns its secret key.
//! - `POST /api/upload-url` registers a video for the caller.
//! - `POST /api/sentiment-inference` spends one quota unit and runs the model.
//! - `GET /api/quota` reports the caller's quota without spending it.

use std::sync::Arc;

use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::accounts::{AccountRegistry, NewAccount, RegistrationError};
use crate::inference::{InferenceClient, InferenceError};
use crate::ledger::{AccountId, Clock, LedgerError, QuotaLedger};
use crate::metric::{Caller, Metrics};
use crate::videos::{VideoError, VideoStore};

pub const SIGNUP_PATH: &str = "/api/signup";
pub const UPLOAD_PATH: &str = "/api/upload-url";
pub const INFERENCE_PATH: &str = "/api/sentiment-inference";
pub const QUOTA_PATH: &str = "/api/quota";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API Key is required")]
    MissingKey,

    #[error("Invalid API Key")]
    InvalidKey,

    #[error("{0}")]
    BadRequest(String),

    #[error("File not found.")]
    FileNotFound,

    #[error("Unauthorized")]
    Forbidden,

    #[error("File already analyzed")]
    AlreadyAnalyzed,

    #[error("Monthly request quota exceeded.")]
    QuotaExceeded,

    #[error("Quota record not found")]
    QuotaRecordMissing,

    #[error("An account with this email already exists")]
    EmailTaken,

    #[error("Not found")]
    RouteNotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Details are logged, never sent to the caller.
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingKey | ApiError::InvalidKey => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::AlreadyAnalyzed => StatusCode::BAD_REQUEST,
            ApiError::FileNotFound | ApiError::QuotaRecordMissing | ApiError::RouteNotFound => {
                StatusCode::NOT_FOUND
            }
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::EmailTaken => StatusCode::CONFLICT,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::RecordNotFound(account_id) => {
                log::error!("Account {account_id} has no quota record");
                ApiError::QuotaRecordMissing
            }
            other => {
                log::error!("Quota ledger failure: {other}");
                ApiError::Internal
            }
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        log::error!("Database failure: {err}");
        ApiError::Internal
    }
}

impl From<VideoError> for ApiError {
    fn from(err: VideoError) -> Self {
        match err {
            VideoError::UnsupportedType(t) => {
                ApiError::BadRequest(format!("Unsupported file type: {t}"))
            }
            VideoError::Storage(e) => e.into(),
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        log::error!("Analysis error: {err}");
        ApiError::Internal
    }
}

impl From<RegistrationError> for ApiError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::InvalidInput(reason) => {
                ApiError::BadRequest(format!("Invalid data: {reason}"))
            }
            RegistrationError::EmailTaken => ApiError::EmailTaken,
            RegistrationError::UnknownPlan(plan) => {
                ApiError::BadRequest(format!("Unknown plan: {plan}"))
            }
            RegistrationError::KeyCollision => ApiError::Internal,
            RegistrationError::PasswordHash(e) => {
                log::error!("Password hashing failed: {e}");
                ApiError::Internal
            }
            RegistrationError::Storage(e) => e.into(),
        }
    }
}

// ============================================================================
// Request Bodies
// ============================================================================

#[derive(Deserialize)]
struct SignupRequest {
    name: String,
    email: String,
    password: String,
    plan: Option<String>,
}

#[derive(Deserialize)]
struct UploadRequest {
    file_type: Option<String>,
}

#[derive(Deserialize)]
struct InferenceRequest {
    key: Option<String>,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Malformed request body: {e}")))
}

/// Run a storage call on the blocking pool so lock waits never stall the
/// async workers.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    ApiError: From<E>,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            log::error!("Storage task failed: {e}");
            Err(ApiError::Internal)
        }
    }
}

/// Extract the key from an `Authorization` header value.
///
/// The `Bearer ` scheme is optional; a bare key is accepted too.
pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

// ============================================================================
// Gateway
// ============================================================================

pub struct Gateway {
    registry: Arc<AccountRegistry>,
    ledger: Arc<QuotaLedger>,
    videos: Arc<VideoStore>,
    inference: Arc<dyn InferenceClient>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    default_plan: String,
}

impl Gateway {
    pub fn new(
        registry: AccountRegistry,
        ledger: QuotaLedger,
        videos: VideoStore,
        inference: Arc<dyn InferenceClient>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        default_plan: impl Into<String>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            ledger: Arc::new(ledger),
            videos: Arc::new(videos),
            inference,
            metrics,
            clock,
            default_plan: default_plan.into(),
        }
    }

    /// Route a request and return the status and JSON body to send.
    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        authorization: Option<&str>,
        body: &[u8],
    ) -> (StatusCode, Value) {
        let (caller, result) = self.dispatch(method, path, authorization, body).await;
        let (status, body) = match result {
            Ok(ok) => ok,
            Err(err) => (err.status(), err.body()),
        };
        self.metrics.record(caller, status.as_u16());
        (status, body)
    }

    async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        authorization: Option<&str>,
        body: &[u8],
    ) -> (Caller, Result<(StatusCode, Value), ApiError>) {
        let expected = match path {
            SIGNUP_PATH | UPLOAD_PATH | INFERENCE_PATH => Method::POST,
            QUOTA_PATH => Method::GET,
            _ => return (Caller::Anonymous, Err(ApiError::RouteNotFound)),
        };
        if *method != expected {
            return (Caller::Anonymous, Err(ApiError::MethodNotAllowed));
        }

        if path == SIGNUP_PATH {
            return (Caller::Anonymous, self.signup(body).await);
        }

        let account_id = match self.authenticate(authorization).await {
            Ok(account_id) => account_id,
            Err(err) => return (Caller::Anonymous, Err(err)),
        };
        let result = match path {
            UPLOAD_PATH => self.upload(account_id, body).await,
            INFERENCE_PATH => self.analyze(account_id, body).await,
            _ => self.quota(account_id).await,
        };
        (Caller::Account(account_id), result)
    }

    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<AccountId, ApiError> {
        let token = bearer_token(authorization)
            .ok_or(ApiError::MissingKey)?
            .to_string();
        let registry = self.registry.clone();
        blocking(move || registry.resolve_key(&token))
            .await?
            .ok_or(ApiError::InvalidKey)
    }

    async fn signup(&self, body: &[u8]) -> Result<(StatusCode, Value), ApiError> {
        let req: SignupRequest = parse_body(body)?;
        let new = NewAccount {
            name: req.name,
            email: req.email,
            password: req.password,
            plan: req.plan.unwrap_or_else(|| self.default_plan.clone()),
        };
        let registry = self.registry.clone();
        let now = self.clock.now();
        let registration = blocking(move || registry.register(&new, now)).await?;
        Ok((
            StatusCode::CREATED,
            json!({
                "account_id": registration.account_id,
                "secret_key": registration.secret_key,
                "max_requests": registration.max_requests,
            }),
        ))
    }

    async fn upload(
        &self,
        account_id: AccountId,
        body: &[u8],
    ) -> Result<(StatusCode, Value), ApiError> {
        let req: UploadRequest = parse_body(body)?;
        let file_type = req
            .file_type
            .ok_or_else(|| ApiError::BadRequest("file_type is required".into()))?;
        let videos = self.videos.clone();
        let now = self.clock.now();
        let file =
            blocking(move || videos.register_upload(account_id, &file_type, now)).await?;
        Ok((StatusCode::OK, json!({ "key": file.key })))
    }

    /// Spend one quota unit on the caller's video and return the analysis.
    ///
    /// The unit is spent before the model runs and is kept if the model call
    /// fails. A retried request for the same video is only rejected once the
    /// first attempt has marked it analyzed.
    pub async fn analyze(
        &self,
        account_id: AccountId,
        body: &[u8],
    ) -> Result<(StatusCode, Value), ApiError> {
        let req: InferenceRequest = parse_body(body)?;
        let key = req
            .key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ApiError::BadRequest("Key is required".into()))?;

        let videos = self.videos.clone();
        let lookup = key.clone();
        let file = blocking(move || videos.get(&lookup))
            .await?
            .ok_or(ApiError::FileNotFound)?;
        if file.account_id != account_id {
            log::warn!(
                "Account {account_id} tried to analyze a file owned by account {}",
                file.account_id
            );
            return Err(ApiError::Forbidden);
        }
        if file.analyzed {
            return Err(ApiError::AlreadyAnalyzed);
        }

        let ledger = self.ledger.clone();
        if !blocking(move || ledger.try_consume(account_id)).await? {
            log::info!("Account {account_id} exceeded its monthly quota");
            return Err(ApiError::QuotaExceeded);
        }

        let analysis = self.inference.analyze(&key).await?;

        let videos = self.videos.clone();
        let analyzed = key.clone();
        if !blocking(move || videos.mark_analyzed(&analyzed)).await? {
            log::warn!("File {key} was analyzed concurrently");
        }
        Ok((StatusCode::OK, json!({ "analysis": analysis })))
    }

    async fn quota(&self, account_id: AccountId) -> Result<(StatusCode, Value), ApiError> {
        let ledger = self.ledger.clone();
        let record = blocking(move || ledger.peek(account_id)).await?;
        let registry = self.registry.clone();
        let plan = blocking(move || registry.account(account_id))
            .await?
            .map(|account| account.plan);
        let now = self.clock.now();
        Ok((
            StatusCode::OK,
            json!({
                "plan": plan,
                "key_id": record.key_id,
                "max_requests": record.max_requests,
                "requests_used": record.requests_used,
                "remaining": record.remaining(),
                "last_reset_date": record.last_reset_date.to_rfc3339(),
                "resets_at": record.resets_at().to_rfc3339(),
                "window_expired": record.window_expired(now),
            }),
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration as StdDuration, Instant};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use secret_key::KeyIssuer;

    use super::*;
    use crate::accounts::Plan;
    use crate::db::open_connection;
    use crate::db::testing::temp_db;
    use crate::ledger::tests::ManualClock;
    use crate::store::SqliteQuotaStore;

    /// Model stand-in that counts invocations.
    #[derive(Default)]
    struct FakeModel {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InferenceClient for FakeModel {
        async fn analyze(&self, key: &str) -> Result<Value, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InferenceError::Status(503));
            }
            Ok(json!({ "utterances": [{ "text": "hello", "key": key }] }))
        }
    }

    struct Harness {
        db: tempfile::NamedTempFile,
        gateway: Gateway,
        model: Arc<FakeModel>,
        metrics: Arc<Metrics>,
        clock: Arc<ManualClock>,
    }

    const PASSWORD: &str = "correct horse";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
    }

    fn harness_with(model: FakeModel, quota: i64) -> Harness {
        let db = temp_db();
        let registry = AccountRegistry::new(db.path(), KeyIssuer::new("sa"));
        registry
            .upsert_plan(&Plan {
                name: "Free".into(),
                monthly_quota: quota,
            })
            .unwrap();

        let clock = Arc::new(ManualClock::at(now()));
        let model = Arc::new(model);
        let metrics = Arc::new(Metrics::new());
        let gateway = Gateway::new(
            registry,
            QuotaLedger::with_clock(Arc::new(SqliteQuotaStore::new(db.path())), clock.clone()),
            VideoStore::new(db.path()),
            model.clone(),
            metrics.clone(),
            clock.clone(),
            "Free",
        );
        Harness {
            db,
            gateway,
            model,
            metrics,
            clock,
        }
    }

    fn harness(quota: i64) -> Harness {
        harness_with(FakeModel::default(), quota)
    }

    impl Harness {
        async fn post(&self, path: &str, key: Option<&str>, body: Value) -> (StatusCode, Value) {
            let auth = key.map(|k| format!("Bearer {k}"));
            self.gateway
                .handle(&Method::POST, path, auth.as_deref(), body.to_string().as_bytes())
                .await
        }

        async fn signup(&self, email: &str) -> (AccountId, String) {
            let (status, body) = self
                .post(
                    SIGNUP_PATH,
                    None,
                    json!({ "name": "Ada", "email": email, "password": PASSWORD }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
            (
                body["account_id"].as_i64().unwrap(),
                body["secret_key"].as_str().unwrap().to_string(),
            )
        }

        async fn upload(&self, key: &str) -> String {
            let (status, body) = self
                .post(UPLOAD_PATH, Some(key), json!({ "file_type": "mp4" }))
                .await;
            assert_eq!(status, StatusCode::OK, "{body}");
            body["key"].as_str().unwrap().to_string()
        }

        async fn infer(&self, key: Option<&str>, file: &str) -> (StatusCode, Value) {
            self.post(INFERENCE_PATH, key, json!({ "key": file })).await
        }

        async fn quota(&self, key: &str) -> Value {
            let auth = format!("Bearer {key}");
            let (status, body) = self
                .gateway
                .handle(&Method::GET, QUOTA_PATH, Some(&auth), b"")
                .await;
            assert_eq!(status, StatusCode::OK, "{body}");
            body
        }
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer sa_v1_x")), Some("sa_v1_x"));
        assert_eq!(bearer_token(Some("bearer   sa_v1_x ")), Some("sa_v1_x"));
        assert_eq!(bearer_token(Some("sa_v1_x")), Some("sa_v1_x"));
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(Some("")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::MissingKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidKey.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::FileNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::QuotaRecordMissing.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::AlreadyAnalyzed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::QuotaExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ApiError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ApiError::QuotaExceeded.body(),
            json!({ "error": "Monthly request quota exceeded." })
        );
    }

    #[tokio::test]
    async fn test_full_flow() {
        let h = harness(10);
        let (account_id, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;

        let (status, body) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["analysis"]["utterances"][0]["key"], file.as_str());
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);

        let quota = h.quota(&key).await;
        assert_eq!(quota["requests_used"], 1);
        assert_eq!(quota["remaining"], 9);
        assert_eq!(quota["plan"], "Free");

        let totals = h.metrics.totals(Caller::Account(account_id));
        assert_eq!(totals.get(&200), Some(&3));
    }

    #[tokio::test]
    async fn test_missing_and_invalid_key() {
        let h = harness(10);
        let (_, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;

        let (status, body) = h.infer(None, &file).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "API Key is required");

        let (status, body) = h.infer(Some("sa_v1_forged"), &file).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid API Key");

        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.totals(Caller::Anonymous).get(&401), Some(&2));
    }

    #[tokio::test]
    async fn test_malformed_body_and_missing_key_field() {
        let h = harness(10);
        let (_, key) = h.signup("ada@example.com").await;
        let auth = format!("Bearer {key}");

        let (status, _) = h
            .gateway
            .handle(&Method::POST, INFERENCE_PATH, Some(&auth), b"{not json")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = h.post(INFERENCE_PATH, Some(&key), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Key is required");
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let h = harness(10);
        let (_, key) = h.signup("ada@example.com").await;

        let (status, body) = h.infer(Some(&key), "inference/nope.mp4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "File not found.");
    }

    #[tokio::test]
    async fn test_cross_account_access_is_forbidden_and_free() {
        let h = harness(10);
        let (_, owner) = h.signup("owner@example.com").await;
        let (_, intruder) = h.signup("intruder@example.com").await;
        let file = h.upload(&owner).await;

        let (status, _) = h.infer(Some(&intruder), &file).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(h.quota(&intruder).await["requests_used"], 0);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_already_analyzed_does_not_spend_quota() {
        let h = harness(10);
        let (_, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;

        assert_eq!(h.infer(Some(&key), &file).await.0, StatusCode::OK);
        let (status, body) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File already analyzed");
        assert_eq!(h.quota(&key).await["requests_used"], 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_blocks_model_call() {
        let h = harness(2);
        let (account_id, key) = h.signup("ada@example.com").await;

        for _ in 0..2 {
            let file = h.upload(&key).await;
            assert_eq!(h.infer(Some(&key), &file).await.0, StatusCode::OK);
        }
        let file = h.upload(&key).await;
        let (status, body) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Monthly request quota exceeded.");
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.metrics.totals(Caller::Account(account_id)).get(&429),
            Some(&1)
        );

        // The file is still pending and can be analyzed once the window rolls.
        h.clock.set(now() + Duration::days(31));
        let (status, _) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.quota(&key).await["requests_used"], 1);
    }

    #[tokio::test]
    async fn test_failed_inference_keeps_the_spent_unit() {
        let h = harness_with(
            FakeModel {
                fail: true,
                ..FakeModel::default()
            },
            5,
        );
        let (_, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;

        let (status, body) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(h.quota(&key).await["requests_used"], 1);

        // Not marked analyzed, so the caller may retry.
        let (status, _) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.quota(&key).await["requests_used"], 2);
    }

    #[tokio::test]
    async fn test_missing_quota_record_maps_to_not_found() {
        let h = harness(5);
        let (account_id, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;

        let conn = open_connection(h.db.path()).unwrap();
        conn.execute("DELETE FROM Quotas WHERE account_id = ?1", [account_id])
            .unwrap();

        let body = json!({ "key": file }).to_string();
        let err = h
            .gateway
            .analyze(account_id, body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::QuotaRecordMissing));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);

        // Without its quota row the key no longer resolves either.
        let (status, _) = h.infer(Some(&key), &file).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signup_errors() {
        let h = harness(5);
        h.signup("ada@example.com").await;

        let (status, body) = h
            .post(
                SIGNUP_PATH,
                None,
                json!({ "name": "Ada", "email": "ADA@example.com", "password": PASSWORD }),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "An account with this email already exists");

        let (status, _) = h
            .post(
                SIGNUP_PATH,
                None,
                json!({
                    "name": "Bo",
                    "email": "bo@example.com",
                    "password": PASSWORD,
                    "plan": "Gold",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .post(SIGNUP_PATH, None, json!({ "email": "x@y.z", "password": PASSWORD }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h
            .post(SIGNUP_PATH, None, json!({ "name": "Cy", "email": "cy@example.com" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = h
            .post(
                SIGNUP_PATH,
                None,
                json!({ "name": "Cy", "email": "cy@example.com", "password": "short" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "Invalid data: password must be at least 8 characters"
        );

        let stored = h.gateway.registry.verify_password("ada@example.com", PASSWORD);
        assert!(stored.unwrap().is_some());
    }

    // Runs on a single-threaded runtime: a storage call that blocked the
    // worker would also hold up the timer below until the lock is released.
    #[tokio::test]
    async fn test_storage_lock_wait_does_not_stall_the_runtime() {
        let h = Arc::new(harness(5));
        let (_, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;

        let writer = open_connection(h.db.path()).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let request = {
            let h = h.clone();
            tokio::spawn(async move { h.infer(Some(&key), &file).await })
        };

        let started = Instant::now();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        let waited = started.elapsed();
        writer.execute_batch("COMMIT").unwrap();

        let (status, body) = request.await.unwrap();
        assert!(waited < StdDuration::from_secs(2), "timer held up for {waited:?}");
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(h.model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_file_type() {
        let h = harness(5);
        let (_, key) = h.signup("ada@example.com").await;

        let (status, _) = h
            .post(UPLOAD_PATH, Some(&key), json!({ "file_type": "exe" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h.post(UPLOAD_PATH, Some(&key), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_quota_view_does_not_roll_over() {
        let h = harness(3);
        let (_, key) = h.signup("ada@example.com").await;
        let file = h.upload(&key).await;
        h.infer(Some(&key), &file).await;

        h.clock.set(now() + Duration::days(40));
        let quota = h.quota(&key).await;
        assert_eq!(quota["requests_used"], 1);
        assert_eq!(quota["window_expired"], true);
        assert_eq!(quota["last_reset_date"], now().to_rfc3339());
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let h = harness(5);
        let (status, _) = h.gateway.handle(&Method::GET, "/nope", None, b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = h
            .gateway
            .handle(&Method::GET, INFERENCE_PATH, None, b"")
            .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
