//! HTTP clients for the identity and attendance services.
//!
//! Both services are trait seams so the decision flow and registrar can
//! be exercised against scripted backends. The production impls are
//! thin reqwest clients against the ERP gateway.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ponto_core::types::{AttendanceRecord, BiometricTemplate, GeoPoint, Identity, RecordKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("network timeout")]
    NetworkTimeout,
    #[error("server error: {0}")]
    ServerError(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One registration write, fully specified.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub user_id: String,
    pub site_id: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    pub coords: Option<GeoPoint>,
    pub idempotency_key: String,
}

/// Backend acknowledgement of a registration write.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    pub record_id: String,
    /// True when the backend matched the idempotency key against an
    /// existing record and created nothing.
    #[serde(default)]
    pub duplicate: bool,
}

/// Outcome of the server-side auto-decision endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoOutcome {
    /// The server decided and committed this action atomically.
    Decided(RecordKind),
    /// The backend does not implement auto-decision. The only signal
    /// that permits the fallback path.
    NotSupported,
}

pub trait AttendanceApi: Send + Sync {
    /// Ask the server to decide and commit entrada/saida atomically.
    fn auto_register(
        &self,
        site_id: &str,
        user_id: &str,
        coords: Option<GeoPoint>,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<AutoOutcome, ApiError>> + Send;

    /// Today's records for the user, fallback path only.
    fn list_today(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<AttendanceRecord>, ApiError>> + Send;

    /// Commit one explicit registration write.
    fn register(&self, req: &RegisterRequest) -> impl Future<Output = Result<Ack, ApiError>> + Send;
}

pub trait IdentityService: Send + Sync {
    /// Identify the person behind a captured template.
    fn authenticate(
        &self,
        template: &BiometricTemplate,
    ) -> impl Future<Output = Result<Identity, ApiError>> + Send;
}

/// reqwest-backed client for both services.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::ServerError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_send_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::NetworkTimeout
        } else {
            ApiError::ServerError(e.to_string())
        }
    }
}

#[derive(Deserialize)]
struct AutoResponse {
    action: RecordKind,
}

#[derive(Deserialize)]
struct ListResponse {
    records: Vec<AttendanceRecord>,
}

impl AttendanceApi for HttpApi {
    async fn auto_register(
        &self,
        site_id: &str,
        user_id: &str,
        coords: Option<GeoPoint>,
        idempotency_key: &str,
    ) -> Result<AutoOutcome, ApiError> {
        let body = serde_json::json!({
            "site_id": site_id,
            "user_id": user_id,
            "coords": coords,
            "idempotency_key": idempotency_key,
        });
        let resp = self
            .client
            .post(self.url("/attendance/auto"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        // 404 is the distinguishable "endpoint absent" signal; any
        // other failure is genuine and must not silently downgrade to
        // the fallback path.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(AutoOutcome::NotSupported);
        }
        if !resp.status().is_success() {
            return Err(ApiError::ServerError(format!(
                "auto-register returned {}",
                resp.status()
            )));
        }
        let body: AutoResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(AutoOutcome::Decided(body.action))
    }

    async fn list_today(&self, user_id: &str) -> Result<Vec<AttendanceRecord>, ApiError> {
        let resp = self
            .client
            .get(self.url(&format!("/attendance/today/{user_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        if !resp.status().is_success() {
            return Err(ApiError::ServerError(format!(
                "list-today returned {}",
                resp.status()
            )));
        }
        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(body.records)
    }

    async fn register(&self, req: &RegisterRequest) -> Result<Ack, ApiError> {
        let resp = self
            .client
            .post(self.url("/attendance/register"))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        // The backend answers a replayed idempotency key with 409 plus
        // the original record.
        if resp.status() == reqwest::StatusCode::CONFLICT {
            let mut ack: Ack = resp
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
            ack.duplicate = true;
            return Ok(ack);
        }
        if !resp.status().is_success() {
            return Err(ApiError::ServerError(format!(
                "register returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

impl IdentityService for HttpApi {
    async fn authenticate(&self, template: &BiometricTemplate) -> Result<Identity, ApiError> {
        let resp = self
            .client
            .post(self.url("/identity/authenticate"))
            .bearer_auth(&self.token)
            .json(template)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            || resp.status() == reqwest::StatusCode::FORBIDDEN
            || resp.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Err(ApiError::AuthenticationFailed);
        }
        if !resp.status().is_success() {
            return Err(ApiError::ServerError(format!(
                "authenticate returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}
