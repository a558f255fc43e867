//! Idempotent registration writes.
//!
//! At most one write is in flight per device. A second call while the
//! lock is held is rejected immediately, never queued: the caller is a
//! user-facing flow and a queued duplicate would register twice. The
//! idempotency key makes an explicit retry of the same logical request
//! safe; no retry happens automatically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::api::{Ack, ApiError, AttendanceApi, AutoOutcome, RegisterRequest};

#[derive(Error, Debug)]
pub enum RegistrarError {
    /// Another write is in flight; this trigger is suppressed.
    #[error("duplicate submission suppressed: a registration is already in flight")]
    DuplicateSubmissionSuppressed,
    #[error("network timeout")]
    NetworkTimeout,
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub struct Registrar<A: AttendanceApi> {
    api: Arc<A>,
    in_flight: AtomicBool,
    timeout: Duration,
}

/// Releases the in-flight lock on every exit path, including timeout
/// and panic unwinding.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<A: AttendanceApi> Registrar<A> {
    pub fn new(api: Arc<A>, timeout: Duration) -> Self {
        Self {
            api,
            in_flight: AtomicBool::new(false),
            timeout,
        }
    }

    fn acquire(&self) -> Result<InFlightGuard<'_>, RegistrarError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("registration rejected: another write in flight");
            return Err(RegistrarError::DuplicateSubmissionSuppressed);
        }
        Ok(InFlightGuard(&self.in_flight))
    }

    /// Commit one registration write under the in-flight lock.
    pub async fn register(&self, req: &RegisterRequest) -> Result<Ack, RegistrarError> {
        let _guard = self.acquire()?;
        tracing::info!(
            user = %req.user_id,
            site = %req.site_id,
            kind = %req.kind,
            key = %req.idempotency_key,
            "submitting registration"
        );
        match tokio::time::timeout(self.timeout, self.api.register(req)).await {
            Err(_) => Err(RegistrarError::NetworkTimeout),
            Ok(Err(ApiError::NetworkTimeout)) => Err(RegistrarError::NetworkTimeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(ack)) => {
                if ack.duplicate {
                    tracing::info!(record = %ack.record_id, "server suppressed duplicate key");
                }
                Ok(ack)
            }
        }
    }

    /// Run the server-side auto-decision under the same lock: it also
    /// commits a record.
    pub async fn auto_register(
        &self,
        site_id: &str,
        user_id: &str,
        coords: Option<ponto_core::types::GeoPoint>,
        idempotency_key: &str,
    ) -> Result<AutoOutcome, RegistrarError> {
        let _guard = self.acquire()?;
        match tokio::time::timeout(
            self.timeout,
            self.api.auto_register(site_id, user_id, coords, idempotency_key),
        )
        .await
        {
            Err(_) => Err(RegistrarError::NetworkTimeout),
            Ok(Err(ApiError::NetworkTimeout)) => Err(RegistrarError::NetworkTimeout),
            Ok(res) => Ok(res?),
        }
    }
}
