//! Registration decision flow.
//!
//! Preferred path: the server's auto-decision endpoint determines and
//! commits the action atomically, which sidesteps the race between a
//! client-side history read and concurrent writes from other devices.
//! The local fallback reconstruction runs only when the endpoint is
//! demonstrably absent, never after a genuine server error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ponto_core::decision::{self, PlannedAction};
use ponto_core::idempotency;
use ponto_core::types::{GeoPoint, Identity, RecordKind};
use thiserror::Error;

use crate::api::{ApiError, AttendanceApi, AutoOutcome, RegisterRequest};
use crate::registrar::{Registrar, RegistrarError};

#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// One committed action, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedAction {
    pub kind: RecordKind,
    pub site_id: String,
}

/// What a completed clock operation did.
#[derive(Debug, Clone)]
pub struct ClockReceipt {
    pub actions: Vec<ExecutedAction>,
    pub via_fallback: bool,
}

pub struct RegistrationFlow<A: AttendanceApi> {
    api: Arc<A>,
    registrar: Registrar<A>,
    settle_delay: Duration,
}

impl<A: AttendanceApi> RegistrationFlow<A> {
    pub fn new(api: Arc<A>, register_timeout: Duration, settle_delay: Duration) -> Self {
        let registrar = Registrar::new(api.clone(), register_timeout);
        Self {
            api,
            registrar,
            settle_delay,
        }
    }

    /// Decide and commit the clock event(s) for `identity` at
    /// `target_site_id`.
    pub async fn clock(
        &self,
        identity: &Identity,
        target_site_id: &str,
        coords: Option<GeoPoint>,
    ) -> Result<ClockReceipt, FlowError> {
        let auto_key =
            idempotency::derive_key(&identity.user_id, target_site_id, "auto", Utc::now());

        match self
            .registrar
            .auto_register(target_site_id, &identity.user_id, coords, &auto_key)
            .await?
        {
            AutoOutcome::Decided(kind) => {
                tracing::info!(user = %identity.user_id, site = target_site_id, action = %kind,
                    "server decided registration");
                Ok(ClockReceipt {
                    actions: vec![ExecutedAction {
                        kind,
                        site_id: target_site_id.to_string(),
                    }],
                    via_fallback: false,
                })
            }
            AutoOutcome::NotSupported => {
                tracing::debug!("auto-decision endpoint absent; reconstructing locally");
                self.clock_fallback(identity, target_site_id, coords).await
            }
        }
    }

    async fn clock_fallback(
        &self,
        identity: &Identity,
        target_site_id: &str,
        coords: Option<GeoPoint>,
    ) -> Result<ClockReceipt, FlowError> {
        let records = self.api.list_today(&identity.user_id).await?;
        let plan = decision::plan(&records, target_site_id);
        tracing::info!(user = %identity.user_id, site = target_site_id, ?plan, "fallback plan");

        let mut actions = Vec::new();
        match plan {
            PlannedAction::Entrada { site_id } => {
                self.submit(identity, &site_id, RecordKind::Entrada, coords).await?;
                actions.push(ExecutedAction {
                    kind: RecordKind::Entrada,
                    site_id,
                });
            }
            PlannedAction::Saida { site_id } => {
                self.submit(identity, &site_id, RecordKind::Saida, coords).await?;
                actions.push(ExecutedAction {
                    kind: RecordKind::Saida,
                    site_id,
                });
            }
            PlannedAction::CloseThenOpen {
                close_site_id,
                open_site_id,
            } => {
                // Close-first, with a settle delay, so the server
                // observes "closed at the old site" before "opened at
                // the new one" even without a cross-request transaction.
                self.submit(identity, &close_site_id, RecordKind::Saida, coords)
                    .await?;
                actions.push(ExecutedAction {
                    kind: RecordKind::Saida,
                    site_id: close_site_id,
                });

                tokio::time::sleep(self.settle_delay).await;

                self.submit(identity, &open_site_id, RecordKind::Entrada, coords)
                    .await?;
                actions.push(ExecutedAction {
                    kind: RecordKind::Entrada,
                    site_id: open_site_id,
                });
            }
        }

        Ok(ClockReceipt {
            actions,
            via_fallback: true,
        })
    }

    async fn submit(
        &self,
        identity: &Identity,
        site_id: &str,
        kind: RecordKind,
        coords: Option<GeoPoint>,
    ) -> Result<(), FlowError> {
        let now = Utc::now();
        let req = RegisterRequest {
            user_id: identity.user_id.clone(),
            site_id: site_id.to_string(),
            kind,
            timestamp: now,
            coords,
            idempotency_key: idempotency::derive_key(
                &identity.user_id,
                site_id,
                kind.as_str(),
                now,
            ),
        };
        self.registrar.register(&req).await?;
        Ok(())
    }
}
