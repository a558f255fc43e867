//! Clock engine — wires scan, identity, geolocation and registration
//! into one serialized pipeline behind a clone-safe handle.
//!
//! Requests are processed one at a time, which is what guarantees that
//! exactly one scan session polls the camera. A request arriving while
//! one is running is rejected immediately, not queued.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ponto_core::types::{BiometricTemplate, Identity, QualityTier};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::api::{ApiError, AttendanceApi, IdentityService};
use crate::capture::CameraWorker;
use crate::config::Config;
use crate::flow::{FlowError, RegistrationFlow};
use crate::geo::Geolocator;
use crate::model::SidecarRuntime;
use crate::scan::{ScanConfig, ScanError, ScanSession, ScanStatus};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("a scan is already in progress")]
    Busy,
    #[error("engine task exited")]
    ChannelClosed,
}

/// Result of one completed clock operation, surfaced over D-Bus.
#[derive(Debug, Clone, Serialize)]
pub struct ClockSummary {
    pub user_id: String,
    pub user_name: String,
    pub quality: QualityTier,
    pub via_fallback: bool,
    pub actions: Vec<ActionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub action: String,
    pub site_id: String,
}

/// Scan seam for the engine: runs one full capture and returns the
/// template. Production builds a fresh camera session and model runtime
/// per scan.
pub trait ScanDriver: Send + 'static {
    fn scan(
        &mut self,
        cancel: watch::Receiver<bool>,
        status: watch::Sender<ScanStatus>,
    ) -> impl std::future::Future<Output = Result<BiometricTemplate, ScanError>> + Send;
}

/// Production driver: camera thread plus the inference sidecar.
pub struct CameraScanDriver {
    camera_device: String,
    orientation: ponto_hw::Orientation,
    model_runtime_url: String,
    scan_config: ScanConfig,
}

impl CameraScanDriver {
    pub fn from_config(config: &Config) -> Self {
        Self {
            camera_device: config.camera_device.clone(),
            orientation: config.orientation,
            model_runtime_url: config.model_runtime_url.clone(),
            scan_config: ScanConfig {
                accept_threshold: config.accept_threshold,
                target_samples: config.target_samples,
                tick_interval: config.tick_interval,
                no_face_deadline: config.no_face_deadline,
                max_consecutive_failures: config.max_consecutive_failures,
            },
        }
    }
}

impl ScanDriver for CameraScanDriver {
    async fn scan(
        &mut self,
        cancel: watch::Receiver<bool>,
        status: watch::Sender<ScanStatus>,
    ) -> Result<BiometricTemplate, ScanError> {
        let camera = CameraWorker::new(&self.camera_device, self.orientation);
        let runtime = SidecarRuntime::new(&self.model_runtime_url)
            .map_err(|e| ScanError::ModelLoadFailure(e.to_string()))?;
        let mut session =
            ScanSession::new(self.scan_config.clone(), camera, runtime, cancel, status);
        session.run().await
    }
}

enum EngineRequest {
    Clock {
        site_id: Option<String>,
        reply: oneshot::Sender<Result<ClockSummary, EngineError>>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status_rx: watch::Receiver<ScanStatus>,
    cancel_slot: Arc<Mutex<Option<watch::Sender<bool>>>>,
    busy: Arc<std::sync::atomic::AtomicBool>,
}

impl EngineHandle {
    /// Run a full clock operation. `site_id` of `None` uses the
    /// device's configured site. Fails fast with `Busy` while another
    /// operation is running.
    pub async fn clock_in(&self, site_id: Option<String>) -> Result<ClockSummary, EngineError> {
        // Admission happens here, not in the task: the flag must be
        // set before the request is visible, otherwise a second caller
        // could slip into the channel while the task is mid-operation
        // and get queued behind it.
        if self
            .busy
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_err()
        {
            return Err(EngineError::Busy);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(e) = self.tx.try_send(EngineRequest::Clock {
            site_id,
            reply: reply_tx,
        }) {
            self.busy.store(false, std::sync::atomic::Ordering::Release);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => EngineError::Busy,
                mpsc::error::TrySendError::Closed(_) => EngineError::ChannelClosed,
            });
        }
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Cooperatively cancel the running scan, if any. In-flight network
    /// calls are not aborted; their results are discarded.
    pub fn cancel(&self) {
        let slot = self.cancel_slot.lock().expect("cancel slot poisoned");
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Latest scan status.
    pub fn status(&self) -> ScanStatus {
        self.status_rx.borrow().clone()
    }
}

pub struct Engine<S, I, A, G>
where
    S: ScanDriver,
    I: IdentityService + 'static,
    A: AttendanceApi + 'static,
    G: Geolocator + 'static,
{
    driver: S,
    identity: Arc<I>,
    geolocator: Arc<G>,
    flow: RegistrationFlow<A>,
    default_site: String,
    geo_timeout: Duration,
}

impl<S, I, A, G> Engine<S, I, A, G>
where
    S: ScanDriver,
    I: IdentityService + 'static,
    A: AttendanceApi + 'static,
    G: Geolocator + 'static,
{
    pub fn new(
        driver: S,
        identity: Arc<I>,
        geolocator: Arc<G>,
        flow: RegistrationFlow<A>,
        default_site: String,
        geo_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            identity,
            geolocator,
            flow,
            default_site,
            geo_timeout,
        }
    }

    /// Spawn the engine task and return its handle.
    pub fn spawn(mut self) -> EngineHandle {
        // Capacity 1 with try_send: one running operation, no queue.
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);
        let (status_tx, status_rx) = watch::channel(ScanStatus::default());
        let cancel_slot: Arc<Mutex<Option<watch::Sender<bool>>>> = Arc::new(Mutex::new(None));
        let busy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let slot_for_task = cancel_slot.clone();
        let busy_for_task = busy.clone();

        tokio::spawn(async move {
            tracing::info!("engine task started");
            while let Some(req) = rx.recv().await {
                match req {
                    EngineRequest::Clock { site_id, reply } => {
                        // The handle set `busy` at admission; this task
                        // only ever clears it.
                        let (cancel_tx, cancel_rx) = watch::channel(false);
                        *slot_for_task.lock().expect("cancel slot poisoned") = Some(cancel_tx);

                        let result = self
                            .run_clock(site_id, cancel_rx, status_tx.clone())
                            .await;

                        *slot_for_task.lock().expect("cancel slot poisoned") = None;
                        busy_for_task.store(false, std::sync::atomic::Ordering::Release);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine task exiting");
        });

        EngineHandle {
            tx,
            status_rx,
            cancel_slot,
            busy,
        }
    }

    async fn run_clock(
        &mut self,
        site_id: Option<String>,
        cancel: watch::Receiver<bool>,
        status: watch::Sender<ScanStatus>,
    ) -> Result<ClockSummary, EngineError> {
        let site_id = site_id.unwrap_or_else(|| self.default_site.clone());

        // Geolocation starts with the scan so its latency hides behind
        // the classifier and identity round trips.
        let geolocator = self.geolocator.clone();
        let geo_timeout = self.geo_timeout;
        let geo_task =
            tokio::spawn(async move { geolocator.current_position(geo_timeout).await });

        let template = match self.driver.scan(cancel, status).await {
            Ok(t) => t,
            Err(e) => {
                geo_task.abort();
                return Err(e.into());
            }
        };
        tracing::info!(
            samples = template.sample_count,
            quality = ?template.quality,
            "capture complete; authenticating"
        );

        let (identity, fix) = tokio::join!(
            self.identity.authenticate(&template),
            async { geo_task.await.unwrap_or_default() }
        );
        let identity: Identity = identity?;
        tracing::info!(user = %identity.user_id, "identified");

        let receipt = self.flow.clock(&identity, &site_id, fix.coords).await?;

        Ok(ClockSummary {
            user_id: identity.user_id,
            user_name: identity.user_name,
            quality: template.quality,
            via_fallback: receipt.via_fallback,
            actions: receipt
                .actions
                .into_iter()
                .map(|a| ActionSummary {
                    action: a.kind.as_str().to_string(),
                    site_id: a.site_id,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Ack, AutoOutcome, RegisterRequest};
    use crate::geo::{FixedGeolocator, GeoFix};
    use ponto_core::types::{AttendanceRecord, GeoPoint, RecordKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    fn template() -> BiometricTemplate {
        BiometricTemplate {
            descriptor: vec![0.1, 0.2],
            sample_count: 5,
            avg_confidence: 0.85,
            quality: QualityTier::Excellent,
            still_png: vec![1, 2, 3],
        }
    }

    struct FakeDriver {
        delay: Duration,
        fail: bool,
    }

    impl ScanDriver for FakeDriver {
        async fn scan(
            &mut self,
            _cancel: watch::Receiver<bool>,
            _status: watch::Sender<ScanStatus>,
        ) -> Result<BiometricTemplate, ScanError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ScanError::NoFaceTimeout);
            }
            Ok(template())
        }
    }

    struct FakeIdentity {
        fail: bool,
    }

    impl IdentityService for FakeIdentity {
        async fn authenticate(
            &self,
            _template: &BiometricTemplate,
        ) -> Result<Identity, ApiError> {
            if self.fail {
                return Err(ApiError::AuthenticationFailed);
            }
            Ok(Identity {
                user_id: "u1".into(),
                user_name: "Maria".into(),
            })
        }
    }

    struct FakeApi {
        writes: AsyncMutex<Vec<(RecordKind, String, Option<GeoPoint>)>>,
        auto_calls: AtomicU32,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                writes: AsyncMutex::new(Vec::new()),
                auto_calls: AtomicU32::new(0),
            }
        }
    }

    impl AttendanceApi for FakeApi {
        async fn auto_register(
            &self,
            _site_id: &str,
            _user_id: &str,
            _coords: Option<GeoPoint>,
            _key: &str,
        ) -> Result<AutoOutcome, ApiError> {
            self.auto_calls.fetch_add(1, Ordering::SeqCst);
            Ok(AutoOutcome::NotSupported)
        }

        async fn list_today(&self, _user_id: &str) -> Result<Vec<AttendanceRecord>, ApiError> {
            Ok(Vec::new())
        }

        async fn register(&self, req: &RegisterRequest) -> Result<Ack, ApiError> {
            let mut writes = self.writes.lock().await;
            writes.push((req.kind, req.site_id.clone(), req.coords));
            Ok(Ack {
                record_id: "r1".into(),
                duplicate: false,
            })
        }
    }

    fn engine(
        driver: FakeDriver,
        identity: FakeIdentity,
        api: Arc<FakeApi>,
    ) -> Engine<FakeDriver, FakeIdentity, FakeApi, FixedGeolocator> {
        let flow = RegistrationFlow::new(api, Duration::from_secs(8), Duration::from_millis(500));
        Engine::new(
            driver,
            Arc::new(identity),
            Arc::new(FixedGeolocator::new(Some(GeoPoint {
                lat: -23.5,
                lng: -46.6,
            }))),
            flow,
            "default-site".into(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_clock_operation() {
        let api = Arc::new(FakeApi::new());
        let handle = engine(
            FakeDriver {
                delay: Duration::from_millis(100),
                fail: false,
            },
            FakeIdentity { fail: false },
            api.clone(),
        )
        .spawn();

        let summary = handle.clock_in(Some("A".into())).await.unwrap();
        assert_eq!(summary.user_name, "Maria");
        assert_eq!(summary.actions.len(), 1);
        assert_eq!(summary.actions[0].action, "entrada");
        assert_eq!(summary.actions[0].site_id, "A");

        // Prefetched kiosk coordinates made it onto the write.
        let writes = api.writes.lock().await;
        assert!(writes[0].2.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_site_used_when_unspecified() {
        let api = Arc::new(FakeApi::new());
        let handle = engine(
            FakeDriver {
                delay: Duration::ZERO,
                fail: false,
            },
            FakeIdentity { fail: false },
            api.clone(),
        )
        .spawn();

        let summary = handle.clock_in(None).await.unwrap();
        assert_eq!(summary.actions[0].site_id, "default-site");
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_rejected_while_busy() {
        let api = Arc::new(FakeApi::new());
        let handle = engine(
            FakeDriver {
                delay: Duration::from_secs(3),
                fail: false,
            },
            FakeIdentity { fail: false },
            api,
        )
        .spawn();

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.clock_in(Some("A".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Engine is mid-scan: the slot and the channel are both taken.
        let second = handle.clock_in(Some("A".into())).await;
        assert!(matches!(second, Err(EngineError::Busy)));

        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_request_is_never_queued() {
        // A request refused while one is running must not run later:
        // admission flips the busy flag before the request is sent, so
        // there is no window where the emptied channel admits a second
        // request behind the task's back.
        struct CountingDriver {
            calls: Arc<AtomicU32>,
        }

        impl ScanDriver for CountingDriver {
            async fn scan(
                &mut self,
                _cancel: watch::Receiver<bool>,
                _status: watch::Sender<ScanStatus>,
            ) -> Result<BiometricTemplate, ScanError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(template())
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let api = Arc::new(FakeApi::new());
        let flow =
            RegistrationFlow::new(api, Duration::from_secs(8), Duration::from_millis(500));
        let handle = Engine::new(
            CountingDriver {
                calls: calls.clone(),
            },
            Arc::new(FakeIdentity { fail: false }),
            Arc::new(FixedGeolocator::new(None)),
            flow,
            "default-site".into(),
            Duration::from_secs(5),
        )
        .spawn();

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.clock_in(Some("A".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = handle.clock_in(Some("B".into())).await;
        assert!(matches!(second, Err(EngineError::Busy)));

        assert!(first.await.unwrap().is_ok());
        // Give a queued request time to surface if one existed.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reaches_running_scan() {
        struct CancellableDriver;

        impl ScanDriver for CancellableDriver {
            async fn scan(
                &mut self,
                mut cancel: watch::Receiver<bool>,
                _status: watch::Sender<ScanStatus>,
            ) -> Result<BiometricTemplate, ScanError> {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(template()),
                    _ = cancel.changed() => Err(ScanError::Cancelled),
                }
            }
        }

        let api = Arc::new(FakeApi::new());
        let flow =
            RegistrationFlow::new(api.clone(), Duration::from_secs(8), Duration::from_millis(500));
        let handle = Engine::new(
            CancellableDriver,
            Arc::new(FakeIdentity { fail: false }),
            Arc::new(FixedGeolocator::new(None)),
            flow,
            "default-site".into(),
            Duration::from_secs(5),
        )
        .spawn();

        let clock = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.clock_in(Some("A".into())).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let result = clock.await.unwrap();
        assert!(matches!(
            result,
            Err(EngineError::Scan(ScanError::Cancelled))
        ));
        assert!(api.writes.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_commits_nothing() {
        let api = Arc::new(FakeApi::new());
        let handle = engine(
            FakeDriver {
                delay: Duration::ZERO,
                fail: false,
            },
            FakeIdentity { fail: true },
            api.clone(),
        )
        .spawn();

        let err = handle.clock_in(Some("A".into())).await.unwrap_err();
        assert!(matches!(err, EngineError::Api(ApiError::AuthenticationFailed)));
        assert_eq!(api.auto_calls.load(Ordering::SeqCst), 0);
        assert!(api.writes.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_surfaces_and_recovers() {
        let api = Arc::new(FakeApi::new());
        let handle = engine(
            FakeDriver {
                delay: Duration::ZERO,
                fail: true,
            },
            FakeIdentity { fail: false },
            api.clone(),
        )
        .spawn();

        let err = handle.clock_in(Some("A".into())).await.unwrap_err();
        assert!(matches!(err, EngineError::Scan(ScanError::NoFaceTimeout)));
        assert!(api.writes.lock().await.is_empty());
    }
}
