//! Scan loop — the capture state machine.
//!
//! One [`ScanSession`] owns the camera and the model runtime for the
//! lifetime of a scan. The loop is self-paced: the next detection tick
//! is scheduled only after the previous one completes, so two classifier
//! calls can never overlap even when inference latency exceeds the tick
//! interval. Completion is additionally guarded by the aggregator's
//! exactly-once emission.

use std::future::Future;
use std::time::Duration;

use ponto_core::aggregator::{AggregateError, SampleAggregator};
use ponto_core::types::{BiometricTemplate, FacialSample};
use ponto_hw::camera::CameraError;
use ponto_hw::frame::is_dark_frame;
use ponto_hw::Frame;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{ModelError, ModelRuntime};

/// Delay before reporting a model load failure, so a caller watching
/// status sees the LoadingModels phase before the terminal state.
const FAILURE_OBSERVE_DELAY: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("model load failure: {0}")]
    ModelLoadFailure(String),
    #[error("no face detected before the deadline")]
    NoFaceTimeout,
    #[error("face not detected consistently")]
    LowConfidenceCapture,
    #[error("scan already completed")]
    AlreadyCompleted,
    #[error("scan cancelled")]
    Cancelled,
}

/// Scan state. Transitions are forward-only; Failed and Cancelled are
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    LoadingModels,
    AcquiringCamera,
    Detecting,
    Capturing,
    Completing,
    Done,
    Failed,
    Cancelled,
}

impl ScanPhase {
    fn ordinal(self) -> u8 {
        match self {
            ScanPhase::Idle => 0,
            ScanPhase::LoadingModels => 1,
            ScanPhase::AcquiringCamera => 2,
            ScanPhase::Detecting => 3,
            ScanPhase::Capturing => 4,
            ScanPhase::Completing => 5,
            ScanPhase::Done => 6,
            ScanPhase::Failed => 7,
            ScanPhase::Cancelled => 8,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanPhase::Done | ScanPhase::Failed | ScanPhase::Cancelled)
    }
}

/// User-facing scan progress, published over a watch channel.
#[derive(Debug, Clone)]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub message: String,
}

impl Default for ScanStatus {
    fn default() -> Self {
        Self {
            phase: ScanPhase::Idle,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub accept_threshold: f32,
    pub target_samples: usize,
    pub tick_interval: Duration,
    pub no_face_deadline: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.55,
            target_samples: 5,
            tick_interval: Duration::from_millis(220),
            no_face_deadline: Duration::from_secs(8),
            max_consecutive_failures: 8,
        }
    }
}

/// Camera seam for the scan loop. [`crate::capture::CameraWorker`] is
/// the production implementation; both operations must be genuine
/// suspension points so the loop can race them against cancellation.
pub trait FrameSource: Send {
    fn acquire(&mut self) -> impl Future<Output = Result<(), CameraError>> + Send;
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, CameraError>> + Send;
    fn release(&mut self);
}

/// One scan attempt: camera ownership, sample collection, aggregation.
pub struct ScanSession<C: FrameSource, M: ModelRuntime> {
    id: Uuid,
    config: ScanConfig,
    camera: C,
    runtime: M,
    phase: ScanPhase,
    samples: Vec<FacialSample>,
    consecutive_failures: u32,
    aggregator: SampleAggregator,
    /// Highest-confidence accepted frame, kept for the template still.
    best_frame: Option<(f32, Frame)>,
    cancel: watch::Receiver<bool>,
    status: watch::Sender<ScanStatus>,
}

impl<C: FrameSource, M: ModelRuntime> ScanSession<C, M> {
    pub fn new(
        config: ScanConfig,
        camera: C,
        runtime: M,
        cancel: watch::Receiver<bool>,
        status: watch::Sender<ScanStatus>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            camera,
            runtime,
            phase: ScanPhase::Idle,
            samples: Vec::new(),
            consecutive_failures: 0,
            aggregator: SampleAggregator::default(),
            best_frame: None,
            cancel,
            status,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    /// Run the scan to completion. The camera is released on every exit
    /// path, including cancellation and failure.
    pub async fn run(&mut self) -> Result<BiometricTemplate, ScanError> {
        let result = self.drive().await;
        self.camera.release();
        match &result {
            Ok(_) => self.advance(ScanPhase::Done, "capture complete"),
            Err(ScanError::Cancelled) => self.advance(ScanPhase::Cancelled, "cancelled"),
            Err(e) => self.advance(ScanPhase::Failed, &e.to_string()),
        }
        tracing::info!(session = %self.id, phase = ?self.phase, "scan finished");
        result
    }

    async fn drive(&mut self) -> Result<BiometricTemplate, ScanError> {
        self.advance(ScanPhase::LoadingModels, "loading models");
        if let Err(e) = self.runtime.load().await {
            tracing::warn!(session = %self.id, error = %e, "model load failed");
            tokio::time::sleep(FAILURE_OBSERVE_DELAY).await;
            return Err(ScanError::ModelLoadFailure(e.to_string()));
        }
        if self.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        self.advance(ScanPhase::AcquiringCamera, "acquiring camera");
        self.camera.acquire().await?;

        self.advance(ScanPhase::Detecting, "position your face");
        self.detect_loop().await?;

        self.advance(ScanPhase::Capturing, "capturing still");
        let still_png = match &self.best_frame {
            Some((_, frame)) => match frame.to_png() {
                Ok(png) => png,
                Err(e) => {
                    tracing::warn!(session = %self.id, error = %e,
                        "still encode failed; submitting without image");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        self.advance(ScanPhase::Completing, "completing");
        match self.aggregator.emit(&self.samples, still_png) {
            Ok(template) => Ok(template),
            Err(AggregateError::EmptyCapture) => Err(ScanError::NoFaceTimeout),
            Err(AggregateError::AlreadyEmitted) => {
                // Allow a fresh attempt after this one is observed.
                self.aggregator.reset();
                Err(ScanError::AlreadyCompleted)
            }
        }
    }

    /// Self-paced detection loop. Each iteration captures one frame,
    /// awaits one classifier call, and only then schedules the next
    /// tick, so ticks never overlap.
    async fn detect_loop(&mut self) -> Result<(), ScanError> {
        let mut no_face_deadline = Instant::now() + self.config.no_face_deadline;

        loop {
            if self.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            // Independent of tick outcomes: enforced even when ticks
            // are slow or the failure counter is configured off.
            if Instant::now() >= no_face_deadline {
                return Err(ScanError::NoFaceTimeout);
            }

            let tick_start = Instant::now();
            // The dequeue can stall indefinitely on a wedged driver;
            // cancellation and the deadline must stay live through it.
            let frame = tokio::select! {
                res = self.camera.next_frame() => res?,
                _ = self.cancel.changed() => return Err(ScanError::Cancelled),
                _ = tokio::time::sleep_until(no_face_deadline) => {
                    return Err(ScanError::NoFaceTimeout);
                }
            };

            let detections = if is_dark_frame(&frame.data, 0.95) {
                Vec::new()
            } else {
                match self.runtime.detect_faces(&frame).await {
                    Ok(d) => d,
                    Err(ModelError::LoadFailure(e)) => return Err(ScanError::ModelLoadFailure(e)),
                    Err(ModelError::InferenceFailed(e)) => {
                        tracing::debug!(session = %self.id, error = %e, "inference tick failed");
                        Vec::new()
                    }
                }
            };

            // The detect call may have straddled a cancellation; the
            // result is ignored in that case.
            if self.is_cancelled() {
                return Err(ScanError::Cancelled);
            }

            match detections.as_slice() {
                [only] if only.confidence >= self.config.accept_threshold => {
                    self.samples.push(FacialSample {
                        detection: only.clone(),
                        captured_at: std::time::Instant::now(),
                    });
                    self.consecutive_failures = 0;
                    no_face_deadline = Instant::now() + self.config.no_face_deadline;

                    let better = match &self.best_frame {
                        Some((conf, _)) => only.confidence > *conf,
                        None => true,
                    };
                    if better {
                        self.best_frame = Some((only.confidence, frame));
                    }

                    self.publish(&format!(
                        "captured {}/{}",
                        self.samples.len(),
                        self.config.target_samples
                    ));
                }
                [_] => {
                    self.consecutive_failures += 1;
                    self.publish("hold still");
                }
                [] => {
                    self.consecutive_failures += 1;
                    self.publish("position your face");
                }
                _ => {
                    // Non-fatal: reported to the user, counted as a
                    // failed tick.
                    self.consecutive_failures += 1;
                    self.publish("multiple faces detected");
                }
            }

            if self.samples.len() >= self.config.target_samples {
                return Ok(());
            }
            if self.consecutive_failures >= self.config.max_consecutive_failures {
                return Err(ScanError::LowConfidenceCapture);
            }

            let next_tick = tick_start + self.config.tick_interval;
            tokio::select! {
                _ = tokio::time::sleep_until(next_tick) => {}
                _ = self.cancel.changed() => {}
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn advance(&mut self, next: ScanPhase, message: &str) {
        if self.phase.is_terminal() {
            return;
        }
        if next.ordinal() <= self.phase.ordinal() {
            tracing::warn!(session = %self.id, from = ?self.phase, to = ?next,
                "ignoring backward phase transition");
            return;
        }
        self.phase = next;
        self.publish(message);
    }

    fn publish(&self, message: &str) {
        self.status.send_replace(ScanStatus {
            phase: self.phase,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ponto_core::types::Detection;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_frame() -> Frame {
        Frame {
            data: vec![128u8; 16],
            width: 4,
            height: 4,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    fn face(confidence: f32) -> Detection {
        Detection {
            confidence,
            landmarks: None,
            descriptor: vec![1.0, 2.0, 3.0],
        }
    }

    struct FakeCamera {
        acquired: Arc<AtomicBool>,
        fail_acquire: bool,
        corrupt_frames: bool,
    }

    impl FakeCamera {
        fn new() -> (Self, Arc<AtomicBool>) {
            let acquired = Arc::new(AtomicBool::new(false));
            (
                Self {
                    acquired: acquired.clone(),
                    fail_acquire: false,
                    corrupt_frames: false,
                },
                acquired,
            )
        }
    }

    impl FrameSource for FakeCamera {
        async fn acquire(&mut self) -> Result<(), CameraError> {
            if self.fail_acquire {
                return Err(CameraError::Unavailable("fake".into()));
            }
            self.acquired.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn next_frame(&mut self) -> Result<Frame, CameraError> {
            if !self.acquired.load(Ordering::SeqCst) {
                return Err(CameraError::NotAcquired);
            }
            let mut frame = test_frame();
            if self.corrupt_frames {
                // Pixel payload inconsistent with the dimensions.
                frame.data.truncate(3);
            }
            Ok(frame)
        }

        fn release(&mut self) {
            self.acquired.store(false, Ordering::SeqCst);
        }
    }

    /// Camera whose dequeues never return, as a wedged driver would.
    struct StalledCamera {
        acquired: Arc<AtomicBool>,
    }

    impl FrameSource for StalledCamera {
        async fn acquire(&mut self) -> Result<(), CameraError> {
            self.acquired.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn next_frame(&mut self) -> Result<Frame, CameraError> {
            std::future::pending().await
        }

        fn release(&mut self) {
            self.acquired.store(false, Ordering::SeqCst);
        }
    }

    /// Scripted classifier: pops one outcome per tick, repeats the last
    /// script entry once exhausted. Tracks in-flight call overlap.
    struct FakeRuntime {
        script: VecDeque<Vec<Detection>>,
        latency: Duration,
        fail_load: bool,
        in_flight: Arc<AtomicU32>,
        max_in_flight: Arc<AtomicU32>,
    }

    impl FakeRuntime {
        fn new(script: Vec<Vec<Detection>>) -> Self {
            Self {
                script: script.into(),
                latency: Duration::ZERO,
                fail_load: false,
                in_flight: Arc::new(AtomicU32::new(0)),
                max_in_flight: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl ModelRuntime for FakeRuntime {
        async fn load(&mut self) -> Result<(), ModelError> {
            if self.fail_load {
                return Err(ModelError::LoadFailure("no sidecar".into()));
            }
            Ok(())
        }

        async fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<Detection>, ModelError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let out = if self.script.len() > 1 {
                self.script.pop_front().unwrap()
            } else {
                self.script.front().cloned().unwrap_or_default()
            };
            Ok(out)
        }
    }

    fn session(
        config: ScanConfig,
        camera: FakeCamera,
        runtime: FakeRuntime,
    ) -> (ScanSession<FakeCamera, FakeRuntime>, watch::Sender<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, _status_rx) = watch::channel(ScanStatus::default());
        (
            ScanSession::new(config, camera, runtime, cancel_rx, status_tx),
            cancel_tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_collects_target_samples() {
        let (camera, acquired) = FakeCamera::new();
        let runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        let template = session.run().await.unwrap();
        assert_eq!(template.sample_count, 5);
        assert_eq!(session.phase(), ScanPhase::Done);
        // Camera released after completion.
        assert!(!acquired.load(Ordering::SeqCst));
        // Still image captured from the best frame.
        assert!(!template.still_png.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eight_failed_ticks_fail_and_release_camera() {
        let (camera, acquired) = FakeCamera::new();
        let runtime = FakeRuntime::new(vec![vec![]]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::LowConfidenceCapture));
        assert_eq!(session.phase(), ScanPhase::Failed);
        assert!(!acquired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_face_deadline_independent_of_failure_counter() {
        let (camera, acquired) = FakeCamera::new();
        let runtime = FakeRuntime::new(vec![vec![]]);
        let config = ScanConfig {
            // Counter path disabled: only the deadline can fire.
            max_consecutive_failures: u32::MAX,
            ..ScanConfig::default()
        };
        let (mut session, _cancel) = session(config, camera, runtime);

        let start = Instant::now();
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::NoFaceTimeout));
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(!acquired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_faces_are_non_fatal() {
        let (camera, _) = FakeCamera::new();
        // Two multi-face ticks, then clean single-face ticks.
        let runtime = FakeRuntime::new(vec![
            vec![face(0.9), face(0.8)],
            vec![face(0.9), face(0.8)],
            vec![face(0.9)],
        ]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        let template = session.run().await.unwrap();
        assert_eq!(template.sample_count, 5);
        assert_eq!(session.phase(), ScanPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_detections_are_rejected() {
        let (camera, _) = FakeCamera::new();
        // Below the 0.55 accept threshold every tick.
        let runtime = FakeRuntime::new(vec![vec![face(0.4)]]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::LowConfidenceCapture));
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_load_failure() {
        let (camera, acquired) = FakeCamera::new();
        let mut runtime = FakeRuntime::new(vec![]);
        runtime.fail_load = true;
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::ModelLoadFailure(_)));
        // Camera was never acquired.
        assert!(!acquired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_unavailable() {
        let (mut camera, _) = FakeCamera::new();
        camera.fail_acquire = true;
        let runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::CameraUnavailable(_)));
        assert_eq!(session.phase(), ScanPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_camera() {
        let (camera, acquired) = FakeCamera::new();
        let mut runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        // Slow ticks so cancellation lands mid-scan.
        runtime.latency = Duration::from_millis(500);
        let config = ScanConfig {
            target_samples: 50,
            ..ScanConfig::default()
        };
        let (mut session, cancel) = session(config, camera, runtime);

        let scan = async { session.run().await };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            cancel.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(scan, canceller);

        assert!(matches!(result.unwrap_err(), ScanError::Cancelled));
        assert_eq!(session.phase(), ScanPhase::Cancelled);
        assert!(!acquired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_stalled_dequeue() {
        // A wedged driver never returns from the dequeue; cancellation
        // must still end the scan and release the camera.
        let acquired = Arc::new(AtomicBool::new(false));
        let camera = StalledCamera {
            acquired: acquired.clone(),
        };
        let runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, _status_rx) = watch::channel(ScanStatus::default());
        let mut session =
            ScanSession::new(ScanConfig::default(), camera, runtime, cancel_rx, status_tx);

        let scan = async { session.run().await };
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel_tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(scan, canceller);

        assert!(matches!(result.unwrap_err(), ScanError::Cancelled));
        assert_eq!(session.phase(), ScanPhase::Cancelled);
        assert!(!acquired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_during_stalled_dequeue() {
        let acquired = Arc::new(AtomicBool::new(false));
        let camera = StalledCamera {
            acquired: acquired.clone(),
        };
        let runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, _status_rx) = watch::channel(ScanStatus::default());
        let mut session =
            ScanSession::new(ScanConfig::default(), camera, runtime, cancel_rx, status_tx);

        let start = Instant::now();
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::NoFaceTimeout));
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(!acquired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_still_encode_degrades_to_empty() {
        let (mut camera, _) = FakeCamera::new();
        camera.corrupt_frames = true;
        let runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        // A broken still pipeline degrades the attachment, never the scan.
        let template = session.run().await.unwrap();
        assert_eq!(template.sample_count, 5);
        assert!(template.still_png.is_empty());
        assert_eq!(session.phase(), ScanPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_calls_never_overlap() {
        let (camera, _) = FakeCamera::new();
        let mut runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        // Inference latency well above the tick interval.
        runtime.latency = Duration::from_millis(600);
        let max_in_flight = runtime.max_in_flight.clone();
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        session.run().await.unwrap();
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_completion_is_suppressed() {
        let (camera, _) = FakeCamera::new();
        let runtime = FakeRuntime::new(vec![vec![face(0.9)]]);
        let (mut session, _cancel) = session(ScanConfig::default(), camera, runtime);

        session.run().await.unwrap();
        // A rapid re-trigger of the same session must not emit a second
        // template: terminal phase is kept, emission stays suppressed.
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::AlreadyCompleted));
        assert_eq!(session.phase(), ScanPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_sample_refreshes_deadline() {
        let (camera, _) = FakeCamera::new();
        // Two empty ticks, one face at t=6s, then nothing. The sample
        // restarts the 8s deadline, so the timeout lands at t=14s
        // instead of t=8s.
        let runtime = FakeRuntime::new(vec![vec![], vec![], vec![face(0.9)], vec![]]);
        let config = ScanConfig {
            tick_interval: Duration::from_secs(3),
            max_consecutive_failures: u32::MAX,
            ..ScanConfig::default()
        };
        let (mut session, _cancel) = session(config, camera, runtime);

        let start = Instant::now();
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, ScanError::NoFaceTimeout));
        assert!(start.elapsed() >= Duration::from_secs(14));
    }
}
