//! Sample aggregation — reduces one scan session's samples into a
//! single [`BiometricTemplate`], exactly once.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::types::{BiometricTemplate, FacialSample, QualityBands, QualityTier};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AggregateError {
    /// No qualifying samples were captured. NoFaceTimeout semantics.
    #[error("no samples captured")]
    EmptyCapture,
    /// A template was already emitted for this session, or the previous
    /// emission was too recent. The trigger is a no-op.
    #[error("template already emitted for this session")]
    AlreadyEmitted,
}

/// Reduces a batch of samples into one template with a single-completion
/// guarantee.
///
/// Completion can be triggered twice in rapid succession (a duplicate
/// timer fire, a rapid re-trigger while the still capture is in flight),
/// so `emit` is guarded two ways: a completed flag for the owning
/// session, and a minimum interval against the previous emission.
pub struct SampleAggregator {
    bands: QualityBands,
    min_interval: Duration,
    completed: bool,
    last_emit: Option<Instant>,
}

impl Default for SampleAggregator {
    fn default() -> Self {
        Self::new(QualityBands::default(), Duration::from_secs(2))
    }
}

impl SampleAggregator {
    pub fn new(bands: QualityBands, min_interval: Duration) -> Self {
        Self {
            bands,
            min_interval,
            completed: false,
            last_emit: None,
        }
    }

    /// Whether this aggregator has already emitted.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Allow a fresh attempt after a failed completion. The emission
    /// cool-down is kept so a reset-then-retrigger burst still cannot
    /// produce two templates within the minimum interval.
    pub fn reset(&mut self) {
        self.completed = false;
    }

    /// Aggregate `samples` into a template. At most one emission per
    /// session; a second trigger within the minimum interval is a no-op.
    pub fn emit(
        &mut self,
        samples: &[FacialSample],
        still_png: Vec<u8>,
    ) -> Result<BiometricTemplate, AggregateError> {
        if self.completed {
            return Err(AggregateError::AlreadyEmitted);
        }
        if let Some(prev) = self.last_emit {
            if prev.elapsed() < self.min_interval {
                tracing::warn!(
                    elapsed_ms = prev.elapsed().as_millis() as u64,
                    "emission re-triggered within cool-down; suppressing"
                );
                return Err(AggregateError::AlreadyEmitted);
            }
        }
        if samples.is_empty() {
            return Err(AggregateError::EmptyCapture);
        }

        let avg_confidence = samples
            .iter()
            .map(|s| s.detection.confidence)
            .sum::<f32>()
            / samples.len() as f32;
        let quality = QualityTier::from_confidence(avg_confidence, self.bands);
        let descriptor = mean_descriptor(samples);

        self.completed = true;
        self.last_emit = Some(Instant::now());

        tracing::info!(
            samples = samples.len(),
            avg_confidence,
            quality = ?quality,
            "template emitted"
        );

        Ok(BiometricTemplate {
            descriptor,
            sample_count: samples.len(),
            avg_confidence,
            quality,
            still_png,
        })
    }
}

/// Componentwise mean of all sample descriptors.
///
/// All descriptors in one session come from the same model and share a
/// length; shorter vectors (which would indicate a runtime bug) only
/// contribute to the components they carry.
pub fn mean_descriptor(samples: &[FacialSample]) -> Vec<f32> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    let dim = first.detection.descriptor.len();
    let mut sum = vec![0.0f32; dim];
    for sample in samples {
        for (acc, v) in sum.iter_mut().zip(sample.detection.descriptor.iter()) {
            *acc += v;
        }
    }
    let n = samples.len() as f32;
    for acc in sum.iter_mut() {
        *acc /= n;
    }
    sum
}
