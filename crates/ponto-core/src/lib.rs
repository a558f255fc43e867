//! ponto-core — sample aggregation and attendance decision logic.
//!
//! Pure domain layer: face detections are reduced into a single
//! biometric template, and a day's attendance history is reduced into
//! the next entrada/saida action. No I/O happens here.

pub mod aggregator;
pub mod decision;
pub mod idempotency;
pub mod types;

pub use aggregator::SampleAggregator;
pub use decision::PlannedAction;
pub use types::{
    AttendanceRecord, BiometricTemplate, Detection, FacialSample, GeoPoint, Identity,
    QualityBands, QualityTier, RecordKind,
};
