use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One face found in a single camera frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Classifier confidence in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    /// Fixed-length descriptor vector (typically 128-dimensional).
    pub descriptor: Vec<f32>,
}

/// An accepted detection, timestamped at capture.
///
/// Only detections above the accept threshold, on ticks that saw exactly
/// one face, become samples.
#[derive(Debug, Clone)]
pub struct FacialSample {
    pub detection: Detection,
    pub captured_at: std::time::Instant,
}

/// Quality tier derived from the average sample confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Poor,
}

/// Confidence bands for deriving a [`QualityTier`].
#[derive(Debug, Clone, Copy)]
pub struct QualityBands {
    pub excellent: f32,
    pub good: f32,
}

impl Default for QualityBands {
    fn default() -> Self {
        Self {
            excellent: 0.8,
            good: 0.6,
        }
    }
}

impl QualityTier {
    pub fn from_confidence(avg: f32, bands: QualityBands) -> Self {
        if avg > bands.excellent {
            QualityTier::Excellent
        } else if avg > bands.good {
            QualityTier::Good
        } else {
            QualityTier::Poor
        }
    }
}

/// Aggregated output of one scan session, submitted for identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricTemplate {
    /// Componentwise mean of all sample descriptors.
    pub descriptor: Vec<f32>,
    pub sample_count: usize,
    pub avg_confidence: f32,
    pub quality: QualityTier,
    /// PNG-encoded still from the capture, attached to the submission.
    #[serde(with = "serde_bytes_base64")]
    pub still_png: Vec<u8>,
}

/// Direction of a time-clock event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Entrada,
    Saida,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entrada => "entrada",
            RecordKind::Saida => "saida",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic fix attached to a registration, when available.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// One accepted time-clock event. Immutable once the backend acks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub user_id: String,
    pub site_id: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    pub coords: Option<GeoPoint>,
    pub idempotency_key: String,
}

/// Identity returned by the remote authentication service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

/// Base64 wire encoding for the still image bytes.
mod serde_bytes_base64 {
    use base64::prelude::{Engine, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64_STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
