//! Records shared by the store, the backend client and the API.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Stored image row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Image ID
    pub id: i64,
    /// Uploading (owning) user
    pub user_id: i64,
    /// Display filename
    pub filename: String,
    /// Storage path, absolute or relative to the upload root
    pub path: String,
    /// Annotated artifact path relative to the upload root
    pub annotated_path: Option<String>,
    /// When the image was uploaded
    pub created_at: DateTime<Utc>,
}

/// Persisted detection row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub image_id: i64,
    pub class_name: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub confidence: Confidence,
    pub created_at: DateTime<Utc>,
}

/// A detection ready to be inserted for an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDetection {
    pub class_name: String,
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub confidence: Confidence,
}

impl NewDetection {
    /// Attach identity and timestamp to produce the stored row
    pub fn into_record(self, id: i64, image_id: i64, created_at: DateTime<Utc>) -> DetectionRecord {
        DetectionRecord {
            id,
            image_id,
            class_name: self.class_name,
            x: self.x,
            y: self.y,
            w: self.w,
            h: self.h,
            confidence: self.confidence,
            created_at,
        }
    }
}

/// One detection as reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDetection {
    /// Class label (`class_name` from the bundled model service)
    #[serde(rename = "class", alias = "class_name")]
    pub class: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub confidence: f64,
}

impl From<&BackendDetection> for NewDetection {
    fn from(d: &BackendDetection) -> Self {
        Self {
            class_name: d.class.clone(),
            x: d.x.round() as i32,
            y: d.y.round() as i32,
            w: d.w.round() as i32,
            h: d.h.round() as i32,
            confidence: Confidence::from_f64(d.confidence),
        }
    }
}

/// Parsed response of one backend call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRunResult {
    /// Annotated image as base64 or data URL
    #[serde(default)]
    pub annotated_image_base64: Option<String>,
    /// Detections in backend order
    #[serde(default)]
    pub detections: Vec<BackendDetection>,
}

/// Detection confidence with four decimal places, in [0, 1].
///
/// Held as ten-thousandths so values survive a `NUMERIC(5,4)` column
/// unchanged. Serializes as a string such as `"0.9100"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Confidence(u16);

impl Confidence {
    pub const SCALE: u16 = 10_000;

    /// Round a float to four decimals, clamping into [0, 1]
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Self(0);
        }
        let scaled = (value.clamp(0.0, 1.0) * f64::from(Self::SCALE)).round();
        Self(scaled as u16)
    }

    /// Build from ten-thousandths, clamping into [0, 1]
    pub fn from_basis_points(bp: i32) -> Self {
        Self(bp.clamp(0, i32::from(Self::SCALE)) as u16)
    }

    pub fn basis_points(self) -> u16 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / f64::from(Self::SCALE)
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:04}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

/// Errors parsing a confidence string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid confidence value: {0}")]
pub struct ParseConfidenceError(String);

impl FromStr for Confidence {
    type Err = ParseConfidenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| ParseConfidenceError(s.to_string()))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ParseConfidenceError(s.to_string()));
        }
        Ok(Self::from_f64(value))
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(de::Error::custom),
            Repr::Number(n) => Ok(Self::from_f64(n)),
        }
    }
}
