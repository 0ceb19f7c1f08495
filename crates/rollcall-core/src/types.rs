use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Face embedding vector as produced by the external encoder
/// (128-dimensional for dlib-style encoders, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when the vector is non-empty and every component is finite.
    pub fn is_well_formed(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Outcome of classifying a probe embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    /// Class probability of `label` [0, 1].
    pub confidence: f32,
}

/// One row of the attendance ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub label: String,
    pub timestamp: NaiveDateTime,
}

/// Per-identity attendance count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub label: String,
    pub count: u64,
}

/// Trim a typed label. Returns `None` for blank input.
pub fn clean_label(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize a transcribed name: upper-case first character, the rest
/// lower-case ("alice SMITH" -> "Alice smith").
pub fn normalize_spoken_label(raw: &str) -> Option<String> {
    let trimmed = clean_label(raw)?;
    let mut chars = trimmed.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect())
}
