use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Registro persistido al final de una corrida exitosa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub filename: String,
    pub upload_time: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub mean_color: [f64; 3],
    pub url: Option<String>,
    #[serde(default)]
    pub metadata_analysis: Value,
}

/// Agregados sobre todos los registros persistidos (`GET /stats`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_images: u64,
    pub avg_width: f64,
    pub avg_height: f64,
    pub avg_color: [f64; 3],
}

impl AggregateStats {
    pub fn empty() -> Self {
        Self {
            total_images: 0,
            avg_width: 0.0,
            avg_height: 0.0,
            avg_color: [0.0; 3],
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a StoredRecord>) -> Self {
        let mut total = 0u64;
        let (mut w, mut h) = (0.0, 0.0);
        let mut color = [0.0; 3];

        for rec in records {
            total += 1;
            w += rec.width as f64;
            h += rec.height as f64;
            for (acc, c) in color.iter_mut().zip(rec.mean_color) {
                *acc += c;
            }
        }

        if total == 0 {
            return Self::empty();
        }

        let n = total as f64;
        Self {
            total_images: total,
            avg_width: round2(w / n),
            avg_height: round2(h / n),
            avg_color: color.map(|c| round2(c / n)),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
