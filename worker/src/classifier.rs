//! Clasificadores heurísticos (probabilidad de IA y medio artístico).
//!
//! Trabajan sobre estadísticas simples de color y textura. Los parámetros se
//! cargan de forma perezosa; `warmup` los fuerza antes de la primera corrida.

use common::{PreparedArtifact, StageError, StageOutput, StageWorker};
use serde_json::{json, Value};
use std::sync::OnceLock;
use tracing::debug;

const GRID: u32 = 4;

const MEDIUMS: [&str; 5] = [
    "digital art",
    "oil painting",
    "watercolor",
    "pencil sketch",
    "photograph",
];

#[derive(Debug)]
struct Calibration {
    /// Gradiente medio (niveles de gris) a partir del cual la imagen se
    /// considera completamente texturizada
    gradient_ceiling: f64,
    saturation_weight: f64,
    smoothness_weight: f64,
}

fn calibration() -> &'static Calibration {
    static CALIBRATION: OnceLock<Calibration> = OnceLock::new();
    CALIBRATION.get_or_init(|| {
        debug!("cargando calibración de clasificadores");
        Calibration {
            gradient_ceiling: 24.0,
            saturation_weight: 0.3,
            smoothness_weight: 0.4,
        }
    })
}

/// Estadísticas compartidas por ambos clasificadores.
#[derive(Debug, Clone, Copy)]
struct ImageFeatures {
    saturation: f64,
    brightness: f64,
    /// 0 = plano, 1 = muy texturizado
    texture: f64,
    /// 1 = la textura es igual en todos los parches
    consistency: f64,
    smoothness: f64,
}

fn features(img: &PreparedArtifact) -> ImageFeatures {
    let cal = calibration();
    let luma = img.luma();
    let (w, h) = (img.width as usize, img.height as usize);

    let mut sat_sum = 0.0;
    for px in img.pixels.chunks_exact(3) {
        let max = px.iter().copied().max().unwrap_or(0) as f64;
        let min = px.iter().copied().min().unwrap_or(0) as f64;
        if max > 0.0 {
            sat_sum += (max - min) / max;
        }
    }
    let n = (w * h).max(1) as f64;
    let saturation = sat_sum / n;
    let brightness = luma.iter().map(|l| *l as f64).sum::<f64>() / n / 255.0;

    let mut grad_sum = 0.0;
    let mut grad_n = 0usize;
    for y in 0..h {
        for x in 0..w {
            let l = luma[y * w + x] as f64;
            if x + 1 < w {
                grad_sum += (l - luma[y * w + x + 1] as f64).abs();
                grad_n += 1;
            }
            if y + 1 < h {
                grad_sum += (l - luma[(y + 1) * w + x] as f64).abs();
                grad_n += 1;
            }
        }
    }
    let gradient = if grad_n == 0 { 0.0 } else { grad_sum / grad_n as f64 };
    let smoothness = 1.0 - (gradient / cal.gradient_ceiling).min(1.0);

    let stds = patch_stds(&luma, img.width, img.height);
    let mean_std = stds.iter().sum::<f64>() / stds.len().max(1) as f64;
    let spread = std_dev(&stds);
    let consistency = (1.0 - spread / (mean_std + 1.0)).clamp(0.0, 1.0);
    let texture = (mean_std / 64.0).min(1.0);

    ImageFeatures {
        saturation,
        brightness,
        texture,
        consistency,
        smoothness,
    }
}

/// Desvío estándar de luminancia en cada parche de una grilla GRID x GRID.
fn patch_stds(luma: &[u8], width: u32, height: u32) -> Vec<f64> {
    let pw = (width / GRID).max(1);
    let ph = (height / GRID).max(1);
    let mut out = Vec::new();

    let mut y0 = 0;
    while y0 < height {
        let mut x0 = 0;
        while x0 < width {
            let values: Vec<f64> = (y0..(y0 + ph).min(height))
                .flat_map(|y| (x0..(x0 + pw).min(width)).map(move |x| (x, y)))
                .map(|(x, y)| luma[(y * width + x) as usize] as f64)
                .collect();
            out.push(std_dev(&values));
            x0 += pw;
        }
        y0 += ph;
    }
    out
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Probabilidad (0..1) de que la imagen sea generada.
#[derive(Debug, Default, Clone)]
pub struct AiClassifier;

impl AiClassifier {
    pub fn fallback() -> Value {
        json!({"ai_probability": null})
    }
}

impl StageWorker for AiClassifier {
    type Input = PreparedArtifact;
    type Output = StageOutput;

    fn run(&self, img: &PreparedArtifact) -> Result<StageOutput, StageError> {
        let cal = calibration();
        let f = features(img);
        let score = 0.5
            + cal.saturation_weight * (f.saturation - 0.4)
            + cal.smoothness_weight * (f.smoothness - 0.5);

        let mut out = StageOutput::new();
        out.insert("ai_probability".to_string(), json!(round4(score.clamp(0.0, 1.0))));
        Ok(out)
    }

    fn warmup(&self) -> Result<(), StageError> {
        calibration();
        Ok(())
    }
}

/// Medio artístico más probable y consistencia de textura.
#[derive(Debug, Default, Clone)]
pub struct ArtMediumClassifier;

impl ArtMediumClassifier {
    pub fn fallback() -> Value {
        json!({"art_medium": null})
    }
}

impl StageWorker for ArtMediumClassifier {
    type Input = PreparedArtifact;
    type Output = StageOutput;

    fn run(&self, img: &PreparedArtifact) -> Result<StageOutput, StageError> {
        let f = features(img);

        let raw = [
            f.consistency * f.saturation * f.smoothness + 0.01,
            f.texture * f.saturation + 0.01,
            f.brightness * (1.0 - f.texture) * (0.2 + f.saturation) + 0.01,
            (1.0 - f.saturation) * (0.2 + f.texture) + 0.01,
            f.texture * (1.0 - f.consistency) + (1.0 - f.smoothness) * 0.5 + 0.01,
        ];
        let total: f64 = raw.iter().sum();
        let scores: Vec<f64> = raw.iter().map(|s| s / total).collect();

        let (best, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });
        let medium = MEDIUMS[best];

        let mut description = format!("Likely {medium} (Confidence: {confidence:.2}). ");
        if f.consistency > 0.8 {
            description.push_str(
                "Texture is highly consistent, suggesting digital media or uniform washes.",
            );
        } else if f.consistency < 0.5 {
            description.push_str(
                "Texture is highly varied, suggesting complex physical brushwork or impasto.",
            );
        } else {
            description.push_str(
                "Texture shows moderate variation consistent with standard artistic techniques.",
            );
        }

        let weighted: serde_json::Map<String, Value> = MEDIUMS
            .iter()
            .zip(&scores)
            .map(|(m, s)| (m.to_string(), json!(round4(*s))))
            .collect();

        let mut out = StageOutput::new();
        out.insert(
            "art_medium".to_string(),
            json!({
                "medium": medium,
                "confidence": round4(confidence),
                "consistency_score": round4(f.consistency),
                "description": description,
                "labels_weighted": weighted,
            }),
        );
        Ok(out)
    }

    fn warmup(&self) -> Result<(), StageError> {
        calibration();
        Ok(())
    }
}
