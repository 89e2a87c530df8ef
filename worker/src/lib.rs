//! Workers concretos de cada etapa de análisis.
//!
//! Todos son bloqueantes e implementan [`common::StageWorker`]. Ninguno
//! depende del orquestador: el master los envuelve con timeout y cancelación.

pub mod classifier;
pub mod fractal;
pub mod histogram;
pub mod metadata;
pub mod objects;
pub mod prepare;
pub mod summary;

pub use classifier::{AiClassifier, ArtMediumClassifier};
pub use fractal::FractalDimension;
pub use histogram::ColorHistogram;
pub use metadata::MetadataInspector;
pub use objects::ObjectDetector;
pub use prepare::Preprocessor;
pub use summary::InsightSummarizer;

/* --------- Nombres de los pasos (los ve el cliente) --------- */

pub const PREPROCESSING: &str = "Preprocessing";
pub const METADATA_ANALYSIS: &str = "Metadata Analysis";
pub const COLOR_HISTOGRAM: &str = "Color Intensity Distribution";
pub const AI_CLASSIFIER: &str = "AI Classifier";
pub const FRACTAL_DIMENSION: &str = "Fractal Dimension";
pub const ART_MEDIUM: &str = "Art Medium Analysis";
pub const OBJECT_DETECTION: &str = "Object Detection";
pub const INSIGHT_SUMMARY: &str = "Insight Summary";
pub const SAVING: &str = "Saving to Database";

#[cfg(test)]
pub(crate) mod testutil {
    use common::PreparedArtifact;

    /// Artefacto sintético: cada pixel se calcula con `f(x, y)`.
    pub fn prepared(w: u32, h: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> PreparedArtifact {
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        let mut sum = [0.0f64; 3];
        for y in 0..h {
            for x in 0..w {
                let p = f(x, y);
                for c in 0..3 {
                    sum[c] += p[c] as f64;
                }
                pixels.extend_from_slice(&p);
            }
        }
        let n = (w * h).max(1) as f64;
        PreparedArtifact {
            filename: "synthetic.png".to_string(),
            width: w,
            height: h,
            pixels,
            mean_color: sum.map(|s| s / n),
            raw: Vec::new(),
        }
    }
}
