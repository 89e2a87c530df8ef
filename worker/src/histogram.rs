use common::{PreparedArtifact, StageError, StageOutput, StageWorker};
use serde_json::json;

/// Histograma de intensidad por canal (256 bins).
#[derive(Debug, Default, Clone)]
pub struct ColorHistogram;

impl ColorHistogram {
    pub fn fallback() -> serde_json::Value {
        json!({"histogram_r": [], "histogram_g": [], "histogram_b": []})
    }
}

impl StageWorker for ColorHistogram {
    type Input = PreparedArtifact;
    type Output = StageOutput;

    fn run(&self, img: &PreparedArtifact) -> Result<StageOutput, StageError> {
        let mut bins = [[0u32; 256]; 3];
        for px in img.pixels.chunks_exact(3) {
            for c in 0..3 {
                bins[c][px[c] as usize] += 1;
            }
        }

        let mut out = StageOutput::new();
        out.insert("histogram_r".to_string(), json!(bins[0].to_vec()));
        out.insert("histogram_g".to_string(), json!(bins[1].to_vec()));
        out.insert("histogram_b".to_string(), json!(bins[2].to_vec()));
        Ok(out)
    }
}
