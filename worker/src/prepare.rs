use anyhow::Context;
use common::{Artifact, PreparedArtifact, StageError, StageWorker};
use tracing::debug;

/// Decodifica el upload, lo pasa a RGB8 y calcula el color promedio.
#[derive(Debug, Default, Clone)]
pub struct Preprocessor;

impl StageWorker for Preprocessor {
    type Input = Artifact;
    type Output = PreparedArtifact;

    fn run(&self, artifact: &Artifact) -> Result<PreparedArtifact, StageError> {
        let img = image::load_from_memory(&artifact.bytes)
            .with_context(|| format!("could not decode image {}", artifact.filename))?
            .to_rgb8();

        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(StageError::InvalidInput(format!(
                "image {} has no pixels",
                artifact.filename
            )));
        }

        let pixels = img.into_raw();
        let mut sum = [0u64; 3];
        for px in pixels.chunks_exact(3) {
            sum[0] += px[0] as u64;
            sum[1] += px[1] as u64;
            sum[2] += px[2] as u64;
        }
        let n = (width as u64 * height as u64) as f64;
        let mean_color = sum.map(|s| s as f64 / n);

        debug!(
            "preprocesado {} ({}x{}, color medio {:?})",
            artifact.filename, width, height, mean_color
        );

        Ok(PreparedArtifact {
            filename: artifact.filename.clone(),
            width,
            height,
            pixels,
            mean_color,
            raw: artifact.bytes.clone(),
        })
    }
}
