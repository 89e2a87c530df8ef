use common::{PreparedArtifact, StageError, StageOutput, StageWorker};
use serde_json::{json, Value};

/// Distancia mínima (RGB euclídea) al color medio para que un pixel
/// cuente como parte de una región destacada.
const DISTANCE_THRESHOLD: f64 = 60.0;
const MIN_AREA: f64 = 0.01;
const MAX_AREA: f64 = 0.9;
const SCORE_THRESHOLD: f64 = 0.5;

/// Detector de regiones destacadas: marca la caja que encierra los pixeles
/// que más se alejan del color medio de la imagen.
#[derive(Debug, Default, Clone)]
pub struct ObjectDetector;

impl ObjectDetector {
    pub fn fallback() -> Value {
        json!({"object_detection": null})
    }
}

impl StageWorker for ObjectDetector {
    type Input = PreparedArtifact;
    type Output = StageOutput;

    fn run(&self, img: &PreparedArtifact) -> Result<StageOutput, StageError> {
        let mut detections = Vec::new();

        let mut bbox: Option<(u32, u32, u32, u32)> = None;
        let mut hits = 0u64;
        let mut dist_sum = 0.0;

        for y in 0..img.height {
            for x in 0..img.width {
                let px = img.rgb(x, y);
                let d = (0..3)
                    .map(|c| (px[c] as f64 - img.mean_color[c]).powi(2))
                    .sum::<f64>()
                    .sqrt();
                if d < DISTANCE_THRESHOLD {
                    continue;
                }
                hits += 1;
                dist_sum += d;
                bbox = Some(match bbox {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }

        if let Some((xmin, ymin, xmax, ymax)) = bbox {
            let total = (img.width as u64 * img.height as u64) as f64;
            let box_area = ((xmax - xmin + 1) as u64 * (ymax - ymin + 1) as u64) as f64;
            let coverage = box_area / total;
            // qué tan "llena" está la caja y qué tan fuerte es el contraste
            let density = hits as f64 / box_area;
            let contrast = (dist_sum / hits as f64 / 255.0).min(1.0);
            let score = (0.5 * density + 0.5 * contrast).min(1.0);

            if (MIN_AREA..=MAX_AREA).contains(&coverage) && score > SCORE_THRESHOLD {
                detections.push(json!({
                    "label": "salient region",
                    "score": (score * 10_000.0).round() / 10_000.0,
                    "box": {"xmin": xmin, "ymin": ymin, "xmax": xmax, "ymax": ymax},
                }));
            }
        }

        let mut out = StageOutput::new();
        out.insert("object_detection".to_string(), json!(detections));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::prepared;

    #[test]
    fn encuentra_un_cuadrado_sobre_fondo_liso() {
        let img = prepared(40, 40, |x, y| {
            if (10..20).contains(&x) && (5..15).contains(&y) {
                [255, 255, 255]
            } else {
                [0, 0, 0]
            }
        });

        let out = ObjectDetector.run(&img).unwrap();
        let dets = out["object_detection"].as_array().unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(
            dets[0]["box"],
            json!({"xmin": 10, "ymin": 5, "xmax": 19, "ymax": 14})
        );
    }

    #[test]
    fn imagen_lisa_no_tiene_detecciones() {
        let img = prepared(20, 20, |_, _| [90, 90, 90]);
        let out = ObjectDetector.run(&img).unwrap();
        assert_eq!(out["object_detection"], json!([]));
    }
}
