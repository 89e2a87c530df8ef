use anyhow::Context;
use common::{PreparedArtifact, StageError, StageOutput, StageWorker};
use image::{imageops::FilterType, GrayImage};
use serde_json::{json, Value};

/// Lado de la imagen cuadrada sobre la que se cuenta (el conteo es caro).
const SIDE: u32 = 128;

/// Dimensión fractal por conteo diferencial de cajas sobre la imagen en
/// escala de grises.
#[derive(Debug, Default, Clone)]
pub struct FractalDimension;

impl FractalDimension {
    pub fn fallback() -> Value {
        json!({"fd_default": null})
    }
}

impl StageWorker for FractalDimension {
    type Input = PreparedArtifact;
    type Output = StageOutput;

    fn run(&self, img: &PreparedArtifact) -> Result<StageOutput, StageError> {
        let gray = GrayImage::from_raw(img.width, img.height, img.luma())
            .context("luma buffer does not match image size")?;
        let resized = image::imageops::resize(&gray, SIDE, SIDE, FilterType::Triangle);

        let fd = box_counting_dimension(resized.as_raw(), SIDE as usize, 2, None);

        let mut out = StageOutput::new();
        out.insert("fd_default".to_string(), json!(fd));
        Ok(out)
    }
}

/// `pixels` es una imagen cuadrada `m x m`. Devuelve 0.0 si no hay puntos
/// suficientes para ajustar la recta.
pub fn box_counting_dimension(
    pixels: &[u8],
    m: usize,
    min_box: usize,
    max_box: Option<usize>,
) -> f64 {
    if m == 0 || pixels.len() < m * m {
        return 0.0;
    }

    let g_min = pixels.iter().copied().min().unwrap_or(0) as f64;
    let g_max = pixels.iter().copied().max().unwrap_or(0) as f64;
    let levels = g_max - g_min + 1.0;
    let max_box = max_box.unwrap_or(m / 2);

    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut prev_nr = -1.0;

    for l in min_box.max(1)..=max_box {
        let scale = m / l;
        let h = if scale == 0 { 1.0 } else { (levels / scale as f64).max(1.0) };
        let n_bins = ((levels + h - 1.0) / h).floor() as usize;

        let mut nr = 0.0;
        for i in (0..m).step_by(l) {
            for j in (0..m).step_by(l) {
                let mut bins: Vec<Vec<f64>> = vec![Vec::new(); n_bins.max(1)];
                for y in i..(i + l).min(m) {
                    for x in j..(j + l).min(m) {
                        let p = pixels[y * m + x] as f64;
                        let idx = ((p - g_min) / h).floor() as usize;
                        if let Some(bin) = bins.get_mut(idx) {
                            bin.push(p);
                        }
                    }
                }
                for bin in bins.iter().filter(|b| !b.is_empty()) {
                    nr += 2.0 * (std_dev(bin) / h).floor() + 1.0;
                }
            }
        }

        if nr != prev_nr {
            points.push((l as f64 / m as f64, nr));
            prev_nr = nr;
        }
    }

    if points.len() < 2 {
        return 0.0;
    }

    let xs: Vec<f64> = points.iter().map(|(r, _)| -r.ln()).collect();
    let ys: Vec<f64> = points.iter().map(|(_, nr)| nr.ln()).collect();
    slope(&xs, &ys)
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

// mínimos cuadrados, grado 1
fn slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let num: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).sum();
    let den: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::prepared;

    #[test]
    fn imagen_plana_tiene_dimension_dos() {
        // una superficie plana cubre el plano: N(r) ~ r^-2
        let m = 32;
        let pixels = vec![128u8; m * m];
        let fd = box_counting_dimension(&pixels, m, 2, None);
        assert!((fd - 2.0).abs() < 0.2, "fd = {fd}");
    }

    #[test]
    fn ruido_es_mas_complejo_que_una_superficie_plana() {
        let m = 32;
        let flat = vec![10u8; m * m];
        let noise: Vec<u8> = (0..m * m).map(|i| ((i * 7919 + 13) % 251) as u8).collect();

        let fd_flat = box_counting_dimension(&flat, m, 2, None);
        let fd_noise = box_counting_dimension(&noise, m, 2, None);
        assert!(fd_noise > fd_flat, "{fd_noise} <= {fd_flat}");
    }

    #[test]
    fn entrada_vacia_devuelve_cero() {
        assert_eq!(box_counting_dimension(&[], 0, 2, None), 0.0);
    }

    #[test]
    fn worker_devuelve_fd_default() {
        let img = prepared(40, 30, |x, y| [(x * 6) as u8, (y * 8) as u8, 0]);
        let out = FractalDimension.run(&img).unwrap();
        assert!(out["fd_default"].as_f64().is_some());
    }
}
