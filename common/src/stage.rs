use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Salida genérica de una etapa: claves que se mezclan en `partial_results`.
pub type StageOutput = Map<String, Value>;

/// Señal de fallo de un worker. El `Display` es el mensaje que termina en
/// el campo `error` de la tarea.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("stage worker panicked")]
    Panicked,
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        StageError::Failed(msg.into())
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        StageError::Failed(format!("{err:#}"))
    }
}

/// Valor que una etapa exitosa aporta a `partial_results`.
pub trait StageValue {
    fn to_partial(&self) -> StageOutput;
}

impl StageValue for StageOutput {
    fn to_partial(&self) -> StageOutput {
        self.clone()
    }
}

/// Contrato de toda etapa de análisis.
///
/// Los workers son bloqueantes: el orquestador los despacha al pool de
/// ejecución y nunca los llama desde su propio loop.
pub trait StageWorker: Send + Sync + 'static {
    type Input: Send + Sync + 'static;
    type Output: StageValue + Send + 'static;

    fn run(&self, input: &Self::Input) -> Result<Self::Output, StageError>;

    /// Carga perezosa de modelos u otros recursos caros.
    fn warmup(&self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Worker del cluster paralelo: todos leen el artefacto preparado.
pub type ClusterWorker = dyn StageWorker<Input = PreparedArtifact, Output = StageOutput>;

/// Worker de síntesis: lee los resultados ya mezclados.
pub type SynthesisWorker = dyn StageWorker<Input = StageOutput, Output = StageOutput>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Cluster,
    Synthesis,
    Finalize,
}

/// Configuración estática de una etapa (no cambia entre corridas).
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub name: String,
    pub phase: Phase,
    pub timeout: Duration,
    /// Valor que se mezcla si la etapa excede su presupuesto.
    /// `None` significa que el timeout aborta la corrida.
    pub fallback: Option<StageOutput>,
    pub fatal_on_error: bool,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, phase: Phase, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            phase,
            timeout,
            fallback: None,
            fatal_on_error: true,
        }
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = fallback.as_object().cloned();
        self
    }
}

/// Archivo tal como llegó en el upload.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Salida de preprocesamiento: imagen decodificada a RGB8 más escalares
/// derivados. Es la entrada compartida de todas las etapas posteriores.
#[derive(Debug, Clone)]
pub struct PreparedArtifact {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// Pixeles RGB8 por filas, `width * height * 3` bytes
    pub pixels: Vec<u8>,
    pub mean_color: [f64; 3],
    /// Bytes originales (para lectura de metadatos)
    pub raw: Vec<u8>,
}

impl PreparedArtifact {
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// Luminancia 0..=255 (Rec. 601) de cada pixel, por filas.
    pub fn luma(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(3)
            .map(|p| {
                let l = 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64;
                l.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

impl StageValue for PreparedArtifact {
    fn to_partial(&self) -> StageOutput {
        let mut out = StageOutput::new();
        out.insert("width".to_string(), json!(self.width));
        out.insert("height".to_string(), json!(self.height));
        out.insert("mean_color".to_string(), json!(self.mean_color));
        out
    }
}
