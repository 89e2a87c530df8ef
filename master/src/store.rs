use chrono::Utc;
use common::{
    AggregateStats, StageError, StageOutput, StageValue, StageWorker, StoredRecord, TaskResult,
};
use serde_json::Value;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::TaskHandle;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] io::Error),
    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("result set is missing `{0}`")]
    MissingField(&'static str),
}

/// Persistencia mínima de resultados.
pub trait RecordStore: Send + Sync {
    /// Guarda una corrida y devuelve el id del registro.
    fn save(&self, filename: &str, url: Option<&str>, stats: &StageOutput) -> Result<String, StoreError>;

    fn aggregate(&self) -> Result<AggregateStats, StoreError>;
}

/// Arma el registro a partir del mapa mezclado de la corrida.
pub fn build_record(filename: &str, url: Option<&str>, stats: &StageOutput) -> Result<StoredRecord, StoreError> {
    let width = dimension(stats, "width")?;
    let height = dimension(stats, "height")?;
    let mean_color = stats
        .get("mean_color")
        .cloned()
        .map(serde_json::from_value::<[f64; 3]>)
        .transpose()?
        .ok_or(StoreError::MissingField("mean_color"))?;

    Ok(StoredRecord {
        id: uuid::Uuid::new_v4().to_string(),
        filename: filename.to_string(),
        upload_time: Utc::now(),
        width,
        height,
        mean_color,
        url: url.map(str::to_string),
        metadata_analysis: stats.get("metadata_analysis").cloned().unwrap_or(Value::Null),
    })
}

fn dimension(stats: &StageOutput, key: &'static str) -> Result<u32, StoreError> {
    stats
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(StoreError::MissingField(key))
}

/* ---------------- JSONL en disco ---------------- */

/// Un registro JSON por línea, sólo append.
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord>(&line) {
                Ok(rec) => out.push(rec),
                Err(e) => warn!("línea {} inválida en {}: {}", n + 1, self.path.display(), e),
            }
        }
        Ok(out)
    }
}

impl RecordStore for JsonlStore {
    fn save(&self, filename: &str, url: Option<&str>, stats: &StageOutput) -> Result<String, StoreError> {
        let record = build_record(filename, url, stats)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        debug!(record_id = %record.id, "registro guardado en {}", self.path.display());
        Ok(record.id)
    }

    fn aggregate(&self) -> Result<AggregateStats, StoreError> {
        let records = self.read_all()?;
        Ok(AggregateStats::from_records(&records))
    }
}

/* ---------------- En memoria ---------------- */

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RecordStore for MemoryStore {
    fn save(&self, filename: &str, url: Option<&str>, stats: &StageOutput) -> Result<String, StoreError> {
        let record = build_record(filename, url, stats)?;
        let id = record.id.clone();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(id)
    }

    fn aggregate(&self) -> Result<AggregateStats, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(AggregateStats::from_records(records.iter()))
    }
}

/* ---------------- Etapa de persistencia ---------------- */

/// Entrada de la etapa Finalize. Lleva la tarea y su token porque la
/// escritura sólo ocurre si la corrida sigue viva en ese momento.
#[derive(Clone)]
pub struct PersistRequest {
    pub task: TaskHandle,
    pub step: String,
    pub cancel: CancellationToken,
    pub filename: String,
    pub url: Option<String>,
    pub stats: StageOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecord {
    pub id: String,
}

// el id va al resultado terminal, no a partial_results
impl StageValue for SavedRecord {
    fn to_partial(&self) -> StageOutput {
        StageOutput::new()
    }
}

pub struct PersistStage {
    store: Arc<dyn RecordStore>,
}

impl PersistStage {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

impl StageWorker for PersistStage {
    type Input = PersistRequest;
    type Output = SavedRecord;

    fn run(&self, req: &PersistRequest) -> Result<SavedRecord, StageError> {
        let committed = req.task.commit(&req.step, &req.cancel, || {
            let id = self.store.save(&req.filename, req.url.as_deref(), &req.stats)?;
            Ok::<_, StoreError>(TaskResult {
                id,
                url: req.url.clone(),
                stats: req.stats.clone(),
            })
        });

        match committed {
            Ok(Some(id)) => Ok(SavedRecord { id }),
            Ok(None) => {
                debug!(task_id = req.task.id(), "la corrida terminó antes de guardar, no se escribe");
                Err(StageError::failed("run finished before its results were saved"))
            }
            Err(e) => Err(StageError::failed(e.to_string())),
        }
    }
}
