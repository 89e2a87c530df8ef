use std::{collections::HashMap, path::PathBuf, time::Duration};
use tracing::warn;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_TASK_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_RETENTION_SWEEP_SECS: u64 = 60;
pub const DEFAULT_DATABASE_PATH: &str = "data/image_stats.jsonl";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Configuración del master, leída una vez al arrancar.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    /// Presupuesto por defecto de cada etapa
    pub step_timeout: Duration,
    /// Overrides por nombre de etapa (`STAGE_TIMEOUTS`)
    pub stage_timeouts: HashMap<String, Duration>,
    pub pool_size: usize,
    pub task_retention: Duration,
    pub sweep_interval: Duration,
    pub database_path: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            stage_timeouts: HashMap::new(),
            pool_size: default_pool_size(),
            task_retention: Duration::from_secs(DEFAULT_TASK_RETENTION_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_RETENTION_SWEEP_SECS),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente arbitraria (tests).
    /// Un valor inválido se avisa y se reemplaza por el default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();

        let secs = |key: &str, default: Duration| {
            parsed::<u64>(&lookup, key)
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(d.bind_addr),
            step_timeout: secs("STEP_TIMEOUT_SECS", d.step_timeout),
            stage_timeouts: lookup("STAGE_TIMEOUTS")
                .map(|raw| parse_stage_timeouts(&raw))
                .unwrap_or_default(),
            pool_size: parsed::<usize>(&lookup, "WORKER_POOL_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(d.pool_size),
            task_retention: secs("TASK_RETENTION_SECS", d.task_retention),
            sweep_interval: secs("RETENTION_SWEEP_SECS", d.sweep_interval),
            database_path: lookup("DATABASE_PATH").map(PathBuf::from).unwrap_or(d.database_path),
            max_upload_bytes: parsed::<usize>(&lookup, "MAX_UPLOAD_BYTES").unwrap_or(d.max_upload_bytes),
        }
    }

    /// Presupuesto de una etapa: override por nombre o el global.
    pub fn timeout_for(&self, stage: &str) -> Duration {
        self.stage_timeouts
            .get(stage)
            .copied()
            .unwrap_or(self.step_timeout)
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("valor inválido para {}: {:?}, se usa el default", key, raw);
            None
        }
    }
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// `"Fractal Dimension=30, AI Classifier=45"` -> nombre -> segundos.
pub fn parse_stage_timeouts(raw: &str) -> HashMap<String, Duration> {
    let mut out = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry
            .split_once('=')
            .and_then(|(name, secs)| Some((name.trim(), secs.trim().parse::<u64>().ok()?)));
        match parsed {
            Some((name, secs)) if !name.is_empty() && secs > 0 => {
                out.insert(name.to_string(), Duration::from_secs(secs));
            }
            _ => warn!("entrada inválida en STAGE_TIMEOUTS: {:?}", entry),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn sin_variables_usa_defaults() {
        let s = Settings::from_lookup(lookup(&[]));
        assert_eq!(s.bind_addr, "0.0.0.0:8080");
        assert_eq!(s.step_timeout, Duration::from_secs(90));
        assert_eq!(s.task_retention, Duration::from_secs(3600));
        assert_eq!(s.database_path, PathBuf::from("data/image_stats.jsonl"));
        assert!(s.pool_size >= 1);
    }

    #[test]
    fn overrides_por_etapa() {
        let s = Settings::from_lookup(lookup(&[
            ("STEP_TIMEOUT_SECS", "30"),
            ("STAGE_TIMEOUTS", "Fractal Dimension=5, AI Classifier = 12"),
        ]));
        assert_eq!(s.timeout_for("Fractal Dimension"), Duration::from_secs(5));
        assert_eq!(s.timeout_for("AI Classifier"), Duration::from_secs(12));
        assert_eq!(s.timeout_for("Object Detection"), Duration::from_secs(30));
    }

    #[test]
    fn valores_invalidos_caen_al_default() {
        let s = Settings::from_lookup(lookup(&[
            ("STEP_TIMEOUT_SECS", "mucho"),
            ("WORKER_POOL_SIZE", "0"),
            ("MAX_UPLOAD_BYTES", "-1"),
        ]));
        assert_eq!(s.step_timeout, Duration::from_secs(90));
        assert!(s.pool_size >= 1);
        assert_eq!(s.max_upload_bytes, DEFAULT_MAX_UPLOAD_BYTES);
    }

    #[test]
    fn parse_ignora_entradas_rotas() {
        let t = parse_stage_timeouts("A=1,,B,C=x,=3, D = 4 ");
        assert_eq!(t.len(), 2);
        assert_eq!(t["A"], Duration::from_secs(1));
        assert_eq!(t["D"], Duration::from_secs(4));
    }
}
