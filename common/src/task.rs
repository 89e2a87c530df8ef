use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stage::StageOutput;

pub type TaskId = String;

/// Mensaje que ven los pollers cuando una corrida fue reemplazada por otra.
pub const ABANDONED_MESSAGE: &str = "Task abandoned because a new upload was started.";

/// Fase visible de una corrida. El orden de declaración es el orden permitido:
/// sólo se avanza, nunca se retrocede.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "Starting")]
    Starting,
    #[serde(rename = "Preprocessing")]
    Preprocessing,
    #[serde(rename = "Parallel Analysis")]
    ParallelAnalysis,
    #[serde(rename = "Synthesis")]
    Synthesis,
    #[serde(rename = "Finalizing")]
    Finalizing,
    #[serde(rename = "Complete")]
    Complete,
    #[serde(rename = "Error")]
    Error,
    #[serde(rename = "Abandoned")]
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Error | TaskStatus::Abandoned
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Starting => "Starting",
            TaskStatus::Preprocessing => "Preprocessing",
            TaskStatus::ParallelAnalysis => "Parallel Analysis",
            TaskStatus::Synthesis => "Synthesis",
            TaskStatus::Finalizing => "Finalizing",
            TaskStatus::Complete => "Complete",
            TaskStatus::Error => "Error",
            TaskStatus::Abandoned => "Abandoned",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Resultado final de una corrida exitosa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Identificador opaco devuelto por el store al persistir
    pub id: String,
    pub url: Option<String>,
    pub stats: StageOutput,
}

/// Estado mutable de una corrida del pipeline.
///
/// Todas las mutaciones devuelven `true` si se aplicaron. Una vez que el
/// registro llega a un estado terminal, ninguna mutación se aplica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub current_step: Option<String>,

    #[serde(rename = "steps")]
    pub declared_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub timed_out_steps: Vec<String>,
    pub partial_results: StageOutput,

    #[serde(rename = "result", default, skip_serializing_if = "Option::is_none")]
    pub terminal_result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, declared_steps: Vec<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Starting,
            progress: 0,
            current_step: Some(TaskStatus::Starting.label().to_string()),
            declared_steps,
            completed_steps: Vec::new(),
            timed_out_steps: Vec::new(),
            partial_results: StageOutput::new(),
            terminal_result: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Entra a una fase no terminal. Una fase anterior a la actual se ignora
    /// (el progreso igual puede subir).
    pub fn enter(&mut self, status: TaskStatus, step: Option<&str>, progress: u8) -> bool {
        if self.is_terminal() || status.is_terminal() {
            return false;
        }
        self.raise_progress(progress);
        if status < self.status {
            return false;
        }
        self.status = status;
        self.current_step = step.map(str::to_string);
        true
    }

    pub fn bump_progress(&mut self, progress: u8) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.raise_progress(progress);
        true
    }

    /// Marca un paso como completado y mezcla su salida, en un solo paso.
    pub fn complete_step(&mut self, step: &str, partial: &StageOutput) -> bool {
        if self.is_terminal() || self.completed_steps.iter().any(|s| s == step) {
            return false;
        }
        self.completed_steps.push(step.to_string());
        self.merge_partial(partial);
        self.raise_progress(self.completion_ratio());
        true
    }

    /// Registra un timeout blando. Con fallback el paso también cuenta como
    /// completado (para que la vista no quede colgada esperando ese paso).
    pub fn time_out_step(&mut self, step: &str, fallback: Option<&StageOutput>) -> bool {
        if self.is_terminal() || self.timed_out_steps.iter().any(|s| s == step) {
            return false;
        }
        self.timed_out_steps.push(step.to_string());
        if let Some(fallback) = fallback {
            if !self.completed_steps.iter().any(|s| s == step) {
                self.completed_steps.push(step.to_string());
            }
            self.merge_partial(fallback);
            self.raise_progress(self.completion_ratio());
        }
        true
    }

    pub fn complete(&mut self, result: TaskResult) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Complete;
        self.progress = 100;
        self.current_step = None;
        self.terminal_result = Some(result);
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.finish_with(TaskStatus::Error, error.into())
    }

    pub fn abandon(&mut self, reason: impl Into<String>) -> bool {
        self.finish_with(TaskStatus::Abandoned, reason.into())
    }

    fn finish_with(&mut self, status: TaskStatus, error: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.current_step = None;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
        true
    }

    fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    // el 100 queda reservado para Complete
    fn completion_ratio(&self) -> u8 {
        if self.declared_steps.is_empty() {
            return 0;
        }
        let pct = self.completed_steps.len() * 100 / self.declared_steps.len();
        pct.min(99) as u8
    }

    fn merge_partial(&mut self, partial: &StageOutput) {
        for (key, value) in partial {
            let keeps_existing = is_empty_value(value)
                && self
                    .partial_results
                    .get(key)
                    .is_some_and(|current| !is_empty_value(current));
            if !keeps_existing {
                self.partial_results.insert(key.clone(), value.clone());
            }
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        TaskRecord::new(
            "t1".to_string(),
            vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()],
        )
    }

    fn output(v: Value) -> StageOutput {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn registro_nuevo_arranca_en_starting() {
        let r = record();
        assert_eq!(r.status, TaskStatus::Starting);
        assert_eq!(r.progress, 0);
        assert!(r.completed_steps.is_empty());
        assert!(!r.is_terminal());
    }

    #[test]
    fn estado_no_retrocede_y_progreso_tampoco() {
        let mut r = record();
        assert!(r.enter(TaskStatus::Synthesis, Some("Insight Summary"), 90));
        assert!(!r.enter(TaskStatus::Preprocessing, Some("Preprocessing"), 5));
        assert_eq!(r.status, TaskStatus::Synthesis);
        assert_eq!(r.progress, 90);
        r.bump_progress(40);
        assert_eq!(r.progress, 90);
    }

    #[test]
    fn complete_step_mezcla_y_no_duplica() {
        let mut r = record();
        assert!(r.complete_step("A", &output(json!({"x": 1}))));
        assert!(!r.complete_step("A", &output(json!({"x": 2}))));
        assert_eq!(r.completed_steps, vec!["A"]);
        assert_eq!(r.partial_results["x"], json!(1));
        assert_eq!(r.progress, 25);
    }

    #[test]
    fn valor_vacio_no_pisa_una_clave_poblada() {
        let mut r = record();
        r.complete_step("A", &output(json!({"hist": [1, 2, 3]})));
        r.time_out_step("B", Some(&output(json!({"hist": []}))));
        assert_eq!(r.partial_results["hist"], json!([1, 2, 3]));
    }

    #[test]
    fn timeout_con_fallback_cuenta_como_completado() {
        let mut r = record();
        assert!(r.time_out_step("B", Some(&output(json!({"fd_default": null})))));
        assert_eq!(r.completed_steps, vec!["B"]);
        assert_eq!(r.timed_out_steps, vec!["B"]);
        assert!(r.partial_results.contains_key("fd_default"));
        assert!(!r.time_out_step("B", None));
    }

    #[test]
    fn timeout_sin_fallback_solo_marca_timed_out() {
        let mut r = record();
        assert!(r.time_out_step("A", None));
        assert!(r.completed_steps.is_empty());
        assert_eq!(r.timed_out_steps, vec!["A"]);
    }

    #[test]
    fn estado_terminal_congela_el_registro() {
        let mut r = record();
        assert!(r.abandon(ABANDONED_MESSAGE));
        let frozen = r.clone();

        assert!(!r.complete_step("A", &output(json!({"x": 1}))));
        assert!(!r.time_out_step("B", None));
        assert!(!r.enter(TaskStatus::Finalizing, None, 95));
        assert!(!r.fail("boom"));
        assert!(!r.complete(TaskResult {
            id: "r".to_string(),
            url: None,
            stats: StageOutput::new(),
        }));
        assert_eq!(r, frozen);
        assert_eq!(r.error.as_deref(), Some(ABANDONED_MESSAGE));
    }

    #[test]
    fn complete_deja_progreso_en_cien() {
        let mut r = record();
        r.complete_step("A", &StageOutput::new());
        assert!(r.complete(TaskResult {
            id: "rec-1".to_string(),
            url: None,
            stats: StageOutput::new(),
        }));
        assert_eq!(r.progress, 100);
        assert_eq!(r.status, TaskStatus::Complete);
        assert!(r.current_step.is_none());
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn json_usa_los_nombres_del_servicio() {
        let mut r = record();
        r.complete(TaskResult {
            id: "rec-1".to_string(),
            url: None,
            stats: StageOutput::new(),
        });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], json!("Complete"));
        assert!(v.get("steps").is_some());
        assert_eq!(v["result"]["id"], json!("rec-1"));
        assert!(v.get("error").is_none());

        let back: TaskRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }
}
