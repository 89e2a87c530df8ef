use common::{StageError, StageOutput, StageWorker};
use serde_json::{json, Value};

/// Resume los resultados del cluster en una sola oración para el usuario.
#[derive(Debug, Default, Clone)]
pub struct InsightSummarizer;

impl StageWorker for InsightSummarizer {
    type Input = StageOutput;
    type Output = StageOutput;

    fn run(&self, results: &StageOutput) -> Result<StageOutput, StageError> {
        let mut out = StageOutput::new();
        out.insert("summary".to_string(), json!(summarize(results)));
        Ok(out)
    }
}

fn summarize(results: &StageOutput) -> String {
    let ai_text = match results.get("ai_probability").and_then(Value::as_f64) {
        Some(p) => format!("{:.1}% AI probability", p * 100.0),
        None => "unknown AI detection".to_string(),
    };

    let medium = results.get("art_medium").filter(|v| v.is_object());
    let medium_text = match medium {
        Some(m) => format!(
            "{} ({:.0}% confidence)",
            m.get("medium").and_then(Value::as_str).unwrap_or("unknown medium"),
            m.get("confidence").and_then(Value::as_f64).unwrap_or(0.0) * 100.0
        ),
        None => "unknown medium".to_string(),
    };

    let suspicious = results
        .get("metadata_analysis")
        .and_then(|m| m.get("is_suspicious"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let metadata_text = if suspicious {
        "suspicious metadata findings"
    } else {
        "clean metadata"
    };

    let fractal_text = match results.get("fd_default").and_then(Value::as_f64) {
        Some(fd) if fd != 0.0 => format!("fractal dimension {fd:.4}"),
        _ => "standard complexity".to_string(),
    };

    let objects = results
        .get("object_detection")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);

    let mut summary = format!(
        "Analysis found {ai_text}, {medium_text}, {metadata_text} and {fractal_text}"
    );
    if objects > 0 {
        summary.push_str(&format!(", with {objects} salient region(s) detected"));
    }
    summary.push('.');
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(v: Value) -> StageOutput {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn resumen_con_todos_los_resultados() {
        let input = results(json!({
            "ai_probability": 0.25,
            "art_medium": {"medium": "oil painting", "confidence": 0.7},
            "metadata_analysis": {"is_suspicious": true},
            "fd_default": 2.1234,
            "object_detection": [{"label": "salient region"}],
        }));

        let out = InsightSummarizer.run(&input).unwrap();
        assert_eq!(
            out["summary"],
            json!("Analysis found 25.0% AI probability, oil painting (70% confidence), suspicious metadata findings and fractal dimension 2.1234, with 1 salient region(s) detected.")
        );
    }

    #[test]
    fn fallbacks_nulos_no_rompen_el_resumen() {
        let input = results(json!({
            "ai_probability": null,
            "art_medium": null,
            "fd_default": null,
            "object_detection": null,
        }));

        let out = InsightSummarizer.run(&input).unwrap();
        assert_eq!(
            out["summary"],
            json!("Analysis found unknown AI detection, unknown medium, clean metadata and standard complexity.")
        );
    }
}
