use common::{PreparedArtifact, StageError, StageOutput, StageWorker};
use serde_json::{json, Map, Value};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const MAX_TAG_LEN: usize = 200;

/// Firmas que dejan los generadores de imágenes más comunes.
const GENERATOR_MARKERS: &[&str] = &[
    "stable diffusion",
    "midjourney",
    "dall-e",
    "dall·e",
    "novelai",
    "comfyui",
    "automatic1111",
    "firefly",
    "negative prompt",
];

/// Inspecciona los metadatos embebidos (chunks de texto PNG y bloques
/// EXIF/XMP) buscando rastros de herramientas generativas.
#[derive(Debug, Default, Clone)]
pub struct MetadataInspector;

impl MetadataInspector {
    pub fn fallback() -> Value {
        json!({
            "metadata_analysis": {
                "tags": {},
                "description": "Analysis timed out.",
                "is_suspicious": false
            }
        })
    }
}

impl StageWorker for MetadataInspector {
    type Input = PreparedArtifact;
    type Output = StageOutput;

    fn run(&self, img: &PreparedArtifact) -> Result<StageOutput, StageError> {
        let mut tags = Map::new();

        if let Ok(format) = image::guess_format(&img.raw) {
            tags.insert("format".to_string(), json!(format!("{format:?}")));
        }
        for (key, text) in png_text_chunks(&img.raw) {
            tags.insert(key, json!(truncate(&text, MAX_TAG_LEN)));
        }
        if contains_bytes(&img.raw, b"Exif\0\0") {
            tags.insert("exif".to_string(), json!(true));
        }
        if contains_bytes(&img.raw, b"http://ns.adobe.com/xap/1.0/") {
            tags.insert("xmp".to_string(), json!(true));
        }

        let haystack = String::from_utf8_lossy(&img.raw).to_lowercase();
        let found: Vec<&str> = GENERATOR_MARKERS
            .iter()
            .copied()
            .filter(|m| haystack.contains(m))
            .collect();
        let is_suspicious = !found.is_empty() || tags.contains_key("parameters");

        let description = if is_suspicious {
            if found.is_empty() {
                "Generation parameters embedded in metadata.".to_string()
            } else {
                format!("Generator signature found: {}.", found.join(", "))
            }
        } else if tags.len() <= 1 {
            "No descriptive metadata found.".to_string()
        } else {
            format!("Found {} metadata entries, none suspicious.", tags.len())
        };

        let mut out = StageOutput::new();
        out.insert(
            "metadata_analysis".to_string(),
            json!({
                "tags": tags,
                "description": description,
                "is_suspicious": is_suspicious,
            }),
        );
        Ok(out)
    }
}

/// Chunks tEXt e iTXt de un PNG como pares (clave, texto).
fn png_text_chunks(bytes: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if !bytes.starts_with(PNG_SIGNATURE) {
        return out;
    }

    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let kind = &bytes[pos + 4..pos + 8];
        let start = pos + 8;
        let Some(end) = start.checked_add(len).filter(|e| *e <= bytes.len()) else {
            break;
        };
        let data = &bytes[start..end];

        match kind {
            b"tEXt" => {
                if let Some(nul) = data.iter().position(|b| *b == 0) {
                    out.push((
                        String::from_utf8_lossy(&data[..nul]).into_owned(),
                        String::from_utf8_lossy(&data[nul + 1..]).into_owned(),
                    ));
                }
            }
            b"iTXt" => {
                // keyword \0 flag method lang \0 translated \0 text
                if let Some(nul) = data.iter().position(|b| *b == 0) {
                    let key = String::from_utf8_lossy(&data[..nul]).into_owned();
                    let text = data[nul + 1..]
                        .splitn(4, |b| *b == 0)
                        .last()
                        .map(|t| String::from_utf8_lossy(t).into_owned())
                        .unwrap_or_default();
                    out.push((key, text));
                }
            }
            b"IEND" => break,
            _ => {}
        }

        // datos + CRC
        pos = end + 4;
    }
    out
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
