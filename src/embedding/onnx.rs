use super::{EmbeddingClient, EmbeddingClientError};
use async_trait::async_trait;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

const MODEL_ONNX: &str = "model.onnx";
const MODEL_ONNX_SUBDIR: &str = "onnx/model.onnx";
const TOKENIZER_JSON: &str = "tokenizer.json";

/// Output carrying an already pooled `[batch, dim]` embedding, when the export has one.
const POOLED_OUTPUT: &str = "sentence_embedding";
/// Token-level `[batch, seq, dim]` output pooled from its first (CLS) position.
const HIDDEN_OUTPUT: &str = "last_hidden_state";

/// Local embedding model executed with ONNX Runtime.
///
/// The model directory holds `model.onnx` (or `onnx/model.onnx`) and a Hugging Face
/// `tokenizer.json`. Inference runs on the blocking pool with a fixed number of intra-op
/// threads and a single inter-op thread, so `EMBEDDING_THREADS` is the whole CPU footprint.
pub struct OnnxEmbeddingClient {
    model: Arc<OnnxModel>,
}

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    takes_token_types: bool,
    max_length: usize,
    name: String,
}

impl OnnxEmbeddingClient {
    /// Load the model stored in `model_dir`.
    pub fn load(
        model_dir: &Path,
        name: &str,
        intra_threads: usize,
        max_length: usize,
    ) -> Result<Self, EmbeddingClientError> {
        let model_file = select_model_file(model_dir).ok_or_else(|| {
            EmbeddingClientError::ModelUnavailable(format!(
                "{name}: no {MODEL_ONNX} or {MODEL_ONNX_SUBDIR} in {}",
                model_dir.display()
            ))
        })?;
        let tokenizer_path = model_dir.join(TOKENIZER_JSON);
        if !tokenizer_path.is_file() {
            return Err(EmbeddingClientError::ModelUnavailable(format!(
                "{name}: no {TOKENIZER_JSON} in {}",
                model_dir.display()
            )));
        }

        let threads = intra_threads.max(1);
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(&model_file))
            .map_err(|e| {
                EmbeddingClientError::ModelUnavailable(format!(
                    "{}: ONNX session creation failed: {e}",
                    model_file.display()
                ))
            })?;
        let takes_token_types = session
            .inputs
            .iter()
            .any(|input| input.name == "token_type_ids");

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            EmbeddingClientError::ModelUnavailable(format!(
                "{}: tokenizer load failed: {e}",
                tokenizer_path.display()
            ))
        })?;

        tracing::info!(
            model = %name,
            model_file = %model_file.display(),
            intra_threads = threads,
            max_length,
            "ONNX embedding model loaded"
        );
        Ok(Self {
            model: Arc::new(OnnxModel {
                session: Mutex::new(session),
                tokenizer,
                takes_token_types,
                max_length: max_length.max(1),
                name: name.to_string(),
            }),
        })
    }
}

fn select_model_file(model_dir: &Path) -> Option<PathBuf> {
    [MODEL_ONNX, MODEL_ONNX_SUBDIR]
        .iter()
        .map(|relative| model_dir.join(relative))
        .find(|path| path.is_file())
}

impl OnnxModel {
    fn failed(&self, context: &str, error: impl std::fmt::Display) -> EmbeddingClientError {
        EmbeddingClientError::GenerationFailed(format!("{} {context}: {error}", self.name))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| self.failed("tokenization", e))?;
        let to_i64 = |values: &[u32]| -> Vec<i64> {
            values
                .iter()
                .take(self.max_length)
                .map(|&value| i64::from(value))
                .collect()
        };
        let input_ids = to_i64(encoding.get_ids());
        let attention_mask = to_i64(encoding.get_attention_mask());
        let token_type_ids = to_i64(encoding.get_type_ids());
        let shape = [1_i64, input_ids.len() as i64];

        let tensor = |name: &str, values: Vec<i64>| {
            ort::value::Tensor::from_array((shape.as_slice(), values))
                .map_err(|e| self.failed(&format!("{name} tensor"), e))
        };
        let input_ids = tensor("input_ids", input_ids)?;
        let attention_mask = tensor("attention_mask", attention_mask)?;
        let inputs = if self.takes_token_types {
            let token_type_ids = tensor("token_type_ids", token_type_ids)?;
            ort::inputs! {
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            }
        } else {
            ort::inputs! {
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            }
        }
        .map_err(|e| self.failed("building inputs", e))?;

        let session = self
            .session
            .lock()
            .map_err(|_| self.failed("session", "lock poisoned"))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| self.failed("inference", e))?;

        for name in [POOLED_OUTPUT, HIDDEN_OUTPUT] {
            if let Some(value) = outputs.get(name)
                && let Ok((shape, data)) = value.try_extract_raw_tensor::<f32>()
            {
                let dims = shape.to_vec();
                let mut vector = first_position(&dims, data)
                    .ok_or_else(|| self.failed(name, format!("unexpected shape {dims:?}")))?;
                l2_normalize(&mut vector);
                return Ok(vector);
            }
        }
        Err(self.failed(
            "inference",
            format!("no {POOLED_OUTPUT} or {HIDDEN_OUTPUT} output"),
        ))
    }
}

/// First row of a `[1, dim]` output, or the first token of a `[1, seq, dim]` one.
fn first_position(dims: &[i64], data: &[f32]) -> Option<Vec<f32>> {
    let width = match dims {
        [1, dim] | [1, _, dim] => usize::try_from(*dim).ok()?,
        _ => return None,
    };
    (width > 0 && data.len() >= width).then(|| data[..width].to_vec())
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[async_trait]
impl EmbeddingClient for OnnxEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no input texts provided".to_string(),
            ));
        }
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || {
            texts
                .iter()
                .map(|text| model.embed(text))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| EmbeddingClientError::GenerationFailed(format!("inference task: {e}")))?
    }
}
