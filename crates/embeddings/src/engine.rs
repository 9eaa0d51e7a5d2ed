use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result, anyhow};
use ort::{session::Session, value::Tensor};
use parking_lot::Mutex;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tokenizers::{EncodeInput, Tokenizer};

use crate::{Embedder, config::EmbeddingConfig, l2_normalize};

pub struct EmbeddingEngine {
    config: EmbeddingConfig,
    backend: EmbeddingBackend,
}

enum EmbeddingBackend {
    Onnx(OnnxBackend),
    Pseudo,
    Unavailable(String),
}

struct OnnxBackend {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model_name: String,
}

struct EncodedBatch {
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    batch_size: usize,
    seq_len: usize,
}

impl EmbeddingEngine {
    pub fn new(config: EmbeddingConfig) -> Self {
        let backend = match build_backend(&config) {
            Ok(backend) => backend,
            Err(err) => {
                tracing::warn!(error = %err, model = %config.model_path, "embedding backend unavailable");
                EmbeddingBackend::Unavailable(format!("{err:#}"))
            }
        };
        Self { config, backend }
    }

    pub const fn is_available(&self) -> bool {
        !matches!(self.backend, EmbeddingBackend::Unavailable(_))
    }

    pub const fn is_pseudo(&self) -> bool {
        matches!(self.backend, EmbeddingBackend::Pseudo)
    }
}

impl Embedder for EmbeddingEngine {
    fn embedder_id(&self) -> String {
        match &self.backend {
            EmbeddingBackend::Onnx(backend) => {
                format!("onnx:{}/{}", backend.model_name, self.config.vector_dim)
            }
            EmbeddingBackend::Pseudo => format!("pseudo-hash/{}", self.config.vector_dim),
            EmbeddingBackend::Unavailable(_) => "unavailable".to_string(),
        }
    }

    fn dim(&self) -> usize {
        self.config.vector_dim
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        match &self.backend {
            EmbeddingBackend::Onnx(backend) => {
                let mut out = Vec::with_capacity(inputs.len());
                for batch in inputs.chunks(self.config.batch_size) {
                    out.extend(backend.embed_batch(batch, &self.config)?);
                }
                Ok(out)
            }
            EmbeddingBackend::Pseudo => Ok(inputs
                .par_iter()
                .map(|input| pseudo_embed(input, self.config.vector_dim))
                .collect::<Vec<_>>()),
            EmbeddingBackend::Unavailable(msg) => Err(anyhow!(
                "embedding unavailable: {msg}. set SOP_RAG_ALLOW_PSEUDO_EMBED=true only for offline testing"
            )),
        }
    }
}

impl OnnxBackend {
    fn embed_batch(&self, inputs: &[String], cfg: &EmbeddingConfig) -> Result<Vec<Vec<f32>>> {
        let encoded = encode_inputs(inputs, cfg, &self.tokenizer)?;
        let shape = vec![encoded.batch_size as i64, encoded.seq_len as i64];
        let ids_tensor = Tensor::<i64>::from_array((shape.clone(), encoded.input_ids.clone()))?;
        let mask_tensor =
            Tensor::<i64>::from_array((shape.clone(), encoded.attention_mask.clone()))?;
        let token_type_tensor = Tensor::<i64>::from_array((
            shape,
            vec![0i64; encoded.batch_size * encoded.seq_len],
        ))?;

        let mut session = self.session.lock();
        let mut model_inputs = HashMap::new();
        for input in session.inputs() {
            let name = input.name().to_lowercase();
            let value = if name.contains("attention") && name.contains("mask") {
                mask_tensor.clone().upcast()
            } else if name.contains("token_type") {
                token_type_tensor.clone().upcast()
            } else {
                ids_tensor.clone().upcast()
            };
            model_inputs.insert(input.name().to_string(), value);
        }

        let mut outputs = session.run(model_inputs)?;
        let first_key = outputs
            .keys()
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("embedding model returned no outputs"))?;
        let output = outputs
            .remove(first_key)
            .ok_or_else(|| anyhow!("embedding model output extraction failed"))?;
        let (shape, values) = output
            .try_extract_tensor::<f32>()
            .map_err(|err| anyhow!("embedding output decode failed: {err}"))?;

        let mut vectors = pool_output(
            shape,
            values,
            encoded.batch_size,
            encoded.seq_len,
            &encoded.attention_mask,
        )?;
        for vector in &mut vectors {
            *vector = fit_vector_dim(vector, cfg.vector_dim);
            l2_normalize(vector);
        }
        Ok(vectors)
    }
}

/// Mean-pools token states over the attention mask. Rank-2 outputs are already pooled.
fn pool_output(
    shape: &[i64],
    values: &[f32],
    batch_size: usize,
    seq_len: usize,
    attention_mask: &[i64],
) -> Result<Vec<Vec<f32>>> {
    if shape.len() < 2 {
        return Err(anyhow!(
            "embedding output rank {} is unsupported",
            shape.len()
        ));
    }
    if shape[0] <= 0 {
        return Err(anyhow!(
            "embedding output batch dimension is invalid: {}",
            shape[0]
        ));
    }
    let hidden = usize::try_from(shape[shape.len() - 1]).unwrap_or(0);
    if hidden == 0 {
        return Err(anyhow!("embedding output hidden dimension is invalid"));
    }

    if shape.len() == 2 {
        if values.len() < batch_size * hidden {
            return Err(anyhow!(
                "embedding output tensor too small for expected shape {batch_size}x{hidden}"
            ));
        }
        return Ok(values
            .chunks(hidden)
            .take(batch_size)
            .map(<[f32]>::to_vec)
            .collect());
    }

    let model_seq_len = usize::try_from(shape[shape.len() - 2]).unwrap_or(seq_len);
    if values.len() < batch_size * model_seq_len * hidden {
        return Err(anyhow!(
            "embedding output tensor too small for pooled decoding"
        ));
    }

    let mut out = Vec::with_capacity(batch_size);
    for batch in 0..batch_size {
        let mut pooled = vec![0.0f32; hidden];
        let mut denom = 0.0f32;
        for token in 0..model_seq_len.min(seq_len) {
            if attention_mask[batch * seq_len + token] == 0 {
                continue;
            }
            denom += 1.0;
            let base = (batch * model_seq_len + token) * hidden;
            for (slot, value) in pooled.iter_mut().zip(&values[base..base + hidden]) {
                *slot += value;
            }
        }
        if denom > 0.0 {
            for value in &mut pooled {
                *value /= denom;
            }
        }
        out.push(pooled);
    }
    Ok(out)
}

fn fit_vector_dim(values: &[f32], target_dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; target_dim];
    let n = values.len().min(target_dim);
    out[..n].copy_from_slice(&values[..n]);
    out
}

fn build_backend(config: &EmbeddingConfig) -> Result<EmbeddingBackend> {
    if config.allow_pseudo_fallback {
        return Ok(EmbeddingBackend::Pseudo);
    }
    let model_path = Path::new(&config.model_path);
    if !model_path.exists() {
        return Err(anyhow!(
            "embedding model not found at {}",
            model_path.display()
        ));
    }
    let tokenizer_path = config
        .tokenizer_path
        .as_deref()
        .ok_or_else(|| anyhow!("no tokenizer configured for {}", model_path.display()))?;
    let tokenizer = Tokenizer::from_file(tokenizer_path)
        .map_err(|err| anyhow!("failed loading tokenizer from {tokenizer_path}: {err}"))?;

    let session = Session::builder()
        .context("failed to create ONNX session builder")?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model {}", model_path.display()))?;
    let model_name = model_path
        .file_stem()
        .map_or_else(|| "model".to_string(), |s| s.to_string_lossy().into_owned());

    Ok(EmbeddingBackend::Onnx(OnnxBackend {
        session: Mutex::new(session),
        tokenizer,
        model_name,
    }))
}

fn encode_inputs(
    inputs: &[String],
    config: &EmbeddingConfig,
    tokenizer: &Tokenizer,
) -> Result<EncodedBatch> {
    let encoded_inputs = inputs
        .iter()
        .map(|text| EncodeInput::Single(text.as_str().into()))
        .collect::<Vec<_>>();
    let encodings = tokenizer
        .encode_batch(encoded_inputs, true)
        .map_err(|err| anyhow!("tokenization failed: {err}"))?;

    let seq_len = config.max_sequence_length;
    let mut input_ids = vec![0i64; inputs.len() * seq_len];
    let mut attention_mask = vec![0i64; inputs.len() * seq_len];
    for (row, encoding) in encodings.iter().enumerate() {
        for (col, token_id) in encoding.get_ids().iter().take(seq_len).enumerate() {
            input_ids[row * seq_len + col] = i64::from(*token_id);
            attention_mask[row * seq_len + col] = 1;
        }
    }

    Ok(EncodedBatch {
        input_ids,
        attention_mask,
        batch_size: inputs.len(),
        seq_len,
    })
}

/// Feature-hashed bag of words. Stable across processes and platforms.
fn pseudo_embed(input: &str, dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; dim.max(1)];
    let lowered = input.to_lowercase();
    let tokens = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .filter(|t| !t.is_empty());
    for token in tokens {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        let len = out.len();
        out[bucket % len] += sign;
    }
    l2_normalize(&mut out);
    out
}
