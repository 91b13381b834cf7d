//! Local embedding generation via fastembed (ONNX inference), feature-gated
//! behind `embeddings`. Grounded in the same global-model-handle pattern:
//! the ONNX session is expensive to construct, so it's built once behind a
//! `OnceLock` and reused across calls.

#![cfg(feature = "embeddings")]

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Mutex, OnceLock};

use crate::embeddings::{Embedder, EMBEDDING_DIMENSIONS};
use crate::error::{EngineError, Result};

/// Maximum characters embedded; longer content is truncated rather than
/// rejected, matching the embedder's "may fail, never blocks store" contract
/// from the other direction (we'd rather embed a prefix than fail outright).
pub const MAX_TEXT_LENGTH: usize = 8192;

static MODEL: OnceLock<std::result::Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("CORTEX_EMBED_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "cortex") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join(".cache/cortex/fastembed");
    }
    std::path::PathBuf::from(".cortex_fastembed_cache")
}

fn model() -> std::result::Result<std::sync::MutexGuard<'static, TextEmbedding>, String> {
    let result = MODEL.get_or_init(|| {
        let dir = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(?dir, error = %e, "failed to create fastembed cache directory");
        }
        // AllMiniLML6V2 outputs 384 dimensions natively, matching the
        // engine's fixed embedding width without any truncation step.
        let options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false)
            .with_cache_dir(dir);
        TextEmbedding::try_new(options)
            .map(Mutex::new)
            .map_err(|e| format!("failed to initialize all-MiniLM-L6-v2: {e}"))
    });
    match result {
        Ok(m) => m.lock().map_err(|e| format!("embedding model lock poisoned: {e}")),
        Err(e) => Err(e.clone()),
    }
}

/// Truncate to at most `max_bytes`, backing off to the nearest preceding
/// char boundary so multi-byte UTF-8 content never gets sliced mid-codepoint.
fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// `Embedder` backed by a local ONNX model. Feature-gated: without
/// `embeddings`, callers inject their own `Embedder` or leave it
/// unconfigured and rely on `NullEmbedder`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalEmbedder;

impl Embedder for LocalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let truncated = if text.len() > MAX_TEXT_LENGTH { truncate_at_char_boundary(text, MAX_TEXT_LENGTH) } else { text };
        let mut guard = model().map_err(EngineError::ExternalUnavailable)?;
        let embeddings = guard
            .embed(vec![truncated], None)
            .map_err(|e| EngineError::ExternalUnavailable(format!("embedding generation failed: {e}")))?;
        let vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ExternalUnavailable("embedder returned no vectors".into()))?;
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(EngineError::internal(format!(
                "embedder produced {} dims, expected {EMBEDDING_DIMENSIONS}",
                vector.len()
            )));
        }
        Ok(vector)
    }
}
