//! Embedding provider abstraction.
//!
//! The production provider wraps a fastembed `TextEmbedding` (BGE-Base-EN,
//! 768 dims) loaded in a blocking task. `EmbeddingService` adds an LRU text
//! cache in front of whichever provider is installed. Tests install a
//! deterministic hash-based provider so no model download is needed.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Embedding dimension (matches fastembed BGE-Base-EN-v1.5).
pub const EMBEDDING_DIM: i32 = 768;

const EMBEDDING_CACHE_SIZE: usize = 2048;

/// Anything that can turn text into vectors.
pub trait EmbeddingProvider: Send + Sync {
    fn encode_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, String>;
}

/// fastembed-backed provider.
pub struct FastembedProvider {
    model: Arc<TextEmbedding>,
}

impl FastembedProvider {
    /// Load the CPU embedding model. Must run off the async runtime.
    pub fn load() -> Result<Self, String> {
        let mut options = InitOptions::new(EmbeddingModel::BGEBaseENV15);
        options.show_download_progress = false;
        let model = TextEmbedding::try_new(options)
            .map_err(|e| format!("Failed to load embedding model: {}", e))?;
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

impl EmbeddingProvider for FastembedProvider {
    fn encode_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, String> {
        self.model
            .embed(texts, None)
            .map_err(|e| format!("Embedding failed: {}", e))
    }
}

/// Deterministic provider for tests: folds bytes into a fixed-dim vector.
pub struct HashEmbeddingProvider;

impl EmbeddingProvider for HashEmbeddingProvider {
    fn encode_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, String> {
        Ok(texts
            .into_iter()
            .map(|text| {
                let mut vector = vec![0.0f32; EMBEDDING_DIM as usize];
                for (i, byte) in text.bytes().enumerate() {
                    let idx = (i * 31 + byte as usize) % vector.len();
                    vector[idx] += (byte as f32) / 255.0;
                }
                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for v in vector.iter_mut() {
                        *v /= norm;
                    }
                }
                vector
            })
            .collect())
    }
}

/// Shared slot holding the lazily-initialized provider.
pub type SharedEmbeddingProvider = Arc<RwLock<Option<Arc<dyn EmbeddingProvider>>>>;

/// Caching front for the embedding provider.
pub struct EmbeddingService {
    provider: SharedEmbeddingProvider,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(provider: SharedEmbeddingProvider) -> Self {
        Self {
            provider,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBEDDING_CACHE_SIZE).expect("cache size"),
            )),
        }
    }

    /// Install the fastembed provider in the background. Safe to call once
    /// at startup; consumers error out until the model is ready.
    pub fn spawn_model_load(provider: SharedEmbeddingProvider) {
        tokio::spawn(async move {
            let loaded = tokio::task::spawn_blocking(FastembedProvider::load).await;
            match loaded {
                Ok(Ok(model)) => {
                    let mut guard = provider.write().await;
                    *guard = Some(Arc::new(model));
                    println!("[Embeddings] CPU embedding model loaded");
                }
                Ok(Err(e)) => {
                    println!("[Embeddings] Failed to load embedding model: {}", e);
                }
                Err(e) => {
                    println!("[Embeddings] Embedding model load task panicked: {}", e);
                }
            }
        });
    }

    /// Encode one text, consulting the LRU cache first.
    pub async fn encode(&self, text: &str) -> Result<Vec<f32>, String> {
        if text.trim().is_empty() {
            return Err("Cannot embed empty text".to_string());
        }

        {
            let mut cache = self.cache.lock().expect("embedding cache poisoned");
            if let Some(hit) = cache.get(text) {
                return Ok(hit.clone());
            }
        }

        let provider = {
            let guard = self.provider.read().await;
            guard
                .clone()
                .ok_or_else(|| "Embedding model not initialized".to_string())?
        };

        let owned = text.to_string();
        let mut vectors = tokio::task::spawn_blocking(move || {
            provider.encode_batch(vec![owned])
        })
        .await
        .map_err(|e| format!("Embedding task panicked: {}", e))??;

        let vector = vectors
            .pop()
            .ok_or_else(|| "No embedding returned".to_string())?;

        let mut cache = self.cache.lock().expect("embedding cache poisoned");
        cache.put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Drop every cached embedding (config override invalidation).
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().expect("embedding cache poisoned");
        cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> EmbeddingService {
        let provider: SharedEmbeddingProvider =
            Arc::new(RwLock::new(Some(Arc::new(HashEmbeddingProvider) as Arc<dyn EmbeddingProvider>)));
        EmbeddingService::new(provider)
    }

    #[tokio::test]
    async fn test_hash_provider_is_deterministic() {
        let service = test_service();
        let a = service.encode("patient admissions").await.unwrap();
        let b = service.encode("patient admissions").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM as usize);
    }

    #[tokio::test]
    async fn test_distinct_texts_differ() {
        let service = test_service();
        let a = service.encode("patient admissions").await.unwrap();
        let b = service.encode("order revenue").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let service = test_service();
        assert!(service.encode("   ").await.is_err());
    }

    #[tokio::test]
    async fn test_uninitialized_provider_errors() {
        let provider: SharedEmbeddingProvider = Arc::new(RwLock::new(None));
        let service = EmbeddingService::new(provider);
        let err = service.encode("anything").await.unwrap_err();
        assert!(err.contains("not initialized"));
    }
}
