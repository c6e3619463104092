use std::path::PathBuf;

/// Errors produced by cache-key construction and artifact cache access.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate cache key field `{name}`")]
    DuplicateField { name: String },

    #[error(
        "failed to produce cache entry in cache directory {} \
         (delete the directory to rebuild the cache from scratch): {source}",
        cache_dir.display()
    )]
    Producer {
        cache_dir: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(
        "output location {} must not overlap the cache directory {}",
        path.display(),
        cache_dir.display()
    )]
    OutputOverlapsCache { path: PathBuf, cache_dir: PathBuf },
}
