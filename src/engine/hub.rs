//! Hugging Face hub cache access
//!
//! Resolves the canonical model id to a local snapshot directory, downloading
//! only what the cache does not already hold.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hf_hub::api::tokio::ApiBuilder;
use tracing::info;

use crate::error::{DiarizationError, Result};

/// Settings for hub fetches
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub cache_dir: Option<PathBuf>,
    /// Files that make up a usable snapshot; the first one locates the snapshot dir.
    pub files: Vec<String>,
}

/// Fetch `settings.files` for `model_id` and return the snapshot directory.
///
/// The whole fetch, not each file, is bounded by `timeout`.
pub async fn fetch_snapshot(
    settings: &HubSettings,
    model_id: &str,
    token: Option<String>,
    timeout: Duration,
) -> Result<PathBuf> {
    if settings.files.is_empty() {
        return Err(DiarizationError::ModelLoadFailure(
            "no hub files configured for remote loading".to_string(),
        ));
    }

    if token.is_some() {
        info!("Using HF token for hub authentication");
    }

    let mut builder = ApiBuilder::new().with_token(token).with_progress(false);
    if let Some(ref dir) = settings.cache_dir {
        builder = builder.with_cache_dir(dir.clone());
    }
    let api = builder
        .build()
        .map_err(|e| DiarizationError::ModelLoadFailure(format!("hub client: {}", e)))?;
    let repo = api.model(model_id.to_string());

    let start = Instant::now();
    let fetch = async {
        let mut snapshot: Option<PathBuf> = None;
        for file in &settings.files {
            let path = repo.get(file).await.map_err(|e| {
                DiarizationError::ModelLoadFailure(format!("{}: fetching {}: {}", model_id, file, e))
            })?;
            if snapshot.is_none() {
                snapshot = snapshot_root(&path, file);
            }
        }
        snapshot.ok_or_else(|| {
            DiarizationError::ModelLoadFailure(format!("{}: snapshot has no parent directory", model_id))
        })
    };

    let snapshot = tokio::time::timeout(timeout, fetch).await.map_err(|_| {
        DiarizationError::ModelLoadFailure(format!(
            "{}: download timed out after {}s",
            model_id,
            timeout.as_secs()
        ))
    })??;

    info!("Hub snapshot for {} ready at {:?} in {:?}", model_id, snapshot, start.elapsed());
    Ok(snapshot)
}

/// Strip the repo-relative `file` from its cached `path`, leaving the snapshot dir
fn snapshot_root(path: &Path, file: &str) -> Option<PathBuf> {
    let depth = Path::new(file).components().count();
    path.ancestors().nth(depth).map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_root_of_top_level_file() {
        let path = Path::new("/cache/models--org--model/snapshots/abc123/config.yaml");
        assert_eq!(
            snapshot_root(path, "config.yaml"),
            Some(PathBuf::from("/cache/models--org--model/snapshots/abc123"))
        );
    }

    #[test]
    fn test_snapshot_root_of_nested_file() {
        let path = Path::new("/cache/models--org--model/snapshots/abc123/sub/x.yaml");
        assert_eq!(
            snapshot_root(path, "sub/x.yaml"),
            Some(PathBuf::from("/cache/models--org--model/snapshots/abc123"))
        );
    }

    #[tokio::test]
    async fn test_empty_file_list_is_a_load_failure() {
        let settings = HubSettings {
            cache_dir: None,
            files: Vec::new(),
        };
        let err = fetch_snapshot(&settings, "org/model", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DiarizationError::ModelLoadFailure(_)));
    }
}
