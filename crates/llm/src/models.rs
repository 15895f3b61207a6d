//! Static catalogue of local "brain" models and resumable, integrity-checked
//! downloads.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub filename: String,
    pub url: String,
    /// Empty when unpinned; see [`DownloadOutcome::pinned_sha256`].
    pub sha256: String,
    pub size: u64,
    pub default: bool,
}

/// A small static registry. Real deployments extend this via config; this
/// default set exists so the core has something to resolve against out of
/// the box.
pub fn default_registry() -> Vec<ModelInfo> {
    vec![ModelInfo {
        id: "qwen2.5-0.5b-instruct".to_string(),
        display_name: "Qwen2.5 0.5B Instruct (Q4_K_M)".to_string(),
        filename: "qwen2.5-0.5b-instruct-q4_k_m.gguf".to_string(),
        url: "https://huggingface.co/Qwen/Qwen2.5-0.5B-Instruct-GGUF/resolve/main/qwen2.5-0.5b-instruct-q4_k_m.gguf"
            .to_string(),
        sha256: String::new(),
        size: 491_000_000,
        default: true,
    }]
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

pub struct DownloadOutcome {
    pub path: PathBuf,
    pub resumed: bool,
    /// Set when this download computed and persisted a sidecar digest
    /// because the registry entry shipped with an empty sha256.
    pub pinned_sha256: Option<String>,
}

/// Downloads `model.url` to `dest_dir/model.filename`, resuming from a
/// `.part` file via `Range: bytes=<offset>-` when one exists.
///
/// - `200` on a Range request means the server ignored it; the download
///   restarts from scratch.
/// - `206` resumes.
/// - `416` ("range not satisfiable", typically because the `.part` already
///   holds the full file) retries once without the Range header.
pub async fn download_model(
    client: &reqwest::Client,
    model: &ModelInfo,
    dest_dir: &Path,
) -> Result<DownloadOutcome, DownloadError> {
    std::fs::create_dir_all(dest_dir)?;
    let final_path = dest_dir.join(&model.filename);
    let part_path = dest_dir.join(format!("{}.part", model.filename));

    let existing = std::fs::metadata(&part_path).map(|m| m.len()).unwrap_or(0);
    let (resumed, mut bytes) = fetch_with_resume(client, &model.url, &part_path, existing).await?;
    bytes = bytes.max(existing);
    let _ = bytes;

    let digest = hash_file(&part_path)?;
    let pinned_sha256 = if model.sha256.is_empty() {
        let sidecar = dest_dir.join(format!("{}.sha256", model.filename));
        std::fs::write(&sidecar, &digest)?;
        tracing::info!(model_id = %model.id, sha256 = %digest, "pinned previously-unverified model digest");
        Some(digest)
    } else if digest != model.sha256 {
        std::fs::remove_file(&part_path).ok();
        return Err(DownloadError::IntegrityMismatch { expected: model.sha256.clone(), actual: digest });
    } else {
        None
    };

    std::fs::rename(&part_path, &final_path)?;
    Ok(DownloadOutcome { path: final_path, resumed, pinned_sha256 })
}

async fn fetch_with_resume(
    client: &reqwest::Client,
    url: &str,
    part_path: &Path,
    existing: u64,
) -> Result<(bool, u64), DownloadError> {
    use std::io::Write;
    use tokio::io::AsyncWriteExt;

    let mut request = client.get(url);
    let mut attempted_resume = existing > 0;
    if attempted_resume {
        request = request.header("Range", format!("bytes={existing}-"));
    }

    let mut resp = request.send().await?;

    if resp.status().as_u16() == 416 {
        attempted_resume = false;
        resp = client.get(url).send().await?;
    }

    let status = resp.status();
    let append = attempted_resume && status.as_u16() == 206;
    if !append {
        // Either a fresh download, or the server ignored our Range header
        // and returned 200 with the full body — restart from scratch.
        std::fs::File::create(part_path)?.flush()?;
    }

    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).truncate(!append).open(part_path).await?;
    if !append {
        file.set_len(0).await?;
    }

    let mut total = if append { existing } else { 0 };
    let mut stream = resp.bytes_stream();
    use futures::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok((append, total))
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_one_default_model() {
        let registry = default_registry();
        assert_eq!(registry.iter().filter(|m| m.default).count(), 1);
    }

    #[test]
    fn hash_file_matches_known_sha256_of_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        let digest = hash_file(&path).unwrap();
        assert_eq!(digest, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
