//! Utility functions
//!
use std::{
    fs::{self, File},
    io::Cursor,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;

    if let Some(parent) = filepath.parent() {
        fs::create_dir_all(parent)?;
    }
    // Download next to the target so a failed download never leaves a truncated model behind
    let partial = filepath.with_extension("part");
    let mut file = File::create(&partial)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;
    fs::rename(&partial, filepath)?;

    Ok(())
}

/// Locate the model file, downloading it from `url` if it does not exist.
///
/// Relative model paths that do not exist in the working directory are looked up in (and
/// downloaded to) the user's cache directory.
pub async fn resolve_model(model: &Path, url: Option<&str>) -> Result<PathBuf> {
    if model.exists() {
        return Ok(model.to_path_buf());
    }

    let cached = match (model.is_relative(), dirs::cache_dir()) {
        (true, Some(cache_dir)) => cache_dir.join("detect_server").join(model),
        _ => model.to_path_buf(),
    };
    if cached.exists() {
        return Ok(cached);
    }

    let url = url.with_context(|| {
        format!(
            "model {} not found and no download URL given",
            model.display()
        )
    })?;
    log::info!("Downloading model from {} to {}", url, cached.display());
    download_file(&Client::new(), url, &cached)
        .await
        .with_context(|| format!("failed to download model from {url}"))?;

    Ok(cached)
}

#[cfg(test)]
mod test {

    use super::*;

    #[tokio::test]
    async fn test_existing_model_is_used_as_is() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join("model.onnx");
        fs::write(&model, b"onnx")?;

        assert_eq!(resolve_model(&model, None).await?, model);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_model_without_url_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join("missing.onnx");

        assert!(resolve_model(&model, None).await.is_err());
        Ok(())
    }
}
