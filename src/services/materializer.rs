//! Copies provider-hosted artifacts to durable storage.
//!
//! Generated images live on short-lived provider URLs; the
//! [`Materializer`] fetches them and stores them under a stable key so the
//! record can point at a URL that does not expire.

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

#[async_trait::async_trait]
pub trait Materializer: Send + Sync {
    /// Stores the artifact at `remote_url` under `stable_key` and returns its
    /// durable public URL.
    ///
    /// Nothing is visible at the final location unless the whole artifact was
    /// written.
    async fn materialize(
        &self,
        remote_url: &str,
        stable_key: &str,
    ) -> Result<String, MaterializeError>;
}

/// Writes artifacts into a local directory served under `public_base_url`.
pub struct FsMaterializer {
    client: Client,
    output_dir: PathBuf,
    public_base_url: String,
    default_extension: String,
}

impl FsMaterializer {
    #[must_use]
    pub fn new(
        client: Client,
        output_dir: PathBuf,
        public_base_url: &str,
        default_extension: &str,
    ) -> Self {
        Self {
            client,
            output_dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            default_extension: default_extension.trim_start_matches('.').to_string(),
        }
    }

    async fn write_atomically(&self, file_name: &str, bytes: &[u8]) -> Result<(), MaterializeError> {
        fs::create_dir_all(&self.output_dir).await.map_err(|e| {
            MaterializeError::WriteFailed(format!(
                "Failed to create {}: {e}",
                self.output_dir.display()
            ))
        })?;

        let final_path = self.output_dir.join(file_name);
        let part_path = self.output_dir.join(format!("{file_name}.part"));

        let result = async {
            fs::write(&part_path, bytes).await?;
            fs::rename(&part_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&part_path).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %part_path.display(), error = %cleanup, "Failed to remove partial artifact");
            }
            return Err(MaterializeError::WriteFailed(format!(
                "Failed to write artifact to {}: {e}",
                final_path.display()
            )));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Materializer for FsMaterializer {
    async fn materialize(
        &self,
        remote_url: &str,
        stable_key: &str,
    ) -> Result<String, MaterializeError> {
        info!(url = %remote_url, key = %stable_key, "Downloading artifact");

        let response = self
            .client
            .get(remote_url)
            .send()
            .await
            .map_err(|e| MaterializeError::DownloadFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MaterializeError::DownloadFailed(format!(
                "artifact host returned {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MaterializeError::DownloadFailed(format!("body read failed: {e}")))?;
        if bytes.is_empty() {
            return Err(MaterializeError::DownloadFailed(
                "artifact body is empty".to_string(),
            ));
        }

        let extension = choose_extension(content_type.as_deref(), remote_url)
            .unwrap_or_else(|| self.default_extension.clone());
        let file_name = format!("{}.{extension}", sanitize_key(stable_key));

        self.write_atomically(&file_name, &bytes).await?;

        let public_url = format!("{}/{file_name}", self.public_base_url);
        info!(key = %stable_key, url = %public_url, bytes = bytes.len(), "Artifact materialized");
        Ok(public_url)
    }
}

/// Picks a file extension from an image `Content-Type`, else from the URL path.
fn choose_extension(content_type: Option<&str>, url: &str) -> Option<String> {
    let from_mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .filter(|ct| ct.starts_with("image/"))
        .and_then(|ct| {
            let subtype = ct.trim_start_matches("image/");
            let known = mime_guess::get_mime_extensions_str(ct)?;
            if known.contains(&subtype) {
                Some(subtype.to_string())
            } else if known.contains(&"jpg") {
                Some("jpg".to_string())
            } else {
                known.first().map(|e| (*e).to_string())
            }
        });

    from_mime.or_else(|| {
        let path = url::Url::parse(url).ok()?.path().to_string();
        let ext = Path::new(&path).extension()?.to_str()?.to_ascii_lowercase();
        mime_guess::from_ext(&ext)
            .first()
            .filter(|m| m.type_() == mime_guess::mime::IMAGE)
            .map(|_| ext)
    })
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
