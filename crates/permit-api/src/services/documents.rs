//! Uploaded application documents on the local filesystem.
//!
//! Files live under `<root>/<application_id>/<millis>-<name>`; the stored
//! `file_path` is relative to the root.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_EXTENSIONS: [&str; 7] = ["pdf", "jpg", "jpeg", "png", "gif", "doc", "docx"];
const MAX_NAME_LEN: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("file name is empty")]
    EmptyName,
    #[error("file type not allowed: {0:?}")]
    DisallowedType(String),
    #[error("file exceeds {MAX_DOCUMENT_BYTES} bytes")]
    TooLarge,
    #[error("file is empty")]
    EmptyContent,
    #[error("storage error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct DocumentStorage {
    root: PathBuf,
}

impl DocumentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` for `application_id`; returns the relative stored path.
    pub async fn save(
        &self,
        application_id: Uuid,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, DocumentError> {
        if bytes.is_empty() {
            return Err(DocumentError::EmptyContent);
        }
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(DocumentError::TooLarge);
        }
        let name = sanitize_file_name(file_name)?;

        let relative = format!(
            "{application_id}/{}-{name}",
            Utc::now().timestamp_millis()
        );
        let target = self.root.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;

        tracing::info!(
            application_id = %application_id,
            path = %relative,
            size = bytes.len(),
            "document stored"
        );
        Ok(relative)
    }

    /// Health check: the root exists (creating it if needed) and is a directory.
    pub async fn check(&self) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            tracing::warn!(root = %self.root.display(), error = %e, "document storage unavailable");
            return false;
        }
        tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Keep the final path component, restricted to a safe character set.
pub fn sanitize_file_name(raw: &str) -> Result<String, DocumentError> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        return Err(DocumentError::EmptyName);
    }

    let extension = cleaned
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(DocumentError::DisallowedType(extension));
    }

    let keep = cleaned.len().saturating_sub(MAX_NAME_LEN);
    Ok(cleaned[keep..].to_string())
}
