use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use vocario_core::conversation::ArchiveMetadata;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("archive write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive rejected `{0}`: unsafe file name")]
    UnsafeName(String),
}

/// Durable home of rendered documents; returns the public link users receive.
#[async_trait]
pub trait DocumentArchive: Send + Sync {
    async fn store(
        &self,
        bytes: &[u8],
        metadata: &ArchiveMetadata,
    ) -> Result<String, StorageError>;
}

/// Writes documents under a local directory that the server exposes at `/documents`.
pub struct LocalArchive {
    root: PathBuf,
    public_base_url: String,
}

impl LocalArchive {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        let public_base_url = public_base_url.trim_end_matches('/').to_owned();
        Self { root: root.into(), public_base_url }
    }
}

#[async_trait]
impl DocumentArchive for LocalArchive {
    async fn store(
        &self,
        bytes: &[u8],
        metadata: &ArchiveMetadata,
    ) -> Result<String, StorageError> {
        let name = archive_name(bytes, &metadata.filename)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(&name), bytes).await?;

        info!(
            event_name = "documents.archive.stored",
            number = %metadata.number,
            size = bytes.len(),
            file = %name,
            "document archived"
        );
        Ok(format!("{}/{name}", self.public_base_url))
    }
}

/// `DEV-20260115-0001.pdf` becomes `DEV-20260115-0001-3fa2b9c01d4e.pdf`: the content hash keeps
/// links to earlier renders of the same number valid and unguessable.
fn archive_name(bytes: &[u8], filename: &str) -> Result<String, StorageError> {
    let safe = !filename.is_empty()
        && filename.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        && !filename.starts_with('.');
    if !safe {
        return Err(StorageError::UnsafeName(filename.to_owned()));
    }

    let digest = Sha256::digest(bytes);
    let hash: String = digest.iter().take(6).map(|byte| format!("{byte:02x}")).collect();
    Ok(match filename.rsplit_once('.') {
        Some((stem, extension)) => format!("{stem}-{hash}.{extension}"),
        None => format!("{filename}-{hash}"),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use vocario_core::conversation::ArchiveMetadata;
    use vocario_core::DocumentKind;

    use super::{archive_name, DocumentArchive, LocalArchive, StorageError};

    fn metadata(filename: &str) -> ArchiveMetadata {
        ArchiveMetadata {
            number: "DEV-20260115-0001".to_owned(),
            kind: DocumentKind::Quote,
            client_name: "Dupont".to_owned(),
            filename: filename.to_owned(),
            content_type: "application/pdf".to_owned(),
        }
    }

    #[test]
    fn names_keep_the_extension_and_add_a_content_hash() {
        let first = archive_name(b"one", "DEV-1.pdf").expect("name");
        let second = archive_name(b"two", "DEV-1.pdf").expect("name");

        assert!(first.starts_with("DEV-1-") && first.ends_with(".pdf"));
        assert_eq!(first.len(), "DEV-1-.pdf".len() + 12);
        assert_ne!(first, second);
    }

    #[test]
    fn path_traversal_is_rejected() {
        assert!(matches!(archive_name(b"x", "../etc/passwd"), Err(StorageError::UnsafeName(_))));
        assert!(matches!(archive_name(b"x", ".hidden"), Err(StorageError::UnsafeName(_))));
    }

    #[tokio::test]
    async fn stored_documents_are_written_and_linked() {
        let dir = TempDir::new().expect("temp dir");
        let root = dir.path().join("docs");
        let archive = LocalArchive::new(root.clone(), "https://vocario.fr/documents/");

        let url =
            archive.store(b"%PDF-1.4", &metadata("DEV-20260115-0001.pdf")).await.expect("store");

        assert!(url.starts_with("https://vocario.fr/documents/DEV-20260115-0001-"));
        let name = url.rsplit('/').next().expect("file name");
        let written = std::fs::read(root.join(name)).expect("archived file");
        assert_eq!(written, b"%PDF-1.4");
    }
}
