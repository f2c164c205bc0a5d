//! Write-to-temp-then-rename for the store's JSON documents.
//!
//! The temp file lives next to the target so the rename stays on one mount.

use crate::error::StoreError;
use std::path::Path;
use tracing::error;

pub(crate) async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");

    if let Err(e) = tokio::fs::write(&tmp_path, content).await {
        error!(path = %tmp_path.display(), error = %e, "Failed to write temp file");
        return Err(StoreError::io(&tmp_path, e));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        error!(
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StoreError::io(path, e));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overwrites_without_leaving_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");

        atomic_write(&path, b"first").await.unwrap();
        atomic_write(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_parent_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("record.json");
        assert!(matches!(
            atomic_write(&path, b"x").await,
            Err(StoreError::Io { .. })
        ));
    }
}
