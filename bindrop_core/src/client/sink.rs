use crate::utils::{sanitize_file_name, unique_destination};
use std::path::PathBuf;

/// Decides where a received file is written.
pub trait FileSink: Send + Sync + 'static {
    /// `name` is the decrypted name the sender declared and is not trusted
    fn destination(&self, file_id: &str, name: &str) -> PathBuf;
}

/// Writes into one directory, never overwriting an existing file
pub struct DownloadDirSink {
    dir: PathBuf,
}

impl DownloadDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl FileSink for DownloadDirSink {
    fn destination(&self, _file_id: &str, name: &str) -> PathBuf {
        unique_destination(&self.dir, &sanitize_file_name(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_is_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DownloadDirSink::new(dir.path());
        let dest = sink.destination("id", "../../etc/passwd");
        assert_eq!(dest, dir.path().join("passwd"));
    }
}
