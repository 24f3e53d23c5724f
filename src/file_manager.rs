// src/file_manager.rs - storage of uploaded drawing files
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FileManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),
}

#[derive(Debug, Clone)]
pub struct FileManager {
    uploads_dir: PathBuf,
}

impl FileManager {
    pub fn new(uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    /// Create the uploads directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> Result<(), FileManagerError> {
        fs::create_dir_all(&self.uploads_dir).await?;
        Ok(())
    }

    /// Reduce a client supplied name to its final path component.
    pub fn clean_name(name: &str) -> Result<String, FileManagerError> {
        let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
        if base.is_empty() || base == "." || base == ".." {
            return Err(FileManagerError::InvalidName(name.to_string()));
        }
        Ok(base.to_string())
    }

    /// Write an upload into the uploads directory. An existing file is never overwritten:
    /// `name.svg` becomes `name_1.svg`, `name_2.svg`, ... until a free name is found.
    pub async fn save_upload(&self, filename: &str, content: &[u8]) -> Result<PathBuf, FileManagerError> {
        let name = Self::clean_name(filename)?;
        let (stem, ext) = match name.rfind('.') {
            Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
            _ => (name.as_str(), ""),
        };

        let mut counter = 0u32;
        loop {
            let candidate = if counter == 0 {
                self.uploads_dir.join(&name)
            } else {
                self.uploads_dir.join(format!("{stem}_{counter}{ext}"))
            };
            match fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
                Ok(file) => {
                    write_or_discard(file, &candidate, content).await?;
                    tracing::info!("Saved uploaded file: {}", candidate.display());
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => counter += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Best-effort removal of a job's backing file. Failures are logged, never returned.
    pub async fn remove_file(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(()) => {
                tracing::info!("Deleted file: {}", path.display());
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("File already gone: {}", path.display());
                false
            }
            Err(e) => {
                tracing::error!("Error deleting file {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// Writes and flushes `content`. On failure the partial file at `path` is removed so a
/// later upload can take the name.
async fn write_or_discard<W>(mut file: W, path: &Path, content: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = file.write_all(content).await;
    if written.is_ok() {
        written = file.flush().await;
    }
    if let Err(e) = written {
        drop(file);
        tracing::error!("Writing upload {} failed: {}", path.display(), e);
        if let Err(rm) = fs::remove_file(path).await {
            tracing::warn!("Could not remove partial upload {}: {}", path.display(), rm);
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::tempdir;

    /// Accepts nothing: every write fails the way a full disk does.
    struct FullDisk;

    impl AsyncWrite for FullDisk {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(ErrorKind::StorageFull, "no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn clean_name_keeps_last_component() {
        assert_eq!(FileManager::clean_name("../../etc/passwd.svg").unwrap(), "passwd.svg");
        assert_eq!(FileManager::clean_name("C:\\art\\cat.svg").unwrap(), "cat.svg");
        assert!(FileManager::clean_name("dir/").is_err());
        assert!(FileManager::clean_name("..").is_err());
    }

    #[tokio::test]
    async fn duplicate_uploads_get_numbered_names() {
        let dir = tempdir().unwrap();
        let files = FileManager::new(dir.path());
        let first = files.save_upload("cat.svg", b"<svg/>").await.unwrap();
        let second = files.save_upload("cat.svg", b"<svg/>").await.unwrap();
        let third = files.save_upload("cat.svg", b"<svg/>").await.unwrap();
        assert_eq!(first.file_name().unwrap(), "cat.svg");
        assert_eq!(second.file_name().unwrap(), "cat_1.svg");
        assert_eq!(third.file_name().unwrap(), "cat_2.svg");
    }

    #[tokio::test]
    async fn remove_missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let files = FileManager::new(dir.path());
        let path = files.save_upload("dog.svg", b"<svg/>").await.unwrap();
        assert!(files.remove_file(&path).await);
        assert!(!files.remove_file(&path).await);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_partial_upload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cat.svg");
        std::fs::write(&path, "<svg").unwrap();

        let err = write_or_discard(FullDisk, &path, b"<svg/>").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFull);
        assert!(!path.exists());

        // the name is free again for the next upload
        let files = FileManager::new(dir.path());
        let saved = files.save_upload("cat.svg", b"<svg/>").await.unwrap();
        assert_eq!(saved, path);
    }
}
