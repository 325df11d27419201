//! Filesystem path helpers (XDG-aware) for staging, blobs, and the record store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid content identifier `{cid}`; expected at least two hexadecimal characters")]
    InvalidContentId { cid: String },
    #[error("invalid folder name `{folder}`")]
    InvalidFolder { folder: String },
}

/// Container providing filesystem paths for the application, rooted at
/// `storage.path` (`$XDG_DATA_HOME/phototag` unless configured).
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Directory holding per-item staged uploads (`.../staging`).
    pub fn staging_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["staging"])
    }

    /// LMDB environment directory for image records (`.../lmdb/records`).
    pub fn records_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "records"])
    }

    /// Base directory for blob storage (`.../blobs`).
    pub fn blobs_base_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs"])
    }

    /// Directory for blobs stored under a folder (`.../blobs/{folder}`).
    pub fn blobs_folder_dir(&self, folder: &str) -> Result<PathBuf, PathError> {
        let folder = normalize_folder(folder)?;
        self.ensure_child(&["blobs", folder.as_str()])
    }

    /// Full path for a blob identified by a content identifier (CID).
    pub fn blob_path(&self, folder: &str, cid: &str) -> Result<PathBuf, PathError> {
        if cid.len() < 2 {
            return Err(PathError::InvalidContentId {
                cid: cid.to_owned(),
            });
        }

        let mut path = self.blobs_folder_dir(folder)?;
        let prefix = &cid[..2];
        path.push(prefix);
        ensure_dir(&path)?;
        path.push(cid);
        Ok(path)
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

/// Normalize a folder hint into a single safe path segment.
pub fn normalize_folder(folder: &str) -> Result<String, PathError> {
    let slug = folder.trim().to_ascii_lowercase();
    let valid = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if !valid {
        return Err(PathError::InvalidFolder {
            folder: folder.to_owned(),
        });
    }
    Ok(slug)
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blob_path_is_sharded_by_cid_prefix() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");

        let path = paths.blob_path("User_Images", "abcdef").expect("blob path");
        assert!(path.ends_with("blobs/user_images/ab/abcdef"));
        assert!(path.parent().expect("parent").is_dir());
    }

    #[test]
    fn folder_rejects_path_separators() {
        assert!(normalize_folder("../etc").is_err());
        assert!(normalize_folder("a/b").is_err());
        assert!(normalize_folder("  ").is_err());
        assert_eq!(normalize_folder(" Avatars ").expect("valid"), "avatars");
    }

    #[test]
    fn short_cid_is_rejected() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");
        assert!(matches!(
            paths.blob_path("user_images", "a"),
            Err(PathError::InvalidContentId { .. })
        ));
    }
}
