//! File-backed auth token storage
//!
//! The token lives alone in a file under the data directory, readable only by
//! the current user on unix.

use crate::{ProviderError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token; a missing or blank file means no token
    pub fn get(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let token = content.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::TokenStorage(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Replace the stored token atomically
    pub fn set(&self, token: &str) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.write_all(token.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|e| ProviderError::TokenStorage(e.error.to_string()))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_no_token() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(tmp.path().join("authtoken"));
        assert_eq!(store.get().unwrap(), None);
    }

    #[test]
    fn test_set_get_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(tmp.path().join("sub").join("authtoken"));
        store.set("2abc_token").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some("2abc_token"));

        store.set("other").unwrap();
        assert_eq!(store.get().unwrap().as_deref(), Some("other"));

        store.clear().unwrap();
        assert_eq!(store.get().unwrap(), None);
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(tmp.path().join("authtoken"));
        store.set("secret").unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_blank_file_is_no_token() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("authtoken");
        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(FileTokenStore::new(path).get().unwrap(), None);
    }
}
