//! Persisted install state of a component directory.
//!
//! Two sidecar files record it: the install marker (`.installed`, present
//! once an install succeeded) and the fingerprint (`.requirements_hash`, the
//! SHA-256 of the dependency file that was installed).

use crate::config::PathsConfig;
use crate::error::{Result, RuntimeError};
use crate::persist::atomic_write_text;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Chunk size used when hashing dependency files.
const CHUNK_SIZE: usize = 4096;

/// Compute the SHA-256 fingerprint of a file as lowercase hex.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| RuntimeError::io_with_path(e, path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| RuntimeError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// View over the install sidecar files of one component directory.
#[derive(Debug, Clone)]
pub struct InstallState {
    dir: PathBuf,
}

impl InstallState {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(PathsConfig::INSTALL_MARKER_FILENAME)
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.dir.join(PathsConfig::FINGERPRINT_FILENAME)
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.dir.join(PathsConfig::REQUIREMENTS_FILENAME)
    }

    pub fn has_marker(&self) -> bool {
        self.marker_path().is_file()
    }

    pub fn has_requirements(&self) -> bool {
        self.requirements_path().is_file()
    }

    /// Fingerprint written by the last successful install, if any.
    pub fn stored_fingerprint(&self) -> Option<String> {
        std::fs::read_to_string(self.fingerprint_path())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Fingerprint of the dependency file as it is on disk now.
    pub fn current_fingerprint(&self) -> Result<Option<String>> {
        let requirements = self.requirements_path();
        if !requirements.is_file() {
            return Ok(None);
        }
        fingerprint_file(&requirements).map(Some)
    }

    /// Converged iff the marker exists and the dependency file, if any, is
    /// the one that was installed.
    pub fn is_converged(&self) -> bool {
        if !self.has_marker() {
            return false;
        }
        match self.current_fingerprint() {
            Ok(None) => true,
            Ok(Some(current)) => self.stored_fingerprint().as_deref() == Some(current.as_str()),
            Err(_) => false,
        }
    }

    /// Record a successful install.
    ///
    /// `fingerprint` is `None` for components without a dependency file; any
    /// stale fingerprint is removed in that case.
    pub fn record_success(&self, fingerprint: Option<&str>, note: &str) -> Result<()> {
        let stamp = chrono::Utc::now().to_rfc3339();
        atomic_write_text(&self.marker_path(), &format!("{} on {}", note, stamp))?;
        match fingerprint {
            Some(fingerprint) => atomic_write_text(&self.fingerprint_path(), fingerprint)?,
            None => remove_if_exists(&self.fingerprint_path())?,
        }
        Ok(())
    }

    /// Forget the install: remove the marker and the fingerprint.
    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.marker_path())?;
        remove_if_exists(&self.fingerprint_path())
    }

    /// Write a dependency file from a list of package specs.
    pub fn restore_requirements(&self, packages: &[String]) -> Result<()> {
        let mut content = packages.join("\n");
        content.push('\n');
        atomic_write_text(&self.requirements_path(), &content)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RuntimeError::io_with_path(e, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("requirements.txt");
        std::fs::write(&path, "").unwrap();
        assert_eq!(
            fingerprint_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_converged_without_requirements() {
        let temp_dir = TempDir::new().unwrap();
        let state = InstallState::new(temp_dir.path());
        assert!(!state.is_converged());

        state.record_success(None, "Installed (No Dependencies)").unwrap();
        assert!(state.is_converged());
        assert!(state.stored_fingerprint().is_none());
    }

    #[test]
    fn test_single_character_edit_breaks_convergence() {
        let temp_dir = TempDir::new().unwrap();
        let state = InstallState::new(temp_dir.path());
        std::fs::write(state.requirements_path(), "requests==2.31.0\n").unwrap();

        let fingerprint = state.current_fingerprint().unwrap().unwrap();
        state.record_success(Some(&fingerprint), "Installed").unwrap();
        assert!(state.is_converged());

        std::fs::write(state.requirements_path(), "requests==2.31.1\n").unwrap();
        assert!(!state.is_converged());
    }

    #[test]
    fn test_clear_removes_sidecars() {
        let temp_dir = TempDir::new().unwrap();
        let state = InstallState::new(temp_dir.path());
        state.record_success(Some("abc"), "Installed").unwrap();
        assert!(state.has_marker());

        state.clear().unwrap();
        assert!(!state.has_marker());
        assert!(state.stored_fingerprint().is_none());
        // Clearing twice is fine
        state.clear().unwrap();
    }

    #[test]
    fn test_restore_requirements() {
        let temp_dir = TempDir::new().unwrap();
        let state = InstallState::new(temp_dir.path());
        state
            .restore_requirements(&["numpy".to_string(), "protobuf==3.20.3".to_string()])
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(state.requirements_path()).unwrap(),
            "numpy\nprotobuf==3.20.3\n"
        );
    }
}
