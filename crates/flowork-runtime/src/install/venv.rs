//! Paths inside a per-component virtual environment.
//!
//! # Platform Behavior
//! - **Linux/macOS**: executables in `{venv}/bin`, packages in
//!   `{venv}/lib/python3.X/site-packages`
//! - **Windows**: executables in `{venv}/Scripts`, packages in
//!   `{venv}/Lib/site-packages`

use crate::config::PathsConfig;
use std::path::{Path, PathBuf};

/// The `.venv` directory of a component.
pub fn venv_dir(component_dir: &Path) -> PathBuf {
    component_dir.join(PathsConfig::VENV_DIR_NAME)
}

/// Python executable inside a virtual environment.
pub fn venv_python(venv: &Path) -> PathBuf {
    #[cfg(unix)]
    {
        venv.join("bin").join("python")
    }
    #[cfg(windows)]
    {
        venv.join("Scripts").join("python.exe")
    }
}

/// pip executable inside a virtual environment.
///
/// A venv copied from another platform has no pip at this location, which is
/// how incompatible environments are detected.
pub fn venv_pip(venv: &Path) -> PathBuf {
    #[cfg(unix)]
    {
        venv.join("bin").join("pip")
    }
    #[cfg(windows)]
    {
        venv.join("Scripts").join("pip.exe")
    }
}

/// site-packages directory of a virtual environment, if it exists.
pub fn site_packages(venv: &Path) -> Option<PathBuf> {
    #[cfg(windows)]
    {
        let path = venv.join("Lib").join("site-packages");
        path.is_dir().then_some(path)
    }
    #[cfg(unix)]
    {
        let lib = venv.join("lib");
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&lib)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("python"))
            .map(|e| e.path().join("site-packages"))
            .filter(|p| p.is_dir())
            .collect();
        candidates.sort();
        candidates.pop()
    }
}
