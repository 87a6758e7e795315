//! Package installation into the shared or a per-component environment.
//!
//! [`PipInstaller`] shells out to `pip` through `tokio::process`. Tests and
//! embedders can swap in their own [`PackageInstaller`].

use super::venv::{venv_dir, venv_pip, venv_python};
use crate::component::IsolationStrategy;
use crate::config::InstallConfig;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One installation job.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Human readable name used in logs and errors, e.g. `plugin 'echo'`.
    pub label: String,
    pub component_dir: PathBuf,
    pub requirements: PathBuf,
    pub isolation: IsolationStrategy,
}

/// Installs the packages listed in a dependency file.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> Result<()>;

    /// Remove the isolated environment of a component, if it has one.
    async fn remove_environment(&self, component_dir: &Path) -> Result<()> {
        let venv = venv_dir(component_dir);
        match tokio::fs::remove_dir_all(&venv).await {
            Ok(()) => {
                info!("Removed environment {}", venv.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::io_with_path(e, venv)),
        }
    }
}

/// Installer backed by `python -m venv` and `pip install -r`.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    python: String,
    install_timeout: Duration,
    venv_timeout: Duration,
}

impl Default for PipInstaller {
    fn default() -> Self {
        Self::new(InstallConfig::DEFAULT_PYTHON)
    }
}

impl PipInstaller {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            install_timeout: InstallConfig::PIP_INSTALL_TIMEOUT,
            venv_timeout: InstallConfig::VENV_CREATION_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, install: Duration, venv: Duration) -> Self {
        self.install_timeout = install;
        self.venv_timeout = venv;
        self
    }

    /// Create the component's `.venv` if needed and return its interpreter.
    ///
    /// An environment without its own pip (for example one created on a
    /// different platform) is destroyed and recreated.
    async fn ensure_venv(&self, request: &InstallRequest) -> Result<PathBuf> {
        let venv = venv_dir(&request.component_dir);

        if venv.exists() && !venv_pip(&venv).exists() {
            warn!(
                "Environment of {} is incompatible with this platform, recreating",
                request.label
            );
            self.remove_environment(&request.component_dir).await?;
        }

        let python = venv_python(&venv);
        if python.exists() {
            return Ok(python);
        }

        info!("Creating virtual environment for {}", request.label);
        let mut cmd = tokio::process::Command::new(&self.python);
        cmd.arg("-m")
            .arg("venv")
            .arg(&venv)
            .current_dir(&request.component_dir);

        let output = run_with_timeout(cmd, self.venv_timeout, &request.label).await?;
        if !output.status.success() {
            return Err(RuntimeError::install(
                &request.label,
                format!(
                    "venv creation failed: {}",
                    summarize_output(&output.stderr, &output.stdout)
                ),
            ));
        }

        Ok(python)
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        let python = match request.isolation {
            IsolationStrategy::Shared => PathBuf::from(&self.python),
            IsolationStrategy::PerComponent => self.ensure_venv(request).await?,
        };

        let packages = std::fs::read_to_string(&request.requirements)
            .map(|content| parse_requirements(&content))
            .unwrap_or_default();
        info!(
            "Installing {} packages for {}",
            packages.len(),
            request.label
        );

        let mut cmd = tokio::process::Command::new(&python);
        cmd.args(["-m", "pip", "install", "-r"])
            .arg(&request.requirements)
            .args(InstallConfig::PIP_FLAGS)
            .current_dir(&request.component_dir);

        let output = run_with_timeout(cmd, self.install_timeout, &request.label).await?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!("pip: {}", line);
        }

        if !output.status.success() {
            return Err(RuntimeError::install(
                &request.label,
                format!(
                    "pip install failed with status {}: {}",
                    output.status,
                    summarize_output(&output.stderr, &output.stdout)
                ),
            ));
        }

        info!("Dependencies installed successfully for {}", request.label);
        Ok(())
    }
}

/// Run a command to completion, killing it when the timeout elapses.
async fn run_with_timeout(
    mut cmd: tokio::process::Command,
    timeout: Duration,
    label: &str,
) -> Result<std::process::Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| RuntimeError::install(label, format!("failed to start installer: {}", e)))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(RuntimeError::install(
            label,
            format!("failed to wait for installer: {}", e),
        )),
        Err(_) => {
            warn!("Installer for {} timed out after {:?}", label, timeout);
            Err(RuntimeError::Timeout(timeout))
        }
    }
}

fn error_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*ERROR:.*$").ok())
        .as_ref()
}

/// Short description of a failed installer run: the `ERROR:` lines if pip
/// printed any, otherwise the tail of stderr.
pub fn summarize_output(stderr: &[u8], stdout: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stdout = String::from_utf8_lossy(stdout);

    let errors: Vec<&str> = match error_line_regex() {
        Some(re) => re
            .find_iter(&stderr)
            .chain(re.find_iter(&stdout))
            .map(|m| m.as_str().trim())
            .collect(),
        None => Vec::new(),
    };

    let summary = if errors.is_empty() {
        stderr.trim().to_string()
    } else {
        errors.join("; ")
    };

    truncate_tail(&summary, InstallConfig::ERROR_OUTPUT_LIMIT)
}

fn truncate_tail(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - limit).collect();
    format!("...{}", tail)
}

/// Package names listed in a dependency file.
///
/// Comments, blank lines and pip options (`-r`, `--index-url`, ...) are
/// skipped; version specifiers, extras and markers are stripped.
pub fn parse_requirements(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .filter_map(|line| {
            line.split(['=', '>', '<', '!', '~', '[', ';', ' '])
                .next()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements() {
        let content = r#"
# vision stack
numpy
opencv-python-headless>=4.8
pillow[webp]
protobuf==3.20.3
faster-whisper ; python_version >= "3.9"
--extra-index-url https://example.invalid/simple
"#;
        assert_eq!(
            parse_requirements(content),
            vec![
                "numpy",
                "opencv-python-headless",
                "pillow",
                "protobuf",
                "faster-whisper"
            ]
        );
    }

    #[test]
    fn test_summarize_prefers_error_lines() {
        let stderr = b"Collecting nope\nERROR: Could not find a version that satisfies the requirement nope\nERROR: No matching distribution found for nope\n";
        let summary = summarize_output(stderr, b"");
        assert!(summary.starts_with("ERROR: Could not find"));
        assert!(summary.contains("; ERROR: No matching distribution"));
    }

    #[test]
    fn test_summarize_truncates() {
        let stderr = "x".repeat(1000);
        let summary = summarize_output(stderr.as_bytes(), b"");
        assert_eq!(summary.len(), InstallConfig::ERROR_OUTPUT_LIMIT + 3);
        assert!(summary.starts_with("..."));
    }

    #[tokio::test]
    async fn test_default_remove_environment() {
        struct Noop;
        #[async_trait]
        impl PackageInstaller for Noop {
            async fn install(&self, _request: &InstallRequest) -> Result<()> {
                Ok(())
            }
        }

        let temp_dir = tempfile::TempDir::new().unwrap();
        let venv = temp_dir.path().join(".venv").join("bin");
        std::fs::create_dir_all(&venv).unwrap();

        Noop.remove_environment(temp_dir.path()).await.unwrap();
        assert!(!temp_dir.path().join(".venv").exists());
        // Missing environment is fine
        Noop.remove_environment(temp_dir.path()).await.unwrap();
    }

    /// System interpreter stand-in: `-m venv <dir>` lays out a minimal
    /// environment and logs the call, anything else succeeds.
    #[cfg(unix)]
    fn fake_python(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("venv-calls.log");
        let script = dir.join("fake-python");
        let body = format!(
            r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  printf '#!/bin/sh\nexit 0\n' > "$3/bin/python"
  cp "$3/bin/python" "$3/bin/pip"
  chmod 755 "$3/bin/python" "$3/bin/pip"
  echo venv >> '{}'
fi
exit 0
"#,
            log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_incompatible_environment_is_recreated() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let component_dir = temp_dir.path().join("echo");
        let venv = venv_dir(&component_dir);
        std::fs::create_dir_all(venv.join("bin")).unwrap();
        std::fs::create_dir_all(venv.join("Scripts")).unwrap();
        std::fs::write(venv.join("bin").join("python"), "stale").unwrap();
        std::fs::write(component_dir.join("requirements.txt"), "requests\n").unwrap();

        let installer =
            PipInstaller::new(fake_python(temp_dir.path()).to_string_lossy().into_owned());
        let request = InstallRequest {
            label: "tool 'echo'".to_string(),
            component_dir: component_dir.clone(),
            requirements: component_dir.join("requirements.txt"),
            isolation: IsolationStrategy::PerComponent,
        };
        installer.install(&request).await.unwrap();

        assert!(!venv.join("Scripts").exists());
        assert!(venv_pip(&venv).exists());
        assert_ne!(std::fs::read_to_string(venv_python(&venv)).unwrap(), "stale");

        // A compatible environment is reused as is.
        installer.install(&request).await.unwrap();
        let calls = std::fs::read_to_string(temp_dir.path().join("venv-calls.log")).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }
}
