//! Dependency reconciler.
//!
//! Keeps every component directory's installed packages converged with its
//! `requirements.txt`. A background task polls all kind roots; the instance
//! manager and manual installs call into the same code path. One process-wide
//! lock serializes every installation, whatever the kind.

use super::fallback::FallbackRequirements;
use super::installer::{InstallRequest, PackageInstaller};
use super::state::InstallState;
use crate::cancel::CancellationToken;
use crate::component::{ComponentDescriptor, ComponentKind, IsolationStrategy, KindPolicy};
use crate::config::PathsConfig;
use crate::discovery::{component_dirs, ComponentRegistry};
use crate::error::{Result, RuntimeError};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a component directory needs to become converged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    /// Marker present and dependency file unchanged.
    Converged,
    /// Nothing to install; only the marker has to be written.
    ZeroDependencies,
    /// Run the installer. `restore` holds the packages to write back to a
    /// lost dependency file first.
    Install { restore: Option<Vec<String>> },
}

impl InstallPlan {
    pub fn needs_install(&self) -> bool {
        matches!(self, InstallPlan::Install { .. })
    }
}

/// Decide what a directory needs.
///
/// `force` turns a converged directory into a fresh install (or a fresh
/// zero-dependency marker) without changing any other decision.
pub fn plan_install(
    state: &InstallState,
    fallback: Option<&[String]>,
    force: bool,
) -> InstallPlan {
    if state.has_requirements() {
        if !force && state.is_converged() {
            return InstallPlan::Converged;
        }
        return InstallPlan::Install { restore: None };
    }

    match fallback {
        Some(packages) if !packages.is_empty() => InstallPlan::Install {
            restore: Some(packages.to_vec()),
        },
        _ if !force && state.has_marker() => InstallPlan::Converged,
        _ => InstallPlan::ZeroDependencies,
    }
}

/// Result of reconciling one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyConverged,
    MarkedZeroDependencies,
    Installed,
}

/// Report handed to a manual install callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub kind: ComponentKind,
    pub id: String,
    pub success: bool,
    pub message: String,
}

/// Callback invoked once a manual installation finishes.
pub type InstallCallback = Box<dyn FnOnce(InstallReport) + Send>;

/// Summary of one background poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub checked: usize,
    pub installed: usize,
    pub failed: usize,
}

/// Keeps component dependencies converged.
pub struct DependencyReconciler {
    policies: BTreeMap<ComponentKind, KindPolicy>,
    registries: BTreeMap<ComponentKind, Arc<ComponentRegistry>>,
    installer: Arc<dyn PackageInstaller>,
    fallback: FallbackRequirements,
    globally_disabled: HashSet<String>,
    install_lock: Mutex<()>,
    reload_tx: Option<mpsc::UnboundedSender<ComponentKind>>,
}

impl DependencyReconciler {
    pub fn new(
        policies: Vec<KindPolicy>,
        registries: BTreeMap<ComponentKind, Arc<ComponentRegistry>>,
        installer: Arc<dyn PackageInstaller>,
        fallback: FallbackRequirements,
    ) -> Self {
        Self {
            policies: policies.into_iter().map(|p| (p.kind, p)).collect(),
            registries,
            installer,
            fallback,
            globally_disabled: HashSet::new(),
            install_lock: Mutex::new(()),
            reload_tx: None,
        }
    }

    /// Skip these component ids / directory names entirely.
    pub fn with_globally_disabled(mut self, disabled: HashSet<String>) -> Self {
        self.globally_disabled = disabled;
        self
    }

    /// Send the kind on this channel after every successful installation.
    pub fn with_reload_channel(mut self, tx: mpsc::UnboundedSender<ComponentKind>) -> Self {
        self.reload_tx = Some(tx);
        self
    }

    fn isolation_of(&self, kind: ComponentKind) -> IsolationStrategy {
        self.policies
            .get(&kind)
            .map(|p| p.isolation)
            .unwrap_or_else(|| kind.isolation())
    }

    fn fallback_for(&self, kind: ComponentKind, dir: &Path, id: Option<&str>) -> Option<&[String]> {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut names = vec![dir_name.as_str()];
        if let Some(id) = id {
            names.push(id);
        }
        self.fallback.lookup(kind, &names)
    }

    /// Bring one component directory to convergence.
    ///
    /// The check runs without the lock; an install re-checks under it so
    /// concurrent callers do not install twice.
    pub async fn reconcile_dir(
        &self,
        kind: ComponentKind,
        dir: &Path,
        force: bool,
    ) -> Result<InstallOutcome> {
        let state = InstallState::new(dir);
        let registry_id = self
            .registries
            .get(&kind)
            .and_then(|registry| registry.id_for_dir(dir));
        let label = format!(
            "{} '{}'",
            kind,
            registry_id
                .clone()
                .unwrap_or_else(|| dir_label(dir))
        );
        let fallback = self.fallback_for(kind, dir, registry_id.as_deref());

        let plan = plan_install(&state, fallback, force);
        match plan {
            InstallPlan::Converged => {
                self.mark_installed(kind, registry_id.as_deref(), &state);
                return Ok(InstallOutcome::AlreadyConverged);
            }
            InstallPlan::ZeroDependencies => {
                state.record_success(None, "Installed (No Dependencies)")?;
                debug!("{} has no dependencies", label);
                self.mark_installed(kind, registry_id.as_deref(), &state);
                return Ok(InstallOutcome::MarkedZeroDependencies);
            }
            InstallPlan::Install { .. } => {}
        }

        let _guard = self.install_lock.lock().await;

        // Another caller may have finished the job while we waited.
        let plan = plan_install(&state, fallback, force);
        let restore = match plan {
            InstallPlan::Converged => {
                self.mark_installed(kind, registry_id.as_deref(), &state);
                return Ok(InstallOutcome::AlreadyConverged);
            }
            InstallPlan::ZeroDependencies => {
                state.record_success(None, "Installed (No Dependencies)")?;
                self.mark_installed(kind, registry_id.as_deref(), &state);
                return Ok(InstallOutcome::MarkedZeroDependencies);
            }
            InstallPlan::Install { restore } => restore,
        };

        if let Some(packages) = restore {
            warn!(
                "{} lost its {}, restoring {} known packages",
                label,
                PathsConfig::REQUIREMENTS_FILENAME,
                packages.len()
            );
            state.restore_requirements(&packages)?;
        }

        let fingerprint = state
            .current_fingerprint()?
            .ok_or_else(|| RuntimeError::install(&label, "dependency file disappeared"))?;

        info!("Installing dependencies for {}", label);
        let request = InstallRequest {
            label: label.clone(),
            component_dir: dir.to_path_buf(),
            requirements: state.requirements_path(),
            isolation: self.isolation_of(kind),
        };
        if let Err(e) = self.installer.install(&request).await {
            if let (Some(registry), Some(id)) = (self.registries.get(&kind), registry_id.as_deref()) {
                registry.set_installed(id, false, state.stored_fingerprint());
            }
            return Err(e);
        }

        state.record_success(Some(&fingerprint), "Installed")?;
        self.mark_installed(kind, registry_id.as_deref(), &state);
        self.request_reload(kind);
        info!("Dependencies of {} are converged", label);
        Ok(InstallOutcome::Installed)
    }

    /// Denylist check by directory name and by manifest id, as in discovery.
    fn is_disabled(&self, kind: ComponentKind, dir: &Path) -> bool {
        if self.globally_disabled.is_empty() {
            return false;
        }
        self.globally_disabled.contains(&dir_label(dir))
            || ComponentDescriptor::load(kind, dir)
                .is_ok_and(|descriptor| self.globally_disabled.contains(&descriptor.id))
    }

    fn mark_installed(&self, kind: ComponentKind, id: Option<&str>, state: &InstallState) {
        if let (Some(registry), Some(id)) = (self.registries.get(&kind), id) {
            registry.set_installed(id, true, state.stored_fingerprint());
        }
    }

    fn request_reload(&self, kind: ComponentKind) {
        if let Some(tx) = &self.reload_tx {
            // Fire and forget; a closed channel just means nobody reloads.
            let _ = tx.send(kind);
        }
    }

    fn component_dir(&self, kind: ComponentKind, id: &str) -> Result<(String, PathBuf)> {
        let registry = self
            .registries
            .get(&kind)
            .ok_or_else(|| RuntimeError::ComponentNotFound {
                kind,
                id: id.to_string(),
            })?;
        let descriptor = registry
            .descriptor(id)
            .ok_or_else(|| RuntimeError::ComponentNotFound {
                kind,
                id: id.to_string(),
            })?;
        Ok((descriptor.id, descriptor.path))
    }

    /// Make sure a registered component is converged before it is loaded.
    pub async fn ensure_converged(&self, kind: ComponentKind, id: &str) -> Result<()> {
        let (_, dir) = self.component_dir(kind, id)?;
        self.reconcile_dir(kind, &dir, false).await.map(|_| ())
    }

    /// User-requested installation: always runs the install plan.
    pub async fn install_component(
        &self,
        kind: ComponentKind,
        id: &str,
        callback: Option<InstallCallback>,
    ) -> Result<()> {
        let outcome = match self.component_dir(kind, id) {
            Ok((_, dir)) => self.reconcile_dir(kind, &dir, true).await,
            Err(e) => Err(e),
        };
        // A completed install has already asked for its own reload.
        let reloaded = matches!(outcome, Ok(InstallOutcome::Installed));
        let result = outcome.map(|_| ());

        let report = InstallReport {
            kind,
            id: id.to_string(),
            success: result.is_ok(),
            message: match &result {
                Ok(()) => format!("{} '{}' installed", kind, id),
                Err(e) => e.to_string(),
            },
        };
        match &result {
            Ok(()) => info!("{}", report.message),
            Err(e) => error!("Manual installation of {} '{}' failed: {}", kind, id, e),
        }
        if let Some(callback) = callback {
            callback(report);
        }
        if !reloaded {
            self.request_reload(kind);
        }
        result
    }

    /// Remove the install marker, the fingerprint and the isolated
    /// environment of a component.
    pub async fn uninstall_dependencies(&self, kind: ComponentKind, id: &str) -> Result<()> {
        let (canonical, dir) = self.component_dir(kind, id)?;
        let _guard = self.install_lock.lock().await;

        InstallState::new(&dir).clear()?;
        self.installer.remove_environment(&dir).await?;
        if let Some(registry) = self.registries.get(&kind) {
            registry.set_installed(&canonical, false, None);
        }
        info!("Removed dependencies of {} '{}'", kind, canonical);
        Ok(())
    }

    /// Check every component directory of every kind once.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        for (kind, policy) in &self.policies {
            for dir in component_dirs(&policy.roots) {
                if !dir.join(PathsConfig::MANIFEST_FILENAME).is_file() {
                    continue;
                }
                if self.is_disabled(*kind, &dir) {
                    debug!("Skipping globally disabled {}", dir.display());
                    continue;
                }

                report.checked += 1;
                match self.reconcile_dir(*kind, &dir, false).await {
                    Ok(InstallOutcome::Installed) => report.installed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        error!("Failed to reconcile {}: {}", dir.display(), e);
                    }
                }
            }
        }

        debug!(
            checked = report.checked,
            installed = report.installed,
            failed = report.failed,
            "Reconciler poll finished"
        );
        report
    }

    /// Run the poll loop until `shutdown` is cancelled.
    pub fn spawn(
        self: Arc<Self>,
        initial_delay: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Dependency reconciler started");
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dependency reconciler stopped before first poll");
                    return;
                }
                _ = tokio::time::sleep(initial_delay) => {}
            }

            loop {
                self.poll_once().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Dependency reconciler stopped");
        })
    }
}

fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}
