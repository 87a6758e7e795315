//! Dependency installation: persisted install state, the package installer
//! and the reconciler that keeps every component converged.

mod fallback;
mod installer;
mod reconciler;
mod state;
pub mod venv;

pub use fallback::FallbackRequirements;
pub use installer::{parse_requirements, summarize_output, InstallRequest, PackageInstaller, PipInstaller};
pub use reconciler::{
    plan_install, DependencyReconciler, InstallCallback, InstallOutcome, InstallPlan,
    InstallReport, PollReport,
};
pub use state::{fingerprint_file, InstallState};
