//! Flowork CLI - command-line front end for the component runtime.
//!
//! Discovers components, reconciles their dependencies, toggles pause state
//! and runs single components outside of a workflow.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use flowork_runtime::config::default_root;
use flowork_runtime::{
    ComponentKind, ComponentRecord, ComponentRuntime, ExecutionMode, ExecutionRequest,
};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "flowork")]
#[command(about = "Manage and run Flowork components")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Runtime root directory (defaults to ~/.flowork)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover components of one kind, or of every kind
    Scan {
        #[arg(value_parser = parse_kind)]
        kind: Option<ComponentKind>,
    },
    /// List discovered components
    List {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Converge dependencies of every component
    Reconcile {
        /// Run a single pass instead of polling until Ctrl-C
        #[arg(long)]
        once: bool,
    },
    /// Install a component's dependencies now
    Install {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        id: String,
    },
    /// Remove a component's installed dependencies
    UninstallDeps {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        id: String,
    },
    /// Delete a component from disk
    Uninstall {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        id: String,
    },
    /// Pause a component
    Pause {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        id: String,
    },
    /// Resume a paused component
    Resume {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        id: String,
    },
    /// Execute a component once through its behavior chain
    Run {
        #[arg(value_parser = parse_kind)]
        kind: ComponentKind,
        id: String,
        /// Input payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Node configuration as JSON
        #[arg(long, default_value = "{}")]
        config: String,
        /// Workflow context id (random when omitted)
        #[arg(long)]
        context: Option<String>,
        /// Dry run
        #[arg(long)]
        simulate: bool,
    },
}

fn parse_kind(s: &str) -> std::result::Result<ComponentKind, String> {
    ComponentKind::from_str(s)
        .ok_or_else(|| format!("unknown component kind '{}' (module, plugin, tool, trigger)", s))
}

fn print_records(records: &[ComponentRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    for record in records {
        let mut flags = Vec::new();
        if record.is_paused {
            flags.push("paused");
        }
        if !record.is_installed {
            flags.push("not installed");
        }
        println!(
            "{:<32} {:<10} {}",
            record.id(),
            record.descriptor.version.as_deref().unwrap_or("-"),
            flags.join(", ")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let root = match args.root {
        Some(path) => path,
        None => default_root().ok_or_else(|| anyhow!("cannot determine home directory"))?,
    };
    info!("Runtime root: {}", root.display());

    let runtime = ComponentRuntime::builder(&root)
        .auto_create_dirs(true)
        .build()
        .with_context(|| format!("failed to initialize runtime at {}", root.display()))?;

    match args.command {
        Command::Scan { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => ComponentKind::ALL.to_vec(),
            };
            for kind in kinds {
                let delta = runtime.reload(kind).await;
                println!(
                    "{}: {} components (+{} -{} ~{})",
                    kind.plural(),
                    delta.count,
                    delta.added.len(),
                    delta.removed.len(),
                    delta.changed.len()
                );
            }
        }
        Command::List { kind, json } => print_records(&runtime.list(kind), json)?,
        Command::Reconcile { once: true } => {
            let report = runtime.reconcile_once().await;
            println!(
                "checked {}, installed {}, failed {}",
                report.checked, report.installed, report.failed
            );
        }
        Command::Reconcile { once: false } => {
            runtime.start_background()?;
            info!("Reconciling until Ctrl-C");
            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
        }
        Command::Install { kind, id } => {
            runtime.install_component(kind, &id, None).await?;
            println!("{} '{}' installed", kind, id);
        }
        Command::UninstallDeps { kind, id } => {
            runtime.uninstall_dependencies(kind, &id).await?;
            println!("Removed dependencies of {} '{}'", kind, id);
        }
        Command::Uninstall { kind, id } => {
            runtime.uninstall_component(kind, &id).await?;
            println!("{} '{}' deleted", kind, id);
        }
        Command::Pause { kind, id } => runtime.pause(kind, &id).await?,
        Command::Resume { kind, id } => runtime.resume(kind, &id).await?,
        Command::Run {
            kind,
            id,
            payload,
            config,
            context,
            simulate,
        } => {
            let payload = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let config = serde_json::from_str(&config).context("--config is not valid JSON")?;
            let mode = if simulate {
                ExecutionMode::Simulate
            } else {
                ExecutionMode::Execute
            };
            let request = ExecutionRequest::new(payload)
                .with_config(config)
                .with_mode(mode)
                .with_context(context.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));

            match runtime.execute(kind, &id, request).await {
                Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
                Err(failure) => {
                    warn!("{} '{}' failed", kind, id);
                    runtime.shutdown().await;
                    return Err(failure.into());
                }
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let args = Args::try_parse_from([
            "flowork", "--debug", "run", "plugins", "echo", "--payload", "{\"a\":1}", "--simulate",
        ])
        .unwrap();
        assert!(args.debug);
        match args.command {
            Command::Run {
                kind, id, simulate, ..
            } => {
                assert_eq!(kind, ComponentKind::Plugin);
                assert_eq!(id, "echo");
                assert!(simulate);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Args::try_parse_from(["flowork", "list", "widgets"]).is_err());
    }

    #[test]
    fn test_global_root_after_subcommand() {
        let args = Args::try_parse_from(["flowork", "scan", "--root", "/tmp/flowork"]).unwrap();
        assert_eq!(args.root, Some(PathBuf::from("/tmp/flowork")));
        assert!(matches!(args.command, Command::Scan { kind: None }));
    }
}
