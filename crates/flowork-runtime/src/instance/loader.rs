//! Entry point resolution and the per-component loader context.
//!
//! Nothing here touches a process-wide search path. Every component gets an
//! explicit [`LoaderContext`] (namespace plus search paths), and an entry
//! point resolves either to an in-process factory or, when the component
//! ships `<module>.py`, to a [`PythonComponent`] that runs the code in a
//! child interpreter with exactly that context.

use super::component::{Component, ExecutionOutcome, ExecutionRequest, Payload};
use super::services::{ComponentLogger, LogLevel, ServiceMap, TracingLogger, LOGGER_ALIAS};
use crate::component::{ComponentDescriptor, ComponentKind, EntryPoint, IsolationStrategy};
use crate::config::{BridgeConfig, PathsConfig};
use crate::error::{ExecutionFailure, Result, RuntimeError};
use crate::install::venv::{site_packages, venv_dir, venv_python};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

/// Loader scope of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderContext {
    pub kind: ComponentKind,
    pub id: String,
    /// e.g. `plugins.my_plugin`; keeps same-named modules of different
    /// components apart.
    pub namespace: String,
    pub component_dir: PathBuf,
    /// Package directories visible to the component, in lookup order.
    pub search_paths: Vec<PathBuf>,
    pub entry_point: EntryPoint,
    /// Interpreter that runs Python entry points.
    pub interpreter: PathBuf,
}

impl LoaderContext {
    /// Build the context from a descriptor and its isolation strategy.
    ///
    /// Per-component kinds see their `.venv` site-packages and interpreter;
    /// all kinds see the bundled `vendor/` directory when it exists.
    pub fn for_descriptor(
        descriptor: &ComponentDescriptor,
        isolation: IsolationStrategy,
        shared_python: &str,
    ) -> Self {
        let mut search_paths = Vec::new();
        let mut interpreter = PathBuf::from(shared_python);

        if isolation == IsolationStrategy::PerComponent {
            let venv = venv_dir(&descriptor.path);
            if let Some(packages) = site_packages(&venv) {
                search_paths.push(packages);
            }
            let python = venv_python(&venv);
            if python.exists() {
                interpreter = python;
            }
        }

        let vendor = descriptor.path.join(PathsConfig::VENDOR_DIR_NAME);
        if vendor.is_dir() {
            search_paths.push(vendor);
        }

        Self {
            kind: descriptor.kind,
            id: descriptor.id.clone(),
            namespace: descriptor.namespace(),
            component_dir: descriptor.path.clone(),
            search_paths,
            entry_point: descriptor.entry_point.clone(),
            interpreter,
        }
    }

    /// Registry keys tried for this context, most specific first.
    pub fn factory_keys(&self) -> [String; 2] {
        [
            format!("{}:{}", self.namespace, self.entry_point),
            self.entry_point.to_string(),
        ]
    }

    /// The entry file if the entry point is Python source.
    pub fn python_source(&self) -> Option<PathBuf> {
        let path = self.component_dir.join(self.entry_point.source_file());
        path.is_file().then_some(path)
    }
}

/// Everything a factory gets to build an instance from.
#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub descriptor: ComponentDescriptor,
    pub loader: LoaderContext,
    pub services: ServiceMap,
}

/// Builds an instance for an entry point.
pub type ComponentFactory = Arc<dyn Fn(ComponentContext) -> Result<Arc<dyn Component>> + Send + Sync>;

/// Resolves entry points to constructors.
///
/// In-process factories are registered either for a bare entry point
/// (`"main.Echo"`) or for one component (`"plugins.echo:main.Echo"`); the
/// latter wins.
pub struct EntryPointRegistry {
    factories: RwLock<HashMap<String, ComponentFactory>>,
    python_bridge: bool,
}

impl Default for EntryPointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            python_bridge: true,
        }
    }

    /// Enable or disable the Python subprocess fallback.
    ///
    /// Default: `true`
    pub fn with_python_bridge(mut self, enable: bool) -> Self {
        self.python_bridge = enable;
        self
    }

    pub fn register<F>(&self, key: impl Into<String>, factory: F)
    where
        F: Fn(ComponentContext) -> Result<Arc<dyn Component>> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!("Registered component factory for {}", key);
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(factory));
    }

    fn factory_for(&self, loader: &LoaderContext) -> Option<ComponentFactory> {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        loader
            .factory_keys()
            .iter()
            .find_map(|key| factories.get(key).cloned())
    }

    /// Construct an instance (without running `on_load`).
    pub fn instantiate(&self, context: ComponentContext) -> Result<Arc<dyn Component>> {
        if let Some(factory) = self.factory_for(&context.loader) {
            return factory(context);
        }

        if self.python_bridge {
            if let Some(source) = context.loader.python_source() {
                debug!(
                    namespace = %context.loader.namespace,
                    "Loading {} through the Python bridge",
                    source.display()
                );
                let component = PythonComponent::new(context.loader, &context.services);
                return Ok(Arc::new(component));
            }
        }

        Err(RuntimeError::EntryPointNotFound {
            id: context.descriptor.id.clone(),
            entry_point: context.descriptor.entry_point.to_string(),
        })
    }
}

/// Bootstrap run by the child interpreter.
///
/// The first stdin line describes the instance; the child builds it with its
/// collaborators, runs `on_load` and answers. Every further line is one
/// `execute` or `unload` request answered by exactly one stdout line. The
/// component's own prints go to stderr.
const PYTHON_BOOTSTRAP: &str = r#"
import importlib, json, sys

LOG_PREFIX = sys.argv[4]

class _Logger:
    def __init__(self, stream):
        self._stream = stream

    def __call__(self, message, level="INFO", *args, **kwargs):
        record = {"message": str(message), "level": str(level)}
        self._stream.write(LOG_PREFIX + json.dumps(record) + "\n")
        self._stream.flush()

    def debug(self, message):
        self(message, "DEBUG")

    def info(self, message):
        self(message, "INFO")

    def warning(self, message):
        self(message, "WARN")

    def error(self, message):
        self(message, "ERROR")

class _Handle:
    def __init__(self, alias):
        self._alias = alias

    def __getattr__(self, name):
        raise RuntimeError("service '%s' is not reachable from a child interpreter" % self._alias)

def _noop(*args, **kwargs):
    return None

def _reply(out, response):
    out.write(json.dumps(response, default=str) + "\n")
    out.flush()

def _failure(exc):
    return {"ok": False, "error": "%s: %s" % (type(exc).__name__, exc)}

def _hook(instance, name):
    hook = getattr(instance, name, None)
    if callable(hook):
        hook()

def _services(specs):
    services = {}
    for alias, spec in specs.items():
        if spec.get("type") == "logger":
            services[alias] = _Logger(sys.stderr)
        elif spec.get("type") == "value":
            services[alias] = spec.get("value")
        else:
            services[alias] = _Handle(alias)
    return services

def main():
    component_dir, module_name, type_name = sys.argv[1:4]
    out = sys.stdout
    sys.stdout = sys.stderr
    sys.path.insert(0, component_dir)
    init = json.loads(sys.stdin.readline() or "{}")
    try:
        cls = getattr(importlib.import_module(module_name), type_name)
        try:
            instance = cls(init.get("id"), _services(init.get("services") or {}))
        except TypeError:
            instance = cls()
        _hook(instance, "on_load")
    except Exception as exc:
        _reply(out, _failure(exc))
        return
    _reply(out, {"ok": True, "payload": None})

    for line in sys.stdin:
        if not line.strip():
            continue
        request = json.loads(line)
        try:
            if request.get("op") == "unload":
                _hook(instance, "on_unload")
                _reply(out, {"ok": True, "payload": None})
                return
            result = instance.execute(
                request.get("payload"), request.get("config") or {}, _noop, request.get("mode", "EXECUTE")
            )
            _reply(out, {"ok": True, "payload": result})
        except Exception as exc:
            _reply(out, _failure(exc))

main()
"#;

/// How one collaborator crosses into the child interpreter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeService {
    /// Proxy whose records come back on stderr.
    Logger,
    /// JSON data passed by value.
    Value { value: Payload },
    /// Placeholder for an in-process service; using it raises in the child.
    Handle,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    ok: bool,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeLogRecord {
    message: String,
    #[serde(default)]
    level: String,
}

/// Answer of the child to one request.
#[derive(Debug, PartialEq)]
enum BridgeReply {
    Ok(Payload),
    /// The component raised; the child is still usable.
    Failed(String),
}

fn parse_reply(line: &str) -> std::result::Result<BridgeReply, String> {
    let response: BridgeResponse = serde_json::from_str(line.trim())
        .map_err(|e| format!("malformed reply from component: {}", e))?;
    Ok(if response.ok {
        BridgeReply::Ok(response.payload)
    } else {
        BridgeReply::Failed(
            response
                .error
                .unwrap_or_else(|| "component reported an unknown error".to_string()),
        )
    })
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// A running child interpreter holding one component instance.
struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: StderrTail,
}

impl BridgeProcess {
    /// Send one request line and read its reply. `Err` means the child is
    /// gone or speaks garbage and must be replaced.
    async fn request(&mut self, body: &Payload) -> std::result::Result<BridgeReply, String> {
        let mut line = serde_json::to_vec(body).map_err(|e| e.to_string())?;
        line.push(b'\n');

        let written = match self.stdin.write_all(&line).await {
            Ok(()) => self.stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            return Err(self.transport_error(e.to_string()));
        }

        let reply = self.stdout.next_line().await;
        match reply {
            Ok(Some(reply)) => parse_reply(&reply),
            Ok(None) => Err(self.transport_error("interpreter exited".to_string())),
            Err(e) => Err(self.transport_error(e.to_string())),
        }
    }

    fn transport_error(&self, message: String) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            return message;
        }
        let joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        format!(
            "{}: {}",
            message,
            crate::install::summarize_output(joined.as_bytes(), b"")
        )
    }
}

/// Forward the child's stderr: log records to the component logger, anything
/// else to `debug!` and the error tail.
fn forward_stderr(
    stderr: ChildStderr,
    logger: Arc<dyn ComponentLogger>,
    namespace: String,
    tail: StderrTail,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let record = line
                .strip_prefix(BridgeConfig::LOG_PREFIX)
                .and_then(|rest| serde_json::from_str::<BridgeLogRecord>(rest).ok());
            match record {
                Some(record) => logger.write(&record.message, LogLevel::from_str(&record.level)),
                None => {
                    debug!(namespace = %namespace, "{}", line);
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == BridgeConfig::STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }
    });
}

/// Component whose code runs in a child Python interpreter.
///
/// One long-lived child per instance, started by `on_load` and scoped by the
/// loader context. Calls are serialized over its stdin. A stop signal kills
/// the child; the next call starts a fresh one.
pub struct PythonComponent {
    loader: LoaderContext,
    services: BTreeMap<String, BridgeService>,
    logger: Arc<dyn ComponentLogger>,
    process: tokio::sync::Mutex<Option<BridgeProcess>>,
}

impl std::fmt::Debug for PythonComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonComponent")
            .field("loader", &self.loader)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl PythonComponent {
    /// Bridge for `loader`, injecting the collaborators in `services`.
    ///
    /// The logger becomes a proxy, JSON values are copied and any other
    /// service is announced by name only.
    pub fn new(loader: LoaderContext, services: &ServiceMap) -> Self {
        let bridged = services
            .aliases()
            .into_iter()
            .map(|alias| {
                let service = if alias == LOGGER_ALIAS {
                    BridgeService::Logger
                } else if let Some(value) = services.get::<Payload>(alias) {
                    BridgeService::Value {
                        value: (*value).clone(),
                    }
                } else {
                    BridgeService::Handle
                };
                (alias.to_string(), service)
            })
            .collect();
        let logger = services
            .logger()
            .unwrap_or_else(|| Arc::new(TracingLogger::new(loader.id.clone())));

        Self {
            loader,
            services: bridged,
            logger,
            process: tokio::sync::Mutex::new(None),
        }
    }

    pub fn loader(&self) -> &LoaderContext {
        &self.loader
    }

    fn python_path(&self) -> std::result::Result<std::ffi::OsString, String> {
        let mut paths = self.loader.search_paths.clone();
        paths.push(self.loader.component_dir.clone());
        std::env::join_paths(paths).map_err(|e| e.to_string())
    }

    fn command(&self) -> std::result::Result<tokio::process::Command, String> {
        let mut cmd = tokio::process::Command::new(&self.loader.interpreter);
        cmd.arg("-c")
            .arg(PYTHON_BOOTSTRAP)
            .arg(&self.loader.component_dir)
            .arg(&self.loader.entry_point.module)
            .arg(&self.loader.entry_point.type_name)
            .arg(BridgeConfig::LOG_PREFIX)
            .env("PYTHONPATH", self.python_path()?)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .env("FLOWORK_COMPONENT_NAMESPACE", &self.loader.namespace)
            .current_dir(&self.loader.component_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Start the child, build the instance in it and run its `on_load`.
    async fn start(&self) -> std::result::Result<BridgeProcess, String> {
        let mut child = self
            .command()?
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", self.loader.interpreter.display(), e))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err("interpreter pipes unavailable".to_string());
        };
        let stderr_tail = StderrTail::default();
        forward_stderr(
            stderr,
            Arc::clone(&self.logger),
            self.loader.namespace.clone(),
            Arc::clone(&stderr_tail),
        );

        let mut process = BridgeProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
        };
        let init = json!({
            "op": "load",
            "id": self.loader.id,
            "services": self.services,
        });
        let reply = process.request(&init).await?;
        match reply {
            BridgeReply::Ok(_) => {
                debug!(namespace = %self.loader.namespace, "Python component loaded");
                Ok(process)
            }
            BridgeReply::Failed(message) => {
                let _ = process.child.start_kill();
                Err(message)
            }
        }
    }
}

#[async_trait]
impl Component for PythonComponent {
    async fn on_load(&self) -> Result<()> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let process = self
            .start()
            .await
            .map_err(|message| RuntimeError::Instantiation {
                kind: self.loader.kind,
                id: self.loader.id.clone(),
                message,
            })?;
        *guard = Some(process);
        Ok(())
    }

    async fn on_unload(&self) {
        let Some(mut process) = self.process.lock().await.take() else {
            return;
        };
        let unload = async {
            let reply = process.request(&json!({ "op": "unload" })).await;
            let _ = process.child.wait().await;
            reply
        };
        let outcome = tokio::time::timeout(BridgeConfig::UNLOAD_TIMEOUT, unload).await;
        match outcome {
            Ok(Ok(BridgeReply::Ok(_))) => {
                debug!(namespace = %self.loader.namespace, "Python component unloaded")
            }
            Ok(Ok(BridgeReply::Failed(message))) | Ok(Err(message)) => {
                warn!(namespace = %self.loader.namespace, "on_unload failed: {}", message)
            }
            Err(_) => {
                warn!(namespace = %self.loader.namespace, "on_unload timed out, killing interpreter");
                let _ = process.child.start_kill();
            }
        }
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.start().await.map_err(ExecutionFailure::failed)?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(ExecutionFailure::failed("interpreter unavailable"));
        };

        let body = json!({
            "op": "execute",
            "payload": request.payload,
            "config": request.config,
            "mode": request.mode.as_str(),
        });
        let reply = tokio::select! {
            reply = process.request(&body) => Some(reply),
            _ = request.control.stop.cancelled() => None,
        };

        match reply {
            Some(Ok(BridgeReply::Ok(payload))) => Ok(payload),
            Some(Ok(BridgeReply::Failed(message))) => Err(ExecutionFailure::failed(message)),
            Some(Err(message)) => {
                *guard = None;
                Err(ExecutionFailure::failed(message))
            }
            None => {
                warn!(namespace = %self.loader.namespace, "Execution stopped, killing interpreter");
                if let Some(mut process) = guard.take() {
                    let _ = process.child.start_kill();
                }
                Err(ExecutionFailure::Cancelled)
            }
        }
    }
}
