//! Component descriptor: the parsed `manifest.json` plus on-disk metadata.

use super::ComponentKind;
use crate::config::PathsConfig;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Reference to the code a component is built from: `"<module>.<Type>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryPoint {
    /// Entry file stem, e.g. `main` for `main.py`.
    pub module: String,
    /// Exported type inside the entry file.
    pub type_name: String,
}

impl EntryPoint {
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let (module, type_name) = value
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("entry point '{}' must look like 'module.Type'", value))?;

        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !valid(module) || !valid(type_name) {
            return Err(format!(
                "entry point '{}' must look like 'module.Type'",
                value
            ));
        }

        Ok(Self {
            module: module.to_string(),
            type_name: type_name.to_string(),
        })
    }

    /// File name of the entry module when it is a Python source file.
    pub fn source_file(&self) -> String {
        format!("{}.py", self.module)
    }
}

impl std::fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.type_name)
    }
}

impl TryFrom<String> for EntryPoint {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntryPoint> for String {
    fn from(value: EntryPoint) -> Self {
        value.to_string()
    }
}

/// Cross-cutting execution behaviors a component can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Behavior {
    Retry,
    Loop,
}

impl Behavior {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "retry" => Some(Behavior::Retry),
            "loop" => Some(Behavior::Loop),
            _ => None,
        }
    }
}

/// Raw manifest as written by component authors.
#[derive(Debug, Deserialize)]
struct RawManifest {
    id: Option<String>,
    name: Option<String>,
    version: Option<serde_json::Value>,
    entry_point: Option<String>,
    listener_entry_point: Option<String>,
    tier: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    requires_services: Vec<String>,
    #[serde(default)]
    behaviors: Vec<String>,
}

/// Identity, entry point and declared needs of one component.
///
/// `id` and `path` never change after discovery; a re-scan builds a new
/// descriptor instead of patching an old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub id: String,
    pub kind: ComponentKind,
    pub name: String,
    pub version: Option<String>,
    pub entry_point: EntryPoint,
    pub tier: String,
    pub permissions: BTreeSet<String>,
    pub required_services: Vec<String>,
    pub behaviors: Vec<Behavior>,
    pub path: PathBuf,
    /// Directory name; differs from `id` when the manifest renames it.
    pub dir_name: String,
}

impl ComponentDescriptor {
    /// Read and validate `manifest.json` from a component directory.
    pub fn load(kind: ComponentKind, dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(PathsConfig::MANIFEST_FILENAME);
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
            RuntimeError::Descriptor {
                path: manifest_path.clone(),
                message: format!("cannot read manifest: {}", e),
            }
        })?;
        Self::parse(kind, dir, &content)
    }

    /// Parse manifest content for a component living in `dir`.
    pub fn parse(kind: ComponentKind, dir: &Path, content: &str) -> Result<Self> {
        let manifest_path = dir.join(PathsConfig::MANIFEST_FILENAME);
        let descriptor_error = |message: String| RuntimeError::Descriptor {
            path: manifest_path.clone(),
            message,
        };

        let raw: RawManifest = serde_json::from_str(content)
            .map_err(|e| descriptor_error(format!("malformed JSON: {}", e)))?;

        let id = raw
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| descriptor_error("missing required field 'id'".to_string()))?;

        // Triggers may declare a dedicated listener entry point.
        let entry_raw = match kind {
            ComponentKind::Trigger => raw.listener_entry_point.or(raw.entry_point),
            _ => raw.entry_point,
        };
        let entry_raw = entry_raw.ok_or_else(|| {
            descriptor_error(format!(
                "missing required field '{}'",
                kind.entry_point_fields()[0]
            ))
        })?;
        let entry_point = EntryPoint::parse(&entry_raw).map_err(descriptor_error)?;

        let mut behaviors = Vec::new();
        for name in &raw.behaviors {
            match Behavior::from_str(name) {
                Some(behavior) if !behaviors.contains(&behavior) => behaviors.push(behavior),
                Some(_) => {}
                None => warn!(component = %id, behavior = %name, "Ignoring unknown behavior"),
            }
        }

        let version = raw.version.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.clone());

        Ok(Self {
            name: raw.name.unwrap_or_else(|| id.clone()),
            id,
            kind,
            version,
            entry_point,
            tier: raw
                .tier
                .map(|t| t.to_lowercase())
                .unwrap_or_else(|| "free".to_string()),
            permissions: raw.permissions.into_iter().collect(),
            required_services: raw.requires_services,
            behaviors,
            path: dir.to_path_buf(),
            dir_name,
        })
    }

    pub fn has_behavior(&self, behavior: Behavior) -> bool {
        self.behaviors.contains(&behavior)
    }

    /// Loader namespace, e.g. `plugins.my_plugin`.
    ///
    /// Scoping by kind and id keeps same-named entry files of different
    /// components apart.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.kind.plural(), self.id.replace('-', "_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(kind: ComponentKind, content: &str) -> Result<ComponentDescriptor> {
        ComponentDescriptor::parse(kind, Path::new("/srv/flowork/plugins/echo"), content)
    }

    #[test]
    fn test_parse_minimal_descriptor() {
        let descriptor = parse(
            ComponentKind::Plugin,
            r#"{ "id": "echo", "entry_point": "main.Echo", "behaviors": ["retry"] }"#,
        )
        .unwrap();

        assert_eq!(descriptor.id, "echo");
        assert_eq!(descriptor.name, "echo");
        assert_eq!(descriptor.tier, "free");
        assert_eq!(descriptor.entry_point.module, "main");
        assert_eq!(descriptor.entry_point.type_name, "Echo");
        assert_eq!(descriptor.behaviors, vec![Behavior::Retry]);
        assert_eq!(descriptor.namespace(), "plugins.echo");
    }

    #[test]
    fn test_parse_full_descriptor() {
        let descriptor = parse(
            ComponentKind::Module,
            r#"{
                "id": "video-cutter",
                "name": "Video Cutter",
                "version": 2,
                "entry_point": "processor.VideoCutter",
                "tier": "PRO",
                "permissions": ["fs.read", "fs.write", "fs.read"],
                "requires_services": ["logger", "kernel", "dataset_manager"],
                "behaviors": ["loop", "retry", "loop", "teleport"]
            }"#,
        )
        .unwrap();

        assert_eq!(descriptor.version.as_deref(), Some("2"));
        assert_eq!(descriptor.tier, "pro");
        assert_eq!(descriptor.permissions.len(), 2);
        assert_eq!(
            descriptor.required_services,
            vec!["logger", "kernel", "dataset_manager"]
        );
        assert_eq!(descriptor.behaviors, vec![Behavior::Loop, Behavior::Retry]);
        assert_eq!(descriptor.namespace(), "modules.video_cutter");
    }

    #[test]
    fn test_trigger_prefers_listener_entry_point() {
        let descriptor = parse(
            ComponentKind::Trigger,
            r#"{ "id": "cron", "entry_point": "processor.Cron", "listener_entry_point": "listener.CronListener" }"#,
        )
        .unwrap();
        assert_eq!(descriptor.entry_point.to_string(), "listener.CronListener");

        let plugin = parse(
            ComponentKind::Plugin,
            r#"{ "id": "cron", "listener_entry_point": "listener.CronListener" }"#,
        );
        assert!(plugin.is_err());
    }

    #[test]
    fn test_missing_fields_are_descriptor_errors() {
        let err = parse(ComponentKind::Tool, r#"{ "entry_point": "main.Echo" }"#).unwrap_err();
        assert!(matches!(err, RuntimeError::Descriptor { .. }));

        let err = parse(ComponentKind::Tool, r#"{ "id": "echo" }"#).unwrap_err();
        assert!(err.to_string().contains("entry_point"));

        let err = parse(ComponentKind::Tool, "{ not json }").unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_entry_point_validation() {
        assert!(EntryPoint::parse("main.Echo").is_ok());
        assert!(EntryPoint::parse("main").is_err());
        assert!(EntryPoint::parse(".Echo").is_err());
        assert!(EntryPoint::parse("../evil.Echo").is_err());
        assert_eq!(EntryPoint::parse("main.Echo").unwrap().source_file(), "main.py");
    }

    #[test]
    fn test_descriptor_serde_roundtrip_keeps_entry_point_string() {
        let descriptor = parse(
            ComponentKind::Plugin,
            r#"{ "id": "echo", "entry_point": "main.Echo" }"#,
        )
        .unwrap();
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["entry_point"], "main.Echo");
        let back: ComponentDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, descriptor);
    }
}
