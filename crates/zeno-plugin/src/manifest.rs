//! Plugin manifests.
//!
//! A plugin directory holds one manifest (`plugin.toml`, `plugin.yaml`,
//! `plugin.yml` or `plugin.json`) next to its binary.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use zeno_common::RuntimeError;
use zeno_core::{InputSpec, SlotMetadata};

/// Manifest file names, in lookup order.
pub const MANIFEST_FILES: &[&str] = &["plugin.toml", "plugin.yaml", "plugin.yml", "plugin.json"];

/// A parsed plugin manifest.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Path of the binary, relative to the plugin directory.
    pub binary: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
    #[serde(default)]
    pub permissions: ManifestPermissions,
    #[serde(default)]
    pub config: IndexMap<String, ConfigField>,
    /// Slots a sidecar serves. Wasm guests report theirs from
    /// `plugin_register_slots`.
    #[serde(default)]
    pub slots: Vec<SlotDeclaration>,
}

fn default_version() -> String {
    "0.0.0".into()
}

/// The `permissions` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ManifestPermissions {
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// `read` and/or `write`.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub filesystem: Vec<String>,
    #[serde(default)]
    pub database: Vec<String>,
}

/// One entry of the `config` table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigField {
    /// `string`, `number`, `int` or `bool`.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Json>,
    #[serde(default)]
    pub description: Option<String>,
    /// Environment variable that overrides the default.
    #[serde(default)]
    pub env: Option<String>,
}

fn default_kind() -> String {
    "string".into()
}

/// A slot a plugin contributes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SlotDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub example: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputDeclaration>,
    #[serde(default)]
    pub required_blocks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct InputDeclaration {
    #[serde(rename = "type", default = "any_kind")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn any_kind() -> String {
    "any".into()
}

impl SlotDeclaration {
    pub fn metadata(&self) -> SlotMetadata {
        SlotMetadata {
            description: self.description.clone(),
            example: self.example.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|(name, input)| {
                    (
                        name.clone(),
                        InputSpec {
                            kind: input.kind.clone(),
                            required: input.required,
                            description: input.description.clone(),
                        },
                    )
                })
                .collect(),
            required_blocks: self.required_blocks.clone(),
            value_type: None,
        }
    }
}

impl PluginManifest {
    /// Find and parse the manifest in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when no manifest exists, it does not parse or
    /// a required key is missing.
    pub fn load(dir: &Path) -> Result<Self, RuntimeError> {
        let Some(path) = Self::locate(dir) else {
            return Err(RuntimeError::invalid_config(format!(
                "no plugin manifest in {}",
                dir.display()
            )));
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| RuntimeError::io(format!("read {}: {e}", path.display())))?;
        let manifest = Self::parse(&path, &text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Path of the manifest in `dir`, if it has one.
    pub fn locate(dir: &Path) -> Option<PathBuf> {
        MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Parse by file extension.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a parse failure.
    pub fn parse(path: &Path, text: &str) -> Result<Self, RuntimeError> {
        let bad = |e: &dyn std::fmt::Display| {
            RuntimeError::invalid_config(format!("{}: {e}", path.display()))
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(text).map_err(|e| bad(&e)),
            Some("yaml" | "yml") => serde_yaml::from_str(text).map_err(|e| bad(&e)),
            _ => serde_json::from_str(text).map_err(|e| bad(&e)),
        }
    }

    fn validate(&self) -> Result<(), RuntimeError> {
        if self.name.trim().is_empty() {
            return Err(RuntimeError::invalid_config("plugin manifest: `name` is required"));
        }
        if self.binary.trim().is_empty() {
            return Err(RuntimeError::invalid_config(format!(
                "plugin '{}': `binary` is required",
                self.name
            )));
        }
        let binary = Path::new(&self.binary);
        if binary.is_absolute()
            || binary
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(RuntimeError::invalid_config(format!(
                "plugin '{}': `binary` must stay inside the plugin directory",
                self.name
            )));
        }
        Ok(())
    }

    pub fn binary_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.binary)
    }

    /// Whether the binary is a WebAssembly module rather than a sidecar
    /// executable.
    pub fn is_wasm(&self) -> bool {
        Path::new(&self.binary)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wasm"))
    }

    /// Resolve the `config` table: environment override, then default.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` when a required entry has neither, or an override
    /// does not parse as the declared type.
    pub fn resolve_config(&self) -> Result<serde_json::Map<String, Json>, RuntimeError> {
        self.resolve_config_with(|name| std::env::var(name).ok())
    }

    /// [`Self::resolve_config`] with an injectable environment.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve_config`].
    pub fn resolve_config_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<serde_json::Map<String, Json>, RuntimeError> {
        let mut out = serde_json::Map::new();
        for (key, field) in &self.config {
            let from_env = field.env.as_deref().and_then(&env);
            let value = match (from_env, &field.default) {
                (Some(raw), _) => coerce(&field.kind, &raw).ok_or_else(|| {
                    RuntimeError::plugin(
                        &self.name,
                        format!("config `{key}`: '{raw}' is not a valid {}", field.kind),
                    )
                })?,
                (None, Some(default)) => default.clone(),
                (None, None) if field.required => {
                    return Err(RuntimeError::plugin(
                        &self.name,
                        format!("config `{key}` is required"),
                    ));
                }
                (None, None) => continue,
            };
            out.insert(key.clone(), value);
        }
        Ok(out)
    }
}

fn coerce(kind: &str, raw: &str) -> Option<Json> {
    match kind {
        "int" | "integer" => raw.trim().parse::<i64>().ok().map(Json::from),
        "number" | "float" => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number),
        "bool" | "boolean" => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Json::Bool(true)),
            "false" | "0" | "no" => Some(Json::Bool(false)),
            _ => None,
        },
        _ => Some(Json::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOML: &str = r#"
        name = "weather"
        version = "1.2.0"
        binary = "weather.wasm"
        author = "ops"

        [permissions]
        network = ["https://api.weather.example/*"]
        env = ["WEATHER_KEY"]
        scope = ["read"]

        [config.api_key]
        type = "string"
        required = true
        env = "WEATHER_KEY"

        [config.retries]
        type = "int"
        default = 3
    "#;

    #[test]
    fn test_parse_toml_manifest() {
        let manifest = PluginManifest::parse(Path::new("plugin.toml"), TOML).unwrap();
        assert_eq!(manifest.name, "weather");
        assert_eq!(manifest.version, "1.2.0");
        assert!(manifest.is_wasm());
        assert_eq!(manifest.permissions.scope, ["read"]);
        assert_eq!(manifest.config.len(), 2);
        assert_eq!(manifest.config["retries"].kind, "int");
    }

    #[test]
    fn test_parse_yaml_and_json() {
        let yaml = "name: tools\nbinary: bin/tools\nslots:\n  - name: tools.hash\n    description: hash a value\n";
        let manifest = PluginManifest::parse(Path::new("plugin.yaml"), yaml).unwrap();
        assert!(!manifest.is_wasm());
        assert_eq!(manifest.version, "0.0.0");
        assert_eq!(manifest.slots[0].name, "tools.hash");

        let json = r#"{"name": "j", "binary": "j.wasm", "permissions": {"database": ["default"]}}"#;
        let manifest = PluginManifest::parse(Path::new("plugin.json"), json).unwrap();
        assert_eq!(manifest.permissions.database, ["default"]);
    }

    #[test]
    fn test_required_keys() {
        let missing = PluginManifest::parse(Path::new("plugin.json"), r#"{"name": "x"}"#);
        assert!(missing.is_err());

        let escaping = PluginManifest {
            name: "x".into(),
            binary: "../x.wasm".into(),
            ..Default::default()
        };
        assert!(escaping.validate().is_err());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PluginManifest::load(dir.path()).is_err());

        std::fs::write(dir.path().join("plugin.toml"), TOML).unwrap();
        let manifest = PluginManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.binary_path(dir.path()), dir.path().join("weather.wasm"));
    }

    #[test]
    fn test_resolve_config() {
        let manifest = PluginManifest::parse(Path::new("plugin.toml"), TOML).unwrap();

        let err = manifest.resolve_config_with(|_| None).unwrap_err();
        assert!(err.to_string().contains("api_key"));

        let resolved = manifest
            .resolve_config_with(|name| (name == "WEATHER_KEY").then(|| "secret".to_string()))
            .unwrap();
        assert_eq!(resolved["api_key"], json!("secret"));
        assert_eq!(resolved["retries"], json!(3));
    }

    #[test]
    fn test_config_override_is_typed() {
        let mut manifest = PluginManifest::parse(Path::new("plugin.toml"), TOML).unwrap();
        manifest.config["retries"].env = Some("RETRIES".into());

        let env = |name: &str| match name {
            "WEATHER_KEY" => Some("k".to_string()),
            "RETRIES" => Some("7".to_string()),
            _ => None,
        };
        assert_eq!(manifest.resolve_config_with(env).unwrap()["retries"], json!(7));

        let bad = |name: &str| match name {
            "WEATHER_KEY" => Some("k".to_string()),
            "RETRIES" => Some("many".to_string()),
            _ => None,
        };
        assert!(manifest.resolve_config_with(bad).is_err());
    }

    #[test]
    fn test_slot_metadata() {
        let decl: SlotDeclaration = serde_json::from_value(json!({
            "name": "weather.get",
            "description": "Current weather",
            "inputs": {"city": {"type": "string", "required": true}}
        }))
        .unwrap();
        let meta = decl.metadata();
        assert_eq!(meta.description, "Current weather");
        assert!(meta.inputs["city"].required);
    }
}
