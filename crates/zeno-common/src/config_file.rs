//! Configuration file structures for zeno.
//!
//! A TOML file mirrors [`RuntimeConfig`] section by section and may name
//! the program to serve.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// program = "./app.json"
///
/// [server]
/// listen = ":8080"
/// request_timeout_ms = 10000
///
/// [worker]
/// enabled = true
/// queues = ["default", "mail"]
///
/// [database.primary]
/// driver = "sqlite"
/// name = "app.db"
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Program tree to load when no path is given on the command line.
    #[serde(default)]
    pub program: Option<String>,

    /// Runtime configuration sections.
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        tracing::debug!(path = %path.as_ref().display(), "loading configuration file");
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.program.is_none());
        assert_eq!(config.runtime.server.listen, ":3000");
        assert!(!config.runtime.admin.enabled);
        assert_eq!(config.runtime.admin.prefix, "/admin");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:4000"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.runtime.server.listen, "127.0.0.1:4000");
        // Defaults applied
        assert_eq!(config.runtime.server.request_timeout_ms, 30_000);
        assert_eq!(config.runtime.worker.concurrency, 1);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            program = "./app.json"

            [server]
            listen = ":9000"
            request_timeout_ms = 250
            use_vm = true

            [execution]
            max_fuel = 5_000_000

            [plugins]
            enabled = true
            dir = "./ext"

            [worker]
            enabled = true
            concurrency = 2
            queues = ["default", "mail"]

            [database.primary]
            driver = "sqlite"
            name = "app.db"

            [database.named.reporting]
            driver = "postgres"
            host = "reports:5432"
            name = "reports"
            user = "ro"

            [admin]
            enabled = true
            token = "secret-token"
            prefix = "/ops"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();
        let runtime = &config.runtime;

        assert_eq!(config.program.as_deref(), Some("./app.json"));
        assert_eq!(runtime.server.bind_addr(), "0.0.0.0:9000");
        assert_eq!(runtime.server.request_timeout_ms, 250);
        assert!(runtime.server.use_vm);
        assert_eq!(runtime.execution.max_fuel, 5_000_000);
        assert!(runtime.plugins.enabled);
        assert_eq!(runtime.plugins.dir, "./ext");
        assert_eq!(runtime.worker.queues, vec!["default", "mail"]);
        assert_eq!(
            runtime.database.primary.as_ref().unwrap().name,
            "app.db".to_string()
        );
        assert_eq!(runtime.database.named["reporting"].user, "ro");
        assert!(runtime.admin.is_configured());
        assert_eq!(runtime.admin.prefix, "/ops");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nmax_attempts = 2").unwrap();

        let config = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.worker.max_attempts, 2);

        let missing = ConfigFile::from_file("/nonexistent/zeno.toml");
        assert!(matches!(missing, Err(ConfigFileError::Io { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }
}
