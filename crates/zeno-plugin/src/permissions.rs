//! Capability checks consulted by every host function.
//!
//! This module provides the [`Permissions`] struct, built from a plugin
//! manifest. Nothing is allowed unless the manifest grants it.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use zeno_common::HostFunctionError;

use crate::manifest::ManifestPermissions;

/// Capabilities of one plugin.
///
/// Permissions are immutable while the plugin is loaded; a reload builds a
/// fresh set from the re-read manifest.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    /// Outbound URL patterns.
    ///
    /// Patterns can be:
    /// - All URLs: `*`
    /// - URL prefix: `https://api.example.com/v1/*`
    /// - Exact URL: `https://api.example.com/status`
    /// - Host only: `api.example.com` or wildcard subdomain `*.example.com`
    pub network: Vec<String>,

    /// Environment variables the plugin may read.
    pub env: HashSet<String>,

    pub scope_read: bool,
    pub scope_write: bool,

    /// Relative path prefixes, resolved against the plugin directory.
    pub filesystem: Vec<PathBuf>,

    /// Database connection names.
    pub database: HashSet<String>,

    /// Maximum outbound HTTP requests per guest call.
    pub max_http_requests: u32,
}

impl Permissions {
    /// Create a permission set with all capabilities disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from a manifest's `permissions` table.
    pub fn from_manifest(manifest: &ManifestPermissions, max_http_requests: u32) -> Self {
        let scope: HashSet<&str> = manifest.scope.iter().map(String::as_str).collect();
        Self {
            network: manifest.network.clone(),
            env: manifest.env.iter().cloned().collect(),
            scope_read: scope.contains("read") || scope.contains("*"),
            scope_write: scope.contains("write") || scope.contains("*"),
            filesystem: manifest.filesystem.iter().map(PathBuf::from).collect(),
            database: manifest.database.iter().cloned().collect(),
            max_http_requests,
        }
    }

    /// Check an outbound URL.
    ///
    /// Private and metadata addresses are refused even under `*`.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when no pattern matches or the target is
    /// internal.
    pub fn check_network(&self, url: &str) -> Result<(), HostFunctionError> {
        if Self::is_private_address(url) {
            return Err(denied(format!("network access to internal address '{url}'")));
        }
        let Ok(parsed) = url::Url::parse(url) else {
            return Err(denied(format!("network access to malformed URL '{url}'")));
        };
        let host = parsed.host_str().map(str::to_lowercase).unwrap_or_default();

        if self
            .network
            .iter()
            .any(|pattern| Self::matches_pattern(pattern, url, &host))
        {
            Ok(())
        } else {
            Err(denied(format!("network access to '{url}'")))
        }
    }

    fn matches_pattern(pattern: &str, url: &str, host: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if pattern.contains("://") {
            return match pattern.strip_suffix('*') {
                Some(prefix) => url.starts_with(prefix),
                None => url == pattern || url.trim_end_matches('/') == pattern,
            };
        }

        let pattern = pattern.to_lowercase();
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host == suffix || host.ends_with(&format!(".{suffix}"))
        } else {
            pattern == host
        }
    }

    /// Check if the URL targets a private or internal address.
    ///
    /// This blocks SSRF attempts against:
    /// - localhost and 127.0.0.0/8
    /// - Private IP ranges (10.x.x.x, 172.16-31.x.x, 192.168.x.x)
    /// - Link-local addresses (169.254.x.x)
    /// - Cloud metadata endpoints (169.254.169.254)
    pub fn is_private_address(url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };

        let Some(host_str) = parsed.host_str() else {
            return false;
        };
        let host = host_str.to_lowercase();

        if host == "localhost" || host.ends_with(".localhost") {
            return true;
        }
        if host == "169.254.169.254" || host == "metadata.google.internal" {
            return true;
        }

        if let Some(url_host) = parsed.host() {
            return match url_host {
                url::Host::Ipv4(v4) => {
                    v4.is_private()
                        || v4.is_loopback()
                        || v4.is_link_local()
                        || v4.is_broadcast()
                        || v4.is_documentation()
                        || v4.is_unspecified()
                }
                url::Host::Ipv6(v6) => {
                    v6.is_loopback()
                        || v6.is_unspecified()
                        || v6.to_ipv4_mapped().is_some_and(|v4| {
                            v4.is_private() || v4.is_loopback() || v4.is_link_local()
                        })
                }
                url::Host::Domain(_) => false,
            };
        }

        false
    }

    /// Validate a guest-supplied path and return it relative to the plugin
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` for absolute paths, `..` components and
    /// paths outside every declared prefix.
    pub fn check_path(&self, path: &str, operation: &str) -> Result<PathBuf, HostFunctionError> {
        let candidate = Path::new(path);
        let escapes = candidate.is_absolute()
            || path.starts_with('/')
            || path.starts_with('\\')
            || candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(denied(format!("filesystem {operation} '{path}'")));
        }

        let normalized: PathBuf = candidate
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        if self
            .filesystem
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
        {
            Ok(normalized)
        } else {
            Err(denied(format!("filesystem {operation} '{path}'")))
        }
    }

    /// # Errors
    ///
    /// Returns `PermissionDenied` for an undeclared variable.
    pub fn check_env(&self, name: &str) -> Result<(), HostFunctionError> {
        if self.env.contains(name) || self.env.contains("*") {
            Ok(())
        } else {
            Err(denied(format!("environment variable '{name}'")))
        }
    }

    /// # Errors
    ///
    /// Returns `PermissionDenied` for an undeclared connection.
    pub fn check_database(&self, connection: &str) -> Result<(), HostFunctionError> {
        if self.database.contains(connection) || self.database.contains("*") {
            Ok(())
        } else {
            Err(denied(format!("database '{connection}'")))
        }
    }

    /// # Errors
    ///
    /// Returns `PermissionDenied` without the `read` scope capability.
    pub fn check_scope_read(&self) -> Result<(), HostFunctionError> {
        if self.scope_read {
            Ok(())
        } else {
            Err(denied("scope read"))
        }
    }

    /// # Errors
    ///
    /// Returns `PermissionDenied` without the `write` scope capability.
    pub fn check_scope_write(&self) -> Result<(), HostFunctionError> {
        if self.scope_write {
            Ok(())
        } else {
            Err(denied("scope write"))
        }
    }
}

fn denied(resource: impl Into<String>) -> HostFunctionError {
    HostFunctionError::PermissionDenied {
        resource: resource.into(),
    }
}
