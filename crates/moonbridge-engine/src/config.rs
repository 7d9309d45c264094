//! Bridge configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! namespace_root = "Host"
//! trim_namespace_prefix = "Acme"
//! tick_hook_id = "moonbridge.scheduler"
//! max_table_depth = 32
//! expose_module_info = true
//! ```

use serde::Deserialize;
use std::path::Path;

/// Default tick hook id for the task scheduler
pub const DEFAULT_TICK_HOOK_ID: &str = "moonbridge.scheduler";

/// Default nesting limit for table conversion
pub const DEFAULT_MAX_TABLE_DEPTH: usize = 32;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration parsed but holds an unusable value
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Global table namespaces are registered under; globals when `None`
    pub namespace_root: Option<String>,
    /// Prefix removed from type namespaces; the module's own prefix when `None`
    pub trim_namespace_prefix: Option<String>,
    /// Id of the tick hook that drains the task scheduler
    pub tick_hook_id: String,
    /// Maximum nesting when converting tables to host maps and lists
    pub max_table_depth: usize,
    /// Publish `_MODULE = { name, version }` under the namespace root
    pub expose_module_info: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace_root: None,
            trim_namespace_prefix: None,
            tick_hook_id: DEFAULT_TICK_HOOK_ID.to_string(),
            max_table_depth: DEFAULT_MAX_TABLE_DEPTH,
            expose_module_info: false,
        }
    }
}

impl BridgeConfig {
    /// Parse from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hook_id.is_empty() {
            return Err(ConfigError::Invalid("tick_hook_id must not be empty".into()));
        }
        if self.max_table_depth == 0 {
            return Err(ConfigError::Invalid("max_table_depth must be at least 1".into()));
        }
        if let Some(root) = &self.namespace_root {
            if root.is_empty() || root.contains('.') {
                return Err(ConfigError::Invalid(format!(
                    "namespace_root must be a single name, got {:?}",
                    root
                )));
            }
        }
        Ok(())
    }

    /// Register namespaces under the global table `root`
    pub fn with_namespace_root(mut self, root: impl Into<String>) -> Self {
        self.namespace_root = Some(root.into());
        self
    }

    /// Trim `prefix` from type namespaces
    pub fn with_trim_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.trim_namespace_prefix = Some(prefix.into());
        self
    }

    /// Use `id` for the scheduler tick hook
    pub fn with_tick_hook_id(mut self, id: impl Into<String>) -> Self {
        self.tick_hook_id = id.into();
        self
    }

    /// Limit table nesting to `depth`
    pub fn with_max_table_depth(mut self, depth: usize) -> Self {
        self.max_table_depth = depth;
        self
    }

    /// Publish the module info table
    pub fn with_module_info(mut self, expose: bool) -> Self {
        self.expose_module_info = expose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(BridgeConfig::from_toml_str("").unwrap(), BridgeConfig::default());
    }

    #[test]
    fn test_parse_fields() {
        let config = BridgeConfig::from_toml_str(
            r#"
            namespace_root = "Host"
            max_table_depth = 4
            expose_module_info = true
            "#,
        )
        .unwrap();
        assert_eq!(config.namespace_root.as_deref(), Some("Host"));
        assert_eq!(config.max_table_depth, 4);
        assert!(config.expose_module_info);
        assert_eq!(config.tick_hook_id, DEFAULT_TICK_HOOK_ID);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            BridgeConfig::from_toml_str("max_table_depth = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("namespace_root = \"a.b\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("unknown = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
