/// Represents the root configuration for the application.
///
/// This struct is used to deserialize the configuration from a file using the `utils::read_toml_from_file` method.
/// It contains two tables, both optional:
/// - `framework`: how the remote executor locates and binds the test framework.
/// - `executor`: how isolated contexts are created and supervised.
///
/// # Example
///
/// ```toml
/// [framework]
/// partial_name = "testkit"
/// runner_type = "testkit.internals.TestRunner"
///
/// [executor]
/// remote_timeout = "10m"
/// shadow_copy = true
/// ```
use crate::config::{ExecutorConfig, FrameworkConfig};
use crate::utils;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 未指定 --config 时在当前目录查找的配置文件
pub const DEFAULT_CONFIG_FILE: &str = "isotest.toml";

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub framework: FrameworkConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    /// 从文件中读取
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = utils::read_toml_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
        Ok(config)
    }

    /// 显式指定的配置文件必须存在；否则尝试默认文件，找不到就用默认值
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(&fallback)
                } else {
                    debug!("No {DEFAULT_CONFIG_FILE} found, using built-in defaults");
                    Ok(Self::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
[framework]
partial_name = "otherkit"
public_key_token = "b03f5f7f11d50a3a"

[executor]
remote_timeout = "90s"
"#,
        )
        .unwrap();

        assert_eq!(config.framework.partial_name, "otherkit");
        assert_eq!(config.framework.runner_type, "testkit.internals.TestRunner");
        assert_eq!(config.framework.public_key_token.as_deref(), Some("b03f5f7f11d50a3a"));
        assert_eq!(config.executor.remote_timeout, Some(Duration::from_secs(90)));
        assert!(config.executor.shadow_copy);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.framework, FrameworkConfig::default());
        assert!(config.executor.remote_timeout.is_none());
        assert_eq!(config.framework.signature_symbol(), "testkit_public_key_token");
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("nope.toml")));
        assert!(result.is_err());
    }
}
