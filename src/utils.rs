//! Utility functions shared by the host and the remote executor.
//!
//! This module provides TOML loading, module file-name helpers and the
//! platform specific library search variable.

use anyhow::{Context, Result};
use log::error;
use serde::de::DeserializeOwned;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// 动态库搜索路径环境变量
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(target_os = "windows")]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Reads a TOML file into an arbitrary struct.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_toml_from_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let config: T = match toml::de::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to parse TOML file {}: {e}", path.display());
            return Err(e.into());
        }
    };
    Ok(config)
}

/// 从动态库文件名获取简单名称
///
/// 去掉目录、`lib` 前缀以及第一个 `.` 之后的所有内容：
/// `libtestkit.so.2` / `libtestkit.2.dylib` / `testkit.dll` 都得到 `testkit`
pub fn module_simple_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let base = base.strip_prefix("lib").unwrap_or(base);
    base.split('.').next().unwrap_or(base).to_string()
}

/// 判断路径是否像一个动态库（包括 `libfoo.so.1` 这样带版本号的文件）
pub fn is_shared_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };
    if name.ends_with(".config") {
        return false;
    }
    name.ends_with(".so")
        || name.contains(".so.")
        || name.ends_with(".dylib")
        || name.to_ascii_lowercase().ends_with(".dll")
}

/// 测试模块旁边的配置文件路径：`<文件名>.config`
pub fn sibling_config_path(module_path: &Path) -> PathBuf {
    let mut name = module_path
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".config");
    module_path.with_file_name(name)
}
