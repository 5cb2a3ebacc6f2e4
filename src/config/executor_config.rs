//! 执行器配置参数
use humantime_serde;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    // 单个测试模块在隔离上下文中允许运行的最长时间，None 表示不限制
    #[serde(with = "humantime_serde")]
    pub remote_timeout: Option<Duration>,
    // 是否把测试模块及其依赖复制到临时目录再加载（避免锁住原目录）
    pub shadow_copy: bool,
    // 按文件名（去掉扩展名和 lib 前缀）排除的模块，正则表达式
    pub exclude: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remote_timeout: None,
            shadow_copy: true,
            exclude: vec![
                "^testkit$".to_string(),
                "^isotest$".to_string(),
            ],
        }
    }
}
