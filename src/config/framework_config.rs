//! 测试框架的后期绑定参数
//!
//! 框架的具体版本在编译期未知，这里只记录按名称查找框架所需的信息。
//! 该结构体会原样穿过隔离边界发送给远程执行器，因此只包含基本类型。
use serde::{Deserialize, Serialize};

/// Describes how the remote executor finds and binds the test framework.
///
/// - `partial_name`: simple name of the framework library (`libtestkit.so.2` -> `testkit`).
/// - `collector_type`: dotted type name of the test collector.
/// - `runner_type`: dotted type name of the test runner.
/// - `public_key_token`: expected identity token; when unset any signed library is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub partial_name: String,
    pub collector_type: String,
    pub runner_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_token: Option<String>,
}

impl FrameworkConfig {
    /// 框架签名标记的导出符号名
    pub fn signature_symbol(&self) -> String {
        format!("{}_public_key_token", self.partial_name)
    }
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            partial_name: "testkit".to_string(),
            collector_type: "testkit.internals.TestCollector".to_string(),
            runner_type: "testkit.internals.TestRunner".to_string(),
            public_key_token: None,
        }
    }
}
