//! 宿主侧的回调契约与结果数据模型
//!
//! 宿主只需要实现 `TestDiscoverySink` / `TestRunSink` 两个窄接口，
//! 隔离上下文内部的一切都通过蹦床（trampoline）转换成这里的类型后再交给宿主。

use std::path::PathBuf;
use std::time::Duration;

/// 发现阶段得到的测试用例
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTestCase {
    /// 完全限定名，发现与运行之间保持不变
    pub fully_qualified_name: String,
    /// 用于查找源码位置的符号名（`path.to.Type.member`）
    pub symbol_name: String,
    /// 显示名称
    pub display_name: String,
    /// 所属测试模块
    pub source: PathBuf,
    /// 源文件（找不到符号信息时为 None）
    pub source_file: Option<PathBuf>,
    /// 源码行号（找不到符号信息时为 None）
    pub source_line: Option<u32>,
}

impl DiscoveredTestCase {
    /// 只包含名称信息的最小测试用例
    pub fn synthetic(
        fully_qualified_name: impl Into<String>,
        display_name: impl Into<String>,
        source: impl Into<PathBuf>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            symbol_name: fully_qualified_name.clone(),
            fully_qualified_name,
            display_name: display_name.into(),
            source: source.into(),
            source_file: None,
            source_line: None,
        }
    }
}

/// 测试结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

impl TestOutcome {
    /// 按固定优先级判定结果：异常 > 跳过 > 失败消息 > 通过
    pub fn classify<E>(exceptions: &[E], skips: &[String], failures: &[String]) -> Self {
        if !exceptions.is_empty() {
            TestOutcome::Failed
        } else if !skips.is_empty() {
            TestOutcome::Skipped
        } else if !failures.is_empty() {
            TestOutcome::Failed
        } else {
            TestOutcome::Passed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
        }
    }
}

/// 单个测试的运行结果
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcomeRecord {
    pub test_case: DiscoveredTestCase,
    pub outcome: TestOutcome,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub error_stack_trace: Option<String>,
    pub messages: Vec<String>,
}

impl TestOutcomeRecord {
    pub fn fully_qualified_name(&self) -> &str {
        &self.test_case.fully_qualified_name
    }
}

/// Receives discovery progress for one or more test modules.
///
/// Implementations are shared by every module of a batch, so calls for
/// different modules may interleave; calls for one module arrive in order.
#[cfg_attr(test, mockall::automock)]
pub trait TestDiscoverySink: Send + Sync {
    fn begin(&self, path: &str);
    fn message(&self, is_error: bool, text: &str);
    fn progress(&self, test_case: &DiscoveredTestCase);
    fn finished(&self, path: &str);
}

/// Receives run progress for one or more test modules.
#[cfg_attr(test, mockall::automock)]
pub trait TestRunSink: Send + Sync {
    fn begin(&self, path: &str);
    fn message(&self, is_error: bool, text: &str);
    fn progress(&self, record: &TestOutcomeRecord);
    fn finished(&self, path: &str);
}
