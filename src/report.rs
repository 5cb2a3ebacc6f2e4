//! 命令行使用的控制台 sink 与运行汇总

use crate::sink::{
    DiscoveredTestCase, TestDiscoverySink, TestOutcome, TestOutcomeRecord, TestRunSink,
};
use chrono::{DateTime, Local};
use log::{debug, error, info};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 一个发现的测试占一行：名称，以及找得到时的源码位置
pub fn format_discovered(test_case: &DiscoveredTestCase) -> String {
    match (&test_case.source_file, test_case.source_line) {
        (Some(file), Some(line)) => format!(
            "{}  [{}:{}]",
            test_case.fully_qualified_name,
            file.display(),
            line
        ),
        _ => test_case.fully_qualified_name.clone(),
    }
}

/// 结果的第一行是状态、名称和耗时，其后是缩进的消息
pub fn format_outcome(record: &TestOutcomeRecord) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<7} {} ({:.3}s)",
        record.outcome.as_str().to_uppercase(),
        record.fully_qualified_name(),
        record.duration.as_secs_f64()
    )];
    if let Some(message) = &record.error_message {
        lines.push(format!("    {message}"));
    }
    if let Some(stack_trace) = &record.error_stack_trace {
        lines.extend(stack_trace.lines().map(|l| format!("      {l}")));
    }
    lines.extend(record.messages.iter().map(|m| format!("    {m}")));
    lines
}

#[derive(Debug, Default)]
pub struct ConsoleDiscoverySink {
    discovered: AtomicUsize,
    errors: AtomicUsize,
}

impl ConsoleDiscoverySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discovered(&self) -> usize {
        self.discovered.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl TestDiscoverySink for ConsoleDiscoverySink {
    fn begin(&self, path: &str) {
        debug!("Discovering tests in {path}");
    }

    fn message(&self, is_error: bool, text: &str) {
        if is_error {
            self.errors.fetch_add(1, Ordering::SeqCst);
            error!("{text}");
        } else {
            info!("{text}");
        }
    }

    fn progress(&self, test_case: &DiscoveredTestCase) {
        self.discovered.fetch_add(1, Ordering::SeqCst);
        println!("{}", format_discovered(test_case));
    }

    fn finished(&self, path: &str) {
        debug!("Finished discovering {path}");
    }
}

/// 运行结果计数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    /// 没有失败的测试，也没有报告错误
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Test Execution Summary ({}): {} total, {} passed, {} failed, {} skipped, {} errors in {:.1}s",
            self.finished.to_rfc3339(),
            self.total(),
            self.passed,
            self.failed,
            self.skipped,
            self.errors,
            (self.finished - self.started).num_milliseconds() as f64 / 1000.0
        )
    }
}

#[derive(Debug)]
pub struct ConsoleRunSink {
    passed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    errors: AtomicUsize,
    started: DateTime<Local>,
}

impl ConsoleRunSink {
    pub fn new() -> Self {
        Self {
            passed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            started: Local::now(),
        }
    }

    fn record(&self, outcome: TestOutcome) {
        let counter = match outcome {
            TestOutcome::Passed => &self.passed,
            TestOutcome::Failed => &self.failed,
            TestOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            passed: self.passed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            started: self.started,
            finished: Local::now(),
        }
    }
}

impl Default for ConsoleRunSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRunSink for ConsoleRunSink {
    fn begin(&self, path: &str) {
        info!("Running tests in {path}");
    }

    fn message(&self, is_error: bool, text: &str) {
        if is_error {
            self.errors.fetch_add(1, Ordering::SeqCst);
            error!("{text}");
        } else {
            info!("{text}");
        }
    }

    fn progress(&self, record: &TestOutcomeRecord) {
        self.record(record.outcome);
        // 多个模块并发运行，一次性输出一个结果的所有行
        println!("{}", format_outcome(record).join("\n"));
    }

    fn finished(&self, path: &str) {
        debug!("Finished running {path}");
    }
}
