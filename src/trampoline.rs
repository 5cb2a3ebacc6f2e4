//! 宿主侧的蹦床
//!
//! 从隔离上下文收到的只有基本类型的元组，这里结合宿主自己持有的查找表
//! （符号名 -> 符号信息，完全限定名 -> 待运行的测试用例）重新构造出类型化的结果，
//! 再交给宿主的 sink。

use log::{debug, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{DiscoveredTuple, ProgressPayload, ResultTuple, SinkTrampoline};
use crate::sink::{
    DiscoveredTestCase, TestDiscoverySink, TestOutcome, TestOutcomeRecord, TestRunSink,
};
use crate::symbols::SymbolInformation;

/// 发现阶段的蹦床
pub struct DiscoverSinkTrampoline {
    target_path: PathBuf,
    parent: Arc<dyn TestDiscoverySink>,
    symbols: HashMap<String, SymbolInformation>,
}

impl DiscoverSinkTrampoline {
    pub fn new(
        target_path: &Path,
        parent: Arc<dyn TestDiscoverySink>,
        symbols: HashMap<String, SymbolInformation>,
    ) -> Self {
        Self {
            target_path: target_path.to_path_buf(),
            parent,
            symbols,
        }
    }

    fn to_test_case(&self, tuple: DiscoveredTuple) -> DiscoveredTestCase {
        let DiscoveredTuple(fully_qualified_name, symbol_name, display_name) = tuple;

        let symbol = self.symbols.get(&symbol_name);
        if symbol.is_none() {
            debug!(
                "SymbolInformation lookup failed: FQTN=\"{fully_qualified_name}\", SymbolName=\"{symbol_name}\", DisplayName=\"{display_name}\""
            );
        }

        DiscoveredTestCase {
            fully_qualified_name,
            symbol_name,
            display_name,
            source: self.target_path.clone(),
            source_file: symbol.map(|s| PathBuf::from(&s.file_name)),
            source_line: symbol.map(|s| s.min_line),
        }
    }
}

impl SinkTrampoline for DiscoverSinkTrampoline {
    fn begin(&mut self, path: &str) -> io::Result<()> {
        self.parent.begin(path);
        Ok(())
    }

    fn message(&mut self, is_error: bool, text: &str) -> io::Result<()> {
        self.parent.message(is_error, text);
        Ok(())
    }

    fn progress(&mut self, payload: ProgressPayload) -> io::Result<()> {
        match payload {
            ProgressPayload::Discovered(tuple) => {
                let test_case = self.to_test_case(tuple);
                debug!(
                    "DiscoverSinkTrampoline: FQTN={}, DisplayName={}, File={}, Line={:?}",
                    test_case.fully_qualified_name,
                    test_case.display_name,
                    test_case
                        .source_file
                        .as_deref()
                        .and_then(|p| p.file_name())
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "(null)".to_string()),
                    test_case.source_line
                );
                self.parent.progress(&test_case);
            }
            ProgressPayload::Result(ResultTuple(name, ..)) => {
                warn!("Ignoring run result for {name} during discovery");
            }
        }
        Ok(())
    }

    fn finished(&mut self, path: &str) -> io::Result<()> {
        self.parent.finished(path);
        Ok(())
    }
}

/// 运行阶段的蹦床
pub struct RunSinkTrampoline {
    target_path: PathBuf,
    parent: Arc<dyn TestRunSink>,
    test_cases: HashMap<String, DiscoveredTestCase>,
}

impl RunSinkTrampoline {
    pub fn new(
        target_path: &Path,
        parent: Arc<dyn TestRunSink>,
        test_cases: HashMap<String, DiscoveredTestCase>,
    ) -> Self {
        Self {
            target_path: target_path.to_path_buf(),
            parent,
            test_cases,
        }
    }

    fn to_record(&self, tuple: ResultTuple) -> TestOutcomeRecord {
        let ResultTuple(
            fully_qualified_name,
            symbol_name,
            display_name,
            exceptions,
            skips,
            failures,
            duration_nanos,
        ) = tuple;

        let test_case = match self.test_cases.get(&fully_qualified_name) {
            Some(test_case) => test_case.clone(),
            None => {
                // 未登记的结果也要能上报，只构造最基本的用例信息
                debug!(
                    "TestCase lookup failed: FQTN=\"{fully_qualified_name}\", SymbolName=\"{symbol_name}\", DisplayName=\"{display_name}\""
                );
                DiscoveredTestCase {
                    symbol_name,
                    ..DiscoveredTestCase::synthetic(
                        fully_qualified_name,
                        display_name,
                        self.target_path.clone(),
                    )
                }
            }
        };

        let outcome = TestOutcome::classify(&exceptions, &skips, &failures);
        let mut exceptions = exceptions.into_iter();
        let first_exception = exceptions.next();
        let mut messages = match outcome {
            TestOutcome::Skipped => skips,
            TestOutcome::Failed if first_exception.is_none() => failures,
            _ => Vec::new(),
        };
        // 第一个异常进 error_message，其余的附在消息里
        messages.extend(exceptions.map(|e| format!("{}: {}", e.0, e.1)));

        TestOutcomeRecord {
            test_case,
            outcome,
            duration: Duration::from_nanos(duration_nanos),
            error_message: first_exception
                .as_ref()
                .map(|e| format!("{}: {}", e.0, e.1)),
            error_stack_trace: first_exception.map(|e| e.2).filter(|s| !s.is_empty()),
            messages,
        }
    }
}

impl SinkTrampoline for RunSinkTrampoline {
    fn begin(&mut self, path: &str) -> io::Result<()> {
        self.parent.begin(path);
        Ok(())
    }

    fn message(&mut self, is_error: bool, text: &str) -> io::Result<()> {
        self.parent.message(is_error, text);
        Ok(())
    }

    fn progress(&mut self, payload: ProgressPayload) -> io::Result<()> {
        match payload {
            ProgressPayload::Result(tuple) => {
                let record = self.to_record(tuple);
                debug!(
                    "RunSinkTrampoline: FQTN={}, SymbolName={}, Outcome={}",
                    record.fully_qualified_name(),
                    record.test_case.symbol_name,
                    record.outcome.as_str()
                );
                self.parent.progress(&record);
            }
            ProgressPayload::Discovered(DiscoveredTuple(name, ..)) => {
                warn!("Ignoring discovered test {name} during run");
            }
        }
        Ok(())
    }

    fn finished(&mut self, path: &str) -> io::Result<()> {
        self.parent.finished(path);
        Ok(())
    }
}
