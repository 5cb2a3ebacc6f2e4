//! 批量执行
//!
//! 一次处理多个测试模块：过滤掉框架和工具自身，每个模块一个并发任务，
//! 运行选中的测试时按所属模块分组。所有运行共用的 token 都登记下来，
//! `cancel()` 会取消全部仍在进行的运行。

use crate::executor::TestExecutor;
use crate::sink::{DiscoveredTestCase, TestDiscoverySink, TestRunSink};
use crate::utils::module_simple_name;
use anyhow::{Context, Result};
use futures::future::join_all;
use log::{debug, info};
use regex::{Regex, RegexBuilder};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct TestBatch {
    executor: TestExecutor,
    exclude: Vec<Regex>,
    tokens: Mutex<HashMap<u64, CancellationToken>>,
    next_run: AtomicU64,
}

/// 一次运行期间登记在批次中的 token，drop 时注销
struct RunRegistration<'a> {
    batch: &'a TestBatch,
    id: u64,
    token: CancellationToken,
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        self.batch
            .tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl TestBatch {
    pub fn new(executor: TestExecutor) -> Result<Self> {
        let exclude = executor
            .config()
            .executor
            .exclude
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid exclude pattern {pattern:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            executor,
            exclude,
            tokens: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(0),
        })
    }

    /// 去掉被排除的模块（按去掉 `lib` 前缀和扩展名后的文件名匹配）
    pub fn filter_sources<'a>(&self, sources: &'a [PathBuf]) -> Vec<&'a Path> {
        sources
            .iter()
            .filter(|path| {
                let name = module_simple_name(&path.to_string_lossy());
                let excluded = self.exclude.iter().any(|re| re.is_match(&name));
                if excluded {
                    debug!("Excluded {}", path.display());
                }
                !excluded
            })
            .map(PathBuf::as_path)
            .collect()
    }

    pub async fn discover_tests(&self, sources: &[PathBuf], sink: Arc<dyn TestDiscoverySink>) {
        info!("isotest {VERSION} discovering tests started");

        let tasks = self
            .filter_sources(sources)
            .into_iter()
            .map(|source| self.executor.discover(source, sink.clone()));
        join_all(tasks).await;

        info!("isotest {VERSION} discovering tests finished");
    }

    /// 运行若干模块中的全部测试
    pub async fn run_sources(&self, sources: &[PathBuf], sink: Arc<dyn TestRunSink>) {
        info!("isotest {VERSION} run tests started");

        let registration = self.register_run();
        let tasks = self.filter_sources(sources).into_iter().map(|source| {
            self.executor
                .run(source, Vec::new(), sink.clone(), registration.token.clone())
        });
        join_all(tasks).await;
        drop(registration);

        info!("isotest {VERSION} run tests finished");
    }

    /// 运行选中的测试，按所属模块分组
    pub async fn run_tests(&self, tests: Vec<DiscoveredTestCase>, sink: Arc<dyn TestRunSink>) {
        info!("isotest {VERSION} run tests started");

        let mut groups: BTreeMap<PathBuf, Vec<DiscoveredTestCase>> = BTreeMap::new();
        for test_case in tests {
            groups
                .entry(test_case.source.clone())
                .or_default()
                .push(test_case);
        }

        let registration = self.register_run();
        let tasks = groups.into_iter().map(|(source, cases)| {
            let sink = sink.clone();
            let token = registration.token.clone();
            async move { self.executor.run(&source, cases, sink, token).await }
        });
        join_all(tasks).await;
        drop(registration);

        info!("isotest {VERSION} run tests finished");
    }

    /// 取消所有已登记的运行
    pub fn cancel(&self) {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        info!("Cancelling {} test run(s)", tokens.len());
        for token in tokens.values() {
            token.cancel();
        }
    }

    fn register_run(&self) -> RunRegistration<'_> {
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token.clone());
        RunRegistration {
            batch: self,
            id,
            token,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::RemoteProgram;
    use crate::sink::TestOutcomeRecord;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 记录所有回调，跨模块的顺序不确定
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl TestDiscoverySink for Recorder {
        fn begin(&self, _path: &str) {}
        fn message(&self, is_error: bool, text: &str) {
            self.push(format!("message {is_error} {text}"));
        }
        fn progress(&self, test_case: &DiscoveredTestCase) {
            self.push(format!(
                "discovered {} {}",
                test_case.fully_qualified_name,
                test_case.source.file_name().unwrap().to_string_lossy()
            ));
        }
        fn finished(&self, _path: &str) {}
    }

    impl TestRunSink for Recorder {
        fn begin(&self, _path: &str) {}
        fn message(&self, is_error: bool, text: &str) {
            self.push(format!("message {is_error} {text}"));
        }
        fn progress(&self, record: &TestOutcomeRecord) {
            self.push(format!("result {}", record.fully_qualified_name()));
        }
        fn finished(&self, _path: &str) {}
    }

    fn modules(names: &[&str]) -> (TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = names
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                fs::write(&path, b"module").unwrap();
                path
            })
            .collect();
        (dir, paths)
    }

    fn batch(script: &str) -> TestBatch {
        let executor = TestExecutor::with_remote_program(
            Config::default(),
            RemoteProgram {
                program: PathBuf::from("sh"),
                args: vec!["-c".into(), script.into()],
                stage: false,
            },
        );
        TestBatch::new(executor).unwrap()
    }

    #[test]
    fn test_filter_sources_excludes_framework_and_self() {
        let batch = batch("true");
        let sources = vec![
            PathBuf::from("/w/libtestkit.so.2"),
            PathBuf::from("/w/isotest"),
            PathBuf::from("/w/libmath_tests.so"),
            PathBuf::from("/w/TestKit.dll"),
        ];
        assert_eq!(
            batch.filter_sources(&sources),
            vec![Path::new("/w/libmath_tests.so")]
        );
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let mut config = Config::default();
        config.executor.exclude = vec!["(".into()];
        let executor = TestExecutor::with_remote_program(
            config,
            RemoteProgram {
                program: PathBuf::from("sh"),
                args: Vec::new(),
                stage: false,
            },
        );
        assert!(TestBatch::new(executor).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_one_broken_module_does_not_block_the_other() {
        let script = r#"read request
case "$request" in
  *libbroken_tests*)
    printf '%s\n' '{"event":"message","is_error":true,"text":"libbroken_tests.so: ImageError: bad magic"}'
    exit 0 ;;
esac
printf '%s\n' '{"event":"begin","path":"m"}'
printf '%s\n' '{"event":"progress","payload":{"kind":"discovered","tuple":["good::a","good.a","a"]}}'
printf '%s\n' '{"event":"finished","path":"m"}'
"#;
        let (_dir, sources) = modules(&["libbroken_tests.so", "libgood_tests.so"]);
        let recorder = Arc::new(Recorder::default());

        batch(script)
            .discover_tests(&sources, recorder.clone())
            .await;

        let mut events = recorder.events();
        events.sort();
        assert_eq!(
            events,
            vec![
                "discovered good::a libgood_tests.so".to_string(),
                "message true libbroken_tests.so: ImageError: bad magic".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_tests_groups_by_source() {
        let script = r#"read request
case "$request" in *liba_tests*) module=a ;; *) module=b ;; esac
names=$(printf '%s' "$request" | grep -o '"test_names":\[[^]]*]' | tr -d '"')
printf '{"event":"message","is_error":false,"text":"%s %s"}\n' "$module" "$names"
"#;
        let (_dir, sources) = modules(&["liba_tests.so", "libb_tests.so"]);
        let tests = vec![
            DiscoveredTestCase::synthetic("a::one", "one", sources[0].clone()),
            DiscoveredTestCase::synthetic("b::one", "one", sources[1].clone()),
            DiscoveredTestCase::synthetic("a::two", "two", sources[0].clone()),
        ];
        let recorder = Arc::new(Recorder::default());

        batch(script).run_tests(tests, recorder.clone()).await;

        let mut events = recorder.events();
        events.sort();
        assert_eq!(
            events,
            vec![
                "message false a test_names:[a::one,a::two]".to_string(),
                "message false b test_names:[b::one]".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_reaches_every_running_module() {
        let script = r#"read request
read command
printf '{"event":"message","is_error":false,"text":"got %s"}\n' "$(printf '%s' "$command" | tr -d '"{}')"
"#;
        let (_dir, sources) = modules(&["liba_tests.so", "libb_tests.so"]);
        let recorder = Arc::new(Recorder::default());
        let batch = batch(script);

        let run = batch.run_sources(&sources, recorder.clone());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            batch.cancel();
        };
        tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(run, cancel) })
            .await
            .expect("batch did not stop after cancel");

        assert_eq!(
            recorder.events(),
            vec![
                "message false got command:cancel".to_string(),
                "message false got command:cancel".to_string(),
            ]
        );
        assert!(batch.tokens.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finished_runs_release_their_tokens() {
        let (_dir, sources) = modules(&["liba_tests.so"]);
        let recorder = Arc::new(Recorder::default());
        let batch = batch("read request");

        for _ in 0..3 {
            batch.run_sources(&sources, recorder.clone()).await;
            batch
                .run_tests(
                    vec![DiscoveredTestCase::synthetic("a::one", "one", sources[0].clone())],
                    recorder.clone(),
                )
                .await;
        }
        assert!(batch.tokens.lock().unwrap().is_empty());

        // 没有进行中的运行时取消什么也不做
        batch.cancel();
        assert!(recorder.events().is_empty());
    }
}
