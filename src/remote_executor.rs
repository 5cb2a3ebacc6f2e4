//! 运行在隔离上下文中的执行器
//!
//! 宿主以 `__remote-executor` 子命令启动自身的影子副本，该进程只服务一个请求：
//! 读取测试模块的依赖，按名称找到（已签名的）测试框架，后期绑定收集器或运行器，
//! 再把框架的原生回调转换成只含基本类型的元组发回宿主。
//! 任何失败都只变成发给宿主的一条消息，不会让进程以错误退出。

use crate::cancellation::listen_for_cancellation;
use crate::config::FrameworkConfig;
use crate::error::ExecutionResult;
use crate::framework::{
    COLLECT_MEMBER, FrameworkInstance, FrameworkType, NativeLibrary, RUN_MEMBER, SymbolSource,
    public_key_token,
};
use crate::module_image::ModuleImage;
use crate::protocol::{
    ProgressPayload, RemoteEvent, RemoteRequest, RequestTarget, SinkTrampoline, encode_line,
};
use crate::utils::module_simple_name;
use anyhow::Context;
use log::{debug, error, info, warn};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::thread;
use tokio_util::sync::CancellationToken;

/// 负责读取与加载模块的部分，单元测试中替换成假实现
pub trait ModuleLoader {
    type Library: SymbolSource;

    fn inspect(&self, path: &Path) -> ExecutionResult<ModuleImage>;
    fn load(&self, path: &Path) -> ExecutionResult<Self::Library>;
    /// 把声明的依赖名解析成要加载的路径
    fn resolve_dependency(&self, name: &str) -> PathBuf;
}

/// 真正通过动态链接器加载模块
pub struct NativeLoader {
    search_roots: Vec<PathBuf>,
}

impl NativeLoader {
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        Self { search_roots }
    }
}

impl ModuleLoader for NativeLoader {
    type Library = NativeLibrary;

    fn inspect(&self, path: &Path) -> ExecutionResult<ModuleImage> {
        ModuleImage::read(path)
    }

    fn load(&self, path: &Path) -> ExecutionResult<NativeLibrary> {
        NativeLibrary::open(path)
    }

    fn resolve_dependency(&self, name: &str) -> PathBuf {
        // Mach-O 的依赖形如 @rpath/libtestkit.dylib
        let file_name = Path::new(name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(name));

        for root in &self.search_roots {
            let candidate = root.join(&file_name);
            if candidate.is_file() {
                return candidate;
            }
        }
        // 交给动态链接器按默认规则查找
        file_name
    }
}

pub struct RemoteExecutor<L: ModuleLoader> {
    loader: L,
}

impl<L: ModuleLoader> RemoteExecutor<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    /// 按请求类型分派
    pub fn execute(
        &self,
        request: &RemoteRequest,
        sink: &mut dyn SinkTrampoline,
        token: &CancellationToken,
    ) {
        match request {
            RemoteRequest::Discover { target, framework } => self.discover(target, framework, sink),
            RemoteRequest::Run {
                target,
                framework,
                test_names,
            } => self.run(target, framework, test_names, sink, token),
        }
    }

    pub fn discover(
        &self,
        target: &RequestTarget,
        framework: &FrameworkConfig,
        sink: &mut dyn SinkTrampoline,
    ) {
        info!("Discover: target={}", target.display_path);

        self.internal_execute(
            target,
            framework,
            &framework.collector_type,
            COLLECT_MEMBER,
            sink,
            |collector, load_path, sink| {
                let mut channel_error = None;
                collector.collect_and_callback(load_path, &mut |tuple| {
                    debug!("Discovered {}", tuple.0);
                    match sink.progress(ProgressPayload::Discovered(tuple)) {
                        Ok(()) => true,
                        Err(e) => {
                            channel_error = Some(e);
                            false
                        }
                    }
                })?;
                channel_error.map_or(Ok(()), |e| Err(e.into()))
            },
        );
    }

    pub fn run(
        &self,
        target: &RequestTarget,
        framework: &FrameworkConfig,
        test_names: &[String],
        sink: &mut dyn SinkTrampoline,
        token: &CancellationToken,
    ) {
        info!(
            "Run: target={}, tests={}",
            target.display_path,
            if test_names.is_empty() {
                "all".to_string()
            } else {
                test_names.len().to_string()
            }
        );

        self.internal_execute(
            target,
            framework,
            &framework.runner_type,
            RUN_MEMBER,
            sink,
            |runner, load_path, sink| {
                let mut channel_error = None;
                let mut cancelled = false;
                runner.run_tests_and_callback(load_path, test_names, &mut |tuple| {
                    // 取消之后的结果全部丢弃
                    if cancelled || token.is_cancelled() {
                        cancelled = true;
                        return false;
                    }
                    debug!("Result {}", tuple.0);
                    match sink.progress(ProgressPayload::Result(tuple)) {
                        Ok(()) => true,
                        Err(e) => {
                            channel_error = Some(e);
                            false
                        }
                    }
                })?;
                if let Some(e) = channel_error {
                    return Err(e.into());
                }
                if cancelled || token.is_cancelled() {
                    info!("Run cancelled: {}", target.display_path);
                    sink.message(false, &format!("{}: test run cancelled", target.display_path))?;
                }
                Ok(())
            },
        );
    }

    fn internal_execute<F>(
        &self,
        target: &RequestTarget,
        framework: &FrameworkConfig,
        type_name: &str,
        entry_member: &str,
        sink: &mut dyn SinkTrampoline,
        action: F,
    ) where
        F: FnOnce(&FrameworkInstance<'_, '_>, &str, &mut dyn SinkTrampoline) -> ExecutionResult<()>,
    {
        if let Err(e) =
            self.try_execute(target, framework, type_name, entry_member, sink, action)
        {
            error!("{}: {e}", target.display_path);
            let text = format!("{}: {}: {e}", target.display_path, e.kind());
            if let Err(send) = sink.message(true, &text) {
                warn!("Cannot report failure to host: {send}");
            }
        }
    }

    fn try_execute<F>(
        &self,
        target: &RequestTarget,
        framework: &FrameworkConfig,
        type_name: &str,
        entry_member: &str,
        sink: &mut dyn SinkTrampoline,
        action: F,
    ) -> ExecutionResult<()>
    where
        F: FnOnce(&FrameworkInstance<'_, '_>, &str, &mut dyn SinkTrampoline) -> ExecutionResult<()>,
    {
        let display_path = target.display_path.as_str();
        let load_path = Path::new(&target.load_path);

        // 1. 读取模块头并加载模块本身
        let image = self.loader.inspect(load_path)?;
        debug!(
            "{} depends on {:?}",
            image.path.display(),
            image.dependencies
        );
        let _module = self.loader.load(load_path)?;

        sink.begin(display_path)?;

        // 2. 从模块的依赖中找出框架
        let Some(library) = self.load_framework(&image, framework)? else {
            info!(
                "{display_path}: no reference to {}, skipped",
                framework.partial_name
            );
            sink.message(
                false,
                &format!(
                    "{display_path}: no reference to {} found, skipped",
                    framework.partial_name
                ),
            )?;
            sink.finished(display_path)?;
            return Ok(());
        };

        // 3. 按名称绑定框架类型
        let framework_type = match FrameworkType::bind(&library, type_name, entry_member) {
            Ok(framework_type) => framework_type,
            Err(e) if e.is_version_mismatch() => {
                warn!("{display_path}: {e}");
                sink.message(
                    true,
                    &format!("{display_path}: {}: unsupported framework version, {e}", e.kind()),
                )?;
                sink.finished(display_path)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // 4. 实例化并执行
        let instance = framework_type.instantiate()?;
        action(&instance, &target.load_path, sink)?;
        drop(instance);

        sink.finished(display_path)?;
        Ok(())
    }

    fn load_framework(
        &self,
        image: &ModuleImage,
        framework: &FrameworkConfig,
    ) -> ExecutionResult<Option<L::Library>> {
        let signature = framework.signature_symbol();

        for dependency in &image.dependencies {
            if !module_simple_name(dependency).eq_ignore_ascii_case(&framework.partial_name) {
                continue;
            }

            let path = self.loader.resolve_dependency(dependency);
            debug!("Candidate framework {dependency} -> {}", path.display());

            // 没有导出签名标记的库不必加载
            match self.loader.inspect(&path) {
                Ok(candidate) if !candidate.exports_symbol(&signature) => {
                    debug!("{dependency} does not export {signature}, ignored");
                    continue;
                }
                Ok(_) => {}
                Err(e) => debug!("Cannot inspect {}, loading anyway: {e}", path.display()),
            }
            let library = match self.loader.load(&path) {
                Ok(library) => library,
                Err(e) => {
                    debug!("Cannot load {dependency}, ignored: {e}");
                    continue;
                }
            };

            match (public_key_token(&library, &signature), &framework.public_key_token) {
                (None, _) => {
                    debug!("{dependency} is not signed, ignored");
                }
                (Some(token), Some(expected)) if !token.eq_ignore_ascii_case(expected) => {
                    debug!("{dependency} is signed with {token}, expected {expected}, ignored");
                }
                (Some(token), _) => {
                    debug!("Using {dependency} (public key token {token})");
                    return Ok(Some(library));
                }
            }
        }
        Ok(None)
    }
}

/// 把事件写回宿主的通道
pub struct ChannelSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> ChannelSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn send(&mut self, event: &RemoteEvent) -> io::Result<()> {
        let line = encode_line(event)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()
    }
}

impl<W: Write + Send> SinkTrampoline for ChannelSink<W> {
    fn begin(&mut self, path: &str) -> io::Result<()> {
        self.send(&RemoteEvent::Begin {
            path: path.to_string(),
        })
    }

    fn message(&mut self, is_error: bool, text: &str) -> io::Result<()> {
        self.send(&RemoteEvent::Message {
            is_error,
            text: text.to_string(),
        })
    }

    fn progress(&mut self, payload: ProgressPayload) -> io::Result<()> {
        self.send(&RemoteEvent::Progress { payload })
    }

    fn finished(&mut self, path: &str) -> io::Result<()> {
        self.send(&RemoteEvent::Finished {
            path: path.to_string(),
        })
    }
}

/// 协议通道
///
/// Unix 上复制一份原来的标准输出作为通道，然后把 fd 1 重定向到标准错误，
/// 这样测试代码的打印不会混进协议流。通道带 close-on-exec，
/// 测试启动的子进程拿不到它，宿主也就不会因为它们而等不到 EOF。
#[cfg(unix)]
pub fn open_protocol_channel() -> io::Result<Box<dyn Write + Send>> {
    io::stdout().flush()?;
    let channel = duplicate_cloexec(libc::STDOUT_FILENO)?;
    // SAFETY: 只操作本进程的标准文件描述符
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Box::new(io::BufWriter::new(channel)))
}

/// 复制 `fd`，新描述符设置 FD_CLOEXEC 且不小于 3
#[cfg(unix)]
fn duplicate_cloexec(fd: std::os::fd::RawFd) -> io::Result<std::fs::File> {
    use std::os::fd::FromRawFd;

    // SAFETY: F_DUPFD_CLOEXEC 只创建新的描述符
    let duplicate = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
    if duplicate < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: duplicate 是刚刚复制出来的，归 File 独占
    Ok(unsafe { std::fs::File::from_raw_fd(duplicate) })
}

#[cfg(not(unix))]
pub fn open_protocol_channel() -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(io::stdout()))
}

/// `__remote-executor` 的入口：读取一个请求，执行，然后返回
pub fn serve() -> anyhow::Result<()> {
    let channel = open_protocol_channel().context("Failed to open protocol channel")?;
    let mut sink = ChannelSink::new(channel);

    let stdin = io::stdin();
    let mut line = String::new();
    stdin
        .lock()
        .read_line(&mut line)
        .context("Failed to read request")?;
    let request: RemoteRequest =
        serde_json::from_str(line.trim()).context("Malformed request from host")?;
    debug!("Request: {request:?}");

    // 剩余的输入是宿主命令
    let token = CancellationToken::new();
    let listener_token = token.clone();
    thread::spawn(move || listen_for_cancellation(io::stdin().lock(), listener_token));

    let target = request.target();
    let search_roots = target.search_roots.iter().map(PathBuf::from).collect();
    let executor = RemoteExecutor::new(NativeLoader::new(search_roots));
    executor.execute(&request, &mut sink, &token);

    sink.into_inner().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::framework::fake::{self, FakeLibrary};
    use crate::framework::member_symbol;
    use crate::protocol::ResultTuple;
    use std::collections::HashMap;

    const MODULE: &str = "/work/libmath_tests.so";

    /// 记录收到的所有事件
    #[derive(Default)]
    struct RecordingSink {
        events: Vec<RemoteEvent>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<(bool, String)> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    RemoteEvent::Message { is_error, text } => Some((*is_error, text.clone())),
                    _ => None,
                })
                .collect()
        }

        fn payloads(&self) -> Vec<ProgressPayload> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    RemoteEvent::Progress { payload } => Some(payload.clone()),
                    _ => None,
                })
                .collect()
        }

        fn is_finished(&self) -> bool {
            matches!(self.events.last(), Some(RemoteEvent::Finished { .. }))
        }
    }

    impl SinkTrampoline for RecordingSink {
        fn begin(&mut self, path: &str) -> io::Result<()> {
            self.events.push(RemoteEvent::Begin { path: path.into() });
            Ok(())
        }

        fn message(&mut self, is_error: bool, text: &str) -> io::Result<()> {
            self.events.push(RemoteEvent::Message {
                is_error,
                text: text.into(),
            });
            Ok(())
        }

        fn progress(&mut self, payload: ProgressPayload) -> io::Result<()> {
            self.events.push(RemoteEvent::Progress { payload });
            if let Some((after, token)) = &self.cancel_after {
                if self.payloads().len() >= *after {
                    token.cancel();
                }
            }
            Ok(())
        }

        fn finished(&mut self, path: &str) -> io::Result<()> {
            self.events.push(RemoteEvent::Finished { path: path.into() });
            Ok(())
        }
    }

    struct FakeLoader {
        dependencies: Vec<String>,
        libraries: HashMap<PathBuf, FakeLibrary>,
    }

    impl FakeLoader {
        fn with_framework(framework: FakeLibrary) -> Self {
            Self {
                dependencies: vec!["libc.so.6".into(), "libtestkit.so.2".into()],
                libraries: HashMap::from([
                    (PathBuf::from(MODULE), FakeLibrary::empty()),
                    (PathBuf::from("/work/libtestkit.so.2"), framework),
                ]),
            }
        }
    }

    impl ModuleLoader for FakeLoader {
        type Library = FakeLibrary;

        fn inspect(&self, path: &Path) -> ExecutionResult<ModuleImage> {
            if path == Path::new(MODULE) {
                return Ok(ModuleImage {
                    path: path.to_path_buf(),
                    dependencies: self.dependencies.clone(),
                    exports: Default::default(),
                });
            }
            match self.libraries.get(path) {
                Some(library) => Ok(ModuleImage {
                    path: path.to_path_buf(),
                    dependencies: Vec::new(),
                    exports: library.exports(),
                }),
                None => Err(ExecutionError::Image {
                    path: path.to_path_buf(),
                    reason: "not a shared library".into(),
                }),
            }
        }

        fn load(&self, path: &Path) -> ExecutionResult<FakeLibrary> {
            self.libraries
                .get(path)
                .cloned()
                .ok_or_else(|| ExecutionError::Load {
                    path: path.to_path_buf(),
                    source: libloading::Error::DlOpenUnknown,
                })
        }

        fn resolve_dependency(&self, name: &str) -> PathBuf {
            Path::new("/work").join(name)
        }
    }

    fn target(path: &str) -> RequestTarget {
        RequestTarget {
            display_path: path.to_string(),
            load_path: path.to_string(),
            search_roots: vec!["/work".into()],
        }
    }

    fn result_names(sink: &RecordingSink) -> Vec<String> {
        sink.payloads()
            .into_iter()
            .filter_map(|p| match p {
                ProgressPayload::Result(ResultTuple(name, ..)) => Some(name),
                _ => None,
            })
            .collect()
    }

    #[test_log::test]
    fn test_discover_reports_in_order() {
        let executor = RemoteExecutor::new(FakeLoader::with_framework(FakeLibrary::framework()));
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &FrameworkConfig::default(), &mut sink);

        assert_eq!(sink.events.first(), Some(&RemoteEvent::Begin { path: MODULE.into() }));
        let names: Vec<_> = sink
            .payloads()
            .into_iter()
            .map(|p| match p {
                ProgressPayload::Discovered(t) => t.0,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["math::adds", "math::subs", "math::muls"]);
        assert!(sink.messages().is_empty());
        assert!(sink.is_finished());
    }

    #[test_log::test]
    fn test_version_mismatch_is_one_error_message() {
        let framework =
            FakeLibrary::framework().without(&member_symbol(fake::COLLECTOR, COLLECT_MEMBER));
        let executor = RemoteExecutor::new(FakeLoader::with_framework(framework));
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &FrameworkConfig::default(), &mut sink);

        assert!(sink.payloads().is_empty());
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].0);
        assert!(messages[0].1.contains(MODULE));
        assert!(messages[0].1.contains("FrameworkVersionMismatch"));
        assert!(sink.is_finished());
    }

    #[test]
    fn test_module_without_framework_is_skipped() {
        let mut loader = FakeLoader::with_framework(FakeLibrary::framework());
        loader.dependencies = vec!["libc.so.6".into()];
        let executor = RemoteExecutor::new(loader);
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &FrameworkConfig::default(), &mut sink);

        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].0);
        assert!(sink.payloads().is_empty());
        assert!(sink.is_finished());
    }

    #[test]
    fn test_unsigned_or_foreign_framework_is_ignored() {
        let unsigned = FakeLibrary::framework().without("testkit_public_key_token");
        let executor = RemoteExecutor::new(FakeLoader::with_framework(unsigned));
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &FrameworkConfig::default(), &mut sink);
        assert!(sink.payloads().is_empty());
        assert!(!sink.messages()[0].0);

        let foreign = FakeLibrary::framework()
            .with("testkit_public_key_token", fake::other_token as *const ());
        let executor = RemoteExecutor::new(FakeLoader::with_framework(foreign));
        let framework = FrameworkConfig {
            public_key_token: Some(fake::TOKEN.to_string()),
            ..FrameworkConfig::default()
        };
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &framework, &mut sink);
        assert!(sink.payloads().is_empty());
    }

    #[test]
    fn test_matching_token_is_accepted() {
        let executor = RemoteExecutor::new(FakeLoader::with_framework(FakeLibrary::framework()));
        let framework = FrameworkConfig {
            public_key_token: Some(fake::TOKEN.to_uppercase()),
            ..FrameworkConfig::default()
        };
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &framework, &mut sink);
        assert_eq!(sink.payloads().len(), 3);
    }

    #[test_log::test]
    fn test_load_failure_is_reported_not_raised() {
        let executor = RemoteExecutor::new(FakeLoader::with_framework(FakeLibrary::framework()));
        let mut sink = RecordingSink::default();
        executor.discover(&target("/work/README.md"), &FrameworkConfig::default(), &mut sink);

        assert_eq!(sink.events.len(), 1);
        let messages = sink.messages();
        assert!(messages[0].0);
        assert!(messages[0].1.starts_with("/work/README.md: ImageError: "));
    }

    #[test]
    fn test_run_all_in_framework_order() {
        let executor = RemoteExecutor::new(FakeLoader::with_framework(FakeLibrary::framework()));
        let mut sink = RecordingSink::default();
        executor.run(
            &target(MODULE),
            &FrameworkConfig::default(),
            &[],
            &mut sink,
            &CancellationToken::new(),
        );

        assert_eq!(
            result_names(&sink),
            vec!["math::throws", "math::skipped", "math::passes"]
        );
        assert!(sink.messages().is_empty());
        assert!(sink.is_finished());
    }

    #[test]
    fn test_run_selected_tests() {
        let executor = RemoteExecutor::new(FakeLoader::with_framework(FakeLibrary::framework()));
        let mut sink = RecordingSink::default();
        let request = RemoteRequest::Run {
            target: target(MODULE),
            framework: FrameworkConfig::default(),
            test_names: vec!["math::passes".into()],
        };
        executor.execute(&request, &mut sink, &CancellationToken::new());
        assert_eq!(result_names(&sink), vec!["math::passes"]);
    }

    #[test_log::test]
    fn test_cancellation_stops_forwarding() {
        let executor = RemoteExecutor::new(FakeLoader::with_framework(FakeLibrary::framework()));
        let token = CancellationToken::new();
        let mut sink = RecordingSink {
            cancel_after: Some((1, token.clone())),
            ..Default::default()
        };
        executor.run(&target(MODULE), &FrameworkConfig::default(), &[], &mut sink, &token);

        assert_eq!(result_names(&sink), vec!["math::throws"]);
        let messages = sink.messages();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].0);
        assert!(messages[0].1.contains("cancelled"));
        assert!(sink.is_finished());
    }

    #[test]
    fn test_channel_sink_writes_lines() {
        let mut sink = ChannelSink::new(Vec::new());
        sink.begin(MODULE).unwrap();
        sink.message(true, "oops").unwrap();
        sink.finished(MODULE).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let events: Vec<RemoteEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                RemoteEvent::Begin { path: MODULE.into() },
                RemoteEvent::Message {
                    is_error: true,
                    text: "oops".into()
                },
                RemoteEvent::Finished { path: MODULE.into() },
            ]
        );
    }

    #[test]
    fn test_native_loader_resolves_in_search_roots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libtestkit.so.2"), b"").unwrap();
        let loader = NativeLoader::new(vec![PathBuf::from("/nonexistent"), dir.path().into()]);

        assert_eq!(
            loader.resolve_dependency("libtestkit.so.2"),
            dir.path().join("libtestkit.so.2")
        );
        assert_eq!(
            loader.resolve_dependency("@rpath/libother.dylib"),
            PathBuf::from("libother.dylib")
        );
    }

    #[test_log::test]
    fn test_unloadable_candidate_falls_through_to_next() {
        let mut loader = FakeLoader::with_framework(FakeLibrary::framework());
        // 第一个同名候选既读不了也加载不了
        loader.dependencies = vec!["libtestkit.so.1".into(), "libtestkit.so.2".into()];
        let executor = RemoteExecutor::new(loader);
        let mut sink = RecordingSink::default();
        executor.discover(&target(MODULE), &FrameworkConfig::default(), &mut sink);

        assert_eq!(sink.payloads().len(), 3);
        assert!(sink.messages().is_empty());
        assert!(sink.is_finished());
    }

    #[cfg(unix)]
    #[test]
    fn test_protocol_channel_is_not_inherited() {
        use std::os::fd::AsRawFd;

        let file = tempfile::tempfile().unwrap();
        let channel = duplicate_cloexec(file.as_raw_fd()).unwrap();
        let fd = channel.as_raw_fd();
        assert!(fd >= 3);

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        #[cfg(target_os = "linux")]
        {
            let status = std::process::Command::new("sh")
                .arg("-c")
                .arg(format!("test -e /proc/self/fd/{fd}"))
                .status()
                .unwrap();
            assert!(!status.success(), "child process inherited fd {fd}");
        }
    }
}
