//! 测试执行器（宿主侧入口）
//!
//! `TestExecutor` 为每次发现/运行创建一个新的隔离上下文，在其中启动远程执行器，
//! 把远程事件经蹦床转换后交给宿主的 sink，最后无条件销毁上下文。
//! 这里的任何错误都只会变成一条报告给 sink 的错误消息。

use crate::cancellation::{CancellationBridge, ChildStdinCancellationSink};
use crate::config::Config;
use crate::context::{IsolatedContext, RemoteProgram};
use crate::protocol::{RemoteEvent, RemoteRequest, RequestTarget, SinkTrampoline, encode_line};
use crate::sink::{DiscoveredTestCase, TestDiscoverySink, TestRunSink};
use crate::symbols;
use crate::trampoline::{DiscoverSinkTrampoline, RunSinkTrampoline};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;

pub struct TestExecutor {
    config: Config,
    remote: RemoteProgram,
}

impl TestExecutor {
    /// 使用当前可执行文件作为远程执行器
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_remote_program(config, RemoteProgram::current_exe()?))
    }

    pub fn with_remote_program(config: Config, remote: RemoteProgram) -> Self {
        Self { config, remote }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 发现一个测试模块中的测试
    pub async fn discover(&self, module_path: &Path, sink: Arc<dyn TestDiscoverySink>) {
        info!("Discover: {}", module_path.display());

        let symbol_source = module_path.to_path_buf();
        let symbols = match tokio::task::spawn_blocking(move || symbols::resolve(&symbol_source))
            .await
        {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!("Symbol resolution aborted: {e}");
                Default::default()
            }
        };

        let mut trampoline = DiscoverSinkTrampoline::new(module_path, sink.clone(), symbols);
        let framework = self.config.framework.clone();
        let result = self
            .internal_execute(
                module_path,
                |target| RemoteRequest::Discover { target, framework },
                &mut trampoline,
                None,
            )
            .await;

        if let Err(e) = result {
            error!("{}: {e:#}", module_path.display());
            sink.message(true, &format!("{}: {e:#}", module_path.display()));
        }
    }

    /// 运行一个测试模块中的测试，`test_cases` 为空表示全部运行
    pub async fn run(
        &self,
        module_path: &Path,
        test_cases: Vec<DiscoveredTestCase>,
        sink: Arc<dyn TestRunSink>,
        token: CancellationToken,
    ) {
        info!(
            "Run: {} ({} selected)",
            module_path.display(),
            test_cases.len()
        );

        let test_names: Vec<String> = test_cases
            .iter()
            .map(|c| c.fully_qualified_name.clone())
            .collect();
        let known: HashMap<String, DiscoveredTestCase> = test_cases
            .into_iter()
            .map(|c| (c.fully_qualified_name.clone(), c))
            .collect();

        let mut trampoline = RunSinkTrampoline::new(module_path, sink.clone(), known);
        let framework = self.config.framework.clone();
        let result = self
            .internal_execute(
                module_path,
                |target| RemoteRequest::Run {
                    target,
                    framework,
                    test_names,
                },
                &mut trampoline,
                Some(token),
            )
            .await;

        if let Err(e) = result {
            error!("{}: {e:#}", module_path.display());
            sink.message(true, &format!("{}: {e:#}", module_path.display()));
        }
    }

    async fn internal_execute<F>(
        &self,
        module_path: &Path,
        build_request: F,
        trampoline: &mut dyn SinkTrampoline,
        token: Option<CancellationToken>,
    ) -> Result<()>
    where
        F: FnOnce(RequestTarget) -> RemoteRequest,
    {
        let mut context = {
            let module_path = module_path.to_path_buf();
            let remote = self.remote.clone();
            let config = self.config.executor.clone();
            // 影子复制涉及大量文件 IO，不占用运行时线程
            tokio::task::spawn_blocking(move || {
                IsolatedContext::create(&module_path, &remote, &config)
            })
            .await
            .context("Context creation aborted")??
        };
        debug!(
            "Context {}: staging={}, load={}, roots={:?}, env={:?}",
            context.id(),
            context.staging_path().display(),
            context.load_path().display(),
            context.search_roots(),
            context.env().keys().collect::<Vec<_>>()
        );
        let request = build_request(context.target());

        let result = self.drive(&mut context, &request, trampoline, token).await;

        // 无论成功与否都销毁上下文
        context.dispose().await;
        result
    }

    async fn drive(
        &self,
        context: &mut IsolatedContext,
        request: &RemoteRequest,
        trampoline: &mut dyn SinkTrampoline,
        token: Option<CancellationToken>,
    ) -> Result<()> {
        let (mut stdin, stdout) = context.spawn()?;

        let line = encode_line(request)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("Failed to send request to remote executor")?;
        stdin.flush().await?;

        // 运行时标准输入用来转发取消；发现时保持打开直到结束
        let (_bridge, _stdin) = match token {
            Some(token) => (
                Some(CancellationBridge::register(
                    token,
                    ChildStdinCancellationSink::new(stdin),
                )),
                None,
            ),
            None => (None, Some(stdin)),
        };

        let pump = pump_events(stdout, trampoline);
        let finished = match self.config.executor.remote_timeout {
            Some(limit) => tokio::time::timeout(limit, pump)
                .await
                .map_err(|_| anyhow!("remote executor timed out after {limit:?}"))??,
            None => pump.await?,
        };

        // 收到 finished 后不再等待，剩下的由 dispose 收尾
        if finished {
            return Ok(());
        }
        let status = context.wait_remote().await?;
        if !status.success() {
            bail!("remote executor exited abnormally ({status})");
        }
        Ok(())
    }
}

/// 逐行读取远程事件并转交给蹦床，直到 finished 或 EOF，返回是否收到了 finished
async fn pump_events(stdout: ChildStdout, trampoline: &mut dyn SinkTrampoline) -> Result<bool> {
    let mut lines = BufReader::new(stdout).lines();
    let mut finished = false;

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from remote executor")?
    {
        if line.trim().is_empty() {
            continue;
        }
        let event: RemoteEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed line from remote executor: {line:?} ({e})");
                continue;
            }
        };
        let is_finished = matches!(event, RemoteEvent::Finished { .. });
        event.dispatch(trampoline)?;
        if is_finished {
            finished = true;
            break;
        }
    }

    debug!("Stopped reading remote events (finished: {finished})");
    Ok(finished)
}
