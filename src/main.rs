mod batch;
mod cancellation;
mod config;
mod context;
mod error;
mod executor;
mod framework;
mod module_image;
mod protocol;
mod remote_executor;
mod report;
mod sink;
mod symbols;
mod trampoline;
mod utils;

use anyhow::{Context, Result};
use batch::TestBatch;
use config::Config;
use config::cli_args::{CliArgs, CliCommand};
use executor::TestExecutor;
use log::{error, info, warn};
use report::{ConsoleDiscoverySink, ConsoleRunSink};
use sink::DiscoveredTestCase;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    let args = CliArgs::parse_args();

    // 远程执行器的日志默认只输出警告，宿主会继承它的标准错误
    let default_level = if args.is_remote_executor() {
        "warn"
    } else {
        args.get_log_level()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: CliArgs) -> Result<ExitCode> {
    let CliArgs {
        config, command, ..
    } = args;

    match command {
        CliCommand::RemoteExecutor => {
            remote_executor::serve().context("Remote executor failed")?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Discover { modules } => {
            let (batch, runtime) = host(config.as_deref())?;
            runtime.block_on(discover(&batch, &modules));
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Run { modules, tests } => {
            let (batch, runtime) = host(config.as_deref())?;
            Ok(runtime.block_on(run_tests(&batch, &modules, &tests)))
        }
    }
}

/// 宿主侧的批次和异步运行时
fn host(config: Option<&Path>) -> Result<(TestBatch, tokio::runtime::Runtime)> {
    let config = Config::load(config)?;
    let batch = TestBatch::new(TestExecutor::new(config)?)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    Ok((batch, runtime))
}

async fn discover(batch: &TestBatch, modules: &[PathBuf]) {
    let sink = Arc::new(ConsoleDiscoverySink::new());
    batch.discover_tests(modules, sink.clone()).await;
    info!(
        "{} tests discovered, {} errors",
        sink.discovered(),
        sink.errors()
    );
}

async fn run_tests(batch: &TestBatch, modules: &[PathBuf], tests: &[String]) -> ExitCode {
    let sink = Arc::new(ConsoleRunSink::new());
    if tests.is_empty() {
        until_interrupted(batch, batch.run_sources(modules, sink.clone())).await;
    } else {
        // 每个模块都带上同一组名称，由框架在模块内按名称筛选
        let selected: Vec<DiscoveredTestCase> = batch
            .filter_sources(modules)
            .into_iter()
            .flat_map(|module| {
                tests
                    .iter()
                    .map(move |name| DiscoveredTestCase::synthetic(name, name, module))
            })
            .collect();
        until_interrupted(batch, batch.run_tests(selected, sink.clone())).await;
    }

    let summary = sink.summary();
    println!("{summary}");
    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Ctrl-C 取消批次中所有的运行，然后等待它们收尾
async fn until_interrupted<F: Future<Output = ()>>(batch: &TestBatch, work: F) {
    tokio::pin!(work);
    tokio::select! {
        _ = &mut work => {}
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    warn!("Interrupted, cancelling test runs");
                    batch.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {e}"),
            }
            work.await;
        }
    }
}
