//! 跨越隔离边界的取消
//!
//! 宿主侧：`CancellationBridge` 订阅宿主的 `CancellationToken`，
//! 取消时通过 `RemoteCancellationSink` 通知远程执行器。
//! 远程侧：`listen_for_cancellation` 从宿主命令流中读取取消命令，
//! 并取消执行器内部使用的 token。

use crate::protocol::{HostCommand, encode_line};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::io::BufRead;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 远程执行器一侧可以被取消的东西
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteCancellationSink: Send + 'static {
    async fn cancel(&mut self) -> Result<()>;
}

/// 通过子进程的标准输入发送取消命令
pub struct ChildStdinCancellationSink {
    stdin: ChildStdin,
}

impl ChildStdinCancellationSink {
    pub fn new(stdin: ChildStdin) -> Self {
        Self { stdin }
    }
}

#[async_trait]
impl RemoteCancellationSink for ChildStdinCancellationSink {
    async fn cancel(&mut self) -> Result<()> {
        let line = encode_line(&HostCommand::Cancel)?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .context("Failed to send cancel command")?;
        self.stdin.flush().await?;
        Ok(())
    }
}

/// 宿主 token 与远程取消之间的桥，drop 时取消订阅
pub struct CancellationBridge {
    task: JoinHandle<()>,
}

impl CancellationBridge {
    pub fn register<S: RemoteCancellationSink>(token: CancellationToken, mut sink: S) -> Self {
        let task = tokio::spawn(async move {
            token.cancelled().await;
            debug!("Cancellation requested, notifying remote executor");
            // 远程执行器可能已经退出
            if let Err(e) = sink.cancel().await {
                debug!("Ignoring failed remote cancellation: {e:#}");
            }
        });
        Self { task }
    }
}

impl Drop for CancellationBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 在远程执行器中读取宿主命令，直到输入结束
pub fn listen_for_cancellation<R: BufRead>(reader: R, token: CancellationToken) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Host command stream closed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HostCommand>(&line) {
            Ok(HostCommand::Cancel) => {
                debug!("Cancel command received");
                token.cancel();
            }
            Err(e) => warn!("Unrecognized host command {line:?}: {e}"),
        }
    }
}
