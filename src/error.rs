//! 远程执行器的错误类型
//!
//! 这些错误只存在于隔离上下文内部，越过边界时统一格式化成
//! `<模块路径>: <kind>: <错误>` 的一条错误消息。

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    /// 无法读取或解析模块文件
    #[error("cannot inspect {path}: {reason}")]
    Image { path: PathBuf, reason: String },

    /// 动态加载失败
    #[error("cannot load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// 框架中缺少所需的类型或成员
    #[error("type {type_name} has no member {member} (exported as {symbol})")]
    FrameworkVersionMismatch {
        type_name: String,
        member: String,
        symbol: String,
    },

    /// 框架拒绝创建实例
    #[error("{type_name}::new returned null")]
    Instantiate { type_name: String },

    /// 框架入口返回了非零状态
    #[error("{type_name}::{member} returned status {status}")]
    FrameworkStatus {
        type_name: String,
        member: String,
        status: i32,
    },

    /// 无法转换成 C 字符串的参数
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 回调中的 panic 在 FFI 边界被捕获
    #[error("callback panicked: {0}")]
    CallbackPanic(String),

    /// 与宿主之间的通道出错
    #[error(transparent)]
    Channel(#[from] io::Error),
}

impl ExecutionError {
    /// 稳定的错误类别名称，用在报告给宿主的消息里
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Image { .. } => "ImageError",
            ExecutionError::Load { .. } => "LoadError",
            ExecutionError::FrameworkVersionMismatch { .. } => "FrameworkVersionMismatch",
            ExecutionError::Instantiate { .. } => "InstantiateError",
            ExecutionError::FrameworkStatus { .. } => "FrameworkStatus",
            ExecutionError::InvalidArgument(_) => "InvalidArgument",
            ExecutionError::CallbackPanic(_) => "CallbackPanic",
            ExecutionError::Channel(_) => "ChannelError",
        }
    }

    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, ExecutionError::FrameworkVersionMismatch { .. })
    }
}

pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;
