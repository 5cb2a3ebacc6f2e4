//! 隔离边界两侧之间的消息协议
//!
//! 宿主与远程执行器之间不共享任何对象，只交换按行分隔的 JSON 消息：
//!
//! ```text
//! host  --stdin-->  remote   RemoteRequest (第一行), 之后是 HostCommand
//! host  <--stdout-- remote   RemoteEvent (每行一个)
//! ```
//!
//! 所有负载都只由字符串、布尔值、整数和数组组成；框架的原生对象永远不会越过边界。

use crate::config::FrameworkConfig;
use serde::{Deserialize, Serialize};
use std::io;

/// 宿主发给远程执行器的第一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum RemoteRequest {
    Discover {
        target: RequestTarget,
        framework: FrameworkConfig,
    },
    Run {
        target: RequestTarget,
        framework: FrameworkConfig,
        /// 为空表示运行全部测试
        test_names: Vec<String>,
    },
}

impl RemoteRequest {
    pub fn target(&self) -> &RequestTarget {
        match self {
            RemoteRequest::Discover { target, .. } | RemoteRequest::Run { target, .. } => target,
        }
    }
}

/// 请求中关于测试模块的部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTarget {
    /// 原始路径，只用于报告
    pub display_path: String,
    /// 实际加载的路径（影子副本）
    pub load_path: String,
    /// 查找框架依赖的目录
    pub search_roots: Vec<String>,
}

/// 宿主在请求之后可以发送的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    Cancel,
}

/// 远程执行器发回的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RemoteEvent {
    Begin { path: String },
    Message { is_error: bool, text: String },
    Progress { payload: ProgressPayload },
    Finished { path: String },
}

impl RemoteEvent {
    /// 把事件转交给蹦床
    pub fn dispatch(self, trampoline: &mut dyn SinkTrampoline) -> io::Result<()> {
        match self {
            RemoteEvent::Begin { path } => trampoline.begin(&path),
            RemoteEvent::Message { is_error, text } => trampoline.message(is_error, &text),
            RemoteEvent::Progress { payload } => trampoline.progress(payload),
            RemoteEvent::Finished { path } => trampoline.finished(&path),
        }
    }
}

/// Flat ordered tuples carried by `progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "tuple", rename_all = "snake_case")]
pub enum ProgressPayload {
    Discovered(DiscoveredTuple),
    Result(ResultTuple),
}

/// (fully qualified name, symbol name, display name)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTuple(pub String, pub String, pub String);

/// (exception type, message, stack trace)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionTuple(pub String, pub String, pub String);

/// (fully qualified name, symbol name, display name, exceptions,
///  skip messages, failure messages, duration in nanoseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultTuple(
    pub String,
    pub String,
    pub String,
    pub Vec<ExceptionTuple>,
    pub Vec<String>,
    pub Vec<String>,
    pub u64,
);

/// Boundary callback interface, implemented on both sides.
///
/// Inside the isolated context it is the channel back to the host; on the
/// host it rebuilds typed results and forwards them to the host sink.
pub trait SinkTrampoline: Send {
    fn begin(&mut self, path: &str) -> io::Result<()>;
    fn message(&mut self, is_error: bool, text: &str) -> io::Result<()>;
    fn progress(&mut self, payload: ProgressPayload) -> io::Result<()>;
    fn finished(&mut self, path: &str) -> io::Result<()>;
}

/// 把一个值编码成一行 JSON（包含结尾的换行符）
pub fn encode_line<T: Serialize>(value: &T) -> io::Result<String> {
    let mut line = serde_json::to_string(value).map_err(io::Error::other)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_wire_shape() {
        let event = RemoteEvent::Progress {
            payload: ProgressPayload::Discovered(DiscoveredTuple(
                "math.adds".into(),
                "math.adds".into(),
                "adds".into(),
            )),
        };
        let line = encode_line(&event).unwrap();
        assert_eq!(
            line,
            "{\"event\":\"progress\",\"payload\":{\"kind\":\"discovered\",\"tuple\":[\"math.adds\",\"math.adds\",\"adds\"]}}\n"
        );
    }

    #[test]
    fn test_result_event_from_hand_written_json() {
        let line = r#"{"event":"progress","payload":{"kind":"result","tuple":["m.t","m.t","t",[["Panic","boom","at m.rs:3"]],[],[],1500]}}"#;
        let event: RemoteEvent = serde_json::from_str(line).unwrap();
        match event {
            RemoteEvent::Progress {
                payload: ProgressPayload::Result(ResultTuple(name, _, _, exceptions, skips, _, nanos)),
            } => {
                assert_eq!(name, "m.t");
                assert_eq!(exceptions[0].1, "boom");
                assert!(skips.is_empty());
                assert_eq!(nanos, 1500);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_cancel_command() {
        let command: HostCommand = serde_json::from_str(r#"{"command":"cancel"}"#).unwrap();
        assert_eq!(command, HostCommand::Cancel);
    }
}
