use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// 远程执行器入口名称，宿主进程按这个名称在隔离上下文中启动自身
pub const REMOTE_EXECUTOR_ENTRY: &str = "__remote-executor";

// isotest - 在隔离的执行器中发现并运行原生测试模块
#[derive(Parser, Debug)]
#[clap(
    name = "isotest",
    version,
    about = "Discover and run native test modules in disposable, isolated executors",
    after_help = "EXAMPLES:\n  isotest discover target/debug/libmath_tests.so\n  isotest run target/debug/libmath_tests.so target/debug/libio_tests.so\n  isotest run target/debug/libmath_tests.so --test math.adds_numbers\n  isotest --config isotest.toml -v run target/debug/*.so"
)]
pub struct CliArgs {
    // Verbose mode - Show more log information
    // 详细模式 - 显示更多日志信息
    #[clap(short = 'v', long = "verbose", global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    // Quiet mode - Only show errors
    // 安静模式 - 只显示错误
    #[clap(short = 'q', long = "quiet", global = true, help = "Suppress non-essential output")]
    pub quiet: bool,

    // Config file - Framework binding and executor settings
    // 配置文件 - 框架绑定与执行器设置
    #[clap(long = "config", global = true, help = "Configuration file (default: ./isotest.toml if present)")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Discover tests in the given test modules
    Discover {
        // 测试模块路径
        #[clap(required = true, help = "Test module paths")]
        modules: Vec<PathBuf>,
    },
    /// Run tests in the given test modules
    Run {
        #[clap(required = true, help = "Test module paths")]
        modules: Vec<PathBuf>,

        // 只运行指定的测试（完全限定名），可重复
        #[clap(long = "test", short = 't', help = "Fully qualified test name to run (repeatable)")]
        tests: Vec<String>,
    },
    /// Internal: serve one request inside an isolated context
    #[clap(name = "__remote-executor", hide = true)]
    RemoteExecutor,
}

impl CliArgs {
    /// Parse command line arguments
    /// 解析命令行参数
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get log level
    /// 获取日志级别
    pub fn get_log_level(&self) -> &str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// 是否以远程执行器身份运行
    pub fn is_remote_executor(&self) -> bool {
        matches!(self.command, CliCommand::RemoteExecutor)
    }
}
