//! 配置模块
//!
//! 命令行参数、框架绑定参数以及执行器参数都在这里定义

pub mod cli_args;
pub mod executor_config;
pub mod framework_config;
pub mod root_config;

pub use executor_config::ExecutorConfig;
pub use framework_config::FrameworkConfig;
pub use root_config::Config;
