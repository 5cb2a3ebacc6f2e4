//! 隔离的执行上下文
//!
//! 每个测试模块的每次发现/运行都使用一个新的上下文：一个临时的暂存目录
//! （模块、同目录的动态库和执行器程序的影子副本）加上在其中启动的远程执行器子进程。
//! 上下文结束时子进程被杀掉，暂存目录被删除，不论之前发生了什么。

use crate::config::ExecutorConfig;
use crate::config::cli_args::REMOTE_EXECUTOR_ENTRY;
use crate::protocol::RequestTarget;
use crate::utils::{self, LIBRARY_PATH_VAR};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tempfile::TempDir;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// 在上下文中启动的程序
#[derive(Debug, Clone)]
pub struct RemoteProgram {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// 是否把程序本身也复制到暂存目录
    pub stage: bool,
}

impl RemoteProgram {
    /// 当前可执行文件的 `__remote-executor` 子命令
    pub fn current_exe() -> Result<Self> {
        let program = env::current_exe().context("Cannot locate the isotest executable")?;
        Ok(Self {
            program,
            args: vec![REMOTE_EXECUTOR_ENTRY.to_string()],
            stage: true,
        })
    }
}

/// 模块旁边的 `<模块>.config`
#[derive(Debug, Default, Deserialize)]
struct ModuleConfigFile {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

pub struct IsolatedContext {
    display_path: String,
    load_path: PathBuf,
    search_roots: Vec<PathBuf>,
    env: BTreeMap<String, String>,
    program: PathBuf,
    args: Vec<String>,
    staging: TempDir,
    child: Option<Child>,
}

impl IsolatedContext {
    pub fn create(
        module_path: &Path,
        remote: &RemoteProgram,
        config: &ExecutorConfig,
    ) -> Result<Self> {
        let target = fs::canonicalize(module_path)
            .with_context(|| format!("Test module not found: {}", module_path.display()))?;
        let base_path = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("{} has no parent directory", target.display()))?;
        let file_name = target
            .file_name()
            .ok_or_else(|| anyhow!("{} is not a file", target.display()))?
            .to_os_string();

        let staging = tempfile::Builder::new()
            .prefix("isotest-")
            .tempdir()
            .context("Failed to create staging directory")?;
        debug!(
            "Creating context for {} in {}",
            target.display(),
            staging.path().display()
        );

        let load_path = if config.shadow_copy {
            shadow_copy_module(&target, &base_path, staging.path())?;
            staging.path().join(&file_name)
        } else {
            target.clone()
        };

        let mut search_roots = Vec::new();
        if config.shadow_copy {
            search_roots.push(staging.path().to_path_buf());
        }
        search_roots.push(base_path);

        let config_path = utils::sibling_config_path(&target);
        let env = if config_path.is_file() {
            debug!("Applying configuration file {}", config_path.display());
            let module_config: ModuleConfigFile = utils::read_toml_from_file(&config_path)?;
            module_config.env
        } else {
            BTreeMap::new()
        };

        let program = if remote.stage && config.shadow_copy {
            let name = remote
                .program
                .file_name()
                .ok_or_else(|| anyhow!("Invalid executor path {}", remote.program.display()))?;
            let staged = staging.path().join(name);
            fs::copy(&remote.program, &staged).with_context(|| {
                format!("Failed to stage executor {}", remote.program.display())
            })?;
            staged
        } else {
            remote.program.clone()
        };

        Ok(Self {
            display_path: module_path.display().to_string(),
            load_path,
            search_roots,
            env,
            program,
            args: remote.args.clone(),
            staging,
            child: None,
        })
    }

    pub fn id(&self) -> String {
        self.staging
            .path()
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn load_path(&self) -> &Path {
        &self.load_path
    }

    pub fn search_roots(&self) -> &[PathBuf] {
        &self.search_roots
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// 发给远程执行器的目标描述
    pub fn target(&self) -> RequestTarget {
        RequestTarget {
            display_path: self.display_path.clone(),
            load_path: self.load_path.to_string_lossy().into_owned(),
            search_roots: self
                .search_roots
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        }
    }

    /// 启动远程执行器，返回它的标准输入和标准输出
    pub fn spawn(&mut self) -> Result<(ChildStdin, ChildStdout)> {
        if self.child.is_some() {
            return Err(anyhow!("Context {} is already running", self.id()));
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(self.staging.path())
            .env(LIBRARY_PATH_VAR, self.library_path()?)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program.display()))?;
        info!(
            "Context {}: started remote executor (pid {:?}) for {}",
            self.id(),
            child.id(),
            self.display_path
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Remote executor has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Remote executor has no stdout"))?;
        self.child = Some(child);
        Ok((stdin, stdout))
    }

    /// 等待远程执行器退出
    pub async fn wait_remote(&mut self) -> Result<ExitStatus> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| anyhow!("Remote executor was not started"))?;
        let status = child.wait().await?;
        debug!("Context {}: remote executor exited with {status}", self.id());
        Ok(status)
    }

    /// 销毁上下文：杀掉仍在运行的执行器并删除暂存目录
    pub async fn dispose(mut self) {
        let id = self.id();
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    debug!("Context {id}: killing remote executor");
                    if let Err(e) = child.kill().await {
                        warn!("Context {id}: failed to kill remote executor: {e}");
                    }
                }
            }
        }
        let staging = self.staging.path().to_path_buf();
        if let Err(e) = self.staging.close() {
            warn!(
                "Context {id}: failed to remove {}: {e}",
                staging.display()
            );
        }
        debug!("Context {id}: disposed");
    }

    fn library_path(&self) -> Result<OsString> {
        let mut paths = self.search_roots.clone();
        if let Some(existing) = env::var_os(LIBRARY_PATH_VAR) {
            paths.extend(env::split_paths(&existing));
        }
        env::join_paths(paths).context("Search roots contain an invalid path")
    }
}

/// 复制模块本身、同目录的动态库以及模块的配置文件
fn shadow_copy_module(target: &Path, base_path: &Path, staging: &Path) -> Result<()> {
    let mut copied = 0usize;
    for entry in fs::read_dir(base_path)
        .with_context(|| format!("Cannot read {}", base_path.display()))?
    {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {e}", base_path.display());
                continue;
            }
        };
        if path == target || !path.is_file() || !utils::is_shared_library(&path) {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        // 依赖复制失败不致命，加载时还会回到原目录查找
        match fs::copy(&path, staging.join(name)) {
            Ok(_) => copied += 1,
            Err(e) => warn!("Failed to shadow copy {}: {e}", path.display()),
        }
    }

    let name = target
        .file_name()
        .ok_or_else(|| anyhow!("{} is not a file", target.display()))?;
    fs::copy(target, staging.join(name))
        .with_context(|| format!("Failed to shadow copy {}", target.display()))?;

    let config_path = utils::sibling_config_path(target);
    if config_path.is_file() {
        if let Some(config_name) = config_path.file_name() {
            fs::copy(&config_path, staging.join(config_name))?;
        }
    }

    debug!(
        "Shadow copied {} and {copied} sibling libraries to {}",
        target.display(),
        staging.display()
    );
    Ok(())
}
