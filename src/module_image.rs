//! 读取测试模块的文件头
//!
//! 只关心两件事：模块声明依赖了哪些动态库，以及它导出了哪些符号。
//! 支持 ELF、PE 和单架构的 Mach-O。

use crate::error::{ExecutionError, ExecutionResult};
use goblin::Object;
use goblin::mach::Mach;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleImage {
    pub path: PathBuf,
    /// 声明的依赖，按文件中的顺序
    pub dependencies: Vec<String>,
    pub exports: HashSet<String>,
}

impl ModuleImage {
    pub fn read(path: &Path) -> ExecutionResult<Self> {
        let bytes = fs::read(path).map_err(|e| image_error(path, e))?;
        Self::parse(path, &bytes)
    }

    pub fn parse(path: &Path, bytes: &[u8]) -> ExecutionResult<Self> {
        let object = Object::parse(bytes).map_err(|e| image_error(path, e))?;

        let (dependencies, exports) = match object {
            Object::Elf(elf) => {
                let dependencies = elf.libraries.iter().map(|s| s.to_string()).collect();
                let exports = elf
                    .dynsyms
                    .iter()
                    .filter(|sym| !sym.is_import() && sym.st_value != 0)
                    .filter_map(|sym| elf.dynstrtab.get_at(sym.st_name))
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
                (dependencies, exports)
            }
            Object::PE(pe) => {
                let dependencies = pe.libraries.iter().map(|s| s.to_string()).collect();
                let exports = pe
                    .exports
                    .iter()
                    .filter_map(|e| e.name)
                    .map(str::to_string)
                    .collect();
                (dependencies, exports)
            }
            Object::Mach(Mach::Binary(macho)) => {
                // libs[0] 是 "self"
                let dependencies = macho
                    .libs
                    .iter()
                    .filter(|lib| **lib != "self")
                    .map(|s| s.to_string())
                    .collect();
                let exports = macho
                    .exports()
                    .map_err(|e| image_error(path, e))?
                    .into_iter()
                    .map(|e| e.name.strip_prefix('_').unwrap_or(&e.name).to_string())
                    .collect();
                (dependencies, exports)
            }
            Object::Mach(Mach::Fat(_)) => {
                return Err(image_error(path, "universal binaries are not supported"));
            }
            _ => return Err(image_error(path, "not a shared library")),
        };

        Ok(Self {
            path: path.to_path_buf(),
            dependencies,
            exports,
        })
    }

    pub fn exports_symbol(&self, name: &str) -> bool {
        self.exports.contains(name)
    }
}

fn image_error(path: &Path, reason: impl ToString) -> ExecutionError {
    ExecutionError::Image {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
