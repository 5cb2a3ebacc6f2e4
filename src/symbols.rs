//! 源码符号信息
//!
//! 从测试模块的调试信息（DWARF 行表）中恢复每个函数对应的源文件与行列范围，
//! 发现阶段用它把测试用例关联到源码位置。读取失败不是错误，只会得到一张空表。

use addr2line::object::{self, Object, ObjectSymbol, SymbolKind};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// 一个符号在源码中的位置
#[derive(Debug, Clone)]
pub struct SymbolInformation {
    /// `path.to.Type.member`
    pub symbol_name: String,
    pub file_name: String,
    pub min_line: u32,
    pub max_line: u32,
    pub min_column: u32,
    pub max_column: u32,
}

impl SymbolInformation {
    pub fn new(
        symbol_name: impl Into<String>,
        file_name: impl Into<String>,
        min_line: u32,
        max_line: u32,
        min_column: u32,
        max_column: u32,
    ) -> Self {
        Self {
            symbol_name: symbol_name.into(),
            file_name: file_name.into(),
            min_line,
            max_line,
            min_column,
            max_column,
        }
    }
}

// 文件名比较不区分大小写
impl PartialEq for SymbolInformation {
    fn eq(&self, other: &Self) -> bool {
        self.symbol_name == other.symbol_name
            && self.file_name.to_lowercase() == other.file_name.to_lowercase()
            && self.min_line == other.min_line
            && self.min_column == other.min_column
            && self.max_line == other.max_line
            && self.max_column == other.max_column
    }
}

impl Eq for SymbolInformation {}

impl Hash for SymbolInformation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.symbol_name.hash(state);
        self.file_name.to_lowercase().hash(state);
        self.min_line.hash(state);
    }
}

impl fmt::Display for SymbolInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = Path::new(&self.file_name)
            .file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_else(|| self.file_name.as_str().into());
        write!(
            f,
            "{}({},{}): {}",
            file, self.min_line, self.min_column, self.symbol_name
        )
    }
}

/// 把（可能经过 mangle 的）符号名转换成 `path.to.Type.member`
pub fn qualify_symbol_name(raw: &str) -> String {
    let demangled = match rustc_demangle::try_demangle(raw) {
        Ok(d) => format!("{d:#}"),
        Err(_) => raw.to_string(),
    };
    demangled.replace("::", ".")
}

/// 读取模块中所有能定位到源码的函数符号
///
/// 同名符号出现多次时后出现的覆盖先出现的；任何读取失败都返回空表。
pub fn resolve(module_path: &Path) -> HashMap<String, SymbolInformation> {
    match try_resolve(module_path) {
        Ok(symbols) => {
            debug!(
                "Resolved {} symbols from {}",
                symbols.len(),
                module_path.display()
            );
            symbols
        }
        Err(e) => {
            warn!(
                "No debug symbols available for {}: {e}",
                module_path.display()
            );
            HashMap::new()
        }
    }
}

fn try_resolve(module_path: &Path) -> anyhow::Result<HashMap<String, SymbolInformation>> {
    let data = fs::read(module_path)?;
    let file = object::File::parse(&*data)?;
    let context = addr2line::Context::new(&file)?;

    let mut symbols = HashMap::new();
    for symbol in file.symbols() {
        if symbol.kind() != SymbolKind::Text || !symbol.is_definition() || symbol.size() == 0 {
            continue;
        }
        let Ok(raw_name) = symbol.name() else {
            continue;
        };

        let start = symbol.address();
        let end = start + symbol.size();
        let Some(info) = locate(&context, raw_name, start, end) else {
            continue;
        };

        if let Some(previous) = symbols.insert(info.symbol_name.clone(), info) {
            debug!("Duplicate symbol {}, replacing {previous}", previous.symbol_name);
        }
    }
    Ok(symbols)
}

fn locate<R: addr2line::gimli::Reader>(
    context: &addr2line::Context<R>,
    raw_name: &str,
    start: u64,
    end: u64,
) -> Option<SymbolInformation> {
    let rows: Vec<(String, u32, u32)> = context
        .find_location_range(start, end)
        .ok()?
        .filter_map(|(_, _, location)| {
            Some((
                location.file?.to_string(),
                location.line?,
                location.column.unwrap_or(0),
            ))
        })
        .collect();

    // 行号为 0 的行是编译器生成的隐藏代码
    let (file, min_line, min_column) = rows.iter().find(|(_, line, _)| *line != 0)?.clone();

    let (max_line, max_column) = rows
        .iter()
        .filter(|(f, line, _)| *f == file && *line != 0)
        .fold((min_line, min_column), |(ml, mc), (_, line, column)| {
            (ml.max(*line), mc.max(*column))
        });

    Some(SymbolInformation::new(
        qualify_symbol_name(raw_name),
        file,
        min_line,
        max_line,
        min_column,
        max_column,
    ))
}
