// inputs.rs
// 运行前一次性枚举输入列表：列表文件（每行一个路径）或目录（按扩展名过滤，排序）。
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// 从列表文件或目录读取输入引用
///
/// 列表文件中的空行和以 `#` 开头的行被忽略；目录只扫描一层。
pub fn load_inputs(source: &Path, extension: &str) -> Result<Vec<String>> {
    let inputs = if source.is_dir() {
        scan_dir(source, extension)?
    } else {
        read_list(source)?
    };
    if inputs.is_empty() {
        return Err(Error::InvalidInput(format!("{} 中没有任何输入", source.display())));
    }
    Ok(inputs)
}

fn scan_dir(dir: &Path, extension: &str) -> Result<Vec<String>> {
    let wanted = extension.trim_start_matches('.');
    let mut inputs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted))
            .unwrap_or(false);
        if matches {
            inputs.push(path.to_string_lossy().into_owned());
        }
    }
    inputs.sort();
    Ok(inputs)
}

fn read_list(file: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(file)
        .map_err(|e| Error::InvalidInput(format!("无法读取输入列表 {}: {}", file.display(), e)))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
