// artifact.rs
// 结果文件：每个输入对应一个CSV表格，一行一个检测框，路径由输入引用确定性地推导。
use crate::error::{Error, Result};
use crate::types::Detection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const HEADER: [&str; 7] = ["xmin", "ymin", "xmax", "ymax", "label", "score", "image_path"];

/// 处理成功的任务产物，写入后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub task_id: String,
    pub input_reference: String,
    pub storage_path: PathBuf,
    /// 写入的检测框数量
    pub detections: usize,
}

/// CSV中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub label: String,
    pub score: f32,
    pub image_path: String,
}

/// 由输出目录和输入引用推导结果文件路径：`<output_dir>/<文件名去扩展名>.csv`
///
/// 同一输入总是得到同一路径，重复运行会覆盖而不是新增文件。
pub fn artifact_path(output_dir: &Path, input_reference: &str) -> PathBuf {
    let stem = Path::new(input_reference)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| input_reference.replace(['/', '\\'], "_"));
    output_dir.join(format!("{}.csv", stem))
}

/// 写入检测结果，已存在的文件会被覆盖；没有检测框时只写表头
///
/// 先写到同目录的临时文件再重命名，失败时目标路径保持原样，不会留下写了一半的文件。
pub fn write_detections(
    path: &Path,
    input_reference: &str,
    detections: &[Detection],
) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(&mut tmp);
    writer.write_record(HEADER)?;
    for d in detections {
        writer.serialize(DetectionRecord {
            xmin: d.xmin,
            ymin: d.ymin,
            xmax: d.xmax,
            ymax: d.ymax,
            label: d.label.clone(),
            score: d.score,
            image_path: input_reference.to_string(),
        })?;
    }
    writer.flush()?;
    drop(writer);

    // 失败时临时文件随 PersistError 一起被删除
    tmp.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}

/// 读回结果文件
pub fn read_detections(path: &Path) -> Result<Vec<DetectionRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}
