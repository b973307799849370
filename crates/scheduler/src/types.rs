// types.rs
// 定义通用类型，如计算设备、检测框等辅助类型。
use serde::{Deserialize, Serialize};
use std::fmt;

/// 工作进程独占的计算设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    /// GPU设备ID
    Gpu(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "cuda:{}", id),
        }
    }
}

/// 单个检测结果（像素坐标的边界框、类别和置信度）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub label: String,
    pub score: f32,
}

// 默认的检测类别
pub const DEFAULT_LABEL: &str = "Tree";
