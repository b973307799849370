// model.rs
// 检测模型的外部协作接口：按模型标识加载模型句柄，对单个输入执行推理。
// 另提供一个确定性的模拟检测器，便于在没有真实模型时端到端运行调度框架。
use crate::config::PredictOptions;
use crate::error::{Error, Result};
use crate::types::{Detection, Device, DEFAULT_LABEL};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::time::Duration;

/// 已加载、可直接推理的模型句柄，由单个工作进程独占
pub trait DetectionModel: Send {
    /// 对一个输入执行推理，返回结构化的检测结果
    fn predict(&mut self, input: &Path, options: &PredictOptions) -> Result<Vec<Detection>>;
}

/// 模型加载能力，失败时返回 `Error::Load`
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_id: &str, device: &Device) -> Result<Box<dyn DetectionModel>>;
}

/// 模拟检测器的加载器
#[derive(Debug, Clone, Default)]
pub struct SimulatedLoader {
    /// 每次推理的模拟耗时
    pub latency: Duration,
}

impl SimulatedLoader {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl ModelLoader for SimulatedLoader {
    fn load(&self, model_id: &str, device: &Device) -> Result<Box<dyn DetectionModel>> {
        if model_id.trim().is_empty() {
            return Err(Error::Load("模型标识为空".to_string()));
        }
        tracing::debug!(model_id, %device, "加载模拟检测模型");
        Ok(Box::new(SimulatedModel {
            device: *device,
            latency: self.latency,
        }))
    }
}

/// 模拟检测器：检测结果只取决于输入路径，同一输入总是得到相同结果
#[derive(Debug)]
pub struct SimulatedModel {
    device: Device,
    latency: Duration,
}

impl SimulatedModel {
    pub fn device(&self) -> Device {
        self.device
    }
}

impl DetectionModel for SimulatedModel {
    fn predict(&mut self, input: &Path, options: &PredictOptions) -> Result<Vec<Detection>> {
        if !input.is_file() {
            return Err(Error::Execution(format!("输入文件不存在: {}", input.display())));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut rng = StdRng::seed_from_u64(seed_for(&input.to_string_lossy()));
        let extent = options.patch_size as f32;
        let count = rng.gen_range(0..=12);
        let detections = (0..count)
            .map(|_| {
                let width = rng.gen_range(5.0..60.0f32);
                let height = rng.gen_range(5.0..60.0f32);
                let xmin = rng.gen_range(0.0..(extent - width).max(1.0));
                let ymin = rng.gen_range(0.0..(extent - height).max(1.0));
                Detection {
                    xmin,
                    ymin,
                    xmax: xmin + width,
                    ymax: ymin + height,
                    label: DEFAULT_LABEL.to_string(),
                    score: rng.gen_range(0.0..1.0f32),
                }
            })
            .collect();
        Ok(detections)
    }
}

// FNV-1a，保证跨进程、跨版本稳定
fn seed_for(reference: &str) -> u64 {
    reference.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
