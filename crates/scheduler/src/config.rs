// config.rs
// 调度器全局配置结构体及其默认实现，包含进程池规模、单进程资源请求、重试策略、推理参数和可用GPU列表。
use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 单个工作进程向集群申请的资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// 每个进程独占的加速器数量，0 表示只用CPU
    pub accelerators: u32,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    /// 墙钟时间上限（秒），到期后进程在当前任务结束时退出
    pub walltime_secs: Option<u64>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            accelerators: 0,
            cpu_cores: 1,
            memory_mb: 2048,
            walltime_secs: None,
        }
    }
}

/// 进程池配置：目标规模和每个进程的资源请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub resources: ResourceRequest,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resources: ResourceRequest::default(),
        }
    }
}

/// 显式的重试策略
///
/// 默认不重试（`max_attempts = 1`）。只有可重试的推理错误才会触发重试，
/// 每次等待 `backoff_ms * 已尝试次数` 再加少量随机抖动。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms.saturating_mul(attempt as u64);
        let jitter = if self.backoff_ms >= 4 {
            rand::thread_rng().gen_range(0..=self.backoff_ms / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

/// 原样透传给检测模型的推理参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
    /// 大影像切块的边长（像素）
    pub patch_size: u32,
    /// 相邻切块的重叠比例
    pub patch_overlap: f32,
    /// 合并切块结果时的NMS阈值
    pub iou_threshold: f32,
    /// 写入结果文件前过滤的最低置信度
    pub score_threshold: f32,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            patch_size: 400,
            patch_overlap: 0.05,
            iou_threshold: 0.15,
            score_threshold: 0.1,
        }
    }
}

/// 调度器全局配置
///
/// 在构造每个工作进程时显式传入，不使用进程级的全局状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 模型标识，交给 `ModelLoader` 解析
    pub model_id: String,
    /// 结果文件输出目录
    pub output_dir: PathBuf,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub predict: PredictOptions,
    /// 看门狗超时（毫秒），为空时等待结果会无限阻塞
    pub watchdog_ms: Option<u64>,
    /// 工作进程崩溃后允许重新加载模型的次数
    pub max_worker_restarts: u32,
    /// 本机可用GPU设备ID列表
    pub gpu_ids: Vec<i32>,
    /// 本机可分配的CPU核数，为空时自动探测
    pub cpu_cores: Option<u32>,
    /// 本机可分配的内存（MB），为空时不检查
    pub memory_mb: Option<u64>,
}

impl Default for SchedulerConfig {
    /// 默认配置：2个纯CPU工作进程，不重试，不启用看门狗
    fn default() -> Self {
        Self {
            model_id: "weecology/deepforest-tree".to_string(),
            output_dir: PathBuf::from("predictions"),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            predict: PredictOptions::default(),
            watchdog_ms: None,
            max_worker_restarts: 0,
            gpu_ids: Vec::new(),
            cpu_cores: None,
            memory_mb: None,
        }
    }
}

impl SchedulerConfig {
    /// 从JSON配置文件读取，缺省字段使用默认值
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        let config: SchedulerConfig = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("解析配置文件 {} 失败: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值范围
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(Error::Config("进程池规模必须大于0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts 必须至少为1".to_string()));
        }
        if self.model_id.trim().is_empty() {
            return Err(Error::Config("model_id 不能为空".to_string()));
        }
        let p = &self.predict;
        if !(0.0..1.0).contains(&p.patch_overlap) {
            return Err(Error::Config(format!(
                "patch_overlap {} 超出范围 [0, 1)", p.patch_overlap
            )));
        }
        let thresholds = [
            ("iou_threshold", p.iou_threshold),
            ("score_threshold", p.score_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} {} 超出范围 [0, 1]", name, value)));
            }
        }
        if p.patch_size == 0 {
            return Err(Error::Config("patch_size 必须大于0".to_string()));
        }
        Ok(())
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }
}
