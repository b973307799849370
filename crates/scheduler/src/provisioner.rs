// provisioner.rs
// 进程池资源分配：按每个进程的资源请求划分加速器、CPU和内存，加速器与进程一一对应，不超分。
use crate::config::{PoolConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::types::Device;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// 分配给单个工作进程的资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: usize,
    /// 该进程独占的设备，纯CPU进程为空
    pub devices: Vec<Device>,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub walltime: Option<Duration>,
}

impl WorkerSlot {
    /// 模型加载所用的设备
    pub fn primary_device(&self) -> Device {
        self.devices.first().copied().unwrap_or(Device::Cpu)
    }
}

/// 外部作业队列的抽象：按进程池配置分配资源，分配失败时在提交任何任务前返回错误
pub trait Provisioner {
    fn provision(&self, pool: &PoolConfig) -> Result<Vec<WorkerSlot>>;
}

/// 在本机上划分资源的分配器
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    gpu_ids: Vec<i32>,
    cpu_cores: u32,
    memory_mb: Option<u64>,
}

impl LocalProvisioner {
    pub fn new(gpu_ids: Vec<i32>, cpu_cores: u32, memory_mb: Option<u64>) -> Self {
        Self {
            gpu_ids,
            cpu_cores,
            memory_mb,
        }
    }

    /// 按调度器配置描述的本机资源创建，未配置CPU核数时自动探测
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let cpu_cores = config.cpu_cores.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        });
        Self::new(config.gpu_ids.clone(), cpu_cores, config.memory_mb)
    }
}

impl Provisioner for LocalProvisioner {
    fn provision(&self, pool: &PoolConfig) -> Result<Vec<WorkerSlot>> {
        let request = &pool.resources;
        if pool.workers == 0 {
            return Err(Error::ResourceProvision("进程池规模为0".to_string()));
        }

        let unique: HashSet<i32> = self.gpu_ids.iter().copied().collect();
        if unique.len() != self.gpu_ids.len() {
            return Err(Error::ResourceProvision(format!(
                "GPU列表 {:?} 含有重复设备，无法一一独占", self.gpu_ids
            )));
        }

        let needed_gpus = pool.workers * request.accelerators as usize;
        if needed_gpus > self.gpu_ids.len() {
            return Err(Error::ResourceProvision(format!(
                "需要 {} 个加速器（{} 个进程 x {}），仅有 {} 个可用",
                needed_gpus,
                pool.workers,
                request.accelerators,
                self.gpu_ids.len()
            )));
        }

        let needed_cores = pool.workers as u64 * request.cpu_cores as u64;
        if needed_cores > self.cpu_cores as u64 {
            return Err(Error::ResourceProvision(format!(
                "需要 {} 个CPU核，仅有 {} 个可用", needed_cores, self.cpu_cores
            )));
        }

        if let Some(total) = self.memory_mb {
            let needed = pool.workers as u64 * request.memory_mb;
            if needed > total {
                return Err(Error::ResourceProvision(format!(
                    "需要 {}MB 内存，仅有 {}MB 可用", needed, total
                )));
            }
        }

        let per_worker = request.accelerators as usize;
        let slots: Vec<WorkerSlot> = (0..pool.workers)
            .map(|worker_id| WorkerSlot {
                worker_id,
                devices: self.gpu_ids[worker_id * per_worker..(worker_id + 1) * per_worker]
                    .iter()
                    .map(|&id| Device::Gpu(id))
                    .collect(),
                cpu_cores: request.cpu_cores,
                memory_mb: request.memory_mb,
                walltime: request.walltime_secs.map(Duration::from_secs),
            })
            .collect();

        tracing::info!(
            workers = slots.len(),
            accelerators_per_worker = request.accelerators,
            cpu_cores_per_worker = request.cpu_cores,
            "进程池资源分配完成"
        );
        Ok(slots)
    }
}
