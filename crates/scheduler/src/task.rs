// task.rs
// 任务单元与工作函数：任务单元只描述“处理哪个输入、用哪个函数处理”，创建后不可变。
use crate::artifact::{self, Artifact};
use crate::error::Result;
use crate::model::DetectionModel;
use crate::worker::WorkerContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// 任务状态枚举，描述任务的生命周期
///
/// 只允许 `Pending -> Running -> {Completed, Failed}` 单向前进，
/// 未开始的任务被取消时直接进入 `Failed`。终态不再变化。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 等待执行
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Completed,
    /// 执行失败，包含失败原因
    Failed(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed(_))
    }
}

/// 工作函数：在工作进程内用已加载的模型处理一个任务单元
pub trait WorkerFunction: Send + Sync {
    fn run(
        &self,
        model: &mut dyn DetectionModel,
        unit: &TaskUnit,
        ctx: &WorkerContext,
    ) -> Result<Artifact>;
}

/// 默认工作函数：推理一个切片，按置信度过滤后写成CSV结果文件
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictTile;

impl WorkerFunction for PredictTile {
    fn run(
        &self,
        model: &mut dyn DetectionModel,
        unit: &TaskUnit,
        ctx: &WorkerContext,
    ) -> Result<Artifact> {
        let options = &ctx.config.predict;
        let detections: Vec<_> = model
            .predict(Path::new(unit.input_reference()), options)?
            .into_iter()
            .filter(|d| d.score >= options.score_threshold)
            .collect();

        let storage_path = artifact::artifact_path(&ctx.config.output_dir, unit.input_reference());
        artifact::write_detections(&storage_path, unit.input_reference(), &detections)?;

        Ok(Artifact {
            task_id: unit.task_id().to_string(),
            input_reference: unit.input_reference().to_string(),
            storage_path,
            detections: detections.len(),
        })
    }
}

/// 任务单元：输入引用加工作函数引用
#[derive(Clone)]
pub struct TaskUnit {
    task_id: String,
    input_reference: String,
    worker_fn: Arc<dyn WorkerFunction>,
}

impl TaskUnit {
    pub fn new(
        task_id: impl Into<String>,
        input_reference: impl Into<String>,
        worker_fn: Arc<dyn WorkerFunction>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            input_reference: input_reference.into(),
            worker_fn,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn input_reference(&self) -> &str {
        &self.input_reference
    }

    pub fn worker_fn(&self) -> &dyn WorkerFunction {
        self.worker_fn.as_ref()
    }
}

impl fmt::Debug for TaskUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskUnit")
            .field("task_id", &self.task_id)
            .field("input_reference", &self.input_reference)
            .finish_non_exhaustive()
    }
}
