// error.rs
// 定义调度框架通用的错误类型（模型加载、推理、资源分配、挂起超时等）和Result类型。
use serde::Serializer;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// 调度框架通用错误类型
///
/// 错误需要在多个 `TaskFuture` 句柄之间共享，因此不可克隆的底层错误统一用 `Arc` 包装。
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// IO错误
    #[error("IO错误: {0}")]
    Io(Arc<io::Error>),
    /// 结果文件写入错误
    #[error("CSV错误: {0}")]
    Csv(Arc<csv::Error>),
    /// 配置或报告的JSON解析错误
    #[error("JSON错误: {0}")]
    Json(Arc<serde_json::Error>),
    /// 模型加载错误，对所在工作进程是致命的
    #[error("模型加载错误: {0}")]
    Load(String),
    /// 单个输入的推理阶段错误
    #[error("推理错误: {0}")]
    Execution(String),
    /// 外部调度器无法分配所需的工作进程池
    #[error("资源分配错误: {0}")]
    ResourceProvision(String),
    /// 看门狗判定任务挂起
    #[error("任务挂起超时: 已运行 {elapsed_ms}ms 仍未结束")]
    HangTimeout { elapsed_ms: u64 },
    /// 工作进程在执行任务时崩溃
    #[error("工作进程崩溃: {0}")]
    WorkerCrashed(String),
    /// 任务在开始执行前被取消
    #[error("任务已取消")]
    Cancelled,
    /// 进程池中已没有存活的工作进程
    #[error("没有存活的工作进程可以执行该任务")]
    NoLiveWorkers,
    /// 非法的任务输入
    #[error("非法输入: {0}")]
    InvalidInput(String),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

/// 通用结果类型
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 是否允许按重试策略重新执行
    ///
    /// 只有单个输入的处理失败可以重试，加载失败、崩溃、超时和取消都不重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Execution(_) | Error::Io(_) | Error::Csv(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Csv(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

/// 带有来源任务信息的失败结果
#[derive(Debug, Clone, Error, serde::Serialize)]
#[error("{input_reference}: {error}")]
pub struct TaskFailure {
    pub task_id: String,
    /// 失败任务的输入引用（例如影像切片路径）
    pub input_reference: String,
    #[source]
    #[serde(serialize_with = "serialize_display")]
    pub error: Error,
}

pub(crate) fn serialize_display<T: Display, S: Serializer>(
    value: &T,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
