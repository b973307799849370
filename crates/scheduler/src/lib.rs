// lib.rs
// 调度器模块入口，声明并导出各子模块。
//
// 面向“易并行”的切片推理：调度器把相互独立的任务单元分发给固定规模的工作进程池，
// 每个进程只加载一次模型，进程之间没有任何通信；结果收集器按完成顺序汇总结果。
pub mod artifact;
pub mod config;
pub mod error;
pub mod future;
pub mod inputs;
pub mod model;
pub mod provisioner;
pub mod result_collector;
pub mod scheduler;
pub mod task;
pub mod types;
pub mod worker;

pub use artifact::Artifact;
pub use config::SchedulerConfig;
pub use error::{Error, Result, TaskFailure};
pub use future::TaskFuture;
pub use result_collector::{ResultCollector, RunReport};
pub use scheduler::TaskScheduler;
pub use task::{TaskStatus, TaskUnit};
