// result_collector.rs
// 结果收集器：按完成顺序（而不是提交顺序）消费结果句柄，单个任务失败不会中断收集。
use crate::artifact::Artifact;
use crate::error::{Result, TaskFailure};
use crate::future::TaskFuture;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// 结果收集器
///
/// 默认没有看门狗：挂起的工作进程和慢任务无法区分，`drain` 会一直等待。
/// 配置看门狗后，运行时间超过上限的任务被判定为 `Error::HangTimeout`，
/// 执行它的工作进程被移出进程池（线程本身无法中断）。进程池因此没有存活进程时，
/// 排在后面的任务以 `Error::NoLiveWorkers` 失败，`drain` 不会一直等下去。
#[derive(Debug, Clone, Default)]
pub struct ResultCollector {
    watchdog: Option<Duration>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_watchdog(mut self, limit: Duration) -> Self {
        self.watchdog = Some(limit);
        self
    }

    /// 惰性地按完成顺序产出每个任务的结果，只能遍历一次
    pub fn drain(&self, futures: Vec<TaskFuture>) -> Drain {
        let (notify, completions) = unbounded();
        for (index, future) in futures.iter().enumerate() {
            future.subscribe(notify.clone(), index);
        }
        Drain {
            remaining: futures.len(),
            futures: futures.into_iter().map(Some).collect(),
            completions,
            watchdog: self.watchdog,
            last_check: Instant::now(),
        }
    }

    /// 收集全部结果，汇总成功的产物和失败的输入
    pub fn collect(&self, futures: Vec<TaskFuture>) -> RunReport {
        let mut report = RunReport::default();
        for outcome in self.drain(futures) {
            match outcome {
                Ok(artifact) => report.succeeded.push(artifact),
                Err(failure) => report.failed.push(failure),
            }
        }
        report
    }
}

/// 按完成顺序产出结果的迭代器
pub struct Drain {
    futures: Vec<Option<TaskFuture>>,
    remaining: usize,
    completions: Receiver<usize>,
    watchdog: Option<Duration>,
    last_check: Instant,
}

impl Drain {
    fn next_completed(&mut self) -> Option<usize> {
        let Some(limit) = self.watchdog else {
            return self.completions.recv().ok();
        };
        let tick = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        loop {
            let received = match self.completions.recv_timeout(tick) {
                Ok(index) => Some(index),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return None,
            };
            if self.last_check.elapsed() >= tick {
                self.enforce_watchdog(limit);
            }
            if received.is_some() {
                return received;
            }
        }
    }

    fn enforce_watchdog(&mut self, limit: Duration) {
        self.last_check = Instant::now();
        for future in self.futures.iter().flatten() {
            future.fail_hung(limit);
        }
    }
}

impl Iterator for Drain {
    type Item = std::result::Result<Artifact, TaskFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let index = self.next_completed()?;
            let Some(future) = self.futures.get_mut(index).and_then(Option::take) else {
                continue;
            };
            self.remaining -= 1;
            return Some(future.wait().map_err(|error| TaskFailure {
                task_id: future.task_id().to_string(),
                input_reference: future.input_reference().to_string(),
                error,
            }));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// 一次运行的最终报告：成功的产物路径和失败的输入及原因
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub succeeded: Vec<Artifact>,
    pub failed: Vec<TaskFailure>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 以JSON格式写出报告
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
