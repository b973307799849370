// future.rs
// 任务结果句柄：提交后立即返回，提供非阻塞的 poll 和阻塞的 wait。
//
// 状态机为 Pending -> Running -> {Completed, Failed}，每次转换最多成功一次，
// 进入终态后任何转换都被忽略，因此每个任务恰好有一个终态、恰好上报一次。
use crate::artifact::Artifact;
use crate::error::{Error, Result};
use crate::task::{TaskStatus, TaskUnit};
use crate::worker::WorkerState;
use crossbeam_channel::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Inner {
    status: TaskStatus,
    outcome: Option<Result<Artifact>>,
    started_at: Option<Instant>,
    cancel_requested: bool,
    /// 正在执行该任务的工作进程，进入终态时释放
    worker: Option<Arc<WorkerState>>,
    /// 终态通知的订阅者：(通道, 订阅者内部的下标)
    watchers: Vec<(Sender<usize>, usize)>,
}

struct Shared {
    unit: TaskUnit,
    state: Mutex<Inner>,
    resolved: Condvar,
}

/// 已提交任务的结果句柄，可以克隆，所有克隆共享同一状态
#[derive(Clone)]
pub struct TaskFuture {
    shared: Arc<Shared>,
}

impl TaskFuture {
    pub(crate) fn new(unit: TaskUnit) -> Self {
        Self {
            shared: Arc::new(Shared {
                unit,
                state: Mutex::new(Inner {
                    status: TaskStatus::Pending,
                    outcome: None,
                    started_at: None,
                    cancel_requested: false,
                    worker: None,
                    watchers: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn task(&self) -> &TaskUnit {
        &self.shared.unit
    }

    pub fn task_id(&self) -> &str {
        self.shared.unit.task_id()
    }

    pub fn input_reference(&self) -> &str {
        self.shared.unit.input_reference()
    }

    /// 非阻塞地查看当前状态
    pub fn poll(&self) -> TaskStatus {
        self.lock().status.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().status.is_terminal()
    }

    /// 已运行的时长，未开始或已结束时为空
    pub fn running_for(&self) -> Option<Duration> {
        let inner = self.lock();
        match inner.status {
            TaskStatus::Running => inner.started_at.map(|t| t.elapsed()),
            _ => None,
        }
    }

    /// 阻塞直到任务进入终态
    ///
    /// 没有配置看门狗时，挂起的工作进程会让这里永远阻塞。
    pub fn wait(&self) -> Result<Artifact> {
        let mut inner = self.lock();
        loop {
            if let Some(outcome) = &inner.outcome {
                return outcome.clone();
            }
            inner = self
                .shared
                .resolved
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 最多阻塞 `timeout`，超时仍未结束时返回 `None`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Artifact>> {
        let inner = self.lock();
        let (inner, _) = self
            .shared
            .resolved
            .wait_timeout_while(inner, timeout, |inner| inner.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        inner.outcome.clone()
    }

    /// 取消任务
    ///
    /// 尚未开始的任务直接失败并返回 `true`，之后不会被执行。
    /// 已在运行的任务只记录取消请求（停止后续重试），无法中断正在进行的推理，返回 `false`。
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        let status = inner.status.clone();
        match status {
            TaskStatus::Pending => {
                self.resolve(&mut inner, Err(Error::Cancelled));
                tracing::debug!(task_id = self.task_id(), "任务在开始前被取消");
                true
            }
            TaskStatus::Running => {
                inner.cancel_requested = true;
                false
            }
            _ => false,
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// Pending -> Running，已被取消或已结束时返回 `false`
    pub(crate) fn try_start(&self, worker: &Arc<WorkerState>) -> bool {
        let mut inner = self.lock();
        if inner.status != TaskStatus::Pending {
            return false;
        }
        inner.status = TaskStatus::Running;
        inner.started_at = Some(Instant::now());
        inner.worker = Some(worker.clone());
        true
    }

    /// Running -> Completed
    pub(crate) fn complete(&self, artifact: Artifact) -> bool {
        let mut inner = self.lock();
        if inner.status != TaskStatus::Running {
            return false;
        }
        self.resolve(&mut inner, Ok(artifact));
        true
    }

    /// Pending | Running -> Failed
    pub(crate) fn fail(&self, error: Error) -> bool {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            return false;
        }
        self.resolve(&mut inner, Err(error));
        true
    }

    /// 运行时间超过 `limit` 时判定挂起：任务以 `HangTimeout` 失败，执行它的工作进程被移出进程池
    pub(crate) fn fail_hung(&self, limit: Duration) -> bool {
        let mut inner = self.lock();
        if inner.status != TaskStatus::Running {
            return false;
        }
        let Some(elapsed) = inner.started_at.map(|t| t.elapsed()) else {
            return false;
        };
        if elapsed <= limit {
            return false;
        }
        let worker = inner.worker.take();
        let elapsed_ms = elapsed.as_millis() as u64;
        self.resolve(&mut inner, Err(Error::HangTimeout { elapsed_ms }));
        drop(inner);

        tracing::warn!(
            task_id = self.task_id(),
            input = self.input_reference(),
            elapsed_ms,
            worker_id = worker.as_ref().map(|w| w.worker_id()),
            "看门狗判定任务挂起"
        );
        // 锁已释放，退出进程池时可能要清空队列里的其他任务
        if let Some(worker) = worker {
            worker.mark_hung();
        }
        true
    }

    /// 订阅终态通知；已处于终态时立即通知
    pub(crate) fn subscribe(&self, notify: Sender<usize>, index: usize) {
        let mut inner = self.lock();
        if inner.status.is_terminal() {
            let _ = notify.send(index);
        } else {
            inner.watchers.push((notify, index));
        }
    }

    fn resolve(&self, inner: &mut Inner, outcome: Result<Artifact>) {
        inner.status = match &outcome {
            Ok(_) => TaskStatus::Completed,
            Err(e) => TaskStatus::Failed(e.to_string()),
        };
        inner.outcome = Some(outcome);
        inner.worker = None;
        for (notify, index) in inner.watchers.drain(..) {
            let _ = notify.send(index);
        }
        self.shared.resolved.notify_all();
    }
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("task_id", &self.task_id())
            .field("input_reference", &self.input_reference())
            .field("status", &self.poll())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PredictTile;
    use std::path::PathBuf;
    use std::thread;

    fn worker() -> Arc<WorkerState> {
        WorkerState::standalone(0)
    }

    fn future(input: &str) -> TaskFuture {
        TaskFuture::new(TaskUnit::new(format!("t_{}", input), input, Arc::new(PredictTile)))
    }

    fn artifact(input: &str) -> Artifact {
        Artifact {
            task_id: format!("t_{}", input),
            input_reference: input.to_string(),
            storage_path: PathBuf::from(format!("out/{}.csv", input)),
            detections: 0,
        }
    }

    #[test]
    fn test_forward_only_transitions() {
        let f = future("tileA");
        assert_eq!(f.poll(), TaskStatus::Pending);
        assert!(!f.complete(artifact("tileA")), "不能跳过 Running 直接完成");

        assert!(f.try_start(&worker()));
        assert!(!f.try_start(&worker()));
        assert_eq!(f.poll(), TaskStatus::Running);
        assert!(f.running_for().is_some());

        assert!(f.complete(artifact("tileA")));
        assert_eq!(f.poll(), TaskStatus::Completed);
        assert!(!f.fail(Error::Execution("late".to_string())));
        assert!(!f.complete(artifact("tileA")));
        assert_eq!(f.wait().unwrap(), artifact("tileA"));
    }

    #[test]
    fn test_cancel_pending_prevents_start() {
        let f = future("tileA");
        assert!(f.cancel());
        assert!(!f.try_start(&worker()));
        assert!(matches!(f.wait(), Err(Error::Cancelled)));
        assert!(!f.cancel());
    }

    #[test]
    fn test_cancel_running_is_best_effort() {
        let f = future("tileA");
        assert!(f.try_start(&worker()));
        assert!(!f.cancel());
        assert!(f.cancel_requested());
        assert_eq!(f.poll(), TaskStatus::Running);
        assert!(f.complete(artifact("tileA")));
    }

    #[test]
    fn test_wait_blocks_until_resolved_on_other_thread() {
        let f = future("tileA");
        let worker = f.clone();
        let handle = thread::spawn(move || {
            assert!(worker.try_start(&WorkerState::standalone(0)));
            thread::sleep(Duration::from_millis(20));
            worker.fail(Error::Execution("corrupt".to_string()));
        });
        assert!(matches!(f.wait(), Err(Error::Execution(_))));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_returns_none_while_pending() {
        let f = future("tileA");
        assert!(f.wait_timeout(Duration::from_millis(10)).is_none());
        f.fail(Error::NoLiveWorkers);
        assert!(matches!(
            f.wait_timeout(Duration::from_millis(10)),
            Some(Err(Error::NoLiveWorkers))
        ));
    }

    #[test]
    fn test_subscribers_notified_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let f = future("tileA");
        f.subscribe(tx.clone(), 7);
        assert!(rx.try_recv().is_err());
        f.try_start(&worker());
        f.fail(Error::Execution("x".to_string()));
        f.fail(Error::Execution("y".to_string()));
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(rx.try_recv().is_err());

        f.subscribe(tx, 9);
        assert_eq!(rx.try_recv().unwrap(), 9);
    }

    #[test]
    fn test_fail_hung_retires_worker_after_limit() {
        let state = worker();
        let f = future("tileA");
        assert!(!f.fail_hung(Duration::ZERO), "未开始的任务不受看门狗影响");

        assert!(f.try_start(&state));
        assert!(!f.fail_hung(Duration::from_secs(60)));
        assert!(!state.is_hung());

        thread::sleep(Duration::from_millis(5));
        assert!(f.fail_hung(Duration::from_millis(1)));
        assert!(matches!(f.wait(), Err(Error::HangTimeout { .. })));
        assert!(state.is_hung());
        assert!(state.is_retired());
        assert!(!f.fail_hung(Duration::ZERO));
    }
}
