// worker.rs
// 工作进程：启动时加载一次模型，从共享队列逐个取任务执行，负责重试、崩溃恢复和墙钟时间限制。
//
// 工作进程之间互不持有引用，只共享任务队列和存活计数。
use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::future::TaskFuture;
use crate::model::{DetectionModel, ModelLoader};
use crate::provisioner::WorkerSlot;
use crate::types::Device;
use crossbeam_channel::Receiver;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// 传给工作函数的只读上下文
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub device: Device,
    pub config: Arc<SchedulerConfig>,
}

/// 单个任务的执行结果
enum Execution {
    Finished,
    Crashed,
}

/// 工作进程在进程池中的登记状态
///
/// 由工作线程、调度器和正在执行的任务句柄共同持有。看门狗判定挂起时通过它
/// 把进程移出进程池，不必等待卡住的线程返回。
pub(crate) struct WorkerState {
    worker_id: usize,
    retired: AtomicBool,
    hung: AtomicBool,
    live: Arc<AtomicUsize>,
    tasks: Receiver<TaskFuture>,
}

impl WorkerState {
    pub(crate) fn new(
        worker_id: usize,
        live: Arc<AtomicUsize>,
        tasks: Receiver<TaskFuture>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            retired: AtomicBool::new(false),
            hung: AtomicBool::new(false),
            live,
            tasks,
        })
    }

    pub(crate) fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub(crate) fn is_hung(&self) -> bool {
        self.hung.load(Ordering::SeqCst)
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// 看门狗判定当前任务挂起：进程不再计入存活数，也不会再取任务
    pub(crate) fn mark_hung(&self) {
        self.hung.store(true, Ordering::SeqCst);
        if self.retire() {
            tracing::warn!(worker_id = self.worker_id, "工作进程被判定挂起，移出进程池");
        }
    }

    /// 退出进程池，只生效一次；最后一个退出的进程把队列中剩余的任务全部判定失败
    pub(crate) fn retire(&self) -> bool {
        if self.retired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let remaining = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::info!(
            worker_id = self.worker_id,
            live_workers = remaining,
            "工作进程退出"
        );
        if remaining == 0 {
            let failed = fail_queued(&self.tasks);
            if failed > 0 {
                tracing::error!(failed, "进程池已无存活进程，剩余任务全部失败");
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn standalone(worker_id: usize) -> Arc<Self> {
        let (_tx, rx) = crossbeam_channel::unbounded();
        Self::new(worker_id, Arc::new(AtomicUsize::new(1)), rx)
    }
}

pub(crate) struct Worker {
    slot: WorkerSlot,
    config: Arc<SchedulerConfig>,
    loader: Arc<dyn ModelLoader>,
    state: Arc<WorkerState>,
}

impl Worker {
    pub(crate) fn new(
        slot: WorkerSlot,
        config: Arc<SchedulerConfig>,
        loader: Arc<dyn ModelLoader>,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            slot,
            config,
            loader,
            state,
        }
    }

    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("tile-worker-{}", self.slot.worker_id))
            .spawn(move || self.run())
    }

    fn run(self) {
        let ctx = WorkerContext {
            worker_id: self.slot.worker_id,
            device: self.slot.primary_device(),
            config: self.config.clone(),
        };
        let started = Instant::now();
        let mut restarts = 0;

        let Some(mut model) = self.load_model(&ctx) else {
            self.state.retire();
            return;
        };

        // 通道关闭且队列取空后退出
        for future in self.state.tasks.iter() {
            if !future.try_start(&self.state) {
                tracing::debug!(
                    worker_id = ctx.worker_id,
                    task_id = future.task_id(),
                    "跳过已取消的任务"
                );
                continue;
            }
            tracing::debug!(
                worker_id = ctx.worker_id,
                task_id = future.task_id(),
                input = future.input_reference(),
                "开始执行任务"
            );

            let execution = self.execute(model.as_mut(), &future, &ctx);
            if self.state.is_retired() {
                // 已被看门狗移出进程池，队列里的任务留给其他进程
                tracing::warn!(worker_id = ctx.worker_id, "挂起的任务终于返回，工作进程退出");
                return;
            }

            if let Execution::Crashed = execution {
                if restarts >= self.config.max_worker_restarts {
                    tracing::error!(
                        worker_id = ctx.worker_id,
                        restarts,
                        "工作进程崩溃次数超过上限，退出"
                    );
                    break;
                }
                restarts += 1;
                tracing::warn!(worker_id = ctx.worker_id, restarts, "工作进程崩溃，重新加载模型");
                match self.load_model(&ctx) {
                    Some(reloaded) => model = reloaded,
                    None => break,
                }
            }

            if let Some(limit) = self.slot.walltime {
                if started.elapsed() >= limit {
                    tracing::warn!(
                        worker_id = ctx.worker_id,
                        walltime_secs = limit.as_secs(),
                        "达到墙钟时间上限，工作进程退出"
                    );
                    break;
                }
            }
        }

        self.state.retire();
    }

    fn load_model(&self, ctx: &WorkerContext) -> Option<Box<dyn DetectionModel>> {
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.loader.load(&self.config.model_id, &ctx.device)
        }));
        match loaded {
            Ok(Ok(model)) => {
                tracing::info!(
                    worker_id = ctx.worker_id,
                    device = %ctx.device,
                    model_id = %self.config.model_id,
                    "模型加载完成"
                );
                Some(model)
            }
            Ok(Err(e)) => {
                tracing::error!(
                    worker_id = ctx.worker_id,
                    device = %ctx.device,
                    error = %e,
                    "模型加载失败，工作进程不再接收任务"
                );
                None
            }
            Err(payload) => {
                tracing::error!(
                    worker_id = ctx.worker_id,
                    panic = %panic_message(payload.as_ref()),
                    "模型加载时崩溃"
                );
                None
            }
        }
    }

    /// 按重试策略执行一个已进入 Running 的任务
    fn execute(
        &self,
        model: &mut dyn DetectionModel,
        future: &TaskFuture,
        ctx: &WorkerContext,
    ) -> Execution {
        let unit = future.task();
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                unit.worker_fn().run(&mut *model, unit, ctx)
            }));
            match result {
                Ok(Ok(artifact)) => {
                    if !future.complete(artifact) {
                        tracing::warn!(
                            task_id = unit.task_id(),
                            "任务已被看门狗判定失败，丢弃迟到的结果"
                        );
                    }
                    return Execution::Finished;
                }
                Ok(Err(e)) => {
                    let may_retry = e.is_retryable()
                        && attempt < retry.max_attempts
                        && !future.cancel_requested()
                        && !future.is_terminal();
                    if !may_retry {
                        tracing::warn!(
                            task_id = unit.task_id(),
                            input = unit.input_reference(),
                            attempt,
                            error = %e,
                            "任务失败"
                        );
                        future.fail(e);
                        return Execution::Finished;
                    }
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        task_id = unit.task_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "任务失败，稍后重试"
                    );
                    thread::sleep(delay);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(
                        worker_id = ctx.worker_id,
                        task_id = unit.task_id(),
                        panic = %message,
                        "执行任务时工作进程崩溃"
                    );
                    future.fail(Error::WorkerCrashed(message));
                    return Execution::Crashed;
                }
            }
        }
    }
}

/// 把队列中尚未被取走的任务判定为失败，返回处理的数量
pub(crate) fn fail_queued(tasks: &Receiver<TaskFuture>) -> usize {
    let mut failed = 0;
    while let Ok(future) = tasks.try_recv() {
        if future.fail(Error::NoLiveWorkers) {
            failed += 1;
        }
    }
    failed
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知崩溃".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredictOptions;
    use crate::error::Result;
    use crate::model::SimulatedLoader;
    use crate::task::{PredictTile, TaskStatus, TaskUnit};
    use crate::types::Detection;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;

    struct FailingLoader;

    impl ModelLoader for FailingLoader {
        fn load(&self, _model_id: &str, _device: &Device) -> Result<Box<dyn DetectionModel>> {
            Err(Error::Load("权重文件损坏".to_string()))
        }
    }

    /// 前 `failures` 次推理失败，之后成功
    struct FlakyLoader {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    struct FlakyModel {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl ModelLoader for FlakyLoader {
        fn load(&self, _model_id: &str, _device: &Device) -> Result<Box<dyn DetectionModel>> {
            Ok(Box::new(FlakyModel {
                failures: self.failures,
                calls: self.calls.clone(),
            }))
        }
    }

    impl DetectionModel for FlakyModel {
        fn predict(&mut self, _input: &Path, _options: &PredictOptions) -> Result<Vec<Detection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::Execution("暂时性错误".to_string()))
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn slot() -> WorkerSlot {
        WorkerSlot {
            worker_id: 0,
            devices: vec![],
            cpu_cores: 1,
            memory_mb: 1024,
            walltime: None,
        }
    }

    fn future(task_id: &str, input: &str) -> TaskFuture {
        TaskFuture::new(TaskUnit::new(task_id, input, Arc::new(PredictTile)))
    }

    fn run_single_worker(
        config: SchedulerConfig,
        loader: Arc<dyn ModelLoader>,
        inputs: &[&str],
    ) -> Vec<TaskFuture> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let futures: Vec<TaskFuture> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| future(&format!("t{}", i), input))
            .collect();
        for f in &futures {
            tx.send(f.clone()).unwrap();
        }
        drop(tx);
        let live = Arc::new(AtomicUsize::new(1));
        let state = WorkerState::new(0, live.clone(), rx);
        let worker = Worker::new(slot(), Arc::new(config), loader, state);
        worker.spawn().unwrap().join().unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        futures
    }

    #[test]
    fn test_load_failure_fails_queued_tasks() {
        let futures = run_single_worker(
            SchedulerConfig::default(),
            Arc::new(FailingLoader),
            &["a.tif", "b.tif"],
        );
        for f in futures {
            assert!(matches!(f.wait(), Err(Error::NoLiveWorkers)));
        }
    }

    #[test]
    fn test_retry_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig {
            output_dir: dir.path().to_path_buf(),
            ..SchedulerConfig::default()
        };
        config.retry.max_attempts = 3;
        config.retry.backoff_ms = 1;
        let calls = Arc::new(AtomicU32::new(0));
        let loader = Arc::new(FlakyLoader { failures: 2, calls: calls.clone() });

        let futures = run_single_worker(config, loader, &["a.tif"]);
        assert_eq!(futures[0].poll(), TaskStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_retry_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            output_dir: dir.path().to_path_buf(),
            ..SchedulerConfig::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let loader = Arc::new(FlakyLoader { failures: 1, calls: calls.clone() });

        let futures = run_single_worker(config, loader, &["a.tif", "b.tif"]);
        assert!(matches!(futures[0].wait(), Err(Error::Execution(_))));
        assert_eq!(futures[1].poll(), TaskStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancelled_task_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tif"), b"x").unwrap();
        let input = dir.path().join("a.tif").to_string_lossy().into_owned();
        let config = SchedulerConfig {
            output_dir: dir.path().join("out"),
            ..SchedulerConfig::default()
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let cancelled = future("t0", &input);
        assert!(cancelled.cancel());
        tx.send(cancelled.clone()).unwrap();
        drop(tx);
        let state = WorkerState::new(0, Arc::new(AtomicUsize::new(1)), rx);
        let worker = Worker::new(
            slot(),
            Arc::new(config),
            Arc::new(SimulatedLoader::default()),
            state,
        );
        worker.spawn().unwrap().join().unwrap();

        assert!(matches!(cancelled.wait(), Err(Error::Cancelled)));
        assert!(!dir.path().join("out").join("a.csv").exists());
    }

    #[test]
    fn test_hung_worker_retires_once_and_fails_queue_when_last() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let live = Arc::new(AtomicUsize::new(2));
        let first = WorkerState::new(0, live.clone(), rx.clone());
        let second = WorkerState::new(1, live.clone(), rx);
        let queued = future("t1", "b.tif");
        tx.send(queued.clone()).unwrap();

        first.mark_hung();
        first.mark_hung();
        assert!(first.is_hung());
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(queued.poll(), TaskStatus::Pending);

        assert!(second.retire());
        assert!(!second.retire());
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(matches!(queued.wait(), Err(Error::NoLiveWorkers)));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "未知崩溃");
    }
}
