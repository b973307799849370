// scheduler.rs
// 任务调度器：分配进程池、启动工作进程，把任务单元按提交顺序放入共享队列（FIFO），立即返回结果句柄。
use crate::artifact;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::future::TaskFuture;
use crate::model::ModelLoader;
use crate::provisioner::Provisioner;
use crate::task::{PredictTile, TaskUnit, WorkerFunction};
use crate::worker::{self, Worker, WorkerState};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use uuid::Uuid;

/// 任务调度器
///
/// 进程池规模固定，进程忙时任务在队列中按提交顺序等待。
/// `submit` 从不阻塞；只有等待结果句柄时才会阻塞。
pub struct TaskScheduler {
    /// 调度器配置
    config: Arc<SchedulerConfig>,
    /// 任务队列发送端，关闭后工作进程处理完剩余任务即退出
    queue_tx: Option<Sender<TaskFuture>>,
    queue_rx: Receiver<TaskFuture>,
    live: Arc<AtomicUsize>,
    workers: Vec<(Arc<WorkerState>, JoinHandle<()>)>,
    pool_size: usize,
    worker_fn: Arc<dyn WorkerFunction>,
    /// 尚未进入终态的任务，按结果路径索引
    in_flight: Mutex<HashMap<PathBuf, TaskFuture>>,
}

impl TaskScheduler {
    /// 校验配置、分配资源并启动工作进程
    ///
    /// 资源分配失败时直接返回 `Error::ResourceProvision`，此时还没有任何任务被提交。
    pub fn start(
        config: SchedulerConfig,
        provisioner: &dyn Provisioner,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        config.validate()?;
        let slots = provisioner.provision(&config.pool)?;
        if slots.is_empty() {
            return Err(Error::ResourceProvision("分配器没有返回任何工作进程".to_string()));
        }

        let config = Arc::new(config);
        let (queue_tx, queue_rx) = unbounded();
        let live = Arc::new(AtomicUsize::new(slots.len()));
        let pool_size = slots.len();

        let mut workers = Vec::with_capacity(pool_size);
        for slot in slots {
            let worker_id = slot.worker_id;
            let state = WorkerState::new(worker_id, live.clone(), queue_rx.clone());
            let worker = Worker::new(slot, config.clone(), loader.clone(), state.clone());
            let handle = worker.spawn().map_err(|e| {
                Error::ResourceProvision(format!("无法启动工作进程 {}: {}", worker_id, e))
            })?;
            workers.push((state, handle));
        }

        tracing::info!(
            pool_size,
            model_id = %config.model_id,
            output_dir = %config.output_dir.display(),
            "调度器已启动"
        );
        Ok(Self {
            config,
            queue_tx: Some(queue_tx),
            queue_rx,
            live,
            workers,
            pool_size,
            worker_fn: Arc::new(PredictTile),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// 替换默认的工作函数
    pub fn with_worker_fn(mut self, worker_fn: Arc<dyn WorkerFunction>) -> Self {
        self.worker_fn = worker_fn;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// 当前存活的工作进程数
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// 为每个输入引用创建任务单元并提交，返回与输入顺序一致的结果句柄
    pub fn submit<I, S>(&self, inputs: I) -> Result<Vec<TaskFuture>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let batch_id = Uuid::new_v4();
        let units = inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| {
                TaskUnit::new(format!("{}_tile_{}", batch_id, i), input, self.worker_fn.clone())
            })
            .collect();
        self.submit_units(units)
    }

    /// 提交一组相互独立的任务单元
    ///
    /// 调度器不做依赖分析。空列表会被拒绝；结果路径与同批次其他输入重复，
    /// 或与之前提交但尚未结束的任务重复时，整批被拒绝。
    /// 被看门狗判定挂起的任务已经结束，但卡住的线程仍可能在之后写入同一路径。
    pub fn submit_units(&self, units: Vec<TaskUnit>) -> Result<Vec<TaskFuture>> {
        if units.is_empty() {
            return Err(Error::InvalidInput("任务列表为空".to_string()));
        }
        let queue_tx = self.queue_tx.as_ref().ok_or(Error::NoLiveWorkers)?;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|_, future| !future.is_terminal());
        let mut paths = HashSet::with_capacity(units.len());
        let mut batch = Vec::with_capacity(units.len());
        for unit in units {
            let path = artifact::artifact_path(&self.config.output_dir, unit.input_reference());
            if in_flight.contains_key(&path) || !paths.insert(path.clone()) {
                return Err(Error::InvalidInput(format!(
                    "输入 {} 的结果路径 {} 与其他未完成的输入重复",
                    unit.input_reference(),
                    path.display()
                )));
            }
            batch.push((path, TaskFuture::new(unit)));
        }

        let mut futures = Vec::with_capacity(batch.len());
        for (path, future) in batch {
            in_flight.insert(path, future.clone());
            // 调度器自己持有接收端，发送不会失败
            let _ = queue_tx.send(future.clone());
            futures.push(future);
        }
        drop(in_flight);
        tracing::info!(
            tasks = futures.len(),
            live_workers = self.live_workers(),
            "任务已提交"
        );

        // 所有进程都已退出时，没人会再取走这些任务
        if self.live.load(Ordering::SeqCst) == 0 {
            let failed = worker::fail_queued(&self.queue_rx);
            tracing::error!(failed, "进程池已无存活进程，提交的任务全部失败");
        }
        Ok(futures)
    }

    /// 关闭队列并等待所有工作进程结束
    ///
    /// 已排队的任务会先被执行完。被看门狗判定挂起的工作进程不再等待，线程被分离；
    /// 没有看门狗时，挂起的工作进程仍会让这里一直阻塞。
    pub fn shutdown(&mut self) {
        if self.queue_tx.take().is_none() {
            return;
        }
        let mut detached = 0;
        for (state, handle) in self.workers.drain(..) {
            if state.is_hung() {
                tracing::warn!(worker_id = state.worker_id(), "不等待挂起的工作进程，线程被分离");
                detached += 1;
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(worker_id = state.worker_id(), "工作进程线程异常退出");
            }
        }
        tracing::info!(detached, "调度器已关闭");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
