// main.rs
// 命令行入口：读取配置和输入列表，启动进程池并行推理，按完成顺序输出结果并写出运行报告。
use anyhow::{Context, Result};
use clap::Parser;
use prettytable::{row, Table};
use scheduler::config::SchedulerConfig;
use scheduler::inputs::load_inputs;
use scheduler::model::SimulatedLoader;
use scheduler::provisioner::LocalProvisioner;
use scheduler::{ResultCollector, RunReport, TaskScheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 把切片推理任务分发到固定规模的工作进程池
#[derive(Parser, Debug)]
#[command(name = "tile-dispatch", version)]
struct Args {
    /// 输入列表文件（每行一个路径）或切片目录
    inputs: PathBuf,
    /// JSON配置文件
    #[arg(long)]
    config: Option<PathBuf>,
    /// 目录输入时的文件扩展名
    #[arg(long, default_value = "tif")]
    extension: String,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    model_id: Option<String>,
    /// 进程池规模
    #[arg(long)]
    workers: Option<usize>,
    /// 可用GPU设备ID，逗号分隔
    #[arg(long, value_delimiter = ',')]
    gpus: Option<Vec<i32>>,
    /// 每个进程独占的加速器数量
    #[arg(long)]
    accelerators_per_worker: Option<u32>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// 看门狗超时（秒）
    #[arg(long)]
    watchdog_secs: Option<u64>,
    /// 运行报告路径，默认写到输出目录下的 report.json
    #[arg(long)]
    report: Option<PathBuf>,
    /// 模拟检测器每次推理的耗时（毫秒）
    #[arg(long, default_value_t = 0)]
    simulate_latency_ms: u64,
}

impl Args {
    fn build_config(&self) -> Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => SchedulerConfig::from_file(path)?,
            None => SchedulerConfig::default(),
        };
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(model_id) = &self.model_id {
            config.model_id = model_id.clone();
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(gpus) = &self.gpus {
            config.gpu_ids = gpus.clone();
        }
        if let Some(n) = self.accelerators_per_worker {
            config.pool.resources.accelerators = n;
        }
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(secs) = self.watchdog_secs {
            config.watchdog_ms = Some(secs * 1000);
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scheduler=info,tile_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.build_config()?;
    let inputs = load_inputs(&args.inputs, &args.extension)
        .with_context(|| format!("无法读取输入 {}", args.inputs.display()))?;
    let report_path = args
        .report
        .clone()
        .unwrap_or_else(|| config.output_dir.join("report.json"));

    let mut collector = ResultCollector::new();
    if let Some(limit) = config.watchdog() {
        collector = collector.with_watchdog(limit);
    } else {
        tracing::warn!("未配置看门狗，挂起的工作进程会让本次运行无限等待");
    }

    let provisioner = LocalProvisioner::from_config(&config);
    let loader = Arc::new(SimulatedLoader::new(Duration::from_millis(
        args.simulate_latency_ms,
    )));
    let mut scheduler =
        TaskScheduler::start(config, &provisioner, loader).context("进程池启动失败")?;

    let started = Instant::now();
    let futures = scheduler.submit(inputs)?;
    let total = futures.len();

    let mut report = RunReport::default();
    for (done, outcome) in collector.drain(futures).enumerate() {
        let progress = format!("{}/{}", done + 1, total);
        match outcome {
            Ok(artifact) => {
                tracing::info!(
                    progress = %progress,
                    input = %artifact.input_reference,
                    detections = artifact.detections,
                    "完成"
                );
                report.succeeded.push(artifact);
            }
            Err(failure) => {
                tracing::warn!(
                    progress = %progress,
                    input = %failure.input_reference,
                    error = %failure.error,
                    "失败"
                );
                report.failed.push(failure);
            }
        }
    }

    // 报告先落盘，再关闭进程池
    print_report(&report, started.elapsed());
    report
        .write_json(&report_path)
        .with_context(|| format!("无法写出运行报告 {}", report_path.display()))?;
    println!("运行报告已写入: {}", report_path.display());
    scheduler.shutdown();

    if !report.is_success() {
        anyhow::bail!("{} 个输入处理失败", report.failed.len());
    }
    Ok(())
}

fn print_report(report: &RunReport, elapsed: Duration) {
    let mut table = Table::new();
    table.add_row(row!["输入", "状态", "检测数 / 错误", "结果文件"]);
    for artifact in &report.succeeded {
        table.add_row(row![
            artifact.input_reference,
            "成功",
            artifact.detections,
            artifact.storage_path.display()
        ]);
    }
    for failure in &report.failed {
        table.add_row(row![failure.input_reference, "失败", failure.error, "-"]);
    }
    table.printstd();
    println!(
        "共 {} 个输入：成功 {}，失败 {}，耗时 {:.2}s",
        report.total(),
        report.succeeded.len(),
        report.failed.len(),
        elapsed.as_secs_f64()
    );
}
