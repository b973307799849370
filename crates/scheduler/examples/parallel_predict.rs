use prettytable::{row, Table};
use scheduler::config::SchedulerConfig;
use scheduler::model::SimulatedLoader;
use scheduler::provisioner::LocalProvisioner;
use scheduler::{ResultCollector, TaskScheduler};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 易并行推理示例：6个切片分给2个工作进程，结果按完成顺序打印
fn main() -> anyhow::Result<()> {
    let workspace = tempfile::tempdir()?;
    let mut tiles = Vec::new();
    for i in 0..6 {
        let path = workspace.path().join(format!("tile_{}.tif", i));
        std::fs::write(&path, b"simulated raster")?;
        tiles.push(path.to_string_lossy().into_owned());
    }

    let mut config = SchedulerConfig {
        output_dir: workspace.path().join("predictions"),
        ..SchedulerConfig::default()
    };
    config.pool.workers = 2;

    println!("=== 并行推理示例：{} 个切片，{} 个工作进程 ===", tiles.len(), config.pool.workers);
    let provisioner = LocalProvisioner::from_config(&config);
    let loader = Arc::new(SimulatedLoader::new(Duration::from_millis(50)));
    let collector = ResultCollector::new().with_watchdog(Duration::from_millis(10_000));
    let scheduler = TaskScheduler::start(config, &provisioner, loader)?;

    let started = Instant::now();
    let futures = scheduler.submit(tiles)?;

    let mut table = Table::new();
    table.add_row(row!["完成顺序", "输入", "检测数", "耗时(ms)"]);
    for (i, outcome) in collector.drain(futures).enumerate() {
        let artifact = outcome?;
        table.add_row(row![
            i + 1,
            artifact.input_reference,
            artifact.detections,
            started.elapsed().as_millis()
        ]);
    }
    table.printstd();
    println!("结果目录: {}", workspace.path().join("predictions").display());
    Ok(())
}
