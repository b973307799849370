use scheduler::artifact::Artifact;
use scheduler::config::SchedulerConfig;
use scheduler::error::{Error, Result};
use scheduler::model::{DetectionModel, SimulatedLoader};
use scheduler::provisioner::LocalProvisioner;
use scheduler::task::{PredictTile, TaskUnit, WorkerFunction};
use scheduler::worker::WorkerContext;
use scheduler::{ResultCollector, TaskScheduler};
use std::sync::Arc;

/// 拒绝文件名中带 `cloudy` 的切片，其余交给默认工作函数
struct SkipCloudy;

impl WorkerFunction for SkipCloudy {
    fn run(
        &self,
        model: &mut dyn DetectionModel,
        unit: &TaskUnit,
        ctx: &WorkerContext,
    ) -> Result<Artifact> {
        if unit.input_reference().contains("cloudy") {
            return Err(Error::Execution("云量过高，跳过".to_string()));
        }
        PredictTile.run(model, unit, ctx)
    }
}

/// 失败隔离示例：单个输入失败不影响其他输入，最终报告同时列出成功和失败
fn main() -> anyhow::Result<()> {
    let workspace = tempfile::tempdir()?;
    let mut inputs = Vec::new();
    for name in ["tileA.tif", "cloudy_tileB.tif", "tileC.tif"] {
        let path = workspace.path().join(name);
        std::fs::write(&path, b"simulated raster")?;
        inputs.push(path.to_string_lossy().into_owned());
    }
    // 不存在的文件会在推理阶段失败
    inputs.push(workspace.path().join("missing.tif").to_string_lossy().into_owned());

    let mut config = SchedulerConfig {
        output_dir: workspace.path().join("predictions"),
        ..SchedulerConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.backoff_ms = 10;

    let provisioner = LocalProvisioner::from_config(&config);
    let loader = Arc::new(SimulatedLoader::default());
    let scheduler =
        TaskScheduler::start(config, &provisioner, loader)?.with_worker_fn(Arc::new(SkipCloudy));

    let report = ResultCollector::new().collect(scheduler.submit(inputs)?);
    println!("成功 {} 个:", report.succeeded.len());
    for artifact in &report.succeeded {
        println!("  {} -> {}", artifact.input_reference, artifact.storage_path.display());
    }
    println!("失败 {} 个:", report.failed.len());
    for failure in &report.failed {
        println!("  {}", failure);
    }
    Ok(())
}
