//! 批处理流水线 (Batch pipeline)
//!
//! 逐个作业顺序执行; 单个作业失败只报告警告, 批处理继续.
//! 每个作业结束 (成功或失败) 都会释放资源.

use std::time::Instant;

use crate::config::TrackerConfig;
use crate::console::Console;
use crate::error::Result;
use crate::job::Job;
use crate::tracking::{CentroidLocator, NearestNeighborLinker};

/// Result of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub completed: usize,
    pub total: usize,
}

impl Outcome {
    /// A batch succeeds when at least one job completed.
    pub fn success(&self) -> bool {
        self.completed > 0
    }
}

/// Locate, link, filter, export and optionally annotate every job.
pub fn track_particles(config: &TrackerConfig, jobs: Vec<Job>, console: &Console) -> Outcome {
    run_batch(jobs, console, |job| track_job(job, config, console))
}

/// Annotate every job from its previously exported trajectories.
pub fn annotate_videos(config: &TrackerConfig, jobs: Vec<Job>, console: &Console) -> Outcome {
    run_batch(jobs, console, |job| annotate_job(job, config, console))
}

fn run_batch(
    jobs: Vec<Job>,
    console: &Console,
    mut run: impl FnMut(&mut Job) -> Result<()>,
) -> Outcome {
    let total = jobs.len();
    let mut completed = 0;
    for (i, mut job) in jobs.into_iter().enumerate() {
        console.message(format!("Processing job {}/{}..", i + 1, total));
        console.plain(job.describe());
        let started = Instant::now();
        match run(&mut job) {
            Ok(()) => {
                completed += 1;
                tracing::info!(
                    job = i + 1,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
            }
            Err(e) => {
                tracing::warn!(job = i + 1, stage = %job.stage(), error = %e, "job failed");
                console.warning(format!("...Job {} failed: {}. Skipping job.", i + 1, e));
            }
        }
        job.release();
    }
    console.message(format!("{}/{} jobs completed", completed, total));
    Outcome { completed, total }
}

fn track_job(job: &mut Job, config: &TrackerConfig, console: &Console) -> Result<()> {
    job.load()?;
    job.preprocess(config.invert)?;

    let located = job.locate(&CentroidLocator::new(config.locate.clone()))?;
    console.message(format!("...Located {} features", located));

    let rows = job.link(&mut NearestNeighborLinker::new(config.link.clone()))?;
    console.message(format!("...Linked {} positions", rows));

    if config.filter.is_active() {
        let kept = job.filter(&config.filter)?;
        console.message(format!("...Kept {} positions after filtering", kept));
    }

    let path = job.export_trajectories(config.export_format)?;
    console.message(format!("...Trajectories saved to {}", path.display()));

    if config.annotate.enabled {
        let path = job.annotate(&config.annotate)?;
        console.message(format!("...Annotated video saved to {}", path.display()));
    }
    Ok(())
}

fn annotate_job(job: &mut Job, config: &TrackerConfig, console: &Console) -> Result<()> {
    job.load()?;
    let rows = job.import_trajectories(config.export_format)?;
    console.message(format!("...Loaded {} positions", rows));
    let path = job.annotate(&config.annotate)?;
    console.message(format!("...Annotated video saved to {}", path.display()));
    Ok(())
}
