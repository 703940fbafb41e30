use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::{IngestPipeline, RunParams};

/// One job per cron expression; each tick runs the pipeline with default parameters.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run(&RunParams::default()).await {
                Ok(report) => info!(
                    invocation_id = %report.invocation_id,
                    location = %report.location,
                    date = %report.date,
                    "scheduled ingest finished"
                ),
                Err(err) => error!(error = %err, kind = err.kind(), "scheduled ingest failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
