use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
    pub run_immediately: bool,
}

pub fn start(jobs: Vec<JobSpec>) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            tokio::spawn(async move {
                let start_at = if job.run_immediately {
                    Instant::now()
                } else {
                    Instant::now() + job.interval
                };
                let mut interval = tokio::time::interval_at(start_at, job.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    interval.tick().await;
                    tracing::debug!(job = %job.name, "scheduler tick");
                    if job.tick.send(()).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect()
}
