use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use unicode_truncate::UnicodeTruncateStr;

use crate::config::probe_config::OrganisationConfig;
use crate::http_probe::prelude::*;
use crate::sink::ResultSink;

use super::{Job, run_job};

/// Pad or cut `input` to exactly `width` columns so log lines line up.
pub fn to_fixed_width(input: &str, width: usize) -> String {
    let (truncated, _) = input.unicode_truncate(width);
    format!("{:<width$}", truncated, width = width)
}

/// Turns configured organisations into polling loops.
#[derive(Clone)]
pub struct Scheduler {
    engine: ProbeEngine,
    sink: Arc<dyn ResultSink>,
    label_width: usize,
}

impl Scheduler {
    pub fn new(engine: ProbeEngine, sink: Arc<dyn ResultSink>, label_width: usize) -> Self {
        Self {
            engine,
            sink,
            label_width,
        }
    }

    /// Poll `organisation` forever: run every target, wait for the round to
    /// finish, then sleep for the polling interval.
    pub fn spawn(&self, name: &str, organisation: OrganisationConfig) -> JoinHandle<()> {
        let scheduler = self.clone();
        let label = to_fixed_width(name, self.label_width);
        let interval = Duration::from_secs(organisation.polling_interval_seconds);
        tokio::spawn(async move {
            loop {
                scheduler.run_round(&label, &organisation).await;
                sleep(interval).await;
            }
        })
    }

    /// Run one round: one task per target, all concurrently. Returns the
    /// number of checks that came back up.
    pub async fn run_round(&self, label: &str, organisation: &OrganisationConfig) -> usize {
        let mut round = JoinSet::new();
        for target in &organisation.targets {
            let engine = self.engine.clone();
            let sink = self.sink.clone();
            let organisation_id = organisation.organisation_id.clone();
            let job = Job::from_target(target);
            let label = label.to_string();

            round.spawn(async move {
                let url = job.url.clone();
                let result = run_job(&engine, sink.as_ref(), &organisation_id, job).await?;
                log_result(&label, &url, &result);
                Some(result.success())
            });
        }

        let mut up = 0;
        while let Some(joined) = round.join_next().await {
            match joined {
                Ok(Some(true)) => up += 1,
                Ok(_) => {}
                Err(e) => log::error!("[{label}] Check task failed: {e}"),
            }
        }
        up
    }
}

fn log_result(label: &str, url: &str, result: &CheckResult) {
    if result.success() {
        let cert = result
            .certificate
            .as_ref()
            .map(|c| {
                let days = (c.valid_to - chrono::Utc::now()).num_days();
                format!("{days}d")
            })
            .unwrap_or_else(|| "N/A".to_string());
        log::info!(
            "[{label}] ✅ URL: {url}, Status: {}, Elapsed: {}ms, Cert: {cert}",
            result.status_code,
            result.elapsed.as_millis()
        );
    } else {
        log::info!(
            "[{label}] ❌ URL: {url}, Error: {}, Elapsed: {}ms",
            result.error_code(),
            result.elapsed.as_millis()
        );
    }
}
