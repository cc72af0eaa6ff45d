use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::state::BatchToken;
use crate::utils::logging::TIMING_TARGET;

/// Wall-clock record of one batch, from dispatch until its last slot settles.
///
/// `scope` is `batch` for a full fan-out and `retry` for single-slot re-runs
/// issued after the batch had already settled.
#[derive(Debug)]
pub struct BatchTimer {
    scope: &'static str,
    token: BatchToken,
    quality: &'static str,
    dispatch: &'static str,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    completed: bool,
}

impl BatchTimer {
    pub fn start(
        scope: &'static str,
        token: BatchToken,
        quality: &'static str,
        dispatch: &'static str,
    ) -> Self {
        let timer = BatchTimer {
            scope,
            token,
            quality,
            dispatch,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            completed: false,
        };
        info!(
            target: TIMING_TARGET,
            "event=batch_started scope={} token={} quality={} dispatch={} started_at={}",
            timer.scope,
            timer.token.value(),
            timer.quality,
            timer.dispatch,
            timer.started_at.to_rfc3339()
        );
        timer
    }

    #[cfg(test)]
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    pub fn complete(&mut self, status: &str, done: usize, failed: usize) {
        if self.completed {
            return;
        }
        self.completed = true;
        let completed_at = Utc::now();
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: TIMING_TARGET,
            "event=batch_completed scope={} token={} quality={} dispatch={} started_at={} completed_at={} duration_s={:.3} status={} done={} failed={}",
            self.scope,
            self.token.value(),
            self.quality,
            self.dispatch,
            self.started_at.to_rfc3339(),
            completed_at.to_rfc3339(),
            duration,
            status,
            done,
            failed
        );
    }
}

pub async fn log_generation_timing<T, E, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    call: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    info!(
        target: TIMING_TARGET,
        "event=generation_request provider={} model={} operation={} started_at={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339()
    );

    let result = call().await;
    let status = match &result {
        Ok(_) => "success".to_string(),
        Err(err) => format!("error ({err})"),
    };

    let completed_at = Utc::now();
    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: TIMING_TARGET,
        "event=generation_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={}",
        provider,
        model,
        operation,
        completed_at.to_rfc3339(),
        duration,
        status
    );

    result
}
