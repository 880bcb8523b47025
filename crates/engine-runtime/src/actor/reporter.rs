use crate::{
    actor::{Actor, ActorContext, ActorRef, messages::ReporterMsg, spawn_actor},
    error::ActorError,
};
use async_trait::async_trait;
use engine_config::settings::format_bytes;
use engine_core::metrics::{Metrics, MetricsSnapshot};
use std::time::Duration;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

struct ReporterActor {
    operation: &'static str,
    metrics: Metrics,
    total_bytes: u64,
}

impl ReporterActor {
    fn log(&self, snapshot: &MetricsSnapshot, message: &'static str) {
        let eta = snapshot.eta(self.total_bytes).map(|d| d.as_secs());
        info!(
            operation = self.operation,
            rows = snapshot.rows,
            data = %format_bytes(snapshot.data_bytes),
            rows_per_sec = snapshot.rows_per_sec().round() as u64,
            throughput = %format!("{}/s", format_bytes(snapshot.bytes_per_sec() as u64)),
            eta_secs = ?eta,
            done = snapshot.tasks_done,
            failed = snapshot.tasks_failed,
            "{message}"
        );
    }
}

#[async_trait]
impl Actor<ReporterMsg> for ReporterActor {
    async fn handle(&mut self, msg: ReporterMsg, _ctx: &ActorContext) -> Result<(), ActorError> {
        match msg {
            ReporterMsg::Tick => self.log(&self.metrics.snapshot(), "Progress"),
            ReporterMsg::SetTotal(total) => self.total_bytes = total,
        }
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        let snapshot = self.metrics.snapshot();
        info!(
            operation = self.operation,
            rows = snapshot.rows,
            data = %format_bytes(snapshot.data_bytes),
            files = %format_bytes(snapshot.file_bytes),
            retries = snapshot.retry_count,
            warnings = snapshot.warnings,
            elapsed_secs = snapshot.elapsed.as_secs_f64(),
            "Finished"
        );
        Ok(())
    }
}

/// Periodic throughput logging for a running operation.
pub struct Reporter {
    stop: CancellationToken,
    ticker: Option<JoinHandle<()>>,
    actor: Option<JoinHandle<()>>,
    total: Option<ActorRef<ReporterMsg>>,
}

impl Reporter {
    /// Starts ticking every `interval`. A disabled reporter logs nothing.
    pub fn start(operation: &'static str, metrics: Metrics, interval: Duration, enabled: bool) -> Self {
        let stop = CancellationToken::new();
        if !enabled {
            return Self {
                stop,
                ticker: None,
                actor: None,
                total: None,
            };
        }

        let (actor_ref, actor) = spawn_actor(
            format!("{operation}-reporter"),
            16,
            ReporterActor {
                operation,
                metrics,
                total_bytes: 0,
            },
        );
        let ticks = actor_ref.clone();
        let token = stop.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = time::interval(interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if ticks.send(ReporterMsg::Tick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop,
            ticker: Some(ticker),
            actor: Some(actor),
            total: Some(actor_ref),
        }
    }

    pub async fn set_total(&self, bytes: u64) {
        if let Some(actor) = &self.total {
            let _ = actor.send(ReporterMsg::SetTotal(bytes)).await;
        }
    }

    /// Stops ticking and logs the final summary.
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
        self.total = None;
        if let Some(actor) = self.actor.take() {
            let _ = actor.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn logs_progress_and_summary() {
        let metrics = Metrics::new();
        metrics.increment_rows(500);
        let reporter = Reporter::start("dump", metrics, Duration::from_secs(1), true);
        reporter.set_total(1 << 20).await;
        time::sleep(Duration::from_millis(2500)).await;
        reporter.finish().await;

        assert!(logs_contain("Progress"));
        assert!(logs_contain("Finished"));
        assert!(logs_contain("rows=500"));
    }

    #[tokio::test]
    async fn disabled_reporter_is_inert() {
        let reporter = Reporter::start("load", Metrics::new(), Duration::from_millis(1), false);
        reporter.set_total(10).await;
        reporter.finish().await;
    }
}
