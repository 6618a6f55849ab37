//! Periodic background sync of pending metric deltas.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hugin_metrics::{DeltaWriter, SyncClient};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{ProxyError, Result};
use crate::interceptor::Interceptor;
use crate::plugin::{Plugin, PluginContext};

pub(crate) const ID: &str = "metrics-sync";

pub struct MetricsSyncPlugin;

impl Plugin for MetricsSyncPlugin {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Metrics sync"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        120
    }

    fn dependencies(&self) -> Vec<String> {
        vec![super::metrics::ID.to_string()]
    }

    fn create_interceptor(&self, ctx: &PluginContext) -> Result<Arc<dyn Interceptor>> {
        let client = ctx
            .sync
            .clone()
            .ok_or_else(|| ProxyError::Configuration("sync not configured".into()))?;
        let writer = ctx
            .deltas
            .clone()
            .ok_or_else(|| ProxyError::Configuration("metrics directory not configured".into()))?;
        Ok(Arc::new(MetricsSync {
            client,
            writer,
            interval: ctx.config.sync_interval,
            task: Mutex::new(None),
            span: ctx.span().clone(),
        }))
    }
}

struct MetricsSync {
    client: SyncClient,
    writer: DeltaWriter,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    span: tracing::Span,
}

async fn sync_once(client: &SyncClient, writer: &DeltaWriter) {
    match client.sync_pending(writer).await {
        Ok(report) if report.batches == 0 => {}
        Ok(report) => tracing::info!(
            batches = report.batches,
            synced = report.synced,
            failed = report.failed,
            "Metrics sync finished"
        ),
        Err(e) => tracing::warn!(error = %e, "Metrics sync could not read or write records"),
    }
}

#[async_trait]
impl Interceptor for MetricsSync {
    async fn on_proxy_start(&self) -> Result<()> {
        let client = self.client.clone();
        let writer = self.writer.clone();
        let period = self.interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    sync_once(&client, &writer).await;
                }
            }
            .instrument(self.span.clone()),
        );

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn on_proxy_stop(&self) -> Result<()> {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        sync_once(&self.client, &self.writer)
            .instrument(self.span.clone())
            .await;
        Ok(())
    }
}
