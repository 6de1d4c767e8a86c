//! Output sinks and the wrapper that buffers and flushes metrics to them.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};

use crate::buffer::Buffer;
use crate::metric::Metric;
use crate::serializer::Serializer;

/// Default size of a metric batch.
pub const DEFAULT_METRIC_BATCH_SIZE: usize = 1000;
/// Default number of metrics kept in a single output's buffer. Should be a
/// multiple of the batch size.
pub const DEFAULT_METRIC_BUFFER_LIMIT: usize = 10_000;

/// A sink that metrics are written to.
#[async_trait]
pub trait Output: Send {
    fn sample_config(&self) -> &str {
        ""
    }

    fn description(&self) -> &str {
        ""
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()>;

    /// Returns a view of this sink as an [`AggregatingOutput`], if it
    /// implements that optional capability.
    fn as_aggregating_mut(&mut self) -> Option<&mut dyn AggregatingOutput> {
        None
    }

    /// Returns a view of this sink as a [`SerializerConsumer`], if it
    /// implements that optional capability.
    fn as_serializer_consumer_mut(&mut self) -> Option<&mut dyn SerializerConsumer> {
        None
    }
}

/// Optional capability: a sink that aggregates metrics itself instead of
/// relying on the owning [`RunningOutput`]'s buffer.
///
/// `add`/`push`/`reset` are called under the same lock as `write`, so an
/// implementation does not need its own synchronization.
pub trait AggregatingOutput: Send {
    fn add(&mut self, metric: Metric);
    /// Returns (and clears the need to return again) all metrics
    /// accumulated since the last [`reset`](Self::reset).
    fn push(&mut self) -> Vec<Metric>;
    fn reset(&mut self);
}

/// Optional capability: a sink that delegates serialization to a
/// pluggable [`Serializer`].
pub trait SerializerConsumer: Send {
    fn set_serializer(&mut self, serializer: Box<dyn Serializer>);
}

/// Common configuration shared by every output, regardless of which sink it
/// wraps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub name: String,
    pub alias: Option<String>,
    #[serde(with = "humantime_serde::option")]
    pub flush_interval: Option<Duration>,
    #[serde(with = "humantime_serde::option")]
    pub flush_jitter: Option<Duration>,
    pub metric_buffer_limit: Option<usize>,
    pub metric_batch_size: Option<usize>,
    pub data_format: Option<String>,
    pub json_timestamp_units: Option<String>,
}

/// Binds a sink to its configuration, its bounded buffer, and the
/// batch-ready fast path.
pub struct RunningOutput {
    output: Mutex<Box<dyn Output>>,
    pub config: OutputConfig,
    pub metric_batch_size: usize,
    buffer: Buffer,
    batch_ready_tx: mpsc::Sender<Instant>,
    new_metrics_count: AtomicI64,
    dropped_metrics: AtomicI64,
    log_name: String,
}

impl RunningOutput {
    /// Builds a new wrapper. Returns the wrapper and the receiving half of
    /// the batch-ready signal, which the owning flush task should hold
    /// onto exclusively.
    pub fn new(output: Box<dyn Output>, config: OutputConfig) -> (Self, mpsc::Receiver<Instant>) {
        let metric_buffer_limit = config
            .metric_buffer_limit
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_METRIC_BUFFER_LIMIT);
        let metric_batch_size = config
            .metric_batch_size
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_METRIC_BATCH_SIZE);
        let log_name = match &config.alias {
            Some(alias) => format!("outputs.{}::{alias}", config.name),
            None => format!("outputs.{}", config.name),
        };
        let (batch_ready_tx, batch_ready_rx) = mpsc::channel(1);

        let wrapper = RunningOutput {
            output: Mutex::new(output),
            config,
            metric_batch_size,
            buffer: Buffer::new(metric_buffer_limit),
            batch_ready_tx,
            new_metrics_count: AtomicI64::new(0),
            dropped_metrics: AtomicI64::new(0),
            log_name,
        };
        (wrapper, batch_ready_rx)
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// No-op placeholder mirroring the sink lifecycle.
    pub async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    pub async fn connect(&self) -> anyhow::Result<()> {
        self.output.lock().await.connect().await
    }

    /// Adds a metric to this output: to the aggregating sink directly if it
    /// has that capability, otherwise to the bounded buffer. Signals the
    /// batch-ready channel (non-blockingly) once a full batch has
    /// accumulated since the last flush.
    pub async fn add_metric(&self, metric: Metric) {
        {
            let mut sink = self.output.lock().await;
            if let Some(agg) = sink.as_aggregating_mut() {
                agg.add(metric);
                return;
            }
        }

        let dropped = self.buffer.add(std::iter::once(metric));
        if dropped > 0 {
            self.dropped_metrics.fetch_add(dropped as i64, Ordering::Relaxed);
        }

        let count = self.new_metrics_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == self.metric_batch_size as i64 {
            self.new_metrics_count.store(0, Ordering::Relaxed);
            let _ = self.batch_ready_tx.try_send(Instant::now());
        }
    }

    /// Drains the whole buffer (and, for aggregating sinks, whatever the
    /// sink has accumulated) to the underlying sink, one batch at a time.
    /// Stops and returns the error as soon as one write fails; the failed
    /// batch is rejected back into the buffer for a later retry.
    pub async fn write(&self) -> anyhow::Result<()> {
        let mut sink = self.output.lock().await;

        if let Some(agg) = sink.as_aggregating_mut() {
            let metrics = agg.push();
            self.buffer.add(metrics);
            agg.reset();
        }
        self.new_metrics_count.store(0, Ordering::Relaxed);

        // Only process the metrics in the buffer now; metrics added while
        // we are writing will be sent on the next call. The `+ 1` always
        // makes one extra, harmless attempt that breaks on an empty batch.
        let n_buffer = self.buffer.len();
        let n_batches = n_buffer / self.metric_batch_size + 1;

        for _ in 0..n_batches {
            let batch = self.buffer.batch(self.metric_batch_size);
            if batch.is_empty() {
                break;
            }
            match self.write_batch_to(&mut sink, &batch).await {
                Ok(()) => self.buffer.accept(batch),
                Err(e) => {
                    self.buffer.reject(batch);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Writes a single batch, the fast path taken when the batch-ready
    /// signal fires between regular flush ticks.
    pub async fn write_batch(&self) -> anyhow::Result<()> {
        let batch = self.buffer.batch(self.metric_batch_size);
        if batch.is_empty() {
            return Ok(());
        }
        let mut sink = self.output.lock().await;
        match self.write_batch_to(&mut sink, &batch).await {
            Ok(()) => {
                self.buffer.accept(batch);
                Ok(())
            }
            Err(e) => {
                self.buffer.reject(batch);
                Err(e)
            }
        }
    }

    async fn write_batch_to(&self, sink: &mut Box<dyn Output>, metrics: &[Metric]) -> anyhow::Result<()> {
        let dropped = self.dropped_metrics.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("{}: metric buffer overflow; {dropped} metrics have been dropped", self.log_name);
        }

        let start = Instant::now();
        let result = sink.write(metrics).await;
        if result.is_ok() {
            log::debug!(
                "{}: wrote batch of {} metrics in {:?}",
                self.log_name,
                metrics.len(),
                start.elapsed()
            );
        }
        result
    }

    /// Closes the sink; errors are logged, never propagated.
    pub async fn close(&self) {
        let mut sink = self.output.lock().await;
        if let Err(e) = sink.close().await {
            log::error!("{}: error closing output: {e:#}", self.log_name);
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Timestamp;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct RecordingOutput {
        written: Arc<StdMutex<Vec<Vec<String>>>>,
        fail_next: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl Output for RecordingOutput {
        async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                anyhow::bail!("simulated write failure");
            }
            self.written
                .lock()
                .unwrap()
                .push(metrics.iter().map(|m| m.name().to_string()).collect());
            Ok(())
        }
    }

    fn m(name: &str) -> Metric {
        Metric::untyped(name, Vec::<(&str, &str)>::new(), Timestamp(0))
    }

    #[tokio::test]
    async fn write_drains_buffer_in_batches() {
        let written = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingOutput {
            written: written.clone(),
            fail_next: Arc::default(),
        };
        let mut config = OutputConfig::default();
        config.metric_batch_size = Some(2);
        let (out, _rx) = RunningOutput::new(Box::new(sink), config);

        for name in ["m1", "m2", "m3"] {
            out.add_metric(m(name)).await;
        }
        out.write().await.unwrap();

        let batches = written.lock().unwrap().clone();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 3);
        assert_eq!(out.buffer_len(), 0);
    }

    #[tokio::test]
    async fn failed_write_rejects_batch_for_retry() {
        let written = Arc::new(StdMutex::new(Vec::new()));
        let fail_next = Arc::new(StdMutex::new(true));
        let sink = RecordingOutput {
            written: written.clone(),
            fail_next: fail_next.clone(),
        };
        let mut config = OutputConfig::default();
        config.metric_batch_size = Some(10);
        let (out, _rx) = RunningOutput::new(Box::new(sink), config);

        out.add_metric(m("m1")).await;
        assert!(out.write().await.is_err());
        assert_eq!(out.buffer_len(), 1, "rejected metric should still be in the buffer");

        out.write().await.unwrap();
        assert_eq!(out.buffer_len(), 0);
        assert_eq!(written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_ready_fires_once_a_full_batch_accumulates() {
        let sink = RecordingOutput::default();
        let mut config = OutputConfig::default();
        config.metric_batch_size = Some(2);
        let (out, mut rx) = RunningOutput::new(Box::new(sink), config);

        out.add_metric(m("m1")).await;
        assert!(rx.try_recv().is_err());
        out.add_metric(m("m2")).await;
        assert!(rx.try_recv().is_ok());
    }
}
