//! The accumulator is the contract an input probe uses to emit metrics.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::metric::{FieldValue, IntoFieldValue, Metric, MetricKind, Timestamp};

/// Applies the per-input naming/tag transforms to a freshly built metric,
/// and reports how the owner should be named in diagnostics.
///
/// Implemented by [`crate::input::RunningInput`].
pub trait MetricMaker {
    fn log_name(&self) -> String;

    /// Returns `None` to drop the metric (e.g. because it ended up with no
    /// fields after the transform).
    fn make_metric(&self, metric: Metric) -> Option<Metric>;
}

/// Bridges an input probe to the pipeline's fan-in channel.
///
/// Every `add_*` call resolves a timestamp (the one given, or now), rounds
/// it to the configured [`set_precision`](Accumulator::set_precision), asks
/// the owning [`MetricMaker`] to rewrite or drop the metric, and sends the
/// survivor on the shared channel. The send is the pipeline's only
/// back-pressure mechanism during steady state: it blocks the gathering
/// task when the channel is full.
pub struct Accumulator<'m> {
    maker: &'m dyn MetricMaker,
    metrics: mpsc::Sender<Metric>,
    precision: Duration,
}

impl<'m> Accumulator<'m> {
    pub fn new(maker: &'m dyn MetricMaker, metrics: mpsc::Sender<Metric>) -> Self {
        Accumulator {
            maker,
            metrics,
            precision: Duration::from_nanos(1),
        }
    }

    /// Sets the rounding precision applied to every subsequent timestamp.
    pub fn set_precision(&mut self, precision: Duration) {
        self.precision = precision;
    }

    pub async fn add_fields<I, K, V, F>(&self, measurement: &str, fields: F, tags: I, time: Option<Timestamp>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        F: IntoIterator<Item = (String, Option<FieldValue>)>,
    {
        self.add(measurement, fields, tags, time, MetricKind::Untyped).await
    }

    pub async fn add_gauge<I, K, V, F>(&self, measurement: &str, fields: F, tags: I, time: Option<Timestamp>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        F: IntoIterator<Item = (String, Option<FieldValue>)>,
    {
        self.add(measurement, fields, tags, time, MetricKind::Gauge).await
    }

    pub async fn add_counter<I, K, V, F>(&self, measurement: &str, fields: F, tags: I, time: Option<Timestamp>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        F: IntoIterator<Item = (String, Option<FieldValue>)>,
    {
        self.add(measurement, fields, tags, time, MetricKind::Counter).await
    }

    async fn add<I, K, V, F>(&self, measurement: &str, fields: F, tags: I, time: Option<Timestamp>, kind: MetricKind)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        F: IntoIterator<Item = (String, Option<FieldValue>)>,
    {
        let time = self.resolve_time(time);
        let metric = Metric::new(measurement, tags, fields, time, kind);
        if let Some(metric) = self.maker.make_metric(metric) {
            if self.metrics.send(metric).await.is_err() {
                log::debug!("{}: fan-in channel closed, dropping metric", self.maker.log_name());
            }
        }
    }

    /// Reports a probe-side error. Handled locally: logged, never
    /// propagated into the pipeline.
    pub fn add_error(&self, err: anyhow::Error) {
        log::error!("Error in input {}: {err:#}", self.maker.log_name());
    }

    fn resolve_time(&self, time: Option<Timestamp>) -> Timestamp {
        time.unwrap_or_else(Timestamp::now).round_down(self.precision)
    }
}

/// Helper for building a field list from pairs whose values implement
/// [`IntoFieldValue`]. Most probes will call this instead of constructing
/// the iterator of `(String, Option<FieldValue>)` by hand.
pub fn fields<I, K, V>(pairs: I) -> Vec<(String, Option<FieldValue>)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: IntoFieldValue,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into_field_value()))
        .collect()
}
