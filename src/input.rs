//! Input probes and the wrapper that adapts them to the pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::accumulator::{Accumulator, MetricMaker};
use crate::metric::Metric;

/// A probe that gathers measurements on demand.
///
/// Implementations are expected to call one of [`Accumulator::add_fields`],
/// [`Accumulator::add_gauge`] or [`Accumulator::add_counter`] for each
/// measurement they produce, and to report internal failures through
/// [`Accumulator::add_error`] rather than the returned `Result` (the
/// returned error is reserved for failures severe enough that the agent
/// should stop scheduling this input's gather task).
#[async_trait]
pub trait Input: Send + Sync {
    /// An example configuration snippet, shown to operators.
    fn sample_config(&self) -> &str {
        ""
    }

    fn description(&self) -> &str {
        ""
    }

    async fn gather(&mut self, acc: &Accumulator<'_>) -> anyhow::Result<()>;
}

/// Common configuration shared by every input, regardless of which probe it
/// wraps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub name: String,
    pub alias: Option<String>,
    #[serde(with = "humantime_serde::option")]
    pub interval: Option<Duration>,

    pub name_override: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// The naming/tag part of a [`RunningInput`], split out so that it can be
/// borrowed independently of the boxed probe: building an [`Accumulator`]
/// only ever needs this half, while `gather` needs `&mut` access to the
/// probe, and Rust's field-sensitive borrow checker is happy to hand out
/// both at once as long as they're disjoint fields.
struct InputNaming<'a> {
    log_name: &'a str,
    config: &'a InputConfig,
    default_tags: &'a BTreeMap<String, String>,
}

impl MetricMaker for InputNaming<'_> {
    fn log_name(&self) -> String {
        self.log_name.to_string()
    }

    fn make_metric(&self, mut metric: Metric) -> Option<Metric> {
        if let Some(name) = &self.config.name_override {
            metric.set_name(name.clone());
        }
        if let Some(prefix) = &self.config.name_prefix {
            metric.add_prefix(prefix);
        }
        if let Some(suffix) = &self.config.name_suffix {
            metric.add_suffix(suffix);
        }

        // Default tags first, then per-input tags: per-input wins on conflict.
        for (k, v) in self.default_tags {
            metric.set_tag(k.clone(), v.clone());
        }
        for (k, v) in &self.config.tags {
            metric.set_tag(k.clone(), v.clone());
        }

        if metric.is_empty() {
            return None;
        }
        Some(metric)
    }
}

/// Binds a probe to its configuration, its slice of the fan-in channel, and
/// applies naming/tag rewrites to every metric it produces before it
/// reaches the pipeline.
pub struct RunningInput {
    pub input: Box<dyn Input>,
    pub config: InputConfig,
    default_tags: BTreeMap<String, String>,
    log_name: String,
    tx: mpsc::Sender<Metric>,
    precision: Duration,
}

impl RunningInput {
    pub fn new(input: Box<dyn Input>, config: InputConfig, tx: mpsc::Sender<Metric>) -> Self {
        let log_name = match &config.alias {
            Some(alias) => format!("inputs.{}::{alias}", config.name),
            None => format!("inputs.{}", config.name),
        };
        RunningInput {
            input,
            config,
            default_tags: BTreeMap::new(),
            log_name,
            tx,
            precision: Duration::from_nanos(1),
        }
    }

    pub fn set_default_tags(&mut self, tags: BTreeMap<String, String>) {
        self.default_tags = tags;
    }

    /// Sets the timestamp rounding precision applied to every metric this
    /// input emits, per the agent's resolved precision policy.
    pub fn set_precision(&mut self, precision: Duration) {
        self.precision = precision;
    }

    /// No-op placeholder mirroring the probe lifecycle; kept for symmetry
    /// with [`crate::output::RunningOutput::init`].
    pub fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Applies the naming/tag rewrites a freshly gathered metric needs,
    /// dropping it if it ends up with no fields. Exposed mainly for tests;
    /// [`gather`](Self::gather) applies the same logic to every metric a
    /// probe emits.
    pub fn make_metric(&self, metric: Metric) -> Option<Metric> {
        self.naming().make_metric(metric)
    }

    fn naming(&self) -> InputNaming<'_> {
        InputNaming {
            log_name: &self.log_name,
            config: &self.config,
            default_tags: &self.default_tags,
        }
    }

    pub async fn gather(&mut self) -> anyhow::Result<()> {
        let naming = InputNaming {
            log_name: &self.log_name,
            config: &self.config,
            default_tags: &self.default_tags,
        };
        let mut acc = Accumulator::new(&naming, self.tx.clone());
        acc.set_precision(self.precision);
        self.input.gather(&acc).await
    }
}
