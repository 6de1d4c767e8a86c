//! The orchestration engine: periodic gather, fan-in, fan-out, flush, and
//! the shutdown sequence that ties all of the above together.
//!
//! [`Agent`] is a passive collection of configured inputs/outputs until
//! [`Agent::run`] is called; `run` drives the whole pipeline to completion
//! and only returns once every task has shut down.

pub mod config;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

use crate::agent::config::AgentSettings;
use crate::error::AgentError;
use crate::input::{Input, InputConfig, RunningInput};
use crate::metric::Metric;
use crate::output::{Output, OutputConfig, RunningOutput};

/// Fixed capacity of the channel every gather task feeds and the fan-out
/// task drains. Producers block when it is full; this is the pipeline's
/// only intentional back-pressure point.
const FAN_IN_CHANNEL_CAPACITY: usize = 100;

/// How long to wait before retrying a failed `connect()`, and how many
/// times: exactly once, per the startup sequence.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// A not-yet-running collection of inputs and outputs, plus the settings
/// that govern scheduling, flushing and naming.
pub struct Agent {
    settings: AgentSettings,
    default_tags: BTreeMap<String, String>,
    inputs: Vec<(Box<dyn Input>, InputConfig)>,
    outputs: Vec<(Box<dyn Output>, OutputConfig)>,
}

impl Agent {
    pub fn new(settings: AgentSettings, default_tags: BTreeMap<String, String>) -> Self {
        Agent {
            settings,
            default_tags,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(&mut self, input: Box<dyn Input>, config: InputConfig) {
        self.inputs.push((input, config));
    }

    pub fn add_output(&mut self, output: Box<dyn Output>, config: OutputConfig) {
        self.outputs.push((output, config));
    }

    /// Runs the pipeline to completion. Does not return until every input,
    /// the fan-out task and every output have shut down, which only
    /// happens once `cancel` has been cancelled (or a fatal startup error
    /// occurs first).
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let Agent {
            settings,
            default_tags,
            inputs,
            outputs,
        } = self;

        let precision = settings.precision.unwrap_or_else(|| default_precision(settings.interval));

        // Step 1: init every input, then every output. Each failure is
        // fatal for startup.
        let (tx, rx) = mpsc::channel::<Metric>(FAN_IN_CHANNEL_CAPACITY);
        let mut running_inputs = Vec::with_capacity(inputs.len());
        for (input, config) in inputs {
            let mut running = RunningInput::new(input, config, tx.clone());
            running.set_default_tags(default_tags.clone());
            running.set_precision(precision);
            running
                .init()
                .map_err(|e| AgentError::Init(running.log_name().to_string(), e))?;
            running_inputs.push(running);
        }
        // Every input holds its own clone of `tx`; dropping this one means
        // the channel closes exactly when the last gather task exits.
        drop(tx);

        let mut running_outputs = Vec::with_capacity(outputs.len());
        let mut batch_ready_rxs = Vec::with_capacity(outputs.len());
        for (output, config) in outputs {
            let (running, batch_ready_rx) = RunningOutput::new(output, config);
            running
                .init()
                .await
                .map_err(|e| AgentError::Init(running.log_name().to_string(), e))?;
            running_outputs.push(Arc::new(running));
            batch_ready_rxs.push(batch_ready_rx);
        }

        // Step 2: connect every output, one retry after a fixed delay.
        for output in &running_outputs {
            if let Err(first_err) = output.connect().await {
                log::warn!(
                    "{}: connect failed, retrying in {CONNECT_RETRY_DELAY:?}: {first_err:#}",
                    output.log_name()
                );
                if cancellable_sleep(CONNECT_RETRY_DELAY, &cancel).await.is_err() {
                    // Cancelled while waiting to retry: a clean shutdown, not a failure.
                    return Ok(());
                }
                output
                    .connect()
                    .await
                    .map_err(|e| AgentError::Connect(output.log_name().to_string(), e))?;
            }
        }

        // Step 3 & 4: the fan-in channel already exists; start the gather
        // tasks and the fan-out task.
        let mut gather_tasks = JoinSet::new();
        for running in running_inputs {
            let interval = running.config.interval.unwrap_or(settings.interval);
            gather_tasks.spawn(gather_loop(
                running,
                interval,
                settings.round_interval,
                settings.collection_jitter,
                cancel.clone(),
            ));
        }

        // Flush tasks watch a dedicated token that the fan-out task cancels
        // only once the fan-in channel has actually drained and closed, so
        // a flush task's final write always sees everything the fan-out
        // task produced, even if the caller's `cancel` fires first.
        let flush_shutdown = CancellationToken::new();

        let fan_out_handle = tokio::spawn(fan_out(rx, running_outputs.clone(), flush_shutdown.clone()));

        let mut flush_tasks = JoinSet::new();
        for (output, batch_ready_rx) in running_outputs.iter().cloned().zip(batch_ready_rxs) {
            let flush_interval = output.config.flush_interval.unwrap_or(settings.flush_interval);
            let flush_jitter = output.config.flush_jitter.unwrap_or(settings.flush_jitter);
            flush_tasks.spawn(flush_loop(
                output,
                flush_interval,
                flush_jitter,
                batch_ready_rx,
                flush_shutdown.clone(),
            ));
        }

        // Shutdown ordering (see SPEC_FULL.md §4.6):
        // gather tasks exit -> fan-in channel closes -> fan-out drains and
        // cancels `flush_shutdown` -> flush tasks do a final write -> we
        // close every output.
        while let Some(res) = gather_tasks.join_next().await {
            if let Err(join_err) = res {
                log::error!("a gather task terminated abnormally: {join_err}");
            }
        }

        if let Err(join_err) = fan_out_handle.await {
            log::error!("the fan-out task terminated abnormally: {join_err}");
        }

        while let Some(res) = flush_tasks.join_next().await {
            if let Err(join_err) = res {
                log::error!("a flush task terminated abnormally: {join_err}");
            }
        }

        for output in &running_outputs {
            output.close().await;
        }

        Ok(())
    }
}

/// Repeatedly invokes one input's probe on its configured schedule until
/// `cancel` fires or the probe reports a fatal error. A slow or panicking
/// probe only takes down this input's own task.
async fn gather_loop(
    mut running: RunningInput,
    interval: Duration,
    round_interval: bool,
    collection_jitter: Duration,
    cancel: CancellationToken,
) {
    if round_interval && cancellable_sleep(duration_until_aligned(interval), &cancel).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }

        if cancellable_sleep(jittered_duration(collection_jitter), &cancel).await.is_err() {
            return;
        }

        let gather_fut = running.gather();
        tokio::pin!(gather_fut);
        loop {
            tokio::select! {
                res = &mut gather_fut => {
                    if let Err(e) = res {
                        log::error!("{}: fatal gather error, this input is stopping: {e:#}", running.log_name());
                        return;
                    }
                    break;
                }
                _ = ticker.tick() => {
                    log::warn!("{}: gather is still running past its next scheduled tick", running.log_name());
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
    }
}

/// Reads the fan-in channel and hands every metric to every output,
/// deep-copying for all but the last recipient so that each output owns a
/// structurally independent value. Cancels `shutdown` once the channel
/// closes (all gather tasks have exited), which is the flush tasks' signal
/// to perform their final write.
async fn fan_out(mut rx: mpsc::Receiver<Metric>, outputs: Vec<Arc<RunningOutput>>, shutdown: CancellationToken) {
    while let Some(metric) = rx.recv().await {
        let n = outputs.len();
        if n == 0 {
            continue;
        }
        for output in &outputs[..n - 1] {
            output.add_metric(metric.clone_deep()).await;
        }
        outputs[n - 1].add_metric(metric).await;
    }
    shutdown.cancel();
}

/// Drains one output's buffer on a jittered interval, with a batch-ready
/// fast path for bursts that fill a batch between ticks. Performs one
/// final `write` once `shutdown` fires, then closes the sink.
async fn flush_loop(
    output: Arc<RunningOutput>,
    flush_interval: Duration,
    flush_jitter: Duration,
    mut batch_ready_rx: mpsc::Receiver<TokioInstant>,
    shutdown: CancellationToken,
) {
    let mut ticker = JitteredTicker::new(flush_interval, flush_jitter);

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = output.write().await {
                    log::warn!("{}: flush failed, will retry: {e:#}", output.log_name());
                }
            }
            _ = batch_ready_rx.recv() => {
                let result = if ticker.try_tick() {
                    output.write().await
                } else {
                    output.write_batch().await
                };
                if let Err(e) = result {
                    log::warn!("{}: flush failed, will retry: {e:#}", output.log_name());
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    if let Err(e) = output.write().await {
        log::warn!("{}: final flush before shutdown failed: {e:#}", output.log_name());
    }
}

/// Sleeps for `duration`, or returns early with `Err(())` if `cancel` fires
/// first.
async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), ()> {
    if duration.is_zero() {
        if cancel.is_cancelled() {
            return Err(());
        }
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

/// A uniformly random duration in `[0, max]`. Zero if `max` is zero.
fn jittered_duration(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..=max.as_nanos());
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

/// Time remaining until the next wall-clock instant that is an exact
/// multiple of `interval` since the Unix epoch. Zero if `interval` is zero
/// or the clock already sits on a boundary.
fn duration_until_aligned(interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let interval_nanos = interval.as_nanos();
    let remainder = now.as_nanos() % interval_nanos;
    if remainder == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos((interval_nanos - remainder) as u64)
    }
}

/// The coarsest of {1s, 1ms, 1us, 1ns} that does not exceed `base_interval`,
/// used when the configuration does not specify an explicit precision.
fn default_precision(base_interval: Duration) -> Duration {
    const CANDIDATES: [Duration; 4] = [
        Duration::from_secs(1),
        Duration::from_millis(1),
        Duration::from_micros(1),
        Duration::from_nanos(1),
    ];
    CANDIDATES
        .into_iter()
        .find(|candidate| *candidate <= base_interval)
        .unwrap_or(Duration::from_nanos(1))
}

/// A ticker whose period is `interval` plus a fresh random jitter in
/// `[0, jitter)` picked after every tick. `tokio::time::interval` has no
/// per-tick jitter, so the flush loop needs this instead.
struct JitteredTicker {
    interval: Duration,
    jitter: Duration,
    next_deadline: TokioInstant,
}

impl JitteredTicker {
    fn new(interval: Duration, jitter: Duration) -> Self {
        let mut ticker = JitteredTicker {
            interval,
            jitter,
            next_deadline: TokioInstant::now(),
        };
        ticker.advance();
        ticker
    }

    async fn tick(&mut self) {
        tokio::time::sleep_until(self.next_deadline).await;
        self.advance();
    }

    /// Non-blocking: if the deadline has already passed, advances it and
    /// reports as if `tick` had fired; otherwise leaves the deadline
    /// untouched and reports `false`.
    fn try_tick(&mut self) -> bool {
        if TokioInstant::now() >= self.next_deadline {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        self.next_deadline = TokioInstant::now() + self.interval + jittered_duration(self.jitter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Timestamp;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn default_precision_picks_the_coarsest_fit() {
        assert_eq!(default_precision(Duration::from_secs(10)), Duration::from_secs(1));
        assert_eq!(default_precision(Duration::from_millis(500)), Duration::from_millis(1));
        assert_eq!(default_precision(Duration::from_micros(5)), Duration::from_micros(1));
        assert_eq!(default_precision(Duration::from_nanos(0)), Duration::from_nanos(1));
    }

    #[test]
    fn jittered_duration_never_exceeds_the_max() {
        for _ in 0..100 {
            let d = jittered_duration(Duration::from_millis(10));
            assert!(d <= Duration::from_millis(10));
        }
        assert_eq!(jittered_duration(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_ticker_try_tick_is_false_before_the_deadline_and_true_after() {
        let mut ticker = JitteredTicker::new(Duration::from_secs(10), Duration::ZERO);
        assert!(!ticker.try_tick());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(ticker.try_tick());
        assert!(!ticker.try_tick());
    }

    fn m(name: &str) -> Metric {
        let mut metric = Metric::untyped(name, Vec::<(&str, &str)>::new(), Timestamp(0));
        metric.add_field("value", 1.0_f64);
        metric
    }

    #[derive(Default)]
    struct RecordingOutput {
        written: Arc<StdMutex<Vec<Metric>>>,
    }

    #[async_trait]
    impl Output for RecordingOutput {
        async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
            self.written.lock().unwrap().extend(metrics.iter().map(|m| m.clone_deep()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn fan_out_gives_every_output_a_structurally_independent_copy() {
        let first_written = Arc::new(StdMutex::new(Vec::new()));
        let second_written = Arc::new(StdMutex::new(Vec::new()));
        let (first, _rx1) = RunningOutput::new(
            Box::new(RecordingOutput {
                written: first_written.clone(),
            }),
            OutputConfig::default(),
        );
        let (second, _rx2) = RunningOutput::new(
            Box::new(RecordingOutput {
                written: second_written.clone(),
            }),
            OutputConfig::default(),
        );
        let outputs = vec![Arc::new(first), Arc::new(second)];

        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(fan_out(rx, outputs.clone(), shutdown.clone()));

        let mut metric = m("cpu");
        metric.set_tag("host", "a");
        tx.send(metric).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert!(shutdown.is_cancelled());

        outputs[0].write().await.unwrap();
        outputs[1].write().await.unwrap();

        let mut first_seen = first_written.lock().unwrap().clone();
        let mut second_seen = second_written.lock().unwrap().clone();
        assert_eq!(first_seen.len(), 1);
        assert_eq!(second_seen.len(), 1);

        // mutating one output's copy must not affect the other's.
        first_seen[0].set_tag("host", "mutated");
        assert_ne!(
            first_seen[0].tags().iter().find(|(k, _)| k == "host"),
            second_seen[0].tags().iter().find(|(k, _)| k == "host")
        );
        let _ = &mut second_seen;
    }

    #[tokio::test]
    async fn run_flushes_every_output_before_closing_it() {
        struct OneShotInput(bool);
        #[async_trait]
        impl Input for OneShotInput {
            async fn gather(&mut self, acc: &crate::accumulator::Accumulator<'_>) -> anyhow::Result<()> {
                if !self.0 {
                    self.0 = true;
                    acc.add_gauge(
                        "cpu",
                        crate::accumulator::fields(vec![("usage", 1.0_f64)]),
                        Vec::<(&str, &str)>::new(),
                        None,
                    )
                    .await;
                }
                Ok(())
            }
        }

        let written = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(StdMutex::new(false));

        struct TrackingOutput {
            written: Arc<StdMutex<Vec<Metric>>>,
            closed: Arc<StdMutex<bool>>,
        }
        #[async_trait]
        impl Output for TrackingOutput {
            async fn write(&mut self, metrics: &[Metric]) -> anyhow::Result<()> {
                self.written.lock().unwrap().extend(metrics.iter().map(|m| m.clone_deep()));
                Ok(())
            }
            async fn close(&mut self) -> anyhow::Result<()> {
                *self.closed.lock().unwrap() = true;
                Ok(())
            }
        }

        let mut settings = AgentSettings {
            interval: Duration::from_millis(5),
            round_interval: false,
            ..Default::default()
        };
        settings.flush_interval = Duration::from_secs(3600);

        let mut agent = Agent::new(settings, BTreeMap::new());
        agent.add_input(Box::new(OneShotInput(false)), InputConfig::default());
        agent.add_output(
            Box::new(TrackingOutput {
                written: written.clone(),
                closed: closed.clone(),
            }),
            OutputConfig::default(),
        );

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(agent.run(run_cancel));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(written.lock().unwrap().len(), 1);
        assert!(*closed.lock().unwrap());
    }
}
