use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::engine::{Batch, Engine, Outputs};
use crate::export::health::HealthMetrics;
use crate::sink::jsonl::JsonlSink;
use crate::sink::summary::SummarySink;
use crate::sink::Sink;
use crate::tracer::event::{EventRecord, Provider};
use crate::tracer::replay::ReplaySource;
use crate::tracer::stats::LostEventCounters;
use crate::tracer::{EventSource, SessionSummary};

/// How often per-provider event counts are logged.
const EVENT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Totals for a finished recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub session: SessionSummary,
    pub presents: u64,
    pub compositor_frames: u64,
    pub lsrs: u64,
}

/// Agent orchestrates all components: event source, engine, consumer loop,
/// sinks and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    /// Stops recording.
    cancel: CancellationToken,
    /// Fires once the consumer has run its final drain.
    done: CancellationToken,
    producer: Option<thread::JoinHandle<Result<SessionSummary>>>,
    consumer: Option<JoinHandle<Result<ConsumerTotals>>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            producer: None,
            consumer: None,
        })
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    /// Token that stops recording when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token that fires once recording has finished and been drained.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Start recording from the configured replay file.
    pub async fn start(&mut self) -> Result<()> {
        let source = ReplaySource::open(&self.cfg.source.path, self.cfg.source.qpc_frequency)
            .context("opening trace source")?;

        self.start_with_source(Box::new(source)).await
    }

    /// Start recording from any event source.
    pub async fn start_with_source(&mut self, mut source: Box<dyn EventSource>) -> Result<()> {
        // 0. Start health metrics server.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 1. Subscribe to providers. Any failure here is fatal.
        let options = self.cfg.engine_options();
        let providers = options.providers();
        for provider in &providers {
            source
                .enable_provider(*provider)
                .with_context(|| format!("enabling provider {provider}"))?;
        }
        info!(
            providers = providers.len(),
            simple_mode = options.simple_mode(),
            "Trace session configured",
        );

        // 2. Create sinks.
        let frequency = source.frequency();
        let sinks = self.create_sinks(frequency)?;

        // 3. Start the producer thread.
        let outputs = Outputs::default();
        let lost = source.lost_counters();
        let producer_done = CancellationToken::new();
        {
            let outputs = outputs.clone();
            let cancel = self.cancel.clone();
            let producer_done = producer_done.clone();

            let handle = thread::Builder::new()
                .name("frametrace-producer".to_string())
                .spawn(move || {
                    // Releases the consumer even if the engine panics.
                    let done = producer_done.drop_guard();
                    let mut engine = Engine::new(options, outputs);
                    let result = source.run(&cancel, &mut |ev: &EventRecord| engine.handle(ev));
                    engine.finish();
                    drop(done);

                    let summary = result.context("trace session failed")?;
                    info!(
                        delivered = summary.delivered,
                        filtered = summary.filtered,
                        malformed = summary.malformed,
                        "Trace session finished",
                    );
                    Ok(summary)
                })
                .context("spawning producer thread")?;
            self.producer = Some(handle);
        }

        // 4. Start the consumer loop.
        let consumer = Consumer {
            outputs,
            aggregator: Aggregator::new(frequency, self.cfg.process_filter()),
            sinks,
            health: Arc::clone(&self.health),
            lost,
            max_lost_events: self.cfg.consumer.max_lost_events,
            cancel: self.cancel.clone(),
            totals: ConsumerTotals::default(),
            provider_counts: BTreeMap::new(),
            last_event_stats: Instant::now(),
        };
        self.consumer = Some(self.spawn_consumer(consumer, producer_done));

        // 5. Start the recording timer.
        if let Some(timer) = self.cfg.consumer.timer {
            self.spawn_timer(timer);
        }

        info!("Agent fully started");

        Ok(())
    }

    /// Wait for recording to finish, stopping it first if still running.
    pub async fn stop(&mut self) -> Result<RunSummary> {
        // Signal the producer; the consumer drains once it exits.
        self.cancel.cancel();

        let mut summary = RunSummary::default();

        if let Some(consumer) = self.consumer.take() {
            let totals = consumer
                .await
                .map_err(|e| anyhow!("consumer task failed: {e}"))??;
            summary.presents = totals.presents;
            summary.compositor_frames = totals.compositor_frames;
            summary.lsrs = totals.lsrs;
        }

        if let Some(producer) = self.producer.take() {
            summary.session = tokio::task::spawn_blocking(move || producer.join())
                .await
                .context("joining producer thread")?
                .map_err(|_| anyhow!("producer thread panicked"))??;
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(summary)
    }

    fn create_sinks(&self, frequency: u64) -> Result<Vec<Box<dyn Sink>>> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        let verbosity = self.cfg.tracking.verbosity;

        if self.cfg.sinks.jsonl.enabled {
            let sink = JsonlSink::create(
                &self.cfg.sinks.jsonl.path,
                frequency,
                verbosity,
                self.cfg.processes.exclude_dropped,
            )?;
            info!(path = %self.cfg.sinks.jsonl.path.display(), "JSONL sink configured");
            sinks.push(Box::new(sink));
        }

        if self.cfg.sinks.summary.enabled {
            sinks.push(Box::new(SummarySink::new(
                self.cfg.sinks.summary.interval,
                verbosity,
            )));
        }

        Ok(sinks)
    }

    /// Spawn the consumer loop. It polls on an interval until the producer
    /// exits, then runs one final drain.
    fn spawn_consumer(
        &self,
        mut consumer: Consumer,
        producer_done: CancellationToken,
    ) -> JoinHandle<Result<ConsumerTotals>> {
        let poll_interval = self.cfg.consumer.interval;
        let cancel = self.cancel.clone();
        let done = self.done.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let result = async {
                loop {
                    tokio::select! {
                        _ = producer_done.cancelled() => break,
                        _ = ticker.tick() => consumer.poll()?,
                    }
                }

                // Final drain.
                consumer.poll()?;
                consumer.close()?;
                consumer.log_event_stats();
                Ok::<_, anyhow::Error>(consumer.totals)
            }
            .await;

            if let Err(e) = &result {
                error!(error = %e, "Consumer failed, stopping recording");
                cancel.cancel();
            }
            done.cancel();
            result
        })
    }

    /// Spawn the timer that stops recording after `duration`.
    fn spawn_timer(&self, duration: Duration) {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    info!(?duration, "Recording timer elapsed, stopping");
                    cancel.cancel();
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ConsumerTotals {
    presents: u64,
    compositor_frames: u64,
    lsrs: u64,
}

/// Consumer-side state, owned by the consumer task.
struct Consumer {
    outputs: Outputs,
    aggregator: Aggregator,
    sinks: Vec<Box<dyn Sink>>,
    health: Arc<HealthMetrics>,
    lost: Arc<LostEventCounters>,
    max_lost_events: u64,
    cancel: CancellationToken,
    totals: ConsumerTotals,
    provider_counts: BTreeMap<Provider, u64>,
    last_event_stats: Instant,
}

impl Consumer {
    /// Drain completed records, update statistics and write the sinks.
    fn poll(&mut self) -> Result<()> {
        let start = Instant::now();

        self.check_lost_events();
        self.record_producer_stats();

        let batch = self.outputs.drain();
        self.health.consumer_batch_size.observe(batch.len() as f64);
        self.record_batch(&batch);

        let report = self.aggregator.apply(batch);
        for sink in &mut self.sinks {
            sink.write(&report)
                .with_context(|| format!("writing to {} sink", sink.name()))?;
            sink.tick(&self.aggregator)
                .with_context(|| format!("updating {} sink", sink.name()))?;
        }

        let processes = self.aggregator.processes();
        self.health.processes_tracked.set(processes.len() as f64);
        self.health
            .swap_chains_tracked
            .set(processes.swap_chain_count() as f64);
        self.health
            .consumer_poll_duration
            .observe(start.elapsed().as_secs_f64());

        if self.last_event_stats.elapsed() >= EVENT_STATS_INTERVAL {
            self.log_event_stats();
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.close()
                .with_context(|| format!("closing {} sink", sink.name()))?;
        }
        Ok(())
    }

    /// Stop recording when the trace layer loses too many events in one tick.
    fn check_lost_events(&self) {
        let (events, buffers) = self.lost.take();
        if events == 0 && buffers == 0 {
            return;
        }

        self.health.trace_events_lost.inc_by(events as f64);
        self.health.trace_buffers_lost.inc_by(buffers as f64);
        warn!(events_lost = events, buffers_lost = buffers, "Trace session lost events");

        if self.max_lost_events > 0 && events > self.max_lost_events {
            warn!(
                events_lost = events,
                max_lost_events = self.max_lost_events,
                "Too many lost events, stopping recording",
            );
            self.cancel.cancel();
        }
    }

    fn record_producer_stats(&mut self) {
        let pipeline = self.outputs.stats.snapshot();
        self.health
            .events_dropped
            .inc_by(pipeline.events_dropped as f64);
        self.health
            .presents_abandoned
            .inc_by(pipeline.presents_abandoned as f64);
        self.health
            .double_completions
            .inc_by(pipeline.double_completions as f64);

        for (provider, count) in self.outputs.provider_stats.snapshot() {
            self.health
                .events_by_provider
                .with_label_values(&[provider.as_str()])
                .inc_by(count as f64);
            *self.provider_counts.entry(provider).or_default() += count;
        }
    }

    fn record_batch(&mut self, batch: &Batch) {
        for p in &batch.presents {
            self.health
                .presents_by_result
                .with_label_values(&[p.final_state.as_str()])
                .inc();
        }
        for f in &batch.compositor_frames {
            self.health
                .compositor_frames
                .with_label_values(&[f.kind.as_str()])
                .inc();
        }
        for l in &batch.lsrs {
            self.health
                .lsrs
                .with_label_values(&[l.final_state.as_str()])
                .inc();
        }

        self.totals.presents += batch.presents.len() as u64;
        self.totals.compositor_frames += batch.compositor_frames.len() as u64;
        self.totals.lsrs += batch.lsrs.len() as u64;
    }

    /// Log and reset per-provider event counts.
    fn log_event_stats(&mut self) {
        self.last_event_stats = Instant::now();

        let total: u64 = self.provider_counts.values().sum();
        if total == 0 {
            return;
        }

        info!(events = total, "Event stats");

        for (provider, count) in &self.provider_counts {
            debug!(provider = %provider, count, "  by provider");
        }
        self.provider_counts.clear();
    }
}
