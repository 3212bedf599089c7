//! The shard-fanout Producer: buffers `send`s, batches them by size or idle time, and rotates
//! writes across shard-streams with retry.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::config::ProducerOptions;
use crate::error::{AmiError, AmiResult};
use crate::metrics::AmiMetrics;
use crate::naming::shard_stream;
use crate::notifier::{ErrorNotifier, TracingNotifier};
use crate::redis::Store;
use crate::retry::{RetryConfig, RetryError, Retrier};

/// Ingests strings on a bounded intake channel and publishes them across `shards_count`
/// shard-streams. See the crate-level docs for the full lifecycle.
pub struct Producer {
    name: String,
    intake: Option<mpsc::Sender<String>>,
    batcher: Option<tokio::task::JoinHandle<()>>,
    metrics: Option<Arc<AmiMetrics>>,
}

impl Producer {
    /// Provisions shards, then spawns the batcher. Logs errors via `tracing` unless
    /// [`Producer::with_notifier`] is used instead.
    pub async fn new(opt: ProducerOptions, store: Store) -> AmiResult<Self> {
        Self::with_notifier(opt, store, Arc::new(TracingNotifier)).await
    }

    pub async fn with_notifier(
        opt: ProducerOptions,
        store: Store,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> AmiResult<Self> {
        Self::with_notifier_and_metrics(opt, store, notifier, None).await
    }

    /// Like [`Producer::with_notifier`], but also records counters/histograms on `metrics` for
    /// every send, flush, and retry/error. Pass `None` to run without instrumentation.
    pub async fn with_notifier_and_metrics(
        opt: ProducerOptions,
        store: Store,
        notifier: Arc<dyn ErrorNotifier>,
        metrics: Option<Arc<AmiMetrics>>,
    ) -> AmiResult<Self> {
        opt.validate()?;
        store.ensure_shards(&opt.name, opt.shards_count).await?;

        let (tx, rx) = mpsc::channel(opt.pending_buffer_size);
        let name = opt.name.clone();
        let retrier = Arc::new(Retrier::new(RetryConfig::default()));
        let batcher = tokio::spawn(batcher_loop(opt, store, rx, notifier, retrier, metrics.clone()));

        Ok(Self {
            name,
            intake: Some(tx),
            batcher: Some(batcher),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `m`. Awaits if the intake channel is at capacity (`pending_buffer_size`).
    pub async fn send(&self, m: String) -> AmiResult<()> {
        let tx = self.intake.as_ref().ok_or(AmiError::Closed("producer"))?;
        tx.send(m).await.map_err(|_| AmiError::Closed("producer"))?;
        if let Some(m) = &self.metrics {
            m.inc_sent();
        }
        Ok(())
    }

    /// Closes the intake channel and awaits until every buffered message has been dispatched.
    pub async fn close(mut self) -> AmiResult<()> {
        self.intake.take();
        if let Some(handle) = self.batcher.take() {
            handle.await?;
        }
        Ok(())
    }
}

async fn batcher_loop(
    opt: ProducerOptions,
    store: Store,
    mut rx: mpsc::Receiver<String>,
    notifier: Arc<dyn ErrorNotifier>,
    retrier: Arc<Retrier>,
    metrics: Option<Arc<AmiMetrics>>,
) {
    let mut buf: Vec<String> = Vec::with_capacity(opt.pipe_buffer_size);
    let mut started = Instant::now();
    let mut shard: u32 = 0;
    let mut writers: JoinSet<()> = JoinSet::new();

    let mut ticker = tokio::time::interval(opt.pipe_period_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(m) => {
                        buf.push(m);
                        if buf.len() >= opt.pipe_buffer_size {
                            flush(&mut buf, &mut shard, &opt, &store, &notifier, &retrier, &metrics, &mut writers);
                            started = Instant::now();
                        }
                    }
                    None => {
                        if !buf.is_empty() {
                            flush(&mut buf, &mut shard, &opt, &store, &notifier, &retrier, &metrics, &mut writers);
                        }
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buf.is_empty() && started.elapsed() >= opt.pipe_period_duration() && rx.is_empty() {
                    flush(&mut buf, &mut shard, &opt, &store, &notifier, &retrier, &metrics, &mut writers);
                    started = Instant::now();
                }
            }
        }
    }

    while writers.join_next().await.is_some() {}
}

/// Snapshots `buf`, dispatches it to the current `shard` on a spawned task (tracked by
/// `writers`), then advances the round-robin cursor. Does not await the dispatch: the batcher
/// keeps accepting intake while the store round-trip is in flight.
fn flush(
    buf: &mut Vec<String>,
    shard: &mut u32,
    opt: &ProducerOptions,
    store: &Store,
    notifier: &Arc<dyn ErrorNotifier>,
    retrier: &Arc<Retrier>,
    metrics: &Option<Arc<AmiMetrics>>,
    writers: &mut JoinSet<()>,
) {
    let batch = std::mem::replace(buf, Vec::with_capacity(opt.pipe_buffer_size));
    let stream = shard_stream(&opt.name, *shard);
    let store = store.clone();
    let notifier = notifier.clone();
    let retrier = retrier.clone();
    let metrics = metrics.clone();

    writers.spawn(async move {
        write_shard(store, stream, batch, notifier, retrier, metrics).await;
    });

    *shard = (*shard + 1) % opt.shards_count;
}

async fn write_shard(
    store: Store,
    stream: String,
    batch: Vec<String>,
    notifier: Arc<dyn ErrorNotifier>,
    retrier: Arc<Retrier>,
    metrics: Option<Arc<AmiMetrics>>,
) {
    let n = batch.len() as u64;
    let started = Instant::now();
    let result = retrier
        .retry(|| {
            let store = store.clone();
            let stream = stream.clone();
            let batch = batch.clone();
            let notifier = notifier.clone();
            let metrics = metrics.clone();
            async move {
                store.xadd_batch(&stream, &batch).await.map_err(|e| {
                    notifier.notify(&e);
                    if let Some(m) = &metrics {
                        m.inc_retry("producer_xadd");
                        m.inc_error("producer_xadd");
                    }
                    RetryError::transient(e)
                })
            }
        })
        .await;

    match result {
        Ok(()) => {
            if let Some(m) = &metrics {
                m.inc_flushed(n);
                m.observe_flush_latency(started.elapsed().as_secs_f64());
            }
        }
        Err(e) => notifier.notify(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The flush-condition decision as a pure function, extracted from `batcher_loop`'s
    /// `tokio::select!` arms so it can be unit tested without a runtime.
    fn should_flush_on_tick(buf_empty: bool, elapsed_ge_period: bool, intake_empty: bool) -> bool {
        !buf_empty && elapsed_ge_period && intake_empty
    }

    #[test]
    fn time_flush_requires_idle_intake() {
        assert!(should_flush_on_tick(false, true, true));
        assert!(!should_flush_on_tick(false, true, false));
        assert!(!should_flush_on_tick(true, true, true));
        assert!(!should_flush_on_tick(false, false, true));
    }

    #[test]
    fn shard_cursor_wraps() {
        let mut shard = 2u32;
        let shards_count = 3u32;
        shard = (shard + 1) % shards_count;
        assert_eq!(shard, 0);
    }
}
