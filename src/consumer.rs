//! The per-shard Consumer: backlog recovery + blocking live reads under a consumer-group
//! discipline, plus the ack batcher that coalesces per-message acks into pipelined transactions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::ConsumerOptions;
use crate::error::{AmiError, AmiResult};
use crate::message::Message;
use crate::metrics::AmiMetrics;
use crate::naming::{group_name, shard_stream};
use crate::notifier::{ErrorNotifier, TracingNotifier};
use crate::redis::Store;
use crate::retry::{RetryConfig, RetryError, Retrier};

/// Pulls messages from `shards_count` shard-streams and delivers them to the application with
/// explicit acknowledgement. See the crate-level docs for the full lifecycle
/// (`start` -> `stop` -> `close`).
pub struct Consumer {
    opt: ConsumerOptions,
    store: Store,
    notifier: Arc<dyn ErrorNotifier>,
    retrier: Arc<Retrier>,
    need_stop: Arc<AtomicBool>,
    delivery_tx: Option<mpsc::Sender<Message>>,
    delivery_rx: Option<mpsc::Receiver<Message>>,
    ack_tx: Option<mpsc::Sender<Message>>,
    ack_batcher: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
    metrics: Option<Arc<AmiMetrics>>,
}

impl Consumer {
    pub async fn new(opt: ConsumerOptions, store: Store) -> AmiResult<Self> {
        Self::with_notifier(opt, store, Arc::new(TracingNotifier)).await
    }

    pub async fn with_notifier(
        opt: ConsumerOptions,
        store: Store,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> AmiResult<Self> {
        Self::with_notifier_and_metrics(opt, store, notifier, None).await
    }

    /// Like [`Consumer::with_notifier`], but also records counters/histograms on `metrics` for
    /// every delivery, ack, and retry/error. Pass `None` to run without instrumentation.
    pub async fn with_notifier_and_metrics(
        opt: ConsumerOptions,
        store: Store,
        notifier: Arc<dyn ErrorNotifier>,
        metrics: Option<Arc<AmiMetrics>>,
    ) -> AmiResult<Self> {
        opt.validate()?;
        store.ensure_shards(&opt.name, opt.shards_count).await?;

        let (delivery_tx, delivery_rx) = mpsc::channel(opt.prefetch_count.max(1) as usize);
        let (ack_tx, ack_rx) = mpsc::channel(opt.pending_buffer_size);

        let retrier = Arc::new(Retrier::new(RetryConfig::default()));
        let ack_batcher = tokio::spawn(ack_batcher_loop(
            opt.clone(),
            store.clone(),
            ack_rx,
            notifier.clone(),
            retrier.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            opt,
            store,
            notifier,
            retrier,
            need_stop: Arc::new(AtomicBool::new(false)),
            delivery_tx: Some(delivery_tx),
            delivery_rx: Some(delivery_rx),
            ack_tx: Some(ack_tx),
            ack_batcher: Some(ack_batcher),
            readers: Vec::new(),
            started: false,
            stopped: false,
            metrics,
        })
    }

    /// Spawns one reader task per shard and returns the delivery channel. May only be called
    /// once.
    pub fn start(&mut self) -> AmiResult<mpsc::Receiver<Message>> {
        if self.started {
            return Err(AmiError::Internal("consumer already started".into()));
        }
        self.started = true;

        let rx = self.delivery_rx.take().ok_or(AmiError::Closed("consumer"))?;
        let tx = self.delivery_tx.as_ref().ok_or(AmiError::Closed("consumer"))?.clone();

        for shard in 0..self.opt.shards_count {
            let handle = tokio::spawn(reader_loop(
                shard,
                self.opt.clone(),
                self.store.clone(),
                self.notifier.clone(),
                self.retrier.clone(),
                tx.clone(),
                self.need_stop.clone(),
                self.metrics.clone(),
            ));
            self.readers.push(handle);
        }

        // Drop our own sender clone: the delivery channel only closes once every reader task
        // (each holding its own clone) has exited.
        self.delivery_tx = None;

        Ok(rx)
    }

    /// Signals all readers to stop after their current read returns, awaits them, and lets the
    /// delivery channel close. The application observes shutdown as `recv()` returning `None`.
    pub async fn stop(&mut self) -> AmiResult<()> {
        self.need_stop.store(true, Ordering::SeqCst);
        for handle in self.readers.drain(..) {
            handle.await?;
        }
        self.stopped = true;
        Ok(())
    }

    /// Pushes `m` onto the ack intake channel. Awaits only if the channel is full.
    pub async fn ack(&self, m: Message) -> AmiResult<()> {
        let tx = self.ack_tx.as_ref().ok_or(AmiError::Closed("consumer"))?;
        tx.send(m).await.map_err(|_| AmiError::Closed("consumer"))
    }

    /// Closes the ack channel and awaits the ack batcher and every in-flight ack dispatch.
    /// `stop()` must precede `close()`; calling `close()` without `stop()` first is a logic
    /// error, not defended against at runtime.
    pub async fn close(mut self) -> AmiResult<()> {
        self.ack_tx.take();
        if let Some(handle) = self.ack_batcher.take() {
            handle.await?;
        }
        self.retrier.stop();
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

async fn reader_loop(
    shard: u32,
    opt: ConsumerOptions,
    store: Store,
    notifier: Arc<dyn ErrorNotifier>,
    retrier: Arc<Retrier>,
    tx: mpsc::Sender<Message>,
    need_stop: Arc<AtomicBool>,
    metrics: Option<Arc<AmiMetrics>>,
) {
    let stream = shard_stream(&opt.name, shard);
    let group = group_name(&opt.name);
    let consumer_name = opt.consumer.clone();
    let block = opt.effective_block_millis();
    let prefetch = opt.prefetch_count;

    let mut last_id = "0-0".to_string();
    let mut check_backlog = true;

    loop {
        if need_stop.load(Ordering::SeqCst) {
            break;
        }

        let id = if check_backlog { last_id.clone() } else { ">".to_string() };

        let reply = retrier
            .retry(|| {
                let store = store.clone();
                let stream = stream.clone();
                let group = group.clone();
                let consumer_name = consumer_name.clone();
                let id = id.clone();
                let notifier = notifier.clone();
                let metrics = metrics.clone();
                let need_stop = need_stop.clone();
                async move {
                    // Checked inside the retried op, not just at the top of the outer loop: a
                    // transient error hit while `stop()` is awaiting would otherwise keep this
                    // retry asleep on its backoff schedule indefinitely, and `stop()` wouldn't
                    // return until the store came back.
                    if need_stop.load(Ordering::SeqCst) {
                        return Err(RetryError::fatal(AmiError::Closed("consumer")));
                    }
                    store
                        .xreadgroup(&stream, &group, &consumer_name, &id, prefetch, block)
                        .await
                        .map_err(|e| {
                            notifier.notify(&e);
                            if let Some(m) = &metrics {
                                m.inc_retry("consumer_xreadgroup");
                                m.inc_error("consumer_xreadgroup");
                            }
                            RetryError::transient(e)
                        })
                }
            })
            .await;

        let reply = match reply {
            Ok(r) => r,
            // The retrier only gives up on a fatal error or an external stop signal; either way
            // there is nothing more this iteration can do.
            Err(_) => continue,
        };

        let messages = reply.keys.into_iter().next().map(|k| k.ids).unwrap_or_default();

        if check_backlog && messages.is_empty() {
            check_backlog = false;
            continue;
        }

        for entry in messages {
            let entry_id = entry.id.clone();

            let body = match entry.map.get("m") {
                Some(redis::Value::BulkString(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
                Some(redis::Value::SimpleString(s)) => Some(s.clone()),
                _ => None,
            };

            last_id = entry_id.clone();

            match body {
                Some(body) => {
                    let msg = Message {
                        body,
                        id: entry_id,
                        stream: stream.clone(),
                        group: group.clone(),
                    };
                    if tx.send(msg).await.is_err() {
                        // Application stopped reading; nothing more to deliver.
                        return;
                    }
                    if let Some(m) = &metrics {
                        m.inc_delivered();
                    }
                }
                None => {
                    notifier.notify(&AmiError::Malformed(format!(
                        "stream {stream} entry {entry_id} missing field 'm'"
                    )));
                    if let Some(m) = &metrics {
                        m.inc_error("consumer_malformed_entry");
                    }
                    self_ack(&store, &stream, &group, &entry_id, &notifier, &retrier).await;
                }
            }
        }
    }
}

async fn self_ack(
    store: &Store,
    stream: &str,
    group: &str,
    id: &str,
    notifier: &Arc<dyn ErrorNotifier>,
    retrier: &Arc<Retrier>,
) {
    let result = retrier
        .retry(|| {
            let store = store.clone();
            let stream = stream.to_string();
            let group = group.to_string();
            let id = id.to_string();
            let notifier = notifier.clone();
            async move {
                store.self_ack(&stream, &group, &id).await.map_err(|e| {
                    notifier.notify(&e);
                    RetryError::transient(e)
                })
            }
        })
        .await;

    if let Err(e) = result {
        notifier.notify(&e);
    }
}

struct AckBin {
    group: String,
    ids: Vec<String>,
}

async fn ack_batcher_loop(
    opt: ConsumerOptions,
    store: Store,
    mut rx: mpsc::Receiver<Message>,
    notifier: Arc<dyn ErrorNotifier>,
    retrier: Arc<Retrier>,
    metrics: Option<Arc<AmiMetrics>>,
) {
    let mut bins: HashMap<String, AckBin> = HashMap::new();
    let mut started = Instant::now();
    let mut dispatchers: JoinSet<()> = JoinSet::new();

    let mut ticker = tokio::time::interval(opt.pipe_period_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(m) => {
                        let full = {
                            let bin = bins.entry(m.stream.clone()).or_insert_with(|| AckBin {
                                group: m.group.clone(),
                                ids: Vec::with_capacity(opt.pipe_buffer_size),
                            });
                            bin.ids.push(m.id);
                            bin.ids.len() >= opt.pipe_buffer_size
                        };
                        if full {
                            flush_one(&m.stream, &mut bins, &store, &notifier, &retrier, &metrics, &mut dispatchers);
                            started = Instant::now();
                        }
                    }
                    None => {
                        flush_all(&mut bins, &store, &notifier, &retrier, &metrics, &mut dispatchers);
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if started.elapsed() >= opt.pipe_period_duration() && rx.is_empty() {
                    flush_all(&mut bins, &store, &notifier, &retrier, &metrics, &mut dispatchers);
                    started = Instant::now();
                }
            }
        }
    }

    while dispatchers.join_next().await.is_some() {}
}

fn flush_one(
    stream: &str,
    bins: &mut HashMap<String, AckBin>,
    store: &Store,
    notifier: &Arc<dyn ErrorNotifier>,
    retrier: &Arc<Retrier>,
    metrics: &Option<Arc<AmiMetrics>>,
    dispatchers: &mut JoinSet<()>,
) {
    if let Some(bin) = bins.get_mut(stream) {
        dispatch_flush(stream.to_string(), bin, store, notifier, retrier, metrics, dispatchers);
    }
}

fn flush_all(
    bins: &mut HashMap<String, AckBin>,
    store: &Store,
    notifier: &Arc<dyn ErrorNotifier>,
    retrier: &Arc<Retrier>,
    metrics: &Option<Arc<AmiMetrics>>,
    dispatchers: &mut JoinSet<()>,
) {
    for (stream, bin) in bins.iter_mut() {
        if !bin.ids.is_empty() {
            dispatch_flush(stream.clone(), bin, store, notifier, retrier, metrics, dispatchers);
        }
    }
}

fn dispatch_flush(
    stream: String,
    bin: &mut AckBin,
    store: &Store,
    notifier: &Arc<dyn ErrorNotifier>,
    retrier: &Arc<Retrier>,
    metrics: &Option<Arc<AmiMetrics>>,
    dispatchers: &mut JoinSet<()>,
) {
    if bin.ids.is_empty() {
        return;
    }
    let ids = std::mem::take(&mut bin.ids);
    let group = bin.group.clone();
    let store = store.clone();
    let notifier = notifier.clone();
    let retrier = retrier.clone();
    let metrics = metrics.clone();

    dispatchers.spawn(async move {
        let n = ids.len() as u64;
        let result = retrier
            .retry(|| {
                let store = store.clone();
                let stream = stream.clone();
                let group = group.clone();
                let ids = ids.clone();
                let notifier = notifier.clone();
                let metrics = metrics.clone();
                async move {
                    store.xack_xdel_batch(&stream, &group, &ids).await.map_err(|e| {
                        notifier.notify(&e);
                        if let Some(m) = &metrics {
                            m.inc_retry("consumer_ack");
                            m.inc_error("consumer_ack");
                        }
                        RetryError::transient(e)
                    })
                }
            })
            .await;

        match result {
            Ok(()) => {
                if let Some(m) = &metrics {
                    m.inc_acked(n);
                }
            }
            Err(e) => notifier.notify(&e),
        }
    });
}
