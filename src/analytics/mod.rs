pub mod store;

pub use store::{
    AnalyticsError, AnalyticsStore, NoopAnalyticsStore, PgAnalyticsStore, GLOBAL_RULE_ID,
};

use crate::events::Event;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy)]
pub struct SinkConfig {
    /// Ingress channel capacity (B).
    pub buffer: usize,
    /// Flush when this many events are batched (K).
    pub batch_size: usize,
    /// Flush at least this often (F).
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub logged: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub enum SinkError {
    ShutdownTimeout,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::ShutdownTimeout => write!(f, "shutdown timeout"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Non-blocking producer in front of a single batching consumer.
///
/// `log` only ever try-sends; when the ingress channel is full the event is
/// dropped and counted. The consumer flushes whenever the batch reaches
/// `batch_size` or `flush_interval` elapses, whichever comes first. Every
/// event that enters `log` ends up in exactly one of the two counters, so
/// `logged + dropped` equals the number of calls at any quiescent point.
pub struct AnalyticsSink {
    tx: mpsc::Sender<Event>,
    logged: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AnalyticsSink {
    /// Spawn the consumer and return the producer handle.
    pub fn spawn(store: Arc<dyn AnalyticsStore>, config: SinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let logged = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(Notify::new());

        let consumer = tokio::spawn(consume(
            rx,
            store,
            config,
            logged.clone(),
            dropped.clone(),
            shutdown.clone(),
        ));

        Self {
            tx,
            logged,
            dropped,
            shutdown,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Enqueue an event. Never blocks; a full (or closed) channel drops.
    pub fn log(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_analytics_dropped_total").increment(1);
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            logged: self.logged.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, drain everything already enqueued into final
    /// flushes, and wait for the consumer, up to `deadline`.
    pub async fn close(&self, deadline: Duration) -> Result<(), SinkError> {
        self.shutdown.notify_one();

        let handle = self.consumer.lock().await.take();
        let Some(handle) = handle else {
            return Ok(()); // already closed
        };

        match tokio::time::timeout(deadline, handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                error!("analytics: consumer did not drain within {:?}", deadline);
                Err(SinkError::ShutdownTimeout)
            }
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Event>,
    store: Arc<dyn AnalyticsStore>,
    config: SinkConfig,
    logged: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset(); // skip the immediate first tick

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            flush(&store, &mut batch, &logged, &dropped).await;
                            ticker.reset();
                        }
                    }
                    // All producers gone; drain below.
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&store, &mut batch, &logged, &dropped).await;
                }
            }
            _ = shutdown.notified() => break,
        }
    }

    // Drain: refuse new work, then empty what is already buffered.
    rx.close();
    while let Ok(event) = rx.try_recv() {
        batch.push(event);
        if batch.len() >= batch_size {
            flush(&store, &mut batch, &logged, &dropped).await;
        }
    }
    flush(&store, &mut batch, &logged, &dropped).await;
    info!("analytics: consumer drained and stopped");
}

async fn flush(
    store: &Arc<dyn AnalyticsStore>,
    batch: &mut Vec<Event>,
    logged: &AtomicU64,
    dropped: &AtomicU64,
) {
    if batch.is_empty() {
        return;
    }
    let len = batch.len();

    match store.write_batch(batch).await {
        Ok(inserted) => {
            logged.fetch_add(inserted as u64, Ordering::Relaxed);
            metrics::counter!("gateway_analytics_logged_total").increment(inserted as u64);
            let skipped = len - inserted;
            if skipped > 0 {
                dropped.fetch_add(skipped as u64, Ordering::Relaxed);
                metrics::counter!("gateway_analytics_dropped_total").increment(skipped as u64);
            }
            debug!("analytics: flushed batch, rows={}", inserted);
        }
        Err(e) => {
            // The whole batch is unwritten. No in-core retry; operators
            // alert on the dropped counter.
            dropped.fetch_add(len as u64, Ordering::Relaxed);
            metrics::counter!("gateway_analytics_dropped_total").increment(len as u64);
            error!("analytics: batch flush failed, lost={}, error={}", len, e);
        }
    }
    batch.clear();
}
