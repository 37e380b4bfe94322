//! Nearest-neighbor pairing driver for in-process synchronization.
//!
//! [`sync`] crosses the exchange streams of adjacent sites directly over
//! bounded channels: each pair runs four exchange tasks (two per direction)
//! under a supervisor that recouples after failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;

use crate::core::{Projection, SiteId};
use crate::exchange::error::ExchangeError;
use crate::exchange::runtime::SiteShared;
use crate::site::{ReceiveExchange, SendExchange, Site};

/// Tunables for the sync driver.
#[derive(Clone, Copy, Debug)]
pub struct SyncConfig {
    /// Capacity of each wire channel; bounds in-flight messages per
    /// direction and provides send-side backpressure.
    pub channel_capacity: usize,
    /// Delay before recoupling a pair after a failed exchange.
    pub retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Handle for a running sync.
///
/// Dropping the handle detaches the pairs; use [`SyncHandle::shutdown`] to
/// stop them or [`SyncHandle::wait`] to block until they unwind on their
/// own.
pub struct SyncHandle {
    shutdown: Arc<AtomicBool>,
    pairs: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Raises the shutdown flag and waits for every exchange to terminate.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join_pairs();
    }

    /// Waits for the pairs to unwind without signalling shutdown.
    pub fn wait(mut self) {
        self.join_pairs();
    }

    fn join_pairs(&mut self) {
        for pair in self.pairs.drain(..) {
            if pair.join().is_err() {
                tracing::warn!(target: "repl", "sync pair supervisor panicked");
            }
        }
    }
}

/// Couples sites by nearest-neighbor pairs and keeps them coupled.
///
/// For each adjacent pair `(a, b)` the driver wires `a.outgoing ↔
/// b.incoming` and `b.outgoing ↔ a.incoming`, then supervises the four
/// exchange tasks: any failure drops the connection and recouples after
/// [`SyncConfig::retry_delay`] until shutdown is signalled.
pub fn sync<T, P>(sites: &[&Site<T, P>], config: SyncConfig) -> SyncHandle
where
    T: Clone + Send + 'static,
    P: Projection<T>,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut pairs = Vec::new();
    for window in sites.windows(2) {
        let left = PairEnd::of(window[0]);
        let right = PairEnd::of(window[1]);
        pairs.push(supervise_pair(left, right, config, Arc::clone(&shutdown)));
    }
    tracing::info!(
        target: "repl",
        sites = sites.len(),
        pairs = pairs.len(),
        "sync started"
    );
    SyncHandle { shutdown, pairs }
}

struct PairEnd<T> {
    id: SiteId,
    shared: Arc<SiteShared<T>>,
}

impl<T> PairEnd<T> {
    fn of<P>(site: &Site<T, P>) -> Self
    where
        T: Clone,
        P: Projection<T>,
    {
        Self {
            id: site.identifier(),
            shared: Arc::clone(site.shared()),
        }
    }
}

fn supervise_pair<T>(
    left: PairEnd<T>,
    right: PairEnd<T>,
    config: SyncConfig,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
{
    thread::spawn(move || {
        loop {
            let outcome = couple(&left, &right, &config, &shutdown);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match outcome {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(
                        target: "repl",
                        left = %left.id,
                        right = %right.id,
                        %err,
                        "exchange pair failed; recoupling"
                    );
                    sleep_interruptible(config.retry_delay, &shutdown);
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        tracing::debug!(target: "repl", left = %left.id, right = %right.id, "pair unwound");
    })
}

/// Runs one full coupling of a pair and joins all four exchanges.
///
/// Returns the first exchange failure, if any; the failed exchange has
/// already dropped its endpoints, so its three peers unwind gracefully
/// before this returns.
fn couple<T>(
    left: &PairEnd<T>,
    right: &PairEnd<T>,
    config: &SyncConfig,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), ExchangeError>
where
    T: Clone + Send + 'static,
{
    let (left_requests_tx, left_requests_rx) = bounded(config.channel_capacity);
    let (left_events_tx, left_events_rx) = bounded(config.channel_capacity);
    let (right_requests_tx, right_requests_rx) = bounded(config.channel_capacity);
    let (right_events_tx, right_events_rx) = bounded(config.channel_capacity);

    let mut tasks: Vec<JoinHandle<Result<(), ExchangeError>>> = Vec::with_capacity(4);
    {
        let exchange =
            SendExchange::new(Arc::clone(&left.shared)).with_shutdown(Arc::clone(shutdown));
        tasks.push(thread::spawn(move || {
            exchange.run(right_events_rx, left_requests_tx)
        }));
    }
    {
        let exchange =
            ReceiveExchange::new(Arc::clone(&right.shared)).with_shutdown(Arc::clone(shutdown));
        tasks.push(thread::spawn(move || {
            exchange.run(left_requests_rx, right_events_tx)
        }));
    }
    {
        let exchange =
            SendExchange::new(Arc::clone(&right.shared)).with_shutdown(Arc::clone(shutdown));
        tasks.push(thread::spawn(move || {
            exchange.run(left_events_rx, right_requests_tx)
        }));
    }
    {
        let exchange =
            ReceiveExchange::new(Arc::clone(&left.shared)).with_shutdown(Arc::clone(shutdown));
        tasks.push(thread::spawn(move || {
            exchange.run(right_requests_rx, left_events_tx)
        }));
    }

    let mut failure = None;
    for task in tasks {
        match task.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                failure.get_or_insert(err);
            }
            Err(_) => {
                failure.get_or_insert(ExchangeError::Transport(
                    "exchange task panicked".to_string(),
                ));
            }
        }
    }
    match failure {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(10);
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(slice));
    }
}
