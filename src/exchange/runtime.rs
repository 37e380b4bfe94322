//! Exchange runtime: shared site state and the step driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};

use super::error::ExchangeError;
use super::notify::InsertNotifier;
use crate::core::{EventId, EventLog, SeqNo, SiteId};

/// Coarse wake-up used to observe the shutdown flag between selections.
pub(crate) const SHUTDOWN_TICK: Duration = Duration::from_millis(50);

struct SiteState<T> {
    log: EventLog<T>,
    notifier: InsertNotifier,
}

/// Log and insertion signal shared by a site and its exchanges.
///
/// One mutex serializes local event production and exchange mutations. The
/// mutex is never held across a channel send or receive; the insertion
/// signal publishes through non-blocking unbounded senders, so publication
/// under the mutex is fine.
pub(crate) struct SiteShared<T> {
    state: Mutex<SiteState<T>>,
}

impl<T> SiteShared<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SiteState {
                log: EventLog::new(),
                notifier: InsertNotifier::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SiteState<T>> {
        self.state.lock().expect("site state lock poisoned")
    }

    /// Runs `f` against the current log under the mutex.
    ///
    /// Decision reads go through here: the lock is released before the
    /// caller returns to its selection.
    pub(crate) fn with_log<R>(&self, f: impl FnOnce(&EventLog<T>) -> R) -> R {
        f(&self.lock().log)
    }

    /// Runs `f` with mutable access to the log and the insertion signal.
    pub(crate) fn with_state<R>(
        &self,
        f: impl FnOnce(&mut EventLog<T>, &mut InsertNotifier) -> R,
    ) -> R {
        let mut state = self.lock();
        let SiteState { log, notifier } = &mut *state;
        f(log, notifier)
    }

    /// Snapshot of the current log.
    pub(crate) fn snapshot(&self) -> EventLog<T>
    where
        T: Clone,
    {
        self.lock().log.clone()
    }

    /// Idempotent insert; publishes the insertion signal only when the
    /// write was novel.
    pub(crate) fn insert(&self, seqno: SeqNo, site: SiteId, body: T) -> bool {
        let mut state = self.lock();
        let novel = state.log.insert(seqno, site, body);
        if novel {
            state.notifier.publish(EventId::new(seqno, site));
        }
        novel
    }

    pub(crate) fn subscribe(&self) -> Receiver<EventId> {
        self.lock().notifier.subscribe()
    }
}

/// Outcome of one selection performed by a state's `step`.
pub(crate) enum Effect<S> {
    Move(S),
    Fail(ExchangeError),
    Terminate,
}

/// Channel endpoints and shared state handed to every `step`.
pub(crate) struct ExchangeIo<'a, T, In, Out> {
    pub shared: &'a SiteShared<T>,
    pub inbound: &'a Receiver<In>,
    pub outbound: &'a Sender<Out>,
    pub insertions: &'a Receiver<EventId>,
    pub shutdown: &'a AtomicBool,
}

impl<T, In, Out> ExchangeIo<'_, T, In, Out> {
    pub(crate) fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// A protocol state machine drivable by [`drive`].
///
/// `step` performs exactly one selection among the branches the state
/// offers and reports the outcome as an [`Effect`].
pub(crate) trait ExchangeStep<T>: Sized {
    type Inbound;
    type Outbound;

    fn step(self, io: &ExchangeIo<'_, T, Self::Inbound, Self::Outbound>) -> Effect<Self>;
}

/// Drives a state machine to a terminal effect.
///
/// On return the caller drops its channel endpoints, which closes them for
/// the peer; termination therefore releases every resource deterministically.
pub(crate) fn drive<T, S>(
    initial: S,
    io: ExchangeIo<'_, T, S::Inbound, S::Outbound>,
) -> Result<(), ExchangeError>
where
    S: ExchangeStep<T>,
{
    let mut state = initial;
    loop {
        match state.step(&io) {
            Effect::Move(next) => state = next,
            Effect::Fail(err) => return Err(err),
            Effect::Terminate => return Ok(()),
        }
    }
}
