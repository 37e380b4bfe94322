//! Site: a replica owning its event log, projection, and exchanges.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};

use crate::core::{EventId, EventLog, EventValue, Projection, SeqNo, SiteId};
use crate::exchange::error::ExchangeError;
use crate::exchange::incoming::IncomingState;
use crate::exchange::notify::InsertNotifier;
use crate::exchange::outgoing::OutgoingState;
use crate::exchange::proto::{IncomingMessage, OutgoingMessage};
use crate::exchange::runtime::{drive, ExchangeIo, SiteShared};

/// A replica owning its sequence-number space.
///
/// The log is mutated only by [`Site::event`], [`Site::restore`], and
/// exchanges applying received events; all three serialize on the per-site
/// mutex. Any number of exchanges may run concurrently against one site.
pub struct Site<T, P> {
    id: SiteId,
    projection: P,
    shared: Arc<SiteShared<T>>,
}

impl<T, P> Site<T, P>
where
    T: Clone,
    P: Projection<T>,
{
    pub fn new(id: SiteId, projection: P) -> Self {
        Self {
            id,
            projection,
            shared: Arc::new(SiteShared::new()),
        }
    }

    pub fn identifier(&self) -> SiteId {
        self.id
    }

    /// Current model, folded from the log on demand.
    pub fn model(&self) -> P::Model {
        self.shared.with_log(|log| log.project(&self.projection))
    }

    /// Snapshot of the current log.
    pub fn log(&self) -> EventLog<T> {
        self.shared.snapshot()
    }

    /// Atomically appends locally produced events.
    ///
    /// The block observes the model folded from the current log and appends
    /// bodies through the scope. Appended events receive consecutive
    /// sequence numbers starting at the log's overall expected value, and
    /// each append publishes the insertion signal. The whole block is
    /// atomic with respect to exchange mutations.
    pub fn event<F>(&self, block: F)
    where
        F: FnOnce(&P::Model, &mut EventScope<'_, T>),
    {
        let site = self.id;
        self.shared.with_state(|log, notifier| {
            let model = log.project(&self.projection);
            let next = log.expected();
            let mut scope = EventScope {
                site,
                next,
                log,
                notifier,
            };
            block(&model, &mut scope);
        });
    }

    /// Rehydrates events from an external store, e.g. a persisted log.
    ///
    /// Inserts are idempotent; the insertion signal fires only for novel
    /// events.
    pub fn restore<I>(&self, events: I)
    where
        I: IntoIterator<Item = EventValue<T>>,
    {
        for event in events {
            self.shared.insert(event.id.seqno, event.id.site, event.body);
        }
    }

    /// Server side of a pairing: serves this site's log to a peer.
    pub fn incoming(&self) -> ReceiveExchange<T> {
        ReceiveExchange::new(Arc::clone(&self.shared))
    }

    /// Client side of a pairing: pulls the peer's events into this site.
    pub fn outgoing(&self) -> SendExchange<T> {
        SendExchange::new(Arc::clone(&self.shared))
    }

    pub(crate) fn shared(&self) -> &Arc<SiteShared<T>> {
        &self.shared
    }
}

/// Append scope handed to [`Site::event`] blocks.
pub struct EventScope<'a, T> {
    site: SiteId,
    next: SeqNo,
    log: &'a mut EventLog<T>,
    notifier: &'a mut InsertNotifier,
}

impl<T> EventScope<'_, T> {
    /// Appends one event body at the next local sequence number.
    pub fn append(&mut self, body: T) -> EventId {
        let id = EventId::new(self.next, self.site);
        let novel = self.log.insert(id.seqno, id.site, body);
        debug_assert!(novel, "local append reused a sequence number");
        self.notifier.publish(id);
        self.next = self.next.next();
        id
    }
}

/// Runs the incoming state machine against one duplex stream.
///
/// Serves until the peer closes `inbound` (or sends the V1 terminal) or the
/// shutdown flag is raised. Dropping the endpoints on return closes the
/// outbound side.
pub struct ReceiveExchange<T> {
    shared: Arc<SiteShared<T>>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Clone> ReceiveExchange<T> {
    pub(crate) fn new(shared: Arc<SiteShared<T>>) -> Self {
        Self {
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an external shutdown flag; the exchange terminates at the
    /// next tick after the flag is raised.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn run(
        self,
        inbound: Receiver<OutgoingMessage>,
        outbound: Sender<IncomingMessage<T>>,
    ) -> Result<(), ExchangeError> {
        let insertions = self.shared.subscribe();
        let known_sites: Vec<SiteId> = self.shared.with_log(|log| log.sites().collect());
        let io = ExchangeIo {
            shared: &self.shared,
            inbound: &inbound,
            outbound: &outbound,
            insertions: &insertions,
            shutdown: &self.shutdown,
        };
        let result = drive(IncomingState::initial(known_sites), io);
        finish("incoming", &result);
        result
    }
}

/// Runs the outgoing state machine against one duplex stream.
///
/// Consumes until the peer closes `inbound` (or sends the V1 terminal) or
/// the shutdown flag is raised, then cancels gracefully.
pub struct SendExchange<T> {
    shared: Arc<SiteShared<T>>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Clone> SendExchange<T> {
    pub(crate) fn new(shared: Arc<SiteShared<T>>) -> Self {
        Self {
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an external shutdown flag; the exchange cancels at the next
    /// tick after the flag is raised.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn run(
        self,
        inbound: Receiver<IncomingMessage<T>>,
        outbound: Sender<OutgoingMessage>,
    ) -> Result<(), ExchangeError> {
        let insertions = self.shared.subscribe();
        let io = ExchangeIo {
            shared: &self.shared,
            inbound: &inbound,
            outbound: &outbound,
            insertions: &insertions,
            shutdown: &self.shutdown,
        };
        let result = drive(OutgoingState::initial(), io);
        finish("outgoing", &result);
        result
    }
}

fn finish(direction: &'static str, result: &Result<(), ExchangeError>) {
    match result {
        Ok(()) => tracing::debug!(target: "repl", direction, "exchange terminated"),
        Err(err) => tracing::warn!(target: "repl", direction, %err, "exchange failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Projection;

    use crossbeam::channel::bounded;

    struct Concat;

    impl Projection<String> for Concat {
        type Model = Vec<String>;

        fn initial(&self) -> Self::Model {
            Vec::new()
        }

        fn apply(&self, mut model: Self::Model, _id: EventId, body: &String) -> Self::Model {
            model.push(body.clone());
            model
        }
    }

    fn test_site(id: u32) -> Site<String, Concat> {
        Site::new(SiteId::new(id), Concat)
    }

    #[test]
    fn event_appends_consecutive_seqnos_and_signals() {
        let site = test_site(1);
        let insertions = site.shared().subscribe();

        site.event(|model, scope| {
            assert!(model.is_empty());
            let first = scope.append("a".to_string());
            let second = scope.append("b".to_string());
            assert_eq!(first.seqno, SeqNo::ZERO);
            assert_eq!(second.seqno, SeqNo::new(1));
        });

        let log = site.log();
        assert_eq!(log.expected_for(SiteId::new(1)), SeqNo::new(2));
        assert_eq!(insertions.try_recv().map(|id| id.seqno), Ok(SeqNo::ZERO));
        assert_eq!(insertions.try_recv().map(|id| id.seqno), Ok(SeqNo::new(1)));
    }

    #[test]
    fn event_block_observes_prior_appends() {
        let site = test_site(1);
        site.event(|_, scope| {
            scope.append("first".to_string());
        });
        site.event(|model, scope| {
            assert_eq!(model, &vec!["first".to_string()]);
            scope.append("second".to_string());
        });
        assert_eq!(site.model(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn local_appends_continue_after_the_overall_frontier() {
        let site = test_site(2);
        // A foreign event at seqno 4 pushes the overall expected to 5.
        site.restore([EventValue::new(
            EventId::new(SeqNo::new(4), SiteId::new(9)),
            "foreign".to_string(),
        )]);

        site.event(|_, scope| {
            let id = scope.append("local".to_string());
            assert_eq!(id.seqno, SeqNo::new(5));
            assert_eq!(id.site, SiteId::new(2));
        });
    }

    #[test]
    fn restore_is_idempotent() {
        let site = test_site(1);
        let events = vec![EventValue::new(
            EventId::new(SeqNo::ZERO, SiteId::new(3)),
            "x".to_string(),
        )];
        site.restore(events.clone());
        site.restore(events);
        assert_eq!(site.log().len(), 1);
    }

    #[test]
    fn receive_exchange_completes_on_closed_inbound() {
        let site = test_site(1);
        let (inbound_tx, inbound_rx) = bounded::<OutgoingMessage>(8);
        let (outbound_tx, _outbound_rx) = bounded::<IncomingMessage<String>>(8);
        drop(inbound_tx);

        assert_eq!(site.incoming().run(inbound_rx, outbound_tx), Ok(()));
    }

    #[test]
    fn send_exchange_cancels_on_closed_inbound() {
        let site = test_site(1);
        let (inbound_tx, inbound_rx) = bounded::<IncomingMessage<String>>(8);
        let (outbound_tx, outbound_rx) = bounded::<OutgoingMessage>(8);
        drop(inbound_tx);

        assert_eq!(site.outgoing().run(inbound_rx, outbound_tx), Ok(()));
        assert_eq!(outbound_rx.try_recv(), Ok(OutgoingMessage::Done));
    }
}
