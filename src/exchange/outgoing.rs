//! Outgoing state machine: requests advertised sites and applies events.
//!
//! Runs on the side that consumes data. Its input is the peer's incoming
//! stream; its output is requests, optional acknowledgements, and the V1
//! terminal marker.

use std::collections::BTreeSet;

use crossbeam::channel::{after, Select};

use super::error::ExchangeError;
use super::proto::{IncomingMessage, OutgoingMessage, Request, CREDITS_MAX};
use super::runtime::{Effect, ExchangeIo, ExchangeStep, SHUTDOWN_TICK};
use crate::core::{EventValue, SiteId};

type Io<'a, T> = ExchangeIo<'a, T, IncomingMessage<T>, OutgoingMessage>;

/// State of the consuming side of an exchange.
#[derive(Clone, Debug)]
pub(crate) enum OutgoingState {
    /// Collecting advertisements until the peer signals readiness.
    Advertising { available: Vec<SiteId> },
    /// Requesting advertised sites and applying received events.
    Listening {
        pending: Vec<SiteId>,
        requested: BTreeSet<SiteId>,
    },
    /// Graceful shutdown: tell the peer no more requests will come.
    Cancelling,
}

impl OutgoingState {
    pub(crate) fn initial() -> Self {
        OutgoingState::Advertising {
            available: Vec::new(),
        }
    }
}

impl<T: Clone> ExchangeStep<T> for OutgoingState {
    type Inbound = IncomingMessage<T>;
    type Outbound = OutgoingMessage;

    fn step(self, io: &Io<'_, T>) -> Effect<Self> {
        if io.shutting_down() && !matches!(self, OutgoingState::Cancelling) {
            return Effect::Move(OutgoingState::Cancelling);
        }
        match self {
            OutgoingState::Advertising { available } => step_advertising(io, available),
            OutgoingState::Listening { pending, requested } => {
                step_listening(io, pending, requested)
            }
            OutgoingState::Cancelling => step_cancelling(io),
        }
    }
}

fn step_advertising<T: Clone>(io: &Io<'_, T>, mut available: Vec<SiteId>) -> Effect<OutgoingState> {
    let tick = after(SHUTDOWN_TICK);
    let mut select = Select::new();
    let recv_inbound = select.recv(io.inbound);
    let recv_insertions = select.recv(io.insertions);
    let recv_tick = select.recv(&tick);

    let op = select.select();
    let index = op.index();

    if index == recv_inbound {
        return match op.recv(io.inbound) {
            Ok(IncomingMessage::Advertisement(advertisement)) => {
                available.push(advertisement.site);
                Effect::Move(OutgoingState::Advertising { available })
            }
            Ok(IncomingMessage::Ready) => {
                tracing::debug!(
                    target: "repl",
                    sites = available.len(),
                    "peer ready; moving to listening"
                );
                Effect::Move(OutgoingState::Listening {
                    pending: available,
                    requested: BTreeSet::new(),
                })
            }
            Ok(message @ IncomingMessage::Event(_)) => {
                Effect::Fail(ExchangeError::ProtocolViolation {
                    received: message.kind(),
                    state: "advertising",
                })
            }
            Ok(IncomingMessage::Done) | Err(_) => Effect::Move(OutgoingState::Cancelling),
        };
    }
    if index == recv_insertions {
        // Local inserts are irrelevant here; drain so the signal queue
        // never accumulates.
        return match op.recv(io.insertions) {
            Ok(_) => Effect::Move(OutgoingState::Advertising { available }),
            Err(_) => Effect::Move(OutgoingState::Cancelling),
        };
    }
    debug_assert_eq!(index, recv_tick);
    let _ = op.recv(&tick);
    Effect::Move(OutgoingState::Advertising { available })
}

fn step_listening<T: Clone>(
    io: &Io<'_, T>,
    mut pending: Vec<SiteId>,
    mut requested: BTreeSet<SiteId>,
) -> Effect<OutgoingState> {
    // One outstanding request per site: a peer may advertise the same site
    // twice across snapshots, so drop duplicates before offering a request.
    while pending
        .last()
        .is_some_and(|site| requested.contains(site))
    {
        pending.pop();
    }

    let request = pending.last().map(|site| {
        io.shared.with_log(|log| {
            OutgoingMessage::Request(Request {
                site: *site,
                next_for_site: log.expected_for(*site),
                next_for_all: log.expected(),
                count: CREDITS_MAX,
            })
        })
    });

    let tick = after(SHUTDOWN_TICK);
    let mut select = Select::new();
    let recv_inbound = select.recv(io.inbound);
    let recv_insertions = select.recv(io.insertions);
    let recv_tick = select.recv(&tick);
    let send_outbound = request.is_some().then(|| select.send(io.outbound));

    let op = select.select();
    let index = op.index();

    if index == recv_inbound {
        return match op.recv(io.inbound) {
            Ok(IncomingMessage::Advertisement(advertisement)) => {
                pending.push(advertisement.site);
                Effect::Move(OutgoingState::Listening { pending, requested })
            }
            Ok(IncomingMessage::Event(EventValue { id, body })) => {
                if io.shared.insert(id.seqno, id.site, body) {
                    tracing::trace!(target: "repl", event = %id, "event applied");
                }
                Effect::Move(OutgoingState::Listening { pending, requested })
            }
            Ok(message @ IncomingMessage::Ready) => {
                Effect::Fail(ExchangeError::ProtocolViolation {
                    received: message.kind(),
                    state: "listening",
                })
            }
            Ok(IncomingMessage::Done) | Err(_) => Effect::Move(OutgoingState::Cancelling),
        };
    }
    if index == recv_insertions {
        return match op.recv(io.insertions) {
            Ok(_) => Effect::Move(OutgoingState::Listening { pending, requested }),
            Err(_) => Effect::Move(OutgoingState::Cancelling),
        };
    }
    if index == recv_tick {
        let _ = op.recv(&tick);
        return Effect::Move(OutgoingState::Listening { pending, requested });
    }

    debug_assert_eq!(Some(index), send_outbound);
    let request = request.expect("send branch registered with a request");
    if op.send(io.outbound, request).is_err() {
        return Effect::Move(OutgoingState::Cancelling);
    }
    let site = pending.pop().expect("requested site present");
    requested.insert(site);
    tracing::trace!(target: "repl", %site, "site requested");
    Effect::Move(OutgoingState::Listening { pending, requested })
}

fn step_cancelling<T>(io: &Io<'_, T>) -> Effect<OutgoingState> {
    // Best effort: the peer may already be gone or backlogged, and dropping
    // our endpoints signals closure either way.
    if io.outbound.try_send(OutgoingMessage::Done).is_err() {
        tracing::debug!(target: "repl", "done not delivered; peer closed or backlogged");
    }
    Effect::Terminate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crossbeam::channel::{bounded, Receiver, Sender};

    use crate::core::{EventId, SeqNo};
    use crate::exchange::proto::Advertisement;
    use crate::exchange::runtime::SiteShared;

    struct Rig {
        shared: SiteShared<&'static str>,
        inbound_tx: Option<Sender<IncomingMessage<&'static str>>>,
        inbound_rx: Receiver<IncomingMessage<&'static str>>,
        outbound_tx: Sender<OutgoingMessage>,
        outbound_rx: Option<Receiver<OutgoingMessage>>,
        insertions: Receiver<EventId>,
        shutdown: AtomicBool,
    }

    impl Rig {
        fn new() -> Self {
            let shared = SiteShared::new();
            let insertions = shared.subscribe();
            let (inbound_tx, inbound_rx) = bounded(8);
            let (outbound_tx, outbound_rx) = bounded(8);
            Self {
                shared,
                inbound_tx: Some(inbound_tx),
                inbound_rx,
                outbound_tx,
                outbound_rx: Some(outbound_rx),
                insertions,
                shutdown: AtomicBool::new(false),
            }
        }

        fn io(&self) -> Io<'_, &'static str> {
            ExchangeIo {
                shared: &self.shared,
                inbound: &self.inbound_rx,
                outbound: &self.outbound_tx,
                insertions: &self.insertions,
                shutdown: &self.shutdown,
            }
        }

        fn queue(&self, message: IncomingMessage<&'static str>) {
            self.inbound_tx
                .as_ref()
                .expect("inbound open")
                .send(message)
                .expect("queue inbound");
        }

        fn sent(&self) -> Result<OutgoingMessage, crossbeam::channel::TryRecvError> {
            self.outbound_rx.as_ref().expect("outbound open").try_recv()
        }
    }

    fn site(value: u32) -> SiteId {
        SiteId::new(value)
    }

    fn seq(value: u32) -> SeqNo {
        SeqNo::new(value)
    }

    fn advertisement(target: u32) -> IncomingMessage<&'static str> {
        IncomingMessage::Advertisement(Advertisement { site: site(target) })
    }

    fn event(seqno: u32, origin: u32, body: &'static str) -> IncomingMessage<&'static str> {
        IncomingMessage::Event(EventValue::new(EventId::new(seq(seqno), site(origin)), body))
    }

    fn expect_move(effect: Effect<OutgoingState>) -> OutgoingState {
        match effect {
            Effect::Move(next) => next,
            Effect::Fail(err) => panic!("unexpected failure: {err}"),
            Effect::Terminate => panic!("unexpected termination"),
        }
    }

    #[test]
    fn advertising_collects_sites_until_ready() {
        let rig = Rig::new();
        rig.queue(advertisement(1));
        rig.queue(advertisement(2));
        rig.queue(IncomingMessage::Ready);

        let mut state = OutgoingState::initial();
        for _ in 0..3 {
            state = expect_move(state.step(&rig.io()));
        }
        match state {
            OutgoingState::Listening { pending, requested } => {
                assert_eq!(pending, vec![site(1), site(2)]);
                assert!(requested.is_empty());
            }
            other => panic!("expected listening state, got {other:?}"),
        }
    }

    #[test]
    fn event_before_ready_is_a_violation() {
        let rig = Rig::new();
        rig.queue(event(0, 1, "early"));

        let effect = OutgoingState::initial().step(&rig.io());
        assert!(matches!(
            effect,
            Effect::Fail(ExchangeError::ProtocolViolation {
                received: "EVENT",
                state: "advertising",
            })
        ));
    }

    #[test]
    fn done_or_close_moves_to_cancelling_then_terminates() {
        let mut rig = Rig::new();
        rig.queue(IncomingMessage::Done);
        let state = expect_move(OutgoingState::initial().step(&rig.io()));
        assert!(matches!(state, OutgoingState::Cancelling));

        assert!(matches!(state.step(&rig.io()), Effect::Terminate));
        assert_eq!(rig.sent(), Ok(OutgoingMessage::Done));

        rig.inbound_tx = None;
        let state = expect_move(OutgoingState::initial().step(&rig.io()));
        assert!(matches!(state, OutgoingState::Cancelling));
    }

    #[test]
    fn listening_requests_latest_advertisement_first() {
        let rig = Rig::new();
        assert!(rig.shared.insert(seq(0), site(2), "held"));
        while rig.insertions.try_recv().is_ok() {}

        let state = OutgoingState::Listening {
            pending: vec![site(1), site(2)],
            requested: BTreeSet::new(),
        };

        let state = expect_move(state.step(&rig.io()));
        match rig.sent() {
            Ok(OutgoingMessage::Request(request)) => {
                assert_eq!(request.site, site(2));
                assert_eq!(request.next_for_site, seq(1));
                assert_eq!(request.next_for_all, seq(1));
                assert_eq!(request.count, CREDITS_MAX);
            }
            other => panic!("expected request, got {other:?}"),
        }

        let _ = expect_move(state.step(&rig.io()));
        match rig.sent() {
            Ok(OutgoingMessage::Request(request)) => {
                assert_eq!(request.site, site(1));
                assert_eq!(request.next_for_site, SeqNo::ZERO);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_advertisements_yield_one_request() {
        let rig = Rig::new();
        let state = OutgoingState::Listening {
            pending: vec![site(1), site(1)],
            requested: BTreeSet::new(),
        };

        let state = expect_move(state.step(&rig.io()));
        assert!(matches!(rig.sent(), Ok(OutgoingMessage::Request(_))));

        // The second copy is dropped without a second request.
        let state = expect_move(state.step(&rig.io()));
        assert!(rig.sent().is_err());
        match state {
            OutgoingState::Listening { pending, requested } => {
                assert!(pending.is_empty());
                assert_eq!(requested.into_iter().collect::<Vec<_>>(), vec![site(1)]);
            }
            other => panic!("expected listening state, got {other:?}"),
        }
    }

    #[test]
    fn listening_applies_events_idempotently() {
        let rig = Rig::new();
        let state = OutgoingState::Listening {
            pending: Vec::new(),
            requested: BTreeSet::new(),
        };

        rig.queue(event(0, 1, "x"));
        let state = expect_move(state.step(&rig.io()));
        // The novel write signalled.
        assert!(rig.insertions.try_recv().is_ok());

        // A redelivery of the same event is dropped silently.
        rig.queue(event(0, 1, "x"));
        let _ = expect_move(state.step(&rig.io()));
        assert!(rig.insertions.try_recv().is_err());

        rig.shared.with_log(|log| {
            assert_eq!(log.get(seq(0), site(1)), Some(&"x"));
            assert_eq!(log.len(), 1);
        });
    }

    #[test]
    fn ready_in_listening_is_a_violation() {
        let rig = Rig::new();
        rig.queue(IncomingMessage::Ready);

        let state = OutgoingState::Listening {
            pending: Vec::new(),
            requested: BTreeSet::new(),
        };
        assert!(matches!(
            state.step(&rig.io()),
            Effect::Fail(ExchangeError::ProtocolViolation {
                received: "READY",
                state: "listening",
            })
        ));
    }

    #[test]
    fn cancelling_terminates_even_when_peer_is_gone() {
        let mut rig = Rig::new();
        rig.outbound_rx = None;
        assert!(matches!(
            OutgoingState::Cancelling.step(&rig.io()),
            Effect::Terminate
        ));
    }
}
