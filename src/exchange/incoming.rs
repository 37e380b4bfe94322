//! Incoming state machine: serves local log events to a peer.
//!
//! Runs on the side that holds data to offer. Its input is the peer's
//! outgoing stream; its output is advertisements, a readiness marker, and
//! credit-gated events.

use std::collections::{BTreeMap, BTreeSet};

use crossbeam::channel::{after, Select, TryRecvError};

use super::error::ExchangeError;
use super::proto::{Advertisement, IncomingMessage, OutgoingMessage};
use super::runtime::{Effect, ExchangeIo, ExchangeStep, SHUTDOWN_TICK};
use crate::core::{EventId, EventValue, SeqNo, SiteId};

type Io<'a, T> = ExchangeIo<'a, T, OutgoingMessage, IncomingMessage<T>>;

/// State of the serving side of an exchange.
#[derive(Clone, Debug)]
pub(crate) enum IncomingState {
    /// Advertising the snapshot of known sites taken at exchange start.
    New {
        already_sent: Vec<SiteId>,
        remaining: Vec<SiteId>,
    },
    /// Credit-driven serving.
    ///
    /// `next_seqno` holds per-site serving floors (acknowledged or advanced
    /// by our own sends, ZERO until then) and `credits` the outstanding
    /// per-site send permissions.
    Sending {
        advertised: BTreeSet<SiteId>,
        next_seqno: BTreeMap<SiteId, SeqNo>,
        credits: BTreeMap<SiteId, u64>,
    },
}

impl IncomingState {
    pub(crate) fn initial(known_sites: Vec<SiteId>) -> Self {
        IncomingState::New {
            already_sent: Vec::new(),
            remaining: known_sites,
        }
    }
}

impl<T: Clone> ExchangeStep<T> for IncomingState {
    type Inbound = OutgoingMessage;
    type Outbound = IncomingMessage<T>;

    fn step(self, io: &Io<'_, T>) -> Effect<Self> {
        if io.shutting_down() {
            return Effect::Terminate;
        }
        match self {
            IncomingState::New {
                already_sent,
                remaining,
            } => step_new(io, already_sent, remaining),
            IncomingState::Sending {
                advertised,
                next_seqno,
                credits,
            } => step_sending(io, advertised, next_seqno, credits),
        }
    }
}

fn step_new<T: Clone>(
    io: &Io<'_, T>,
    mut already_sent: Vec<SiteId>,
    mut remaining: Vec<SiteId>,
) -> Effect<IncomingState> {
    // Inbound wins over sends so cancellation is observed promptly.
    match io.inbound.try_recv() {
        Ok(OutgoingMessage::Done) => return Effect::Terminate,
        Ok(message) => {
            return Effect::Fail(ExchangeError::ProtocolViolation {
                received: message.kind(),
                state: "new",
            });
        }
        Err(TryRecvError::Disconnected) => return Effect::Terminate,
        Err(TryRecvError::Empty) => {}
    }

    let message = match remaining.last() {
        Some(site) => IncomingMessage::Advertisement(Advertisement { site: *site }),
        None => IncomingMessage::Ready,
    };

    let tick = after(SHUTDOWN_TICK);
    let mut select = Select::new();
    let recv_inbound = select.recv(io.inbound);
    let recv_tick = select.recv(&tick);
    let send_outbound = select.send(io.outbound);

    let op = select.select();
    let index = op.index();

    if index == recv_inbound {
        return match op.recv(io.inbound) {
            Ok(OutgoingMessage::Done) | Err(_) => Effect::Terminate,
            Ok(message) => Effect::Fail(ExchangeError::ProtocolViolation {
                received: message.kind(),
                state: "new",
            }),
        };
    }
    if index == recv_tick {
        let _ = op.recv(&tick);
        return Effect::Move(IncomingState::New {
            already_sent,
            remaining,
        });
    }

    debug_assert_eq!(index, send_outbound);
    let was_ready = matches!(message, IncomingMessage::Ready);
    if op.send(io.outbound, message).is_err() {
        return Effect::Terminate;
    }
    if was_ready {
        tracing::debug!(
            target: "repl",
            advertised = already_sent.len(),
            "initial advertisements complete; ready sent"
        );
        Effect::Move(IncomingState::Sending {
            advertised: already_sent.into_iter().collect(),
            next_seqno: BTreeMap::new(),
            credits: BTreeMap::new(),
        })
    } else {
        let site = remaining.pop().expect("advertised site present");
        already_sent.push(site);
        Effect::Move(IncomingState::New {
            already_sent,
            remaining,
        })
    }
}

/// What the send branch will deliver, decided from a short-lock log read.
enum SendPlan {
    Event { id: EventId },
    Advertise(SiteId),
}

fn step_sending<T: Clone>(
    io: &Io<'_, T>,
    mut advertised: BTreeSet<SiteId>,
    mut next_seqno: BTreeMap<SiteId, SeqNo>,
    mut credits: BTreeMap<SiteId, u64>,
) -> Effect<IncomingState> {
    let plan = io.shared.with_log(|log| {
        // First eligible event: ascending site order over the credits map,
        // smallest eligible seqno within the site.
        for (site, credit) in &credits {
            if *credit == 0 || !advertised.contains(site) {
                continue;
            }
            let from = next_seqno.get(site).copied().unwrap_or(SeqNo::ZERO);
            if let Some((seqno, body)) = log.first_from(*site, from) {
                let id = EventId::new(seqno, *site);
                let message = IncomingMessage::Event(EventValue::new(id, body.clone()));
                return Some((message, SendPlan::Event { id }));
            }
        }
        // Otherwise surface a site that appeared since the last snapshot.
        log.sites()
            .find(|site| !advertised.contains(site))
            .map(|site| {
                let message = IncomingMessage::Advertisement(Advertisement { site });
                (message, SendPlan::Advertise(site))
            })
    });

    let tick = after(SHUTDOWN_TICK);
    let mut select = Select::new();
    let recv_inbound = select.recv(io.inbound);
    let recv_insertions = select.recv(io.insertions);
    let recv_tick = select.recv(&tick);
    let send_outbound = plan.is_some().then(|| select.send(io.outbound));

    let op = select.select();
    let index = op.index();

    if index == recv_inbound {
        return match op.recv(io.inbound) {
            Ok(OutgoingMessage::Acknowledge(ack)) => {
                next_seqno.insert(ack.site, ack.next_seqno);
                credits.insert(ack.site, 0);
                Effect::Move(IncomingState::Sending {
                    advertised,
                    next_seqno,
                    credits,
                })
            }
            Ok(OutgoingMessage::Request(request)) => {
                let credit = credits.entry(request.site).or_insert(0);
                *credit = credit.saturating_add(request.count);
                Effect::Move(IncomingState::Sending {
                    advertised,
                    next_seqno,
                    credits,
                })
            }
            Ok(OutgoingMessage::Done) | Err(_) => Effect::Terminate,
        };
    }
    if index == recv_insertions {
        // A novel local insert may have made new work sendable.
        return match op.recv(io.insertions) {
            Ok(_) => Effect::Move(IncomingState::Sending {
                advertised,
                next_seqno,
                credits,
            }),
            Err(_) => Effect::Terminate,
        };
    }
    if index == recv_tick {
        let _ = op.recv(&tick);
        return Effect::Move(IncomingState::Sending {
            advertised,
            next_seqno,
            credits,
        });
    }

    debug_assert_eq!(Some(index), send_outbound);
    let (message, plan) = plan.expect("send branch registered with a plan");
    if op.send(io.outbound, message).is_err() {
        return Effect::Terminate;
    }
    match plan {
        SendPlan::Event { id } => {
            let credit = credits.get_mut(&id.site).expect("credits for served site");
            *credit -= 1;
            next_seqno.insert(id.site, id.seqno.next());
            tracing::trace!(target: "repl", event = %id, "event served");
        }
        SendPlan::Advertise(site) => {
            advertised.insert(site);
            tracing::trace!(target: "repl", %site, "site advertised");
        }
    }
    Effect::Move(IncomingState::Sending {
        advertised,
        next_seqno,
        credits,
    })
}
