//! Wire message alphabets exchanged between paired sites.
//!
//! Messages are whole typed values; a transport layer owns framing and
//! serialization. Both alphabets derive serde so transports can frame them
//! in any format without restating the schema.

use serde::{Deserialize, Serialize};

use crate::core::{EventValue, SeqNo, SiteId};

/// Credit grant attached to a request.
///
/// One credit permits one event for the requested site. Implementations may
/// cap the grant for fairness; receivers accumulate with saturation either
/// way.
pub const CREDITS_MAX: u64 = u64::MAX;

/// Messages sent by the serving (passive) side of an exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncomingMessage<T> {
    Advertisement(Advertisement),
    /// All currently known sites have been advertised; requests may begin.
    Ready,
    Event(EventValue<T>),
    /// Terminal in the V1 dialect; equivalent to closing the stream.
    Done,
}

impl<T> IncomingMessage<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            IncomingMessage::Advertisement(_) => "ADVERTISEMENT",
            IncomingMessage::Ready => "READY",
            IncomingMessage::Event(_) => "EVENT",
            IncomingMessage::Done => "DONE",
        }
    }
}

/// "I hold events for this site."
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub site: SiteId,
}

/// Messages sent by the consuming (active) side of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingMessage {
    Acknowledge(Acknowledge),
    Request(Request),
    /// Terminal in the V1 dialect; equivalent to closing the stream.
    Done,
}

impl OutgoingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::Acknowledge(_) => "ACKNOWLEDGE",
            OutgoingMessage::Request(_) => "REQUEST",
            OutgoingMessage::Done => "DONE",
        }
    }
}

/// "Events below `next_seqno` for `site` are already held; do not resend."
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub site: SiteId,
    pub next_seqno: SeqNo,
}

/// "Send up to `count` events for `site`."
///
/// `next_for_site` and `next_for_all` report the requester's expected
/// frontiers. They are advisory rather than a serving floor: a requester
/// holding a causal hole reports a frontier beyond the hole, and serving
/// from the reported frontier would leave the hole unfillable. Serving
/// starts from the acknowledged floor instead, and the requester's
/// idempotent insert drops duplicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub site: SiteId,
    pub next_for_site: SeqNo,
    pub next_for_all: SeqNo,
    pub count: u64,
}
