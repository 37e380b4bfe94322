#![forbid(unsafe_code)]

//! Eventually consistent, causally ordered replication of per-site event logs.
//!
//! Each [`Site`] owns an append-only [`EventLog`] of events identified by a
//! `(sequence number, site)` pair. Paired sites exchange typed messages over
//! duplex channel streams until every site holds every event produced
//! anywhere, in an order compatible with each site's local sequence. A
//! [`Projection`] folds the log into an application model on demand.
//!
//! The crate is transport-agnostic: exchanges speak over `crossbeam`
//! channels of whole message values, and a transport layer owns framing,
//! serialization, and connection lifecycle. [`sync`] couples sites in-process
//! by crossing their exchange streams directly.

pub mod core;
pub mod exchange;
pub mod site;
pub mod sync;

pub use crate::core::{EventId, EventLog, EventValue, Projection, SeqNo, SiteId};
pub use crate::exchange::{
    Acknowledge, Advertisement, ExchangeError, IncomingMessage, OutgoingMessage, Request,
    CREDITS_MAX,
};
pub use crate::site::{EventScope, ReceiveExchange, SendExchange, Site};
pub use crate::sync::{sync, SyncConfig, SyncHandle};
