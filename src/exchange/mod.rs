//! Bidirectional exchange engine: wire alphabets, state machines, runtime.

pub mod error;
pub(crate) mod incoming;
pub(crate) mod notify;
pub(crate) mod outgoing;
pub mod proto;
pub(crate) mod runtime;

pub use error::ExchangeError;
pub use proto::{
    Acknowledge, Advertisement, IncomingMessage, OutgoingMessage, Request, CREDITS_MAX,
};
