//! Core data model: identifiers, the event log, and projections.
//!
//! Module order follows type dependency order: identity first, then the
//! site-partitioned log, then the projection seam on top of the log fold.

pub mod identity;
pub mod log;
pub mod projection;

pub use identity::{EventId, EventValue, SeqNo, SiteId};
pub use log::EventLog;
pub use projection::Projection;
