//! One-way projections from the event log to an application model.

use super::{EventId, EventLog};

/// Deterministic left fold of events into an application model.
///
/// Implementations must be pure: independent sites replaying the same log
/// contents must reach the same model, so the fold may run at any time and
/// any number of times.
pub trait Projection<T> {
    type Model;

    fn initial(&self) -> Self::Model;

    fn apply(&self, model: Self::Model, id: EventId, body: &T) -> Self::Model;
}

impl<T> EventLog<T> {
    /// Folds the whole log through `projection` from its initial model.
    pub fn project<P>(&self, projection: &P) -> P::Model
    where
        P: Projection<T>,
    {
        self.fold(projection.initial(), |model, id, body| {
            projection.apply(model, id, body)
        })
    }
}
