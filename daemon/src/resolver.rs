/// Candidate resolution against the appointment store.
use anyhow::Result;
use chrono::NaiveDate;

use crate::clock;
use crate::record::{Candidate, DAY_SECS};

/// Read access to the appointment data the notifier consumes.
///
/// Both queries return the earliest match strictly after `after`.
pub trait AppointmentStore: Send + Sync {
    /// Nearest single appointment.
    fn next_single(&self, after: i64) -> Option<Candidate>;

    /// Nearest occurrence of any recurring series, searching occurrences
    /// from `day` onward.
    fn next_recurring(&self, after: i64, day: NaiveDate) -> Option<Candidate>;

    /// Re-reads persisted data.
    fn reload(&self) -> Result<()> {
        Ok(())
    }

    /// Drops in-memory collections before shutdown.
    fn release(&self) {}

    /// Whether the backing data source can be accessed.
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Resolves the globally nearest candidate within the next 24 hours.
///
/// When a recurring occurrence and a single appointment fall on the same
/// second the single appointment wins. Never touches shared state.
pub fn resolve_next(store: &dyn AppointmentStore, now: i64) -> Option<Candidate> {
    let in_horizon = |c: &Candidate| c.occurs_at > now && c.occurs_at - now <= DAY_SECS;

    let recurring = store
        .next_recurring(now, clock::local_date(now))
        .filter(in_horizon);
    let single = store.next_single(now).filter(in_horizon);

    match (recurring, single) {
        (Some(r), Some(s)) => Some(if s.occurs_at <= r.occurs_at { s } else { r }),
        (r, s) => s.or(r),
    }
}
