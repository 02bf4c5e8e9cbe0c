/// The shared "next notification" record and the rules deciding when a newly
/// resolved candidate replaces it.
///
/// The record is a process-lifetime singleton shared as [`SharedRecord`].
/// Every read or write happens under its mutex so that trigger time, flags and
/// text are always observed together.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

pub const MINUTE_SECS: i64 = 60;
pub const DAY_SECS: i64 = 86_400;

bitflags! {
    /// Per-appointment state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AppointmentFlags: u8 {
        /// The user flagged this appointment for notification.
        const NOTIFY = 0b01;
        /// The alert command already fired for the held occurrence.
        /// Owned by the record; the store never sets it.
        const NOTIFIED = 0b10;
    }
}

impl AppointmentFlags {
    /// The bits that come from the appointment store, i.e. everything but
    /// [`AppointmentFlags::NOTIFIED`].
    pub fn store_bits(self) -> Self {
        self.difference(Self::NOTIFIED)
    }
}

/// A prospective next appointment produced by a resolver query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Unix timestamp (seconds) of the occurrence.
    pub occurs_at: i64,
    pub flags: AppointmentFlags,
    pub text: String,
}

/// The appointment currently surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldAppointment {
    pub trigger_time: i64,
    pub flags: AppointmentFlags,
    pub text: String,
}

#[derive(Debug)]
pub struct NotificationRecord {
    /// `Some` iff an appointment is held; the text lives inside it so it can
    /// never outlive or precede the appointment.
    held: Option<HeldAppointment>,
    /// Remaining-time threshold (seconds) at or below which the refresh loop
    /// recomputes the countdown.
    recompute_deadline: i64,
    issued_lookups: u64,
    applied_lookup: u64,
}

pub type SharedRecord = Arc<Mutex<NotificationRecord>>;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for NotificationRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationRecord {
    pub fn new() -> Self {
        Self {
            held: None,
            recompute_deadline: DAY_SECS,
            issued_lookups: 0,
            applied_lookup: 0,
        }
    }

    pub fn shared() -> SharedRecord {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn held(&self) -> Option<&HeldAppointment> {
        self.held.as_ref()
    }

    /// Trigger time and store-owned flags of the held appointment; the inputs
    /// of every merge decision.
    pub fn key(&self) -> Option<(i64, AppointmentFlags)> {
        self.held
            .as_ref()
            .map(|h| (h.trigger_time, h.flags.store_bits()))
    }

    /// Seconds until the held appointment, clamped at zero.
    pub fn time_left(&self, now: i64) -> i64 {
        self.held
            .as_ref()
            .map_or(0, |h| (h.trigger_time - now).max(0))
    }

    pub fn recompute_deadline(&self) -> i64 {
        self.recompute_deadline
    }

    pub fn set_recompute_deadline(&mut self, deadline: i64) {
        self.recompute_deadline = deadline;
    }

    /// Swaps in `candidate` wholesale: the fired bit is cleared, the recompute
    /// deadline goes back to one day and the old text is dropped.
    pub fn replace(&mut self, candidate: Candidate) {
        self.held = Some(HeldAppointment {
            trigger_time: candidate.occurs_at,
            flags: candidate.flags.store_bits(),
            text: candidate.text,
        });
        self.recompute_deadline = DAY_SECS;
    }

    pub fn clear(&mut self) {
        self.held = None;
        self.recompute_deadline = DAY_SECS;
    }

    /// Sets the fired bit. Returns `false` if it was already set or nothing
    /// is held.
    pub fn mark_notified(&mut self) -> bool {
        match self.held.as_mut() {
            Some(h) if !h.flags.contains(AppointmentFlags::NOTIFIED) => {
                h.flags.insert(AppointmentFlags::NOTIFIED);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn is_notified(&self) -> bool {
        self.held
            .as_ref()
            .is_some_and(|h| h.flags.contains(AppointmentFlags::NOTIFIED))
    }

    /// Hands out the ticket for a lookup about to be issued.
    pub fn issue_lookup(&mut self) -> u64 {
        self.issued_lookups += 1;
        self.issued_lookups
    }

    /// Ad-hoc insert or edit of a single appointment (or the resolved
    /// occurrence of a recurring one). A replacing insert is newer than any
    /// lookup already in flight, so those results are dropped when they land.
    pub fn apply_insert(&mut self, now: i64, candidate: Candidate) -> bool {
        if !should_replace_on_insert(self.key(), now, candidate.occurs_at, candidate.flags) {
            return false;
        }
        self.replace(candidate);
        self.applied_lookup = self.issued_lookups;
        true
    }

    /// Periodic or forced refresh with the globally nearest candidate.
    /// `None` clears the record.
    pub fn apply_refresh(&mut self, now: i64, candidate: Option<Candidate>, force: bool) -> bool {
        match candidate {
            None => {
                let had = self.held.is_some();
                self.clear();
                had
            }
            Some(c) if c.occurs_at <= now => false,
            Some(c) => {
                if force || should_replace_on_refresh(self.key(), c.occurs_at, c.flags) {
                    self.replace(c);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Applies the result of the lookup holding `ticket`, unless a lookup
    /// issued later has already been applied.
    pub fn apply_lookup(
        &mut self,
        ticket: u64,
        now: i64,
        candidate: Option<Candidate>,
        force: bool,
    ) -> bool {
        if ticket <= self.applied_lookup {
            return false;
        }
        self.applied_lookup = ticket;
        self.apply_refresh(now, candidate, force)
    }
}

/// Insert rule: replace when nothing is held and the candidate is within a
/// day, when it is strictly sooner than the held one, or when it ties the
/// held time with different flags. Past candidates never replace.
pub fn should_replace_on_insert(
    held: Option<(i64, AppointmentFlags)>,
    now: i64,
    occurs_at: i64,
    flags: AppointmentFlags,
) -> bool {
    if occurs_at <= now {
        return false;
    }
    match held {
        None => occurs_at - now <= DAY_SECS,
        Some((time, held_flags)) => {
            occurs_at < time || (occurs_at == time && flags.store_bits() != held_flags.store_bits())
        }
    }
}

/// Refresh rule: replace when the candidate is a different target, by time
/// or by flags.
pub fn should_replace_on_refresh(
    held: Option<(i64, AppointmentFlags)>,
    occurs_at: i64,
    flags: AppointmentFlags,
) -> bool {
    held.map_or(true, |(time, held_flags)| {
        time != occurs_at || held_flags.store_bits() != flags.store_bits()
    })
}
