/// Entry points that read or update the shared notification record.
///
/// A `Notifier` is cheap to clone; clones share the same record, bar
/// settings, store and spawner. The record and the bar settings sit behind
/// separate locks and are never held at the same time.
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::alert::{self, LaunchOutcome};
use crate::clock;
use crate::config::{NotifyBarConfig, SharedBarConfig};
use crate::record::{lock, AppointmentFlags, Candidate, NotificationRecord, SharedRecord};
use crate::resolver::{self, AppointmentStore};
use crate::spawn::Spawner;
use crate::store::RecurringAppointment;

#[derive(Clone)]
pub struct Notifier {
    record: SharedRecord,
    bar: SharedBarConfig,
    store: Arc<dyn AppointmentStore>,
    spawner: Arc<dyn Spawner>,
}

impl Notifier {
    pub fn new(
        bar: NotifyBarConfig,
        store: Arc<dyn AppointmentStore>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            record: NotificationRecord::shared(),
            bar: bar.shared(),
            store,
            spawner,
        }
    }

    pub fn record(&self) -> &SharedRecord {
        &self.record
    }

    pub fn bar(&self) -> &SharedBarConfig {
        &self.bar
    }

    pub fn store(&self) -> &Arc<dyn AppointmentStore> {
        &self.store
    }

    pub fn spawner(&self) -> &dyn Spawner {
        self.spawner.as_ref()
    }

    /// A consistent copy of the bar settings.
    pub fn bar_snapshot(&self) -> NotifyBarConfig {
        lock(&self.bar).clone()
    }

    /// Whether the notify bar is meant to be visible.
    pub fn is_bar_enabled(&self) -> bool {
        lock(&self.bar).enabled
    }

    /// Returns `true` if the record holds an appointment at `time`.
    pub fn same_item(&self, time: i64) -> bool {
        lock(&self.record)
            .held()
            .is_some_and(|h| h.trigger_time == time)
    }

    /// Starts an ephemeral lookup for the next appointment. Does nothing when
    /// the notify bar is disabled.
    pub fn check_next_app(&self, force: bool) -> Option<JoinHandle<bool>> {
        if !self.is_bar_enabled() {
            return None;
        }
        let ticket = lock(&self.record).issue_lookup();
        Some(self.spawn_lookup(ticket, force))
    }

    /// Runs the resolver off the caller's thread and merges its result. The
    /// ticket must come from [`NotificationRecord::issue_lookup`]; results of
    /// lookups overtaken by a later one are discarded.
    pub fn spawn_lookup(&self, ticket: u64, force: bool) -> JoinHandle<bool> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let now = clock::now_secs();
            let candidate = resolver::resolve_next(this.store.as_ref(), now);
            let replaced = lock(&this.record).apply_lookup(ticket, now, candidate, force);
            if replaced {
                debug!("Lookup {ticket} updated the next appointment");
            }
            replaced
        })
    }

    /// Resolves and merges synchronously on the calling thread.
    pub fn refresh_now(&self, now: i64, force: bool) -> bool {
        let candidate = resolver::resolve_next(self.store.as_ref(), now);
        lock(&self.record).apply_refresh(now, candidate, force)
    }

    /// A single appointment was added or edited.
    pub fn check_added_at(&self, now: i64, text: &str, start: i64, flags: AppointmentFlags) -> bool {
        lock(&self.record).apply_insert(
            now,
            Candidate {
                occurs_at: start,
                flags,
                text: text.to_string(),
            },
        )
    }

    /// A recurring series was added or edited: its nearest future occurrence
    /// from today goes through the insert rule.
    pub fn check_repeated_at(&self, now: i64, series: &RecurringAppointment) -> bool {
        match series.candidate_after(now, clock::local_date(now)) {
            Some(candidate) => lock(&self.record).apply_insert(now, candidate),
            None => false,
        }
    }

    /// Fires the alert command if the held appointment is inside the warning
    /// window and eligible. Returns `None` when no launch was due.
    pub fn alert_if_due(&self, now: i64) -> Option<LaunchOutcome> {
        let bar = self.bar_snapshot();
        let mut rec = lock(&self.record);
        let held_flags = rec.held()?.flags;
        let left = rec.time_left(now);
        if left > 0 && left <= bar.warning_secs && bar.policy.is_eligible(held_flags) {
            if !bar.command_enabled() {
                return None;
            }
            return Some(alert::launch(&mut rec, &bar, self.spawner.as_ref()));
        }
        None
    }
}
