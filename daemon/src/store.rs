/// File-backed appointment store: `appointments.toml` in the data directory.
///
/// ```toml
/// [[appointment]]
/// start = "2026-10-16T14:00:00"
/// text = "Dentist"
/// notify = true
///
/// [[recurring]]
/// start = "2026-01-05T09:30:00"
/// text = "Standup"
/// every = "weekly"
/// frequency = 1
/// until = "2026-12-31"
/// exceptions = ["2026-10-19"]
/// ```
///
/// All times are local wall-clock times.
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use serde::Deserialize;

use crate::clock;
use crate::record::{AppointmentFlags, Candidate};
use crate::resolver::AppointmentStore;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Appointment {
    pub start: NaiveDateTime,
    pub text: String,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeat {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecurringAppointment {
    pub start: NaiveDateTime,
    pub text: String,
    #[serde(default)]
    pub notify: bool,
    pub every: Repeat,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub until: Option<NaiveDate>,
    #[serde(default)]
    pub exceptions: Vec<NaiveDate>,
}

fn default_frequency() -> u32 {
    1
}

fn flags_for(notify: bool) -> AppointmentFlags {
    if notify {
        AppointmentFlags::NOTIFY
    } else {
        AppointmentFlags::empty()
    }
}

impl Appointment {
    pub fn flags(&self) -> AppointmentFlags {
        flags_for(self.notify)
    }

    pub fn candidate(&self) -> Option<Candidate> {
        Some(Candidate {
            occurs_at: clock::timestamp_of(self.start)?,
            flags: self.flags(),
            text: self.text.clone(),
        })
    }
}

impl RecurringAppointment {
    pub fn flags(&self) -> AppointmentFlags {
        flags_for(self.notify)
    }

    /// Returns `true` if the series has an occurrence on `day`.
    pub fn occurs_on(&self, day: NaiveDate) -> bool {
        let first = self.start.date();
        if day < first || self.until.is_some_and(|u| day > u) || self.exceptions.contains(&day) {
            return false;
        }
        let freq = i64::from(self.frequency.max(1));
        match self.every {
            Repeat::Daily => (day - first).num_days() % freq == 0,
            Repeat::Weekly => (day - first).num_days() % (7 * freq) == 0,
            Repeat::Monthly => {
                let months = (day.year() - first.year()) * 12 + day.month() as i32
                    - first.month() as i32;
                day.day() == first.day() && i64::from(months) % freq == 0
            }
        }
    }

    /// Timestamp of the occurrence on `day`, if any.
    pub fn occurrence_on(&self, day: NaiveDate) -> Option<i64> {
        if !self.occurs_on(day) {
            return None;
        }
        clock::timestamp_of(day.and_time(self.start.time()))
    }

    /// Nearest occurrence strictly after `after`, looking at `day` and the
    /// day following it.
    pub fn next_occurrence(&self, after: i64, day: NaiveDate) -> Option<i64> {
        [Some(day), day.checked_add_days(Days::new(1))]
            .into_iter()
            .flatten()
            .filter_map(|d| self.occurrence_on(d))
            .find(|&ts| ts > after)
    }

    pub fn candidate_after(&self, after: i64, day: NaiveDate) -> Option<Candidate> {
        Some(Candidate {
            occurs_at: self.next_occurrence(after, day)?,
            flags: self.flags(),
            text: self.text.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Appointments {
    #[serde(default, rename = "appointment")]
    pub single: Vec<Appointment>,
    #[serde(default)]
    pub recurring: Vec<RecurringAppointment>,
}

impl Appointments {
    /// Items present in `self` but not in `previous`.
    pub fn added_since(&self, previous: &Appointments) -> Appointments {
        Appointments {
            single: self
                .single
                .iter()
                .filter(|a| !previous.single.contains(a))
                .cloned()
                .collect(),
            recurring: self
                .recurring
                .iter()
                .filter(|r| !previous.recurring.contains(r))
                .cloned()
                .collect(),
        }
    }
}

/// Loads the appointment file at `path`, returning an empty set if the file
/// does not exist.
pub fn load_or_empty(path: &Path) -> Result<Appointments> {
    if !path.exists() {
        return Ok(Appointments::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read appointments file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse appointments file: {}", path.display()))
}

pub struct FileStore {
    path: PathBuf,
    items: RwLock<Appointments>,
}

impl FileStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let items = load_or_empty(&path)?;
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Appointments {
        self.items
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AppointmentStore for FileStore {
    fn next_single(&self, after: i64) -> Option<Candidate> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items
            .single
            .iter()
            .filter_map(Appointment::candidate)
            .filter(|c| c.occurs_at > after)
            .min_by_key(|c| c.occurs_at)
    }

    fn next_recurring(&self, after: i64, day: NaiveDate) -> Option<Candidate> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        items
            .recurring
            .iter()
            .filter_map(|r| r.candidate_after(after, day))
            .min_by_key(|c| c.occurs_at)
    }

    fn reload(&self) -> Result<()> {
        let fresh = load_or_empty(&self.path)?;
        *self.items.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    fn release(&self) {
        *self.items.write().unwrap_or_else(|e| e.into_inner()) = Appointments::default();
    }

    fn is_reachable(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn series(every: Repeat, frequency: u32) -> RecurringAppointment {
        RecurringAppointment {
            start: dt("2026-01-05T09:30:00"),
            text: "Standup".to_string(),
            notify: true,
            every,
            frequency,
            until: None,
            exceptions: vec![],
        }
    }

    // ── recurrence ────────────────────────────────────────────────────────────

    #[test]
    fn daily_series_with_frequency() {
        let r = series(Repeat::Daily, 2);
        assert!(r.occurs_on(date("2026-01-05")));
        assert!(!r.occurs_on(date("2026-01-06")));
        assert!(r.occurs_on(date("2026-01-07")));
        assert!(!r.occurs_on(date("2026-01-04")));
    }

    #[test]
    fn weekly_series_hits_same_weekday() {
        let r = series(Repeat::Weekly, 1);
        assert!(r.occurs_on(date("2026-01-12")));
        assert!(!r.occurs_on(date("2026-01-13")));
    }

    #[test]
    fn monthly_series_hits_same_day_of_month() {
        let r = series(Repeat::Monthly, 1);
        assert!(r.occurs_on(date("2026-02-05")));
        assert!(!r.occurs_on(date("2026-02-06")));
    }

    #[test]
    fn until_and_exceptions_are_honoured() {
        let mut r = series(Repeat::Daily, 1);
        r.until = Some(date("2026-01-10"));
        r.exceptions = vec![date("2026-01-07")];
        assert!(!r.occurs_on(date("2026-01-07")));
        assert!(r.occurs_on(date("2026-01-10")));
        assert!(!r.occurs_on(date("2026-01-11")));
    }

    #[test]
    fn next_occurrence_rolls_over_to_following_day() {
        let r = series(Repeat::Daily, 1);
        let day = date("2026-03-10");
        let today = r.occurrence_on(day).unwrap();
        let tomorrow = r.occurrence_on(date("2026-03-11")).unwrap();
        assert_eq!(r.next_occurrence(today - 1, day), Some(today));
        assert_eq!(r.next_occurrence(today, day), Some(tomorrow));
    }

    // ── file store ────────────────────────────────────────────────────────────

    const SAMPLE: &str = r#"
[[appointment]]
start = "2026-03-10T14:00:00"
text = "Dentist"
notify = true

[[appointment]]
start = "2026-03-10T11:00:00"
text = "Call bank"

[[recurring]]
start = "2026-01-05T12:00:00"
text = "Lunch"
every = "daily"
"#;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("appointments.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("none.toml")).unwrap();
        assert_eq!(store.snapshot(), Appointments::default());
        assert!(!store.is_reachable());
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appointments.toml");
        std::fs::write(&path, "[[appointment]]\nstart = 12\n").unwrap();
        assert!(FileStore::open(path).is_err());
    }

    #[test]
    fn next_single_picks_earliest_after() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(write_sample(&dir)).unwrap();
        let morning = clock::timestamp_of(dt("2026-03-10T08:00:00")).unwrap();

        let first = store.next_single(morning).unwrap();
        assert_eq!(first.text, "Call bank");
        assert_eq!(first.flags, AppointmentFlags::empty());

        let second = store.next_single(first.occurs_at).unwrap();
        assert_eq!(second.text, "Dentist");
        assert_eq!(second.flags, AppointmentFlags::NOTIFY);
    }

    #[test]
    fn next_recurring_uses_given_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(write_sample(&dir)).unwrap();
        let morning = clock::timestamp_of(dt("2026-03-10T08:00:00")).unwrap();
        let lunch = store.next_recurring(morning, date("2026-03-10")).unwrap();
        assert_eq!(lunch.occurs_at, clock::timestamp_of(dt("2026-03-10T12:00:00")).unwrap());
    }

    #[test]
    fn reload_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir);
        let store = FileStore::open(path.clone()).unwrap();
        assert_eq!(store.snapshot().single.len(), 2);

        std::fs::write(&path, "").unwrap();
        store.reload().unwrap();
        assert!(store.snapshot().single.is_empty());

        std::fs::write(&path, SAMPLE).unwrap();
        store.reload().unwrap();
        store.release();
        assert_eq!(store.snapshot(), Appointments::default());
    }

    #[test]
    fn added_since_reports_new_items_only() {
        let before: Appointments = toml::from_str(SAMPLE).unwrap();
        let mut after = before.clone();
        after.single.push(Appointment {
            start: dt("2026-03-10T16:00:00"),
            text: "Gym".to_string(),
            notify: false,
        });
        let added = after.added_since(&before);
        assert_eq!(added.single.len(), 1);
        assert_eq!(added.single[0].text, "Gym");
        assert!(added.recurring.is_empty());
    }
}
