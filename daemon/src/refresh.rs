/// The notify-bar refresh loop of the interactive session.
///
/// Once per second the loop formats the clock, recomputes the countdown to
/// the held appointment when its recompute deadline is reached, fires the
/// alert command inside the warning window, and starts lookups when the held
/// appointment has passed or nothing has been held for a minute. At most one
/// loop runs at a time; see [`RefreshController`].
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::alert;
use crate::clock;
use crate::display::{BarDisplay, BarView, Countdown};
use crate::notifier::Notifier;
use crate::record::{lock, MINUTE_SECS};

/// `secs` rounded up to whole minutes.
pub fn round_up_minutes(secs: i64) -> i64 {
    secs / MINUTE_SECS + i64::from(secs % MINUTE_SECS != 0)
}

/// Remaining time rounded down to the previous whole minute, so the next
/// recompute lands on a minute boundary.
pub fn next_recompute_deadline(time_left: i64) -> i64 {
    let rem = time_left % MINUTE_SECS;
    time_left - MINUTE_SECS + if rem != 0 { MINUTE_SECS - rem } else { 0 }
}

/// Loop-local state carried between iterations.
#[derive(Debug, Default)]
pub struct BarState {
    countdown: Option<Countdown>,
    last_check: i64,
}

/// One loop iteration at `now`. Spawns lookups but never waits for them.
pub fn tick(notifier: &Notifier, state: &mut BarState, now: i64) -> BarView {
    let bar = notifier.bar_snapshot();
    let date = clock::format_local(now, &bar.date_format);
    let time = clock::format_local(now, &bar.time_format);

    let mut time_left = 0;
    let mut rec = lock(notifier.record());
    match rec.held().map(|h| (h.trigger_time, h.flags)) {
        Some((trigger, flags)) => {
            time_left = trigger - now;
            if time_left > 0 && time_left <= rec.recompute_deadline() {
                let reminder = time_left <= bar.warning_secs && bar.policy.is_eligible(flags);
                if reminder && bar.command_enabled() {
                    alert::launch(&mut rec, &bar, notifier.spawner());
                }
                state.countdown = Some(Countdown {
                    minutes: round_up_minutes(time_left),
                    reminder,
                    text: rec.held().map(|h| h.text.clone()).unwrap_or_default(),
                });
                rec.set_recompute_deadline(next_recompute_deadline(time_left));
            } else if time_left <= 0 && bar.enabled {
                let ticket = rec.issue_lookup();
                notifier.spawn_lookup(ticket, false);
            }
        }
        None => {
            if now > state.last_check + MINUTE_SECS {
                if bar.enabled {
                    let ticket = rec.issue_lookup();
                    notifier.spawn_lookup(ticket, false);
                }
                state.last_check = now;
            }
        }
    }
    drop(rec);

    BarView {
        date,
        time,
        countdown: if time_left > 0 {
            state.countdown.clone()
        } else {
            None
        },
    }
}

fn until_next_second() -> Duration {
    let millis = Local::now().timestamp_subsec_millis().min(999);
    Duration::from_millis(u64::from(1000 - millis))
}

async fn run(notifier: Notifier, display: Arc<dyn BarDisplay>, mut stop_rx: watch::Receiver<bool>) {
    let mut state = BarState::default();
    loop {
        let view = tick(&notifier, &mut state, clock::now_secs());
        display.render(&view);

        tokio::select! {
            _ = tokio::time::sleep(until_next_second()) => {}
            _ = stop_rx.changed() => break,
        }
    }
}

/// A running refresh loop.
struct RefreshLoop {
    /// Setting this to `true` asks the loop to exit.
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the single refresh loop instance.
#[derive(Default)]
pub struct RefreshController {
    running: Option<RefreshLoop>,
}

impl RefreshController {
    /// Starts the loop, stopping any previous instance first.
    pub async fn start(&mut self, notifier: &Notifier, display: Arc<dyn BarDisplay>) {
        self.stop().await;

        // The shared record may be stale if the loop was stopped and relaunched.
        notifier.check_next_app(true);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(notifier.clone(), display, stop_rx));
        self.running = Some(RefreshLoop { stop_tx, handle });
    }

    /// Stops the loop and waits for it to exit. No-op when nothing runs.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(true);
            if let Err(e) = running.handle.await {
                warn!("Refresh loop ended abnormally: {e}");
            }
        }
    }
}
