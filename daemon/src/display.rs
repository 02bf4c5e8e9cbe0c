/// Rendering of the one-line notify bar.
use std::io::Write;
use std::sync::Mutex;

use crate::record::lock;

const MAX_TEXT_CHARS: usize = 40;

/// Countdown to the held appointment as last recomputed by the refresh loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    /// Remaining time rounded up to whole minutes.
    pub minutes: i64,
    /// The warning threshold is crossed and the appointment is eligible.
    pub reminder: bool,
    pub text: String,
}

/// Everything one bar repaint needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarView {
    pub date: String,
    pub time: String,
    /// `None` when no appointment is pending.
    pub countdown: Option<Countdown>,
}

pub trait BarDisplay: Send + Sync {
    fn render(&self, view: &BarView);
}

/// Draws the bar on a terminal line, overwriting it in place.
pub struct TerminalBar<W: Write + Send> {
    out: Mutex<W>,
    source: String,
}

impl TerminalBar<std::io::Stdout> {
    pub fn stdout(source: impl Into<String>) -> Self {
        Self::new(std::io::stdout(), source)
    }
}

impl<W: Write + Send> TerminalBar<W> {
    /// `source` names the appointment file shown next to the countdown.
    pub fn new(out: W, source: impl Into<String>) -> Self {
        Self {
            out: Mutex::new(out),
            source: source.into(),
        }
    }

    pub fn line(&self, view: &BarView) -> String {
        let mut line = format!("[ {} | {} ]", view.date, view.time);
        if let Some(c) = &view.countdown {
            let entry = format!(
                "> {:02}:{:02} :: {} <",
                c.minutes / 60,
                c.minutes % 60,
                chop(&c.text, MAX_TEXT_CHARS)
            );
            line.push_str(&format!("   ({})   ", self.source));
            if c.reminder {
                // Blink while the warning threshold is crossed.
                line.push_str(&format!("\x1b[5m{entry}\x1b[25m"));
            } else {
                line.push_str(&entry);
            }
        }
        line
    }
}

impl<W: Write + Send> BarDisplay for TerminalBar<W> {
    fn render(&self, view: &BarView) {
        let line = self.line(view);
        let mut out = lock(&self.out);
        let _ = write!(out, "\r\x1b[2K{line}");
        let _ = out.flush();
    }
}

/// Truncates `text` to at most `max` characters.
fn chop(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(countdown: Option<Countdown>) -> BarView {
        BarView {
            date: "Fri 2026-10-16".to_string(),
            time: "09:58:12".to_string(),
            countdown,
        }
    }

    #[test]
    fn idle_bar_shows_clock_only() {
        let bar = TerminalBar::new(Vec::new(), "appointments.toml");
        assert_eq!(bar.line(&view(None)), "[ Fri 2026-10-16 | 09:58:12 ]");
    }

    #[test]
    fn countdown_formats_hours_and_minutes() {
        let bar = TerminalBar::new(Vec::new(), "appointments.toml");
        let line = bar.line(&view(Some(Countdown {
            minutes: 75,
            reminder: false,
            text: "Dentist".to_string(),
        })));
        assert!(line.contains("(appointments.toml)"));
        assert!(line.ends_with("> 01:15 :: Dentist <"));
    }

    #[test]
    fn reminder_is_highlighted() {
        let bar = TerminalBar::new(Vec::new(), "a");
        let line = bar.line(&view(Some(Countdown {
            minutes: 3,
            reminder: true,
            text: "Standup".to_string(),
        })));
        assert!(line.contains("\x1b[5m> 00:03 :: Standup <\x1b[25m"));
    }

    #[test]
    fn chop_respects_char_boundaries() {
        assert_eq!(chop("héllo wörld", 4), "héll");
        assert_eq!(chop("short", 40), "short");
    }

    #[test]
    fn render_overwrites_line() {
        let bar = TerminalBar::new(Vec::new(), "a");
        bar.render(&view(None));
        bar.render(&view(None));
        let written = String::from_utf8(lock(&bar.out).clone()).unwrap();
        assert_eq!(written.matches("\r\x1b[2K").count(), 2);
    }
}
