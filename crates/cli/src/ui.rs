//! User interface helpers for the CLI: banner and progress display.

use std::io::{self, IsTerminal, Write};
use std::time::{Duration, Instant};

pub fn print_header() {
    let version = env!("CARGO_PKG_VERSION");
    // Avoid panics when the version exceeds the expected width
    let spaces = " ".repeat(24usize.saturating_sub(version.len()));
    eprintln!(
        r#"
    ╭──────────────────────────────────────╮
    │                                      │
    │     dblint                           │
    │     Database usage analyzer          │
    │     Version: {version}{spaces}│
    │                                      │
    ╰──────────────────────────────────────╯
"#
    );
}

/// Progress of the extraction phase, one step per input file.
///
/// The bar renders only when stderr is attached to a terminal. For
/// non-interactive environments (CI, redirections), progress updates
/// are skipped to avoid noisy logs.
pub struct ProgressBar {
    label: &'static str,
    total: usize,
    completed: usize,
    width: usize,
    last_line_len: usize,
    min_interval: Duration,
    last_draw: Instant,
    start: Instant,
}

impl ProgressBar {
    /// Returns `None` when there is nothing to track or when stderr is not
    /// attached to a terminal.
    pub fn new(label: &'static str, total: usize) -> Option<Self> {
        if total == 0 || !io::stderr().is_terminal() {
            return None;
        }
        let start = Instant::now();
        let mut bar = Self {
            label,
            total,
            completed: 0,
            width: 28,
            last_line_len: 0,
            min_interval: Duration::from_millis(75),
            last_draw: start,
            start,
        };
        bar.draw(true);
        Some(bar)
    }

    /// Marks `count` items as processed. Redraws are throttled.
    pub fn increment(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.completed = (self.completed + count).min(self.total);
        self.draw(false);
    }

    /// Forces a final draw and moves the cursor to the next line.
    pub fn finish(&mut self) {
        self.completed = self.total;
        self.draw(true);
        let mut stderr = io::stderr();
        let _ = writeln!(stderr);
        self.last_line_len = 0;
    }

    fn draw(&mut self, force: bool) {
        let now = Instant::now();
        if !force
            && self.last_line_len != 0
            && now.duration_since(self.last_draw) < self.min_interval
        {
            return;
        }
        self.last_draw = now;

        let percent = (self.completed as f64 / self.total as f64).clamp(0.0, 1.0);
        let filled = (((self.width as f64) * percent).round() as usize).min(self.width);
        let bar = format!(
            "{}{}",
            "█".repeat(filled),
            "░".repeat(self.width.saturating_sub(filled))
        );
        let eta = self.estimate_eta().unwrap_or_else(|| "--:--".to_string());
        let message = format!(
            "▸ {} |{bar}| {:6.2}% | files {}/{} | ETA {eta}",
            self.label,
            percent * 100.0,
            self.completed,
            self.total,
        );

        let mut stderr = io::stderr();
        let padding = " ".repeat(self.last_line_len.saturating_sub(message.len()));
        let _ = write!(stderr, "\r{message}{padding}");
        let _ = stderr.flush();
        self.last_line_len = message.len();
    }

    fn estimate_eta(&self) -> Option<String> {
        if self.completed == 0 {
            return None;
        }
        if self.completed >= self.total {
            return Some("00:00".to_string());
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed < f64::EPSILON {
            return None;
        }
        let per_second = self.completed as f64 / elapsed;
        let remaining = (self.total - self.completed) as f64 / per_second;
        Some(format_duration(Duration::from_secs_f64(remaining)))
    }
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
