//! src/sim/report.rs
//!
//! TAP output and the end-of-run metrics table.

use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Writes the TAP result stream. Write failures are logged and otherwise
/// ignored; losing the report must not stop the run.
pub struct TapReporter {
    out: Box<dyn Write + Send>,
}

impl TapReporter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn version(&mut self) {
        self.line(format_args!("TAP version 13"));
    }

    pub fn ok(&mut self, index: usize, text: &str) {
        self.line(format_args!("ok {index} - {text}"));
    }

    pub fn not_ok(&mut self, index: usize, text: &str) {
        self.line(format_args!("not ok {index} - {text}"));
    }

    pub fn bail_out(&mut self, reason: &str) {
        self.line(format_args!("Bail out! {reason}"));
    }

    pub fn plan(&mut self, count: usize) {
        self.line(format_args!("1..{count}"));
    }

    /// Every line of `text` becomes a `# ` comment. Empty text prints nothing.
    pub fn diagnostic(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        for line in text.split('\n') {
            self.line(format_args!("# {line}"));
        }
    }

    fn line(&mut self, args: fmt::Arguments<'_>) {
        let res = self
            .out
            .write_fmt(args)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(e) = res {
            tracing::error!(error = %e, "Failed to write TAP output");
        }
    }
}

/// A cloneable in-memory sink, for capturing a report.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "report buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One row of the metrics table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PuppetMetrics {
    pub name: String,
    pub total: Duration,
    pub active: Duration,
    pub messages: u64,
}

/// Renders the table, longest-running puppet first.
pub fn render_metrics(rows: &[PuppetMetrics]) -> String {
    let mut rows = rows.to_vec();
    rows.sort_by(|a, b| b.total.as_millis().cmp(&a.total.as_millis()));

    let mut table = format!(
        "{:<12} {:>12} {:>12} {:>12}",
        "Puppet", "Total time", "Active time", "# messages"
    );
    for row in rows {
        table.push('\n');
        table.push_str(&format!(
            "{:<12} {:>12} {:>12} {:>12}",
            row.name,
            format_duration(row.total),
            format_duration(row.active),
            row.messages
        ));
    }
    table
}

/// Millisecond-truncated durations in the compact `1h2m3.5s` style.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms < 1000 {
        return format!("{ms}ms");
    }
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let secs = (ms / 1000) % 60;
    let frac = ms % 1000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if frac == 0 {
        out.push_str(&format!("{secs}s"));
    } else {
        let frac = format!("{frac:03}");
        out.push_str(&format!("{secs}.{}s", frac.trim_end_matches('0')));
    }
    out
}
