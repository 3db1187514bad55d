//! Sync progress reporting.
//!
//! Reports what `intake sync` is doing so users see how many documents were
//! found and how many are left. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts.

use std::io::{IsTerminal, Write};

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Source is being enumerated; total unknown.
    Discovering { source: String },
    /// `n` of `total` rows finished, `failed` of them without a record.
    Processing {
        source: String,
        n: u64,
        total: u64,
        failed: u64,
    },
    /// Collected rows are being reconciled into the store.
    Exporting { rows: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync filesystem  processing  12 / 40 documents".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { source } => {
                format!("sync {}  discovering...\n", source)
            }
            SyncProgressEvent::Processing {
                source,
                n,
                total,
                failed,
            } => {
                let mut line = format!(
                    "sync {}  processing  {} / {} documents",
                    source,
                    format_number(*n),
                    format_number(*total)
                );
                if *failed > 0 {
                    line.push_str(&format!("  ({} failed)", format_number(*failed)));
                }
                line.push('\n');
                line
            }
            SyncProgressEvent::Exporting { rows } => {
                format!("sync  exporting {} rows\n", format_number(*rows))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "discovering"
            }),
            SyncProgressEvent::Processing {
                source,
                n,
                total,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "processing",
                "n": n,
                "total": total,
                "failed": failed
            }),
            SyncProgressEvent::Exporting { rows } => serde_json::json!({
                "event": "progress",
                "phase": "exporting",
                "rows": rows
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
