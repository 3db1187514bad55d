//! Per-run accumulation of extracted rows.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::warn;

use crate::schema::PatientRecord;

/// One successfully processed document.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedRow {
    pub filename: String,
    pub content_fingerprint: String,
    pub record: PatientRecord,
}

/// Append-only target shared by all row workers of a run.
#[derive(Default)]
pub struct Collector {
    rows: Mutex<Vec<CollectedRow>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&self, filename: &str, content_fingerprint: &str, record: PatientRecord) {
        self.push(CollectedRow {
            filename: filename.to_string(),
            content_fingerprint: content_fingerprint.to_string(),
            record,
        });
    }

    pub fn push(&self, row: CollectedRow) {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The run's logical table keyed by filename. A filename collected more
    /// than once keeps its last entry.
    pub fn into_rows(self) -> BTreeMap<String, CollectedRow> {
        let rows = self.rows.into_inner().unwrap_or_else(|e| e.into_inner());
        let mut table = BTreeMap::new();
        for row in rows {
            if let Some(previous) = table.insert(row.filename.clone(), row) {
                warn!(filename = %previous.filename, "document collected twice in one run; keeping the later record");
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> PatientRecord {
        PatientRecord {
            name: name.to_string(),
            ..PatientRecord::default()
        }
    }

    #[test]
    fn table_is_keyed_by_filename() {
        let collector = Collector::new();
        collector.collect("b.pdf", "fp-b", record("B"));
        collector.collect("a.pdf", "fp-a", record("A"));
        collector.collect("b.pdf", "fp-b2", record("B2"));
        assert_eq!(collector.len(), 3);

        let table = collector.into_rows();
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["a.pdf", "b.pdf"]);
        assert_eq!(table["b.pdf"].record.name, "B2");
        assert_eq!(table["b.pdf"].content_fingerprint, "fp-b2");
    }

    #[test]
    fn concurrent_collects_are_not_lost() {
        let collector = std::sync::Arc::new(Collector::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let collector = collector.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        collector.collect(&format!("{}-{}.pdf", i, j), "fp", record("x"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(collector.len(), 400);
    }
}
