//! Core data models that flow through the intake pipeline.
//!
//! A [`SourceDocument`] is read-only input produced by a
//! [`DocumentSource`](crate::sources::DocumentSource). The pipeline derives a
//! [`PatientRecord`] from it and the exporter persists one [`IndexedRow`]
//! per filename.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::schema::PatientRecord;

/// A document as produced by a source: stable filename identity plus bytes.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_fingerprint: String,
}

impl SourceDocument {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        let content_fingerprint = fingerprint(&content);
        Self {
            filename: filename.into(),
            content,
            content_fingerprint,
        }
    }

    /// Lowercased suffix of the filename without the dot; empty when absent.
    pub fn kind(&self) -> String {
        file_kind(&self.filename)
    }
}

/// Lowercase hex SHA-256 of the given bytes.
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Suffix convention used to pick a converter: `"forms/a.PDF"` → `"pdf"`.
pub fn file_kind(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// One exported row of the `patients_info` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRow {
    pub filename: String,
    pub patient_info: PatientRecord,
    pub content_fingerprint: String,
    pub record_hash: String,
    pub exported_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(fingerprint(b"abc"), SourceDocument::new("x", b"abc".to_vec()).content_fingerprint);
    }

    #[test]
    fn file_kind_handles_case_and_missing_suffix() {
        assert_eq!(file_kind("forms/a.PDF"), "pdf");
        assert_eq!(file_kind("scan"), "");
        assert_eq!(file_kind("dir.v2/scan"), "");
        assert_eq!(file_kind("notes.tar.txt"), "txt");
    }
}
