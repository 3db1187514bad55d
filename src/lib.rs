//! # Intake Harness
//!
//! Batch extraction of structured patient records from intake forms.
//!
//! Every document a [`sources::DocumentSource`] enumerates runs through the
//! same per-row pipeline, and the collected rows are reconciled into a
//! keyed `patients_info` table:
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌────────────┐   ┌───────────┐   ┌──────────┐
//! │  Source  │──▶│ Conversion │──▶│ Extraction │──▶│ Collector │──▶│ Exporter │
//! │ list/get │   │  markdown  │   │ LLM+schema │   │  by file  │   │  SQLite  │
//! └──────────┘   └─────┬──────┘   └────────────┘   └───────────┘   └──────────┘
//!                      │
//!                ┌─────▼──────┐
//!                │ conversion │
//!                │   cache    │
//!                └────────────┘
//! ```
//!
//! Rows run in parallel up to `pipeline.concurrency`. A failing row is
//! logged and leaves its previously exported value alone; a document that
//! disappears from the source has its row deleted at the next export.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Source documents, exported rows, fingerprints |
//! | [`schema`] | Patient record types and their strict JSON Schema |
//! | [`sources`] | Document source trait and in-memory source |
//! | [`connector_fs`] | Filesystem document source |
//! | [`formats`] | Built-in PDF / Office / text rendering |
//! | [`convert`] | Converter backends and the cached conversion stage |
//! | [`convert_cache`] | Single-flight conversion cache and its backends |
//! | [`extraction`] | Extraction backends |
//! | [`collector`] | Per-run row accumulation |
//! | [`export`] | Reconciling export plans |
//! | [`store`] | Record store trait, SQLite and in-memory stores |
//! | [`ingest`] | Pipeline orchestration and `intake sync` |
//! | [`progress`] | Sync progress on stderr |
//! | [`get`] | `intake get` / `intake list` |
//! | [`cache_cmd`] | `intake cache` |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod cache_cmd;
pub mod collector;
pub mod config;
pub mod connector_fs;
pub mod convert;
pub mod convert_cache;
pub mod db;
pub mod export;
pub mod extraction;
pub mod formats;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod schema;
pub mod sources;
pub mod store;
