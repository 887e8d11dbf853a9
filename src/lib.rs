//! # Boulder KB
//!
//! Knowledge-base sync for the bouldering coach: climbing notes on disk are
//! chunked, embedded and written into a Chroma collection that the coaching
//! service queries at answer time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │ knowledge/  │──▶│ load + split │──▶│ embed      │──▶│  Chroma   │
//! │  *.txt      │   │  (chunk)     │   │ (Gemini)   │   │ collection│
//! └─────────────┘   └──────────────┘   └────────────┘   └──────────┘
//!        │                                    ▲ retry / recovery
//!        ▼                                    │
//!   change detector ── metadata JSON     error analyzer
//! ```
//!
//! Every remote call goes through [`retry`] with error-class-specific
//! backoff; failures are recorded by the [`analyzer`], and batches that still
//! fail are handed to the [`recovery`] manager. Runs hold an exclusive
//! [`lock`] so two syncs never write the collection at once.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML settings with environment overrides |
//! | [`logging`] | tracing subscriber setup |
//! | [`error`] | error taxonomy and status-code classification |
//! | [`retry`] | backoff policies and the retry combinator |
//! | [`analyzer`] | error history, trend windows and alerts |
//! | [`recovery`] | bounded re-processing of failed batches |
//! | [`lock`] | single-run process lock |
//! | [`changes`] | file fingerprints and change detection |
//! | [`documents`] | knowledge directory scanning and loading |
//! | [`chunk`] | recursive character text splitting |
//! | [`models`] | chunks, batches and query results |
//! | [`store`] | vector store trait, Chroma and in-memory backends |
//! | [`embedding`] | embedding provider trait, Gemini and hash backends |
//! | [`backup`] | JSON collection snapshots |
//! | [`ingest`] | replace/append pipeline |
//! | [`health`] | verify-mode health report |
//! | [`retrieval`] | similarity query used by the serving side |
//! | [`progress`] | stage timing and batch progress |
//! | [`runner`] | mode dispatch |

pub mod analyzer;
pub mod backup;
pub mod changes;
pub mod chunk;
pub mod config;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod health;
pub mod ingest;
pub mod lock;
pub mod logging;
pub mod models;
pub mod progress;
pub mod recovery;
pub mod retrieval;
pub mod retry;
pub mod runner;
pub mod store;
