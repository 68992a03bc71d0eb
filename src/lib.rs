//! # Report Ingest
//!
//! An idempotent, rollback-safe ingestion pipeline for analyst report PDFs.
//!
//! Every source file is tracked in a JSON registry keyed by a content hash.
//! A batch run plans which files are new, changed, or stuck part-way, then
//! drives each one through parse → chunk → index. A document that was indexed
//! before and fails on reprocessing is restored to its last good state, both
//! in the registry and in the vector store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────────────────────┐
//! │  raw PDFs  │──▶│ PlanComputer│──▶│      PipelineRunner        │
//! └────────────┘   └──────┬──────┘   │ parse → segment → index    │
//!                         │          └──┬──────────┬──────────┬──┘
//!                         ▼             ▼          ▼          ▼
//!                   ┌──────────┐  ┌──────────┐ ┌────────┐ ┌──────────┐
//!                   │ Registry │  │  parser  │ │ cache  │ │  vector  │
//!                   │  (JSON)  │  │  (HTTP)  │ │ (.md)  │ │  store   │
//!                   └──────────┘  └──────────┘ └────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ingest init                          # data dirs, empty registry, vector schema
//! ingest plan                          # what would be processed, and why
//! ingest run                           # process everything that is not up to date
//! ingest run --file data/raw_pdfs/x.pdf
//! ingest status                        # counts per pipeline status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error type |
//! | [`models`] | Core data types |
//! | [`registry`] | Persistent per-document records |
//! | [`plan`] | Deciding what needs (re)processing |
//! | [`runner`] | The per-document state machine and batch loop |
//! | [`segment`] | Markdown to text/table chunks |
//! | [`parser`] | Document parsing service client |
//! | [`cache`] | Parse output cache |
//! | [`metadata`] | Report metadata heuristics |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Vector store trait and indexer |
//! | [`memory_store`] | In-memory vector store |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`retry`] | HTTP retry policy |
//! | [`progress`] | Batch progress on stderr |
//! | [`status`] | Registry overview |

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod memory_store;
pub mod metadata;
pub mod models;
pub mod parser;
pub mod plan;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod segment;
pub mod sqlite_store;
pub mod status;
pub mod vector_store;
