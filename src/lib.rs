//! # Repo Vision
//!
//! Ask questions about a hosted code repository. A project is created from a
//! repository URL; every file is summarized and embedded, recent commits are
//! summarized and tracked incrementally, and questions are answered by a
//! streamed completion grounded on the most similar files.
//!
//! ## Architecture
//!
//! ```text
//! GitHub ──▶ loader ──▶ summarize + embed ──▶ index ──▶ SQLite
//!   │                                                     │
//!   └──▶ commits (poll / refresher) ──────────────────────┤
//!                                                         ▼
//!                       question ──▶ retrieval ──▶ answer stream
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Typed failure classes carried inside `anyhow` |
//! | [`retry`] | Bounded exponential backoff for outbound calls |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`models`] | Core data types |
//! | [`store`] | Projects, artifacts, commits and questions |
//! | [`github`] | Hosting API client and repository URL parsing |
//! | [`loader`] | Bounded-concurrency repository loading |
//! | [`embedding`] | Embedding backends and vector helpers |
//! | [`llm`] | Generation backends, one-shot and streaming |
//! | [`summarize`] | File and commit summaries |
//! | [`index`] | Artifact writes and vector reconciliation |
//! | [`ingest`] | The full ingestion pipeline |
//! | [`commits`] | Incremental commit polling |
//! | [`refresh`] | Background commit refresher |
//! | [`retrieval`] | Cosine similarity ranking |
//! | [`answer`] | Prompt assembly and the answer stream |
//! | [`service`] | The [`RepoVision`] service |

pub mod answer;
pub mod commits;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod github;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod refresh;
pub mod retrieval;
pub mod retry;
pub mod service;
pub mod store;
pub mod summarize;

pub use error::Error;
pub use service::RepoVision;
