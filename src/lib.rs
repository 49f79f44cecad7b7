//! # eCFR Analyzer
//!
//! Pulls the Electronic Code of Federal Regulations (titles, the agency
//! hierarchy, and per-reference regulation text) from the public eCFR API
//! into SQLite, and serves the result over a read-only JSON API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  eCFR API   │──▶│   Ingest      │──▶│  SQLite   │
//! │ rate-limited│   │ titles/agency │   │  + FTS5   │
//! └─────────────┘   │ extract+sum.  │   └────┬─────┘
//!                   └──────────────┘        │
//!                      ┌────────────────────┤
//!                      ▼                    ▼
//!                 ┌──────────┐        ┌──────────┐
//!                 │   CLI    │        │   HTTP   │
//!                 │  (ecfr)  │        │  (JSON)  │
//!                 └──────────┘        └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Upstream feed types and stored rows |
//! | [`ratelimit`] | Sliding-window request budget |
//! | [`upstream`] | eCFR API client |
//! | [`extract`] | XML to plain text |
//! | [`summarize`] | Optional LLM summarization |
//! | [`upsert`] | Idempotent writes |
//! | [`ingest`] | Ingestion phases |
//! | [`progress`] | Ingestion progress reporting |
//! | [`catalog`] | Read queries |
//! | [`search`] | Full-text search |
//! | [`stats`] | Row counts |
//! | [`server`] | JSON HTTP API |

pub mod catalog;
pub mod config;
pub mod db;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod ratelimit;
pub mod search;
pub mod server;
pub mod stats;
pub mod summarize;
pub mod upsert;
pub mod upstream;
