//! # Archive Sync
//!
//! Ingestion and status-reconciliation engine for scanned archive documents.
//!
//! Documents arrive under several historical id schemes. Their page-level
//! analysis (OCR text, entities, dates, annotations) comes from an external
//! service and is reconciled idempotently into SQLite, along with a
//! normalized timeline and a processing stage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌───────────┐
//! │ Identity │──▶│ Analysis │──▶│   Dates   │──▶│ Reconcile │──▶ SQLite
//! │ resolve  │   │  fetch   │   │ normalize │   │  upsert   │
//! └──────────┘   └──────────┘   └───────────┘   └─────┬─────┘
//!                                                     │
//!                      ┌──────────────────────────────┤
//!                      ▼                              ▼
//!                 ┌──────────┐                   ┌──────────┐
//!                 │   CLI    │                   │   HTTP   │
//!                 │  (arx)   │                   │  (axum)  │
//!                 └──────────┘                   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! arx init                          # create database
//! arx update 104-10003-10041        # fetch + reconcile with retries
//! arx scan                          # list broken documents
//! arx repair --all                  # repair them
//! arx serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`dates`] | Date normalization |
//! | [`identity`] | Id cleaning and resolution |
//! | [`analysis`] | Analysis service client |
//! | [`retry`] | Bounded retry combinator |
//! | [`reconcile`] | Idempotent upsert of analysis results |
//! | [`status`] | Status reports and cache |
//! | [`ingest`] | Kickoff, update, webhook and status operations |
//! | [`repair`] | Broken-document detection and repair |
//! | [`store`] | Storage trait and in-memory backend |
//! | [`sqlite_store`] | SQLite backend |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analysis;
pub mod config;
pub mod dates;
pub mod db;
pub mod get;
pub mod identity;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod reconcile;
pub mod repair;
pub mod retry;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod status;
pub mod store;
pub mod sync_cmd;
