//! chimera library entrypoint.
//!
//! Modules:
//! - `app`: startup, configuration
//! - `server`: Unix socket listener, request routing, handlers
//! - `proto`: line protocol parsing and response forms
//! - `journal`: journalctl subprocess reader
//! - `ingest`: incremental ingest pipeline
//! - `db`: analytic store schema and queries
//! - `models`: typed records used across layers
//! - `util`: logging setup

pub mod app;
pub mod db;
pub mod error;
pub mod ingest;
pub mod journal;
pub mod models;
pub mod proto;
pub mod server;
pub mod util;
