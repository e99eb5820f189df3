#![deny(missing_docs)]

//! Core library for the reelindex ingestion service.

/// HTTP routing and REST handlers.
pub mod api;
/// At-least-once job broker and its job-state bookkeeping.
pub mod broker;
/// Environment-driven configuration management.
pub mod config;
/// Embedding engine, field selection, and provider adapters.
pub mod embedding;
/// Job model, record normalization, pipeline driver, and worker pool.
pub mod ingest;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion metrics helpers.
pub mod metrics;
/// Search store integration (Elasticsearch and in-memory).
pub mod search;
/// Status channel and broker-backed status store.
pub mod status;
