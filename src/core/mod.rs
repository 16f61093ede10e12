// src/core/mod.rs

// The `core` module holds everything the worker does independently of how it
// is launched: the data model, the scanner adapters, reconciliation and
// storage.

/// Data structures shared by every stage: targets, findings, vulnerabilities.
pub mod models;

/// Error types for resolution, scanning and storage.
pub mod error;

/// Static title/severity/description metadata per scanner family.
pub mod knowledge_base;

/// SQLite connection and schema.
pub mod db;

/// Organization to target resolution.
pub mod resolver;

/// External tool adapters and the subprocess runner they share.
pub mod scanner;

/// Merges fresh findings with stored history.
pub mod reconciler;

/// Durable vulnerability records.
pub mod store;

/// Drives a run over every target and scanner.
pub mod orchestrator;

/// Manual check that every outbound path honors the proxy.
pub mod proxy_verifier;
