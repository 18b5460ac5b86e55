//! # Storage Module
//!
//! Durable key-value persistence for the triad matrix.
//!
//! ```text
//! db.rs: sled-backed MatrixDB: triad records + state metadata
//! ```
//!
//! ## Design Decisions
//!
//! 1. **One namespace, prefixed keys.** Triads live under `triad:<id>` and
//!    the matrix parameters under `matrix:state_metadata`, in the same tree.
//!    Reload is a single prefix scan.
//!
//! 2. **JSON on disk.** Triad payloads are arbitrary JSON values, which
//!    need a self-describing format. The same encoding is used on the wire,
//!    so a record read from disk can be gossiped without re-shaping.

pub mod db;

pub use db::{DbError, DbResult, MatrixDB, StateMetadata};
