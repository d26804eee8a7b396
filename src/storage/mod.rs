//! C3 — Schema Manager, plus the relational access layer shared by C6/C7.
//!
//! Grounded on the reference daemon's `storage/sqlite.rs` `SqliteStorage`
//! (pool-based struct, parameterized queries, a `QueryMetrics` side-channel
//! wrapping execution) adapted from SQLite to Postgres since schema-per-project
//! plus `search_path` binding has no SQLite analog. Vector similarity uses the
//! `pgvector` crate's `Vector` type and an ivfflat cosine index (see
//! `migrations/0001_schema.sql`).

pub mod postgres;

pub use postgres::{PostgresStorage, StorageError};
