//! # SQLite Schema for the Mutation Queue
//!
//! The queue treats SQLite as an ordered key-value store. Every data table is
//! a `WITHOUT ROWID` table, i.e. a B-tree clustered on its composite primary
//! key, and the queue only issues point reads, range scans, inserts and
//! deletes against those keys.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  mutation_queues             mutations                               │
//! │  ┌─────────────────────┐     ┌──────────────────────┐                │
//! │  │ user_id (PK)        │     │ user_id    ┐ PK      │                │
//! │  │ last_acknowledged   │     │ batch_id   ┘         │◄───┐           │
//! │  │ highest_batch_id    │     │ local_write_time_ms  │    │           │
//! │  │ last_stream_token   │     │ codec, checksum      │    │           │
//! │  └─────────────────────┘     │ data BLOB            │    │           │
//! │                              └──────────────────────┘    │           │
//! │  document_mutations                                      │           │
//! │  ┌──────────────────────────────┐                        │           │
//! │  │ user_id  ┐                   │                        │           │
//! │  │ path     ├ PK                │  one row per (key, batch)          │
//! │  │ batch_id ┘ ──────────────────┼────────────────────────┘           │
//! │  └──────────────────────────────┘                                    │
//! │                                                                      │
//! │  queue_metadata (key PK, value): schema version                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `document_mutations` is the secondary index behind key and query
//! lookups. It is written in the same transaction as `mutations` and is never
//! allowed to drift from it.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. No migrations exist yet: a mismatch is an error.
pub const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Key-value table for schema-level metadata.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// One row per user queue.
///
/// # Columns
///
/// - `last_acknowledged_batch_id`: 0 until the first acknowledgment
/// - `highest_batch_id`: highest id ever handed out; the next batch gets
///   `highest_batch_id + 1` even if every batch has since been removed
/// - `last_stream_token`: opaque backend cursor, empty blob initially
const CREATE_MUTATION_QUEUES: &str = r#"
CREATE TABLE IF NOT EXISTS mutation_queues (
    user_id                    TEXT PRIMARY KEY,
    last_acknowledged_batch_id INTEGER NOT NULL,
    highest_batch_id           INTEGER NOT NULL,
    last_stream_token          BLOB NOT NULL
) WITHOUT ROWID
"#;

/// Primary batch store, keyed by (user, batch id).
///
/// # Columns
///
/// - `codec`: 0 = raw JSON, 1 = zstd-compressed JSON
/// - `checksum`: XXH3-64 of `data`, little-endian
/// - `data`: encoded mutation list
const CREATE_MUTATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS mutations (
    user_id             TEXT NOT NULL,
    batch_id            INTEGER NOT NULL,
    local_write_time_ms INTEGER NOT NULL,
    codec               INTEGER NOT NULL,
    checksum            BLOB NOT NULL,
    data                BLOB NOT NULL,
    PRIMARY KEY (user_id, batch_id)
) WITHOUT ROWID
"#;

/// Secondary index: (user, document path, batch id).
///
/// Paths are `/`-joined segments. All direct and nested children of a
/// collection `P` sort inside the half-open range `[P/, P0)`.
const CREATE_DOCUMENT_MUTATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS document_mutations (
    user_id  TEXT NOT NULL,
    path     TEXT NOT NULL,
    batch_id INTEGER NOT NULL,
    PRIMARY KEY (user_id, path, batch_id)
) WITHOUT ROWID
"#;

// =============================================================================
// Initialization
// =============================================================================

/// Applies pragmas, creates all tables and verifies the schema version.
///
/// Safe to call on an already-initialized database.
pub(crate) fn initialize(conn: &Connection, config: &PersistenceConfig) -> Result<()> {
    conn.busy_timeout(config.busy_timeout)?;

    // WAL keeps commits durable across crashes. One Persistence serializes
    // its transactions on a single connection, so concurrent reads during a
    // write only happen across separate handles on the same file.
    // In-memory databases report "memory" and ignore this.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch(&format!(
        "PRAGMA synchronous = {}",
        config.synchronous.pragma_value()
    ))?;

    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_MUTATION_QUEUES)?;
    conn.execute_batch(CREATE_MUTATIONS)?;
    conn.execute_batch(CREATE_DOCUMENT_MUTATIONS)?;

    verify_or_set_version(conn)?;
    debug!(version = SCHEMA_VERSION, "schema ready");
    Ok(())
}

/// Verifies the stored schema version, or records it on a fresh database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM queue_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO queue_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
            info!(version = SCHEMA_VERSION, "initialized new mutation queue database");
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
