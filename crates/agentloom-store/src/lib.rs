//! # agentloom-store
//!
//! Durable session memory for agentloom agents.
//!
//! [`SqliteMemory`] implements the workflow crate's
//! [`MemoryStore`](agentloom_workflow::MemoryStore) contract on top of a
//! WAL-mode SQLite database, so session state survives process restarts.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  SqliteMemory (MemoryStore)             │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL, blocking pool) │
//! │  Migrations (versioned, transactional)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ```ignore
//! use agentloom_store::SqliteMemory;
//!
//! let memory = SqliteMemory::open("data/sessions.db").await?;
//! let services = services.with_memory(Arc::new(memory));
//! ```

pub mod db;
pub mod error;
pub mod migration;
pub mod session;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use session::{SessionInfo, SqliteMemory};
