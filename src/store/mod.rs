//! Persistence layer — libSQL-backed storage for targets, policies,
//! attempts, and inbound signals.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, IdentityRow};
