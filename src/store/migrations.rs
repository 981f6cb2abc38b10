//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
///
/// The partial unique index on `attempts` is the engine's one hard
/// invariant: a second active attempt for a target cannot be written, no
/// matter how racy the callers are.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                organization TEXT NOT NULL,
                role TEXT NOT NULL,
                display_organization TEXT NOT NULL,
                display_role TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'discovered',
                priority_score REAL NOT NULL DEFAULT 0,
                contact_email TEXT,
                first_seen_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (organization, role)
            );
            CREATE INDEX IF NOT EXISTS idx_targets_state ON targets(state);
            CREATE INDEX IF NOT EXISTS idx_targets_org ON targets(organization);

            CREATE TABLE IF NOT EXISTS target_sources (
                target_id TEXT NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                source_id TEXT NOT NULL,
                reported_at TEXT NOT NULL,
                PRIMARY KEY (target_id, source_id)
            );

            CREATE TABLE IF NOT EXISTS company_policies (
                organization TEXT PRIMARY KEY,
                blacklisted INTEGER NOT NULL DEFAULT 0,
                blacklist_reason TEXT,
                cooldown_until TEXT,
                cooldown_cause TEXT,
                max_per_day INTEGER NOT NULL DEFAULT 2,
                max_per_week INTEGER NOT NULL DEFAULT 5,
                max_lifetime INTEGER NOT NULL DEFAULT 10,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                channel TEXT NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'pending',
                recipient TEXT,
                subject TEXT,
                content_ref TEXT NOT NULL,
                queued_at TEXT NOT NULL,
                sent_at TEXT,
                resolved_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_active
                ON attempts(target_id) WHERE outcome IN ('pending', 'sent');
            CREATE INDEX IF NOT EXISTS idx_attempts_target ON attempts(target_id);
            CREATE INDEX IF NOT EXISTS idx_attempts_outcome ON attempts(outcome);
        "#,
    },
    Migration {
        version: 2,
        name: "inbound_signals",
        sql: r#"
            CREATE TABLE IF NOT EXISTS inbound_signals (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                received_at TEXT NOT NULL,
                header_names TEXT NOT NULL DEFAULT '[]',
                classification TEXT NOT NULL,
                confidence TEXT NOT NULL,
                matched_rule TEXT,
                extracted_address TEXT,
                attempt_id TEXT REFERENCES attempts(id),
                target_id TEXT REFERENCES targets(id),
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_target ON inbound_signals(target_id);
            CREATE INDEX IF NOT EXISTS idx_signals_classification
                ON inbound_signals(classification);
        "#,
    },
    Migration {
        version: 3,
        name: "correlation_indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_attempts_recipient ON attempts(recipient);
            CREATE INDEX IF NOT EXISTS idx_attempts_queued ON attempts(queued_at);
            CREATE INDEX IF NOT EXISTS idx_signals_attempt ON inbound_signals(attempt_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
pub(crate) async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "targets",
            "target_sources",
            "company_policies",
            "attempts",
            "inbound_signals",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();

        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "inbound_signals");

        let row3 = rows.next().await.unwrap().unwrap();
        let v3: i64 = row3.get(0).unwrap();
        let n3: String = row3.get(1).unwrap();
        assert_eq!(v3, 3);
        assert_eq!(n3, "correlation_indexes");
    }

    #[tokio::test]
    async fn duplicate_active_attempt_rejected_by_index() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO targets (id, organization, role, display_organization, display_role, first_seen_at, created_at, updated_at)
             VALUES ('t1', 'acme', 'engineer', 'Acme', 'Engineer', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO attempts (id, target_id, channel, outcome, content_ref, queued_at)
             VALUES ('a1', 't1', 'email', 'pending', 'ref', '2026-01-02T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        // Second active attempt for the same target must violate the index
        let dup = conn
            .execute(
                "INSERT INTO attempts (id, target_id, channel, outcome, content_ref, queued_at)
                 VALUES ('a2', 't1', 'email', 'sent', 'ref', '2026-01-02T00:00:01Z')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // Resolving the first frees the slot
        conn.execute("UPDATE attempts SET outcome = 'bounced' WHERE id = 'a1'", ())
            .await
            .unwrap();
        conn.execute(
            "INSERT INTO attempts (id, target_id, channel, outcome, content_ref, queued_at)
             VALUES ('a3', 't1', 'email', 'pending', 'ref', '2026-01-02T00:00:02Z')",
            (),
        )
        .await
        .unwrap();
    }
}
