use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Current schema version. Increment this and add a new migration function
/// to the `MIGRATIONS` array when the schema changes.
const CURRENT_VERSION: u32 = 2;

/// Each migration is a function that takes a connection and applies changes.
/// Migrations are applied sequentially starting from the current version + 1.
type MigrationFn = fn(&Connection) -> Result<()>;

/// Ordered list of migrations. Index 0 = version 1, index 1 = version 2, etc.
const MIGRATIONS: &[MigrationFn] = &[migrate_v1, migrate_v2];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current = get_current_version(conn)?;
    info!("message store schema version: {} (latest: {})", current, CURRENT_VERSION);

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    // Each migration + version bump is wrapped in a transaction.
    // BEGIN IMMEDIATE acquires a write lock immediately, preventing concurrent
    // writers from interleaving. On error, the entire migration is rolled back.
    for version in (current + 1)..=CURRENT_VERSION {
        let idx = (version - 1) as usize;
        info!("applying migration v{}", version);

        conn.execute_batch("BEGIN IMMEDIATE")?;
        match MIGRATIONS[idx](conn) {
            Ok(()) => {
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
                conn.execute_batch("COMMIT")?;
                info!("migration v{} applied successfully", version);
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK").ok();
                return Err(anyhow::anyhow!("migration v{} failed: {}", version, e));
            }
        }
    }

    info!("message store migrations complete (now at v{})", CURRENT_VERSION);
    Ok(())
}

fn get_current_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Version 1: the messages table. Primary key mirrors the read path:
/// partition by account, order by (device, server timestamp, guid).
/// INSERT OR IGNORE against this key is how the persister stays idempotent
/// across crashes and retries.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            account_uuid   TEXT    NOT NULL,
            device_id      INTEGER NOT NULL,
            server_ts      INTEGER NOT NULL,
            guid           TEXT    NOT NULL UNIQUE,
            kind           INTEGER NOT NULL,
            client_ts      INTEGER NOT NULL,
            source_uuid    TEXT,
            source_device  INTEGER,
            content        BLOB,
            expires_at     INTEGER NOT NULL,
            PRIMARY KEY (account_uuid, device_id, server_ts, guid)
        );
        ",
    )?;
    Ok(())
}

/// Version 2: secondary indexes — by guid for ACK deletes, by expiry for
/// the TTL sweep.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_messages_guid
            ON messages(guid);

        CREATE INDEX IF NOT EXISTS idx_messages_expiry
            ON messages(expires_at);
        ",
    )?;
    Ok(())
}
