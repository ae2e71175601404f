use crate::models::MessageRow;
use crate::Database;
use anyhow::Result;
use rusqlite::Connection;

const ROW_COLUMNS: &str = "account_uuid, device_id, server_ts, guid, kind, client_ts, \
                           source_uuid, source_device, content, expires_at";

impl Database {
    /// Stores one persister page in a single transaction. INSERT OR IGNORE
    /// keyed on (account, device, server_ts, guid) makes a crashed run's
    /// retry a no-op for rows that already landed.
    pub fn store_messages(&self, rows: &[MessageRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        self.with_conn_mut(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = insert_rows(conn, rows);
            match result {
                Ok(stored) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(stored)
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK").ok();
                    Err(e)
                }
            }
        })
    }

    /// Oldest-first page for one device queue.
    pub fn load_for_device(&self, account: &str, device_id: u8, limit: usize) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM messages
                 WHERE account_uuid = ?1 AND device_id = ?2
                 ORDER BY server_ts ASC, guid ASC
                 LIMIT ?3"
            ))?;

            let rows = stmt
                .query_map(
                    rusqlite::params![account, device_id, limit as i64],
                    row_from_sql,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Removes one message by GUID, returning it when it existed.
    pub fn delete_by_guid(&self, guid: &str) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let row = query_by_guid(conn, guid)?;
            if row.is_some() {
                conn.execute("DELETE FROM messages WHERE guid = ?1", [guid])?;
            }
            Ok(row)
        })
    }

    /// Removes one message matched by sender identity and client timestamp,
    /// the legacy acknowledgement path.
    pub fn delete_by_sender_timestamp(
        &self,
        account: &str,
        device_id: u8,
        source_uuid: &str,
        client_ts: u64,
    ) -> Result<Option<MessageRow>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM messages
                 WHERE account_uuid = ?1 AND device_id = ?2
                   AND source_uuid = ?3 AND client_ts = ?4
                 ORDER BY server_ts ASC
                 LIMIT 1"
            ))?;
            let row = stmt
                .query_row(
                    rusqlite::params![account, device_id, source_uuid, client_ts],
                    row_from_sql,
                )
                .optional()?;

            if let Some(found) = &row {
                conn.execute("DELETE FROM messages WHERE guid = ?1", [&found.guid])?;
            }
            Ok(row)
        })
    }

    pub fn delete_device(&self, account: &str, device_id: u8) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM messages WHERE account_uuid = ?1 AND device_id = ?2",
                rusqlite::params![account, device_id],
            )?;
            Ok(n)
        })
    }

    pub fn delete_account(&self, account: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM messages WHERE account_uuid = ?1", [account])?;
            Ok(n)
        })
    }

    /// TTL sweep: drops rows whose retention has lapsed. Run periodically
    /// from a background loop.
    pub fn delete_expired(&self, now_ms: u64) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM messages WHERE expires_at < ?1",
                [now_ms],
            )?;
            Ok(n)
        })
    }
}

fn insert_rows(conn: &Connection, rows: &[MessageRow]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO messages
            (account_uuid, device_id, server_ts, guid, kind, client_ts,
             source_uuid, source_device, content, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;

    let mut stored = 0;
    for row in rows {
        stored += stmt.execute(rusqlite::params![
            row.account_uuid,
            row.device_id,
            row.server_ts,
            row.guid,
            row.kind,
            row.client_ts,
            row.source_uuid,
            row.source_device,
            row.content,
            row.expires_at,
        ])?;
    }
    Ok(stored)
}

fn query_by_guid(conn: &Connection, guid: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROW_COLUMNS} FROM messages WHERE guid = ?1"
    ))?;
    let row = stmt.query_row([guid], row_from_sql).optional()?;
    Ok(row)
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        account_uuid: row.get(0)?,
        device_id: row.get(1)?,
        server_ts: row.get(2)?,
        guid: row.get(3)?,
        kind: row.get(4)?,
        client_ts: row.get(5)?,
        source_uuid: row.get(6)?,
        source_device: row.get(7)?,
        content: row.get(8)?,
        expires_at: row.get(9)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
