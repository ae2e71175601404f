/// Database row types — these map directly to SQLite rows.
/// Distinct from the courier-types wire entities to keep the DB layer
/// independent; the queue crate converts in both directions.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub account_uuid: String,
    pub device_id: u8,
    pub server_ts: u64,
    pub guid: String,
    pub kind: i64,
    pub client_ts: u64,
    pub source_uuid: Option<String>,
    pub source_device: Option<u8>,
    pub content: Option<Vec<u8>>,
    pub expires_at: u64,
}
