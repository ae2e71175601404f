use courier_db::models::MessageRow;
use courier_db::Database;
use uuid::Uuid;

fn open_store(dir: &tempfile::TempDir) -> Database {
    Database::open(&dir.path().join("messages.db")).unwrap()
}

fn row(account: &str, device_id: u8, server_ts: u64, guid: &str) -> MessageRow {
    MessageRow {
        account_uuid: account.to_string(),
        device_id,
        server_ts,
        guid: guid.to_string(),
        kind: 1,
        client_ts: server_ts - 5,
        source_uuid: Some(Uuid::new_v4().to_string()),
        source_device: Some(1),
        content: Some(vec![0xAB; 16]),
        expires_at: server_ts + 7 * 24 * 3600 * 1000,
    }
}

#[test]
fn store_is_idempotent_per_guid() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();
    let guid = Uuid::new_v4().to_string();

    let rows = vec![row(&account, 1, 1_000, &guid)];
    assert_eq!(db.store_messages(&rows).unwrap(), 1);
    // A persister retry writes the same page again; nothing new lands.
    assert_eq!(db.store_messages(&rows).unwrap(), 0);

    let loaded = db.load_for_device(&account, 1, 100).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].guid, guid);
}

#[test]
fn load_orders_by_server_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();

    let mut rows = Vec::new();
    for ts in [300u64, 100, 200] {
        rows.push(row(&account, 1, ts, &Uuid::new_v4().to_string()));
    }
    db.store_messages(&rows).unwrap();

    let loaded = db.load_for_device(&account, 1, 100).unwrap();
    let timestamps: Vec<u64> = loaded.iter().map(|r| r.server_ts).collect();
    assert_eq!(timestamps, vec![100, 200, 300]);
}

#[test]
fn load_is_scoped_to_one_device() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();

    db.store_messages(&[
        row(&account, 1, 100, &Uuid::new_v4().to_string()),
        row(&account, 2, 100, &Uuid::new_v4().to_string()),
    ])
    .unwrap();

    assert_eq!(db.load_for_device(&account, 1, 100).unwrap().len(), 1);
    assert_eq!(db.load_for_device(&account, 2, 100).unwrap().len(), 1);
    assert_eq!(db.load_for_device(&account, 3, 100).unwrap().len(), 0);
}

#[test]
fn delete_by_guid_returns_row_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();
    let guid = Uuid::new_v4().to_string();

    db.store_messages(&[row(&account, 1, 100, &guid)]).unwrap();

    let removed = db.delete_by_guid(&guid).unwrap();
    assert!(removed.is_some());
    assert_eq!(removed.unwrap().guid, guid);

    // Second acknowledgement of the same guid finds nothing.
    assert!(db.delete_by_guid(&guid).unwrap().is_none());
    assert!(db.load_for_device(&account, 1, 100).unwrap().is_empty());
}

#[test]
fn delete_by_sender_timestamp_matches_source() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();
    let sender = Uuid::new_v4().to_string();

    let mut target = row(&account, 1, 100, &Uuid::new_v4().to_string());
    target.source_uuid = Some(sender.clone());
    target.client_ts = 95;
    let other = row(&account, 1, 200, &Uuid::new_v4().to_string());

    db.store_messages(&[target.clone(), other]).unwrap();

    let removed = db
        .delete_by_sender_timestamp(&account, 1, &sender, 95)
        .unwrap();
    assert_eq!(removed.unwrap().guid, target.guid);

    // Wrong timestamp is a no-op.
    assert!(db
        .delete_by_sender_timestamp(&account, 1, &sender, 96)
        .unwrap()
        .is_none());
    assert_eq!(db.load_for_device(&account, 1, 100).unwrap().len(), 1);
}

#[test]
fn expired_rows_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();

    let mut fresh = row(&account, 1, 2_000, &Uuid::new_v4().to_string());
    fresh.expires_at = 10_000;
    let mut stale = row(&account, 1, 1_000, &Uuid::new_v4().to_string());
    stale.expires_at = 4_000;

    db.store_messages(&[fresh.clone(), stale]).unwrap();

    assert_eq!(db.delete_expired(5_000).unwrap(), 1);
    let remaining = db.load_for_device(&account, 1, 100).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].guid, fresh.guid);
}

#[test]
fn clear_account_and_device() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_store(&dir);
    let account = Uuid::new_v4().to_string();

    db.store_messages(&[
        row(&account, 1, 100, &Uuid::new_v4().to_string()),
        row(&account, 1, 200, &Uuid::new_v4().to_string()),
        row(&account, 2, 100, &Uuid::new_v4().to_string()),
    ])
    .unwrap();

    assert_eq!(db.delete_device(&account, 1).unwrap(), 2);
    assert_eq!(db.load_for_device(&account, 2, 100).unwrap().len(), 1);

    assert_eq!(db.delete_account(&account).unwrap(), 1);
    assert!(db.load_for_device(&account, 2, 100).unwrap().is_empty());
}
