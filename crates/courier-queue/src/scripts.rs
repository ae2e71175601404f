/// Server-side atomic operations on a device queue.
///
/// Every mutation of the four co-tagged queue keys goes through one of these
/// scripts; there is no client-side read-modify-write anywhere. KEYS are
/// always passed in the order queue, metadata, counter/shard-index as noted
/// per script.

/// KEYS: [queue, metadata, counter, shard_index]
/// ARGV: [envelope_json, guid, wake_channel, now_ms]
/// Returns the assigned queue id.
pub const INSERT: &str = r#"
local qid = redis.call("INCR", KEYS[3])
redis.call("ZADD", KEYS[1], qid, ARGV[1])
redis.call("HSET", KEYS[2], ARGV[2], qid)
redis.call("ZADD", KEYS[4], "NX", tonumber(ARGV[4]), KEYS[1])
redis.call("PUBLISH", ARGV[3], "new")
return qid
"#;

/// KEYS: [queue]
/// ARGV: [limit, after_qid]
/// Returns a flat [member, score, ...] array in ascending queue-id order.
pub const GET_ITEMS: &str = r#"
return redis.call("ZRANGEBYSCORE", KEYS[1], "(" .. ARGV[2], "+inf", "WITHSCORES", "LIMIT", 0, tonumber(ARGV[1]))
"#;

/// KEYS: [queue, metadata, shard_index]
/// ARGV: [guid]
/// Returns the removed envelope, or nil when the guid was not indexed.
pub const REMOVE_BY_GUID: &str = r#"
local qid = redis.call("HGET", KEYS[2], ARGV[1])
if qid then
    local removed = redis.call("ZRANGEBYSCORE", KEYS[1], qid, qid, "LIMIT", 0, 1)
    redis.call("ZREMRANGEBYSCORE", KEYS[1], qid, qid)
    redis.call("HDEL", KEYS[2], ARGV[1])
    if redis.call("ZCARD", KEYS[1]) == 0 then
        redis.call("ZREM", KEYS[3], KEYS[1])
    end
    if removed[1] then
        return removed[1]
    end
end
return false
"#;

/// KEYS: [queue, metadata, shard_index]
/// ARGV: [sender_uuid, client_timestamp, scan_window]
/// Linear scan over the oldest `scan_window` entries. Returns
/// [found, envelope_or_empty, truncated]; `truncated` reports that the queue
/// was longer than the window and the match may have been missed.
pub const REMOVE_BY_SENDER_TIMESTAMP: &str = r#"
local entries = redis.call("ZRANGE", KEYS[1], 0, tonumber(ARGV[3]) - 1)
for _, entry in ipairs(entries) do
    local ok, envelope = pcall(cjson.decode, entry)
    if ok and envelope.source_uuid == ARGV[1] and envelope.client_timestamp == tonumber(ARGV[2]) then
        redis.call("ZREM", KEYS[1], entry)
        redis.call("HDEL", KEYS[2], envelope.guid)
        if redis.call("ZCARD", KEYS[1]) == 0 then
            redis.call("ZREM", KEYS[3], KEYS[1])
        end
        return {1, entry, 0}
    end
end
local truncated = 0
if redis.call("ZCARD", KEYS[1]) > tonumber(ARGV[3]) then
    truncated = 1
end
return {0, "", truncated}
"#;

/// KEYS: [queue, metadata, shard_index]
/// ARGV: [upto_qid, now_ms, events_channel]
/// Returns the drained envelopes (qid <= upto_qid) after deleting them and
/// their metadata entries, then announces the persist on the queue channel.
pub const DRAIN_AND_TRIM: &str = r#"
local drained = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, entry in ipairs(drained) do
    local ok, envelope = pcall(cjson.decode, entry)
    if ok and envelope.guid then
        redis.call("HDEL", KEYS[2], envelope.guid)
    end
end
redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
if redis.call("ZCARD", KEYS[1]) == 0 then
    redis.call("ZREM", KEYS[3], KEYS[1])
else
    redis.call("ZADD", KEYS[3], "XX", tonumber(ARGV[2]), KEYS[1])
end
redis.call("PUBLISH", ARGV[3], "persisted")
return drained
"#;

/// KEYS: [queue, metadata, counter, flag, shard_index]
/// Drops every key of one queue and unindexes it.
pub const CLEAR_QUEUE: &str = r#"
redis.call("DEL", KEYS[1], KEYS[2], KEYS[3], KEYS[4])
redis.call("ZREM", KEYS[5], KEYS[1])
return 1
"#;

/// KEYS: [flag]
/// ARGV: [owner, ttl_secs]
/// Acquires the per-queue persist flag; 1 on success, 0 when another worker
/// already holds it.
pub const ACQUIRE_FLAG: &str = r#"
if redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2]) then
    return 1
end
return 0
"#;

/// KEYS: [key]
/// ARGV: [expected_owner]
/// Deletes the key only when it still holds the caller's value. Used for the
/// persist flag and the shard lease so an expired holder cannot stomp a
/// successor.
pub const RELEASE_IF_OWNED: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
end
return 0
"#;
