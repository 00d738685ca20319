/// Schema for all durable worker state.
pub const SCHEMA: &str = r#"
-- Named cache partitions; seq preserves creation order for lookups across partitions
CREATE TABLE IF NOT EXISTS partitions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by (partition, request identity hash)
CREATE TABLE IF NOT EXISTS entries (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (partition, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(request_key);

-- Mutating requests waiting for connectivity
CREATE TABLE IF NOT EXISTS offline_actions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_actions_created ON offline_actions(created_at, seq);

-- Lifecycle state per cache version
CREATE TABLE IF NOT EXISTS versions (
    version TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
