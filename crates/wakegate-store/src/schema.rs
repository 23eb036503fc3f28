/// SQL DDL for the wakegate store.
/// All timestamps are RFC 3339 UTC with millisecond precision and a `Z` suffix.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    wake_schedule TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    mac TEXT NOT NULL UNIQUE,
    site_id TEXT REFERENCES sites(id),
    wake_schedule TEXT,
    protocol_state TEXT,
    current_wake_id TEXT,
    last_wake_at TEXT,
    next_wake_at TEXT,
    last_seen_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wake_cycles (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL REFERENCES devices(id),
    site_id TEXT,
    session_id TEXT,
    protocol_state TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    pending_images INTEGER NOT NULL DEFAULT 0,
    telemetry TEXT NOT NULL DEFAULT '{}',
    image_name TEXT,
    image_size INTEGER,
    image_key TEXT,
    is_overage INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_code INTEGER,
    failure_reason TEXT,
    last_command TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS wake_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wake_id TEXT NOT NULL REFERENCES wake_cycles(id),
    from_state TEXT,
    to_state TEXT NOT NULL,
    reason TEXT,
    at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunk_buffers (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL REFERENCES devices(id),
    wake_id TEXT,
    image_name TEXT NOT NULL,
    total_chunks INTEGER NOT NULL,
    received_count INTEGER NOT NULL DEFAULT 0,
    image_size INTEGER,
    status TEXT NOT NULL DEFAULT 'receiving',
    failure_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    CHECK (received_count <= total_chunks)
);

CREATE TABLE IF NOT EXISTS chunk_parts (
    buffer_id TEXT NOT NULL REFERENCES chunk_buffers(id),
    chunk_index INTEGER NOT NULL,
    bytes BLOB NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (buffer_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    site_id TEXT NOT NULL REFERENCES sites(id),
    local_date TEXT NOT NULL,
    timezone TEXT NOT NULL,
    day_start_utc TEXT NOT NULL,
    day_end_utc TEXT NOT NULL,
    expected_wake_count INTEGER NOT NULL,
    expected_approximate INTEGER NOT NULL DEFAULT 0,
    schedule_fingerprint TEXT NOT NULL,
    completed_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    overage_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'in_progress',
    locked_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (site_id, local_date)
);

CREATE TABLE IF NOT EXISTS session_outcomes (
    wake_id TEXT PRIMARY KEY REFERENCES wake_cycles(id),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    device_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    slot_at TEXT,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    round_index INTEGER NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    site_state TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    PRIMARY KEY (session_id, round_index)
);

CREATE TABLE IF NOT EXISTS image_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL REFERENCES devices(id),
    wake_id TEXT,
    captured_at TEXT NOT NULL,
    score REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS retries (
    id TEXT PRIMARY KEY,
    wake_id TEXT NOT NULL REFERENCES wake_cycles(id),
    device_id TEXT NOT NULL,
    image_name TEXT,
    attempt INTEGER NOT NULL,
    not_before TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commands (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    wake_id TEXT,
    kind TEXT NOT NULL,
    topic TEXT NOT NULL,
    payload TEXT NOT NULL,
    issued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS anomalies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT,
    mac TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_buffers_open
    ON chunk_buffers(device_id, image_name) WHERE status = 'receiving';
CREATE UNIQUE INDEX IF NOT EXISTS idx_outcomes_slot
    ON session_outcomes(session_id, device_id, slot_at) WHERE slot_at IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_retries_pending
    ON retries(wake_id) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_buffers_expiry ON chunk_buffers(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_wakes_device_captured ON wake_cycles(device_id, captured_at);
CREATE INDEX IF NOT EXISTS idx_wakes_state_updated ON wake_cycles(protocol_state, updated_at);
CREATE INDEX IF NOT EXISTS idx_wakes_session ON wake_cycles(session_id);
CREATE INDEX IF NOT EXISTS idx_transitions_wake ON wake_transitions(wake_id);
CREATE INDEX IF NOT EXISTS idx_outcomes_session ON session_outcomes(session_id, device_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, day_end_utc);
CREATE INDEX IF NOT EXISTS idx_scores_device ON image_scores(device_id, captured_at);
CREATE INDEX IF NOT EXISTS idx_retries_device ON retries(device_id, status);
CREATE INDEX IF NOT EXISTS idx_commands_device ON commands(device_id, issued_at);
CREATE INDEX IF NOT EXISTS idx_anomalies_device ON anomalies(device_id, at);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
