use rusqlite_migration::{M, Migrations};

pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE sync_state (
            site_id               TEXT PRIMARY KEY,
            last_attempt_at       TEXT,
            last_success_at       TEXT,
            last_outcome          TEXT,
            last_error            TEXT,
            last_error_kind       TEXT,
            consecutive_failures  INTEGER NOT NULL DEFAULT 0,
            last_marker           TEXT,
            bytes_transferred     INTEGER,
            files_changed         INTEGER,
            duration_ms           INTEGER
        );",
    )])
}
