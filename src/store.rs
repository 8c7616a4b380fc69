use std::path::Path;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::window::ClassificationWindow;

const SCHEMA_VERSION: i32 = 3;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Failed creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A play that has already been handled for the current account.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrobbleRow {
    pub id: i64,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub scrobbled_at: DateTime<Utc>,
    pub array_position: i64,
    pub max_array_position: i64,
    pub is_first_time_scrobble: bool,
    /// Timestamp sent to the sink; `None` for plays recorded without dispatch.
    pub played_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewScrobbleRow {
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub scrobbled_at: DateTime<Utc>,
    pub array_position: i64,
    pub is_first_time_scrobble: bool,
    pub played_at: Option<i64>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.migrate()
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if version > SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }
        if version < 3 {
            self.migrate_v3()?;
        }
        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scrobbles (
                id              INTEGER PRIMARY KEY,
                track_name      TEXT,
                artist_name     TEXT,
                album_name      TEXT,
                scrobbled_at    TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                array_position  INTEGER
            );
            ",
        )?;
        Ok(())
    }

    /// V2: positional freshness tracking. Older databases may already carry
    /// the columns without a recorded version.
    fn migrate_v2(&self) -> Result<()> {
        if !self.has_column("max_array_position")? {
            self.conn
                .execute("ALTER TABLE scrobbles ADD COLUMN max_array_position INTEGER", [])?;
        }
        if !self.has_column("is_first_time_scrobble")? {
            self.conn.execute(
                "ALTER TABLE scrobbles ADD COLUMN is_first_time_scrobble BOOLEAN DEFAULT FALSE",
                [],
            )?;
        }
        self.conn.execute(
            "UPDATE scrobbles SET max_array_position = array_position
             WHERE max_array_position IS NULL",
            [],
        )?;
        Ok(())
    }

    /// V3: the timestamp handed to the sink, plus an identity index.
    fn migrate_v3(&self) -> Result<()> {
        if !self.has_column("played_at")? {
            self.conn
                .execute("ALTER TABLE scrobbles ADD COLUMN played_at INTEGER", [])?;
        }
        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_scrobbles_identity
                ON scrobbles(track_name, artist_name, album_name);",
        )?;
        Ok(())
    }

    fn has_column(&self, column: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare("SELECT name FROM pragma_table_info('scrobbles')")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|name| name == column))
    }

    pub fn rows_in_window(&self, window: &ClassificationWindow) -> Result<Vec<ScrobbleRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, track_name, artist_name, album_name, scrobbled_at,
                    array_position, max_array_position, is_first_time_scrobble, played_at
             FROM scrobbles
             WHERE julianday(scrobbled_at) >= julianday(?1)
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![format_time(window.start)], scrobble_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert(&self, row: &NewScrobbleRow) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO scrobbles (
                track_name, artist_name, album_name, scrobbled_at,
                array_position, max_array_position, is_first_time_scrobble, played_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)",
            params![
                row.track_name,
                row.artist_name,
                row.album_name,
                format_time(row.scrobbled_at),
                row.array_position,
                row.is_first_time_scrobble,
                row.played_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Raises `max_array_position`; never lowers it. Returns whether the row changed.
    pub fn bump_max_position(&self, id: i64, position: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE scrobbles SET max_array_position = ?2
             WHERE id = ?1 AND (max_array_position IS NULL OR max_array_position < ?2)",
            params![id, position],
        )?;
        Ok(changed > 0)
    }

    /// Applies several bumps in one transaction.
    pub fn bump_max_positions(&self, bumps: &[(i64, i64)]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut changed = 0;
        for (id, position) in bumps {
            if self.bump_max_position(*id, *position)? {
                changed += 1;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn prune_older_than(&self, window: &ClassificationWindow) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM scrobbles WHERE julianday(scrobbled_at) < julianday(?1)",
            params![format_time(window.start)],
        )?;
        Ok(removed)
    }

    /// Submission time of the most recent row, i.e. when the last run wrote.
    pub fn last_scrobbled_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.conn.query_row(
            "SELECT scrobbled_at FROM scrobbles
             ORDER BY julianday(scrobbled_at) DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
        Ok(raw.as_deref().and_then(parse_time))
    }

    pub fn latest_played_at(&self) -> Result<Option<i64>> {
        let latest = self
            .conn
            .query_row("SELECT MAX(played_at) FROM scrobbles", [], |row| row.get(0))?;
        Ok(latest)
    }

    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM scrobbles", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn scrobble_from_row(row: &Row<'_>) -> rusqlite::Result<ScrobbleRow> {
    let raw_time: String = row.get(4)?;
    let scrobbled_at = parse_time(&raw_time).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("invalid scrobbled_at value {raw_time:?}").into(),
        )
    })?;
    let array_position: i64 = row.get::<_, Option<i64>>(5)?.unwrap_or(0);
    Ok(ScrobbleRow {
        id: row.get(0)?,
        track_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        artist_name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        album_name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        scrobbled_at,
        array_position,
        max_array_position: row.get::<_, Option<i64>>(6)?.unwrap_or(array_position),
        is_first_time_scrobble: row.get::<_, Option<bool>>(7)?.unwrap_or(false),
        played_at: row.get(8)?,
    })
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339 and SQLite's `CURRENT_TIMESTAMP` layout.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn new_row(track: &str, position: i64, scrobbled_at: DateTime<Utc>) -> NewScrobbleRow {
        NewScrobbleRow {
            track_name: track.to_string(),
            artist_name: "Wilco".to_string(),
            album_name: "Yankee Hotel Foxtrot".to_string(),
            scrobbled_at,
            array_position: position,
            is_first_time_scrobble: false,
            played_at: Some(scrobbled_at.timestamp() - 30),
        }
    }

    fn today() -> ClassificationWindow {
        ClassificationWindow {
            start: at("2026-10-18T00:00:00Z"),
        }
    }

    #[test]
    fn inserted_rows_start_at_their_position() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert(&new_row("Jesus, Etc.", 2, at("2026-10-18T10:00:00Z")))
            .unwrap();
        let rows = db.rows_in_window(&today()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].array_position, 2);
        assert_eq!(rows[0].max_array_position, 2);
        assert_eq!(rows[0].scrobbled_at, at("2026-10-18T10:00:00Z"));
    }

    #[test]
    fn rows_before_the_window_are_invisible() {
        let db = Database::open_in_memory().unwrap();
        db.insert(&new_row("Kamera", 0, at("2026-10-17T23:59:59Z")))
            .unwrap();
        let kept = db
            .insert(&new_row("Kamera", 3, at("2026-10-18T00:00:00Z")))
            .unwrap();
        let rows = db.rows_in_window(&today()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, kept);
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn bump_only_raises() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert(&new_row("Radio Cure", 4, at("2026-10-18T08:00:00Z")))
            .unwrap();
        assert!(!db.bump_max_position(id, 2).unwrap());
        assert!(db.bump_max_position(id, 6).unwrap());
        assert_eq!(db.bump_max_positions(&[(id, 5), (id, 9)]).unwrap(), 1);
        let row = &db.rows_in_window(&today()).unwrap()[0];
        assert_eq!(row.array_position, 4);
        assert_eq!(row.max_array_position, 9);
    }

    #[test]
    fn prune_removes_rows_outside_window() {
        let db = Database::open_in_memory().unwrap();
        db.insert(&new_row("Old", 0, at("2026-10-17T12:00:00Z")))
            .unwrap();
        db.insert(&new_row("New", 0, at("2026-10-18T12:00:00Z")))
            .unwrap();
        assert_eq!(db.prune_older_than(&today()).unwrap(), 1);
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn run_statistics() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.last_scrobbled_at().unwrap(), None);
        assert_eq!(db.latest_played_at().unwrap(), None);
        let first = at("2026-10-18T08:00:00Z");
        let second = first + Duration::minutes(20);
        db.insert(&new_row("A", 1, first)).unwrap();
        db.insert(&new_row("B", 0, second)).unwrap();
        let mut excluded = new_row("C", 2, first);
        excluded.played_at = None;
        db.insert(&excluded).unwrap();
        assert_eq!(db.last_scrobbled_at().unwrap(), Some(second));
        assert_eq!(db.latest_played_at().unwrap(), Some(second.timestamp() - 30));
    }

    #[test]
    fn upgrades_legacy_layout() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE scrobbles (
                id INTEGER PRIMARY KEY,
                track_name TEXT,
                artist_name TEXT,
                album_name TEXT,
                scrobbled_at TEXT DEFAULT CURRENT_TIMESTAMP,
                array_position INTEGER
            );
            INSERT INTO scrobbles (track_name, artist_name, album_name, scrobbled_at, array_position)
            VALUES ('Ashes of American Flags', 'Wilco', 'Yankee Hotel Foxtrot', '2026-10-18 07:00:00', 5);",
        )
        .unwrap();
        let db = Database { conn };
        db.init().unwrap();
        let rows = db.rows_in_window(&today()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].max_array_position, 5);
        assert_eq!(rows[0].scrobbled_at, at("2026-10-18T07:00:00Z"));
        assert!(!rows[0].is_first_time_scrobble);
        assert_eq!(rows[0].played_at, None);
    }

    #[test]
    fn rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let db = Database { conn };
        assert!(matches!(db.init(), Err(StoreError::Migration(_))));
    }
}
