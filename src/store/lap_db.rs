//! Best-lap persistence, keyed by track name.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::StoreError;
use crate::geo::LatLon;

/// A persisted reference lap: total time plus the timed position trace used
/// for delta computation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLap {
    pub total: Duration,
    pub points: Vec<StoredLapPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredLapPoint {
    pub pos: LatLon,
    pub elapsed: Duration,
    pub speed_kmh: f64,
}

pub struct LapDb {
    conn: Connection,
}

impl LapDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS best_laps (
                 track       TEXT PRIMARY KEY,
                 lap_time_ms INTEGER NOT NULL,
                 recorded_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS best_lap_points (
                 track      TEXT NOT NULL,
                 idx        INTEGER NOT NULL,
                 lat        REAL NOT NULL,
                 lon        REAL NOT NULL,
                 elapsed_ms INTEGER NOT NULL,
                 speed_kmh  REAL NOT NULL,
                 PRIMARY KEY (track, idx)
             );",
        )?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE best_laps (
                 track TEXT PRIMARY KEY, lap_time_ms INTEGER NOT NULL, recorded_at TEXT NOT NULL);
             CREATE TABLE best_lap_points (
                 track TEXT NOT NULL, idx INTEGER NOT NULL, lat REAL NOT NULL, lon REAL NOT NULL,
                 elapsed_ms INTEGER NOT NULL, speed_kmh REAL NOT NULL, PRIMARY KEY (track, idx));",
        )?;
        Ok(Self { conn })
    }

    pub fn best_lap(&self, track: &str) -> Result<Option<StoredLap>, StoreError> {
        let total_ms: Option<i64> = self
            .conn
            .query_row(
                "SELECT lap_time_ms FROM best_laps WHERE track = ?1",
                params![track],
                |row| row.get(0),
            )
            .optional()?;
        let Some(total_ms) = total_ms else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT lat, lon, elapsed_ms, speed_kmh FROM best_lap_points
             WHERE track = ?1 ORDER BY idx",
        )?;
        let points = stmt
            .query_map(params![track], |row| {
                Ok(StoredLapPoint {
                    pos: LatLon::new(row.get(0)?, row.get(1)?),
                    elapsed: Duration::from_millis(row.get::<_, i64>(2)? as u64),
                    speed_kmh: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StoredLap {
            total: Duration::from_millis(total_ms as u64),
            points,
        }))
    }

    /// Replaces the stored best for `track` unconditionally; callers decide
    /// whether the candidate beats the incumbent.
    pub fn store_best_lap(&mut self, track: &str, lap: &StoredLap) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO best_laps (track, lap_time_ms, recorded_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(track) DO UPDATE SET lap_time_ms = ?2, recorded_at = ?3",
            params![track, lap.total.as_millis() as i64, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM best_lap_points WHERE track = ?1", params![track])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO best_lap_points (track, idx, lat, lon, elapsed_ms, speed_kmh)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (idx, p) in lap.points.iter().enumerate() {
                stmt.execute(params![
                    track,
                    idx as i64,
                    p.pos.lat,
                    p.pos.lon,
                    p.elapsed.as_millis() as i64,
                    p.speed_kmh
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lap(total_s: u64, n: usize) -> StoredLap {
        StoredLap {
            total: Duration::from_secs(total_s),
            points: (0..n)
                .map(|i| StoredLapPoint {
                    pos: LatLon::new(50.0 + i as f64 * 1e-4, 8.0),
                    elapsed: Duration::from_secs(i as u64),
                    speed_kmh: 100.0,
                })
                .collect(),
        }
    }

    #[test]
    fn store_and_fetch_roundtrip() {
        let mut db = LapDb::open_in_memory().unwrap();
        assert!(db.best_lap("spa").unwrap().is_none());

        let stored = lap(108, 5);
        db.store_best_lap("spa", &stored).unwrap();
        let got = db.best_lap("spa").unwrap().unwrap();
        assert_eq!(got, stored);
    }

    #[test]
    fn replacement_overwrites_points() {
        let mut db = LapDb::open_in_memory().unwrap();
        db.store_best_lap("spa", &lap(110, 8)).unwrap();
        db.store_best_lap("spa", &lap(106, 3)).unwrap();
        let got = db.best_lap("spa").unwrap().unwrap();
        assert_eq!(got.total, Duration::from_secs(106));
        assert_eq!(got.points.len(), 3);
    }

    #[test]
    fn tracks_are_isolated() {
        let mut db = LapDb::open_in_memory().unwrap();
        db.store_best_lap("spa", &lap(108, 2)).unwrap();
        db.store_best_lap("monza", &lap(95, 2)).unwrap();
        assert_eq!(db.best_lap("spa").unwrap().unwrap().total, Duration::from_secs(108));
        assert_eq!(db.best_lap("monza").unwrap().unwrap().total, Duration::from_secs(95));
    }

    #[test]
    fn utf8_track_keys_work() {
        let mut db = LapDb::open_in_memory().unwrap();
        db.store_best_lap("Nürburgring", &lap(500, 1)).unwrap();
        assert!(db.best_lap("Nürburgring").unwrap().is_some());
    }
}
