//! Pit waypoint persistence: one entry/exit line pair per track.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use super::StoreError;
use crate::config::PitMode;
use crate::engines::pit::PitWaypoint;
use crate::geo::{LatLon, Segment};

pub struct PitDb {
    conn: Connection,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS pit_waypoints (
    track           TEXT PRIMARY KEY,
    mode            TEXT NOT NULL,
    entry_a_lat     REAL NOT NULL, entry_a_lon REAL NOT NULL,
    entry_b_lat     REAL NOT NULL, entry_b_lon REAL NOT NULL,
    exit_a_lat      REAL NOT NULL, exit_a_lon REAL NOT NULL,
    exit_b_lat      REAL NOT NULL, exit_b_lon REAL NOT NULL,
    speed_limit_kmh REAL NOT NULL,
    min_stop_ms     INTEGER NOT NULL
);";

fn mode_to_str(mode: PitMode) -> &'static str {
    match mode {
        PitMode::EntranceToExit => "entrance_to_exit",
        PitMode::StationaryOnly => "stationary_only",
    }
}

fn mode_from_str(s: &str) -> PitMode {
    match s {
        "stationary_only" => PitMode::StationaryOnly,
        _ => PitMode::EntranceToExit,
    }
}

impl PitDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn load(&self, track: &str) -> Result<Option<PitWaypoint>, StoreError> {
        self.conn
            .query_row(
                "SELECT mode, entry_a_lat, entry_a_lon, entry_b_lat, entry_b_lon,
                        exit_a_lat, exit_a_lon, exit_b_lat, exit_b_lon,
                        speed_limit_kmh, min_stop_ms
                 FROM pit_waypoints WHERE track = ?1",
                params![track],
                |row| {
                    Ok(PitWaypoint {
                        track_name: track.to_string(),
                        mode: mode_from_str(&row.get::<_, String>(0)?),
                        entry_line: Segment::new(
                            LatLon::new(row.get(1)?, row.get(2)?),
                            LatLon::new(row.get(3)?, row.get(4)?),
                        ),
                        exit_line: Segment::new(
                            LatLon::new(row.get(5)?, row.get(6)?),
                            LatLon::new(row.get(7)?, row.get(8)?),
                        ),
                        speed_limit_kmh: row.get(9)?,
                        min_stop: Duration::from_millis(row.get::<_, i64>(10)? as u64),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn save(&mut self, wp: &PitWaypoint) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO pit_waypoints (track, mode,
                 entry_a_lat, entry_a_lon, entry_b_lat, entry_b_lon,
                 exit_a_lat, exit_a_lon, exit_b_lat, exit_b_lon,
                 speed_limit_kmh, min_stop_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(track) DO UPDATE SET mode = ?2,
                 entry_a_lat = ?3, entry_a_lon = ?4, entry_b_lat = ?5, entry_b_lon = ?6,
                 exit_a_lat = ?7, exit_a_lon = ?8, exit_b_lat = ?9, exit_b_lon = ?10,
                 speed_limit_kmh = ?11, min_stop_ms = ?12",
            params![
                wp.track_name,
                mode_to_str(wp.mode),
                wp.entry_line.a.lat,
                wp.entry_line.a.lon,
                wp.entry_line.b.lat,
                wp.entry_line.b.lon,
                wp.exit_line.a.lat,
                wp.exit_line.a.lon,
                wp.exit_line.b.lat,
                wp.exit_line.b.lon,
                wp.speed_limit_kmh,
                wp.min_stop.as_millis() as i64,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waypoint(track: &str) -> PitWaypoint {
        let o = LatLon::new(50.0, 8.0);
        PitWaypoint {
            track_name: track.into(),
            entry_line: Segment::perpendicular_at(o, 90.0, 15.0),
            exit_line: Segment::perpendicular_at(o.destination(90.0, 300.0), 90.0, 15.0),
            mode: PitMode::StationaryOnly,
            speed_limit_kmh: 60.0,
            min_stop: Duration::from_secs(20),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let mut db = PitDb::open_in_memory().unwrap();
        assert!(db.load("spa").unwrap().is_none());
        let wp = waypoint("spa");
        db.save(&wp).unwrap();
        let got = db.load("spa").unwrap().unwrap();
        assert_eq!(got.mode, PitMode::StationaryOnly);
        assert_eq!(got.min_stop, Duration::from_secs(20));
        assert!(got.entry_line.midpoint().distance_m(&wp.entry_line.midpoint()) < 0.01);
    }

    #[test]
    fn upsert_replaces_lines() {
        let mut db = PitDb::open_in_memory().unwrap();
        let mut wp = waypoint("spa");
        db.save(&wp).unwrap();
        wp.speed_limit_kmh = 80.0;
        wp.mode = PitMode::EntranceToExit;
        db.save(&wp).unwrap();
        let got = db.load("spa").unwrap().unwrap();
        assert_eq!(got.speed_limit_kmh, 80.0);
        assert_eq!(got.mode, PitMode::EntranceToExit);
    }
}
