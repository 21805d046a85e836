//! Read-only OSM roads database with an R-tree spatial index.
//!
//! The multi-gigabyte map files live on external storage under
//! `copilot/maps/`. Proximity queries hit the R-tree with a degree-space
//! bounding box, then filter precisely in metres.

use std::path::Path;

use log::info;
use rusqlite::{params, Connection, OpenFlags};

use super::StoreError;
use crate::geo::LatLon;

#[derive(Debug, Clone, PartialEq)]
pub struct Road {
    pub id: i64,
    pub name: Option<String>,
    pub points: Vec<LatLon>,
}

/// Metres per degree of latitude, and of longitude at the equator.
const M_PER_DEG: f64 = 111_320.0;

pub struct RoadsDb {
    conn: Connection,
    bounds: Option<(LatLon, LatLon)>,
}

impl RoadsDb {
    /// Opens an existing map read-only and sanity-checks it; a corrupt file
    /// surfaces here so CoPilot can disable itself with a clear status.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(StoreError::Invalid(format!(
                "{}: integrity check failed: {check}",
                path.display()
            )));
        }
        let mut db = Self { conn, bounds: None };
        db.bounds = db.query_bounds()?;
        if let Some((sw, ne)) = db.bounds {
            info!(
                "roads db {} covers ({:.3},{:.3})..({:.3},{:.3})",
                path.display(),
                sw.lat,
                sw.lon,
                ne.lat,
                ne.lon
            );
        }
        Ok(db)
    }

    /// Creates an empty writable map (map import tooling and tests).
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn, bounds: None })
    }

    pub fn create_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn, bounds: None })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS roads (
                 id   INTEGER PRIMARY KEY,
                 name TEXT
             );
             CREATE TABLE IF NOT EXISTS road_points (
                 road_id INTEGER NOT NULL,
                 idx     INTEGER NOT NULL,
                 lat     REAL NOT NULL,
                 lon     REAL NOT NULL,
                 PRIMARY KEY (road_id, idx)
             );
             CREATE VIRTUAL TABLE IF NOT EXISTS roads_rtree
                 USING rtree(id, min_lat, max_lat, min_lon, max_lon);",
        )?;
        Ok(())
    }

    pub fn insert_road(&mut self, name: Option<&str>, points: &[LatLon]) -> Result<i64, StoreError> {
        if points.is_empty() {
            return Err(StoreError::Invalid("road with no points".into()));
        }
        let tx = self.conn.transaction()?;
        tx.execute("INSERT INTO roads (name) VALUES (?1)", params![name])?;
        let id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO road_points (road_id, idx, lat, lon) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (idx, p) in points.iter().enumerate() {
                stmt.execute(params![id, idx as i64, p.lat, p.lon])?;
            }
        }
        let (min_lat, max_lat) = points
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.lat), hi.max(p.lat)));
        let (min_lon, max_lon) = points
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.lon), hi.max(p.lon)));
        tx.execute(
            "INSERT INTO roads_rtree (id, min_lat, max_lat, min_lon, max_lon)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, min_lat, max_lat, min_lon, max_lon],
        )?;
        tx.commit()?;
        self.bounds = None;
        Ok(id)
    }

    fn query_bounds(&self) -> Result<Option<(LatLon, LatLon)>, StoreError> {
        let row: Option<(Option<f64>, Option<f64>, Option<f64>, Option<f64>)> = self
            .conn
            .query_row(
                "SELECT min(min_lat), max(max_lat), min(min_lon), max(max_lon) FROM roads_rtree",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .ok();
        Ok(match row {
            Some((Some(a), Some(b), Some(c), Some(d))) => {
                Some((LatLon::new(a, c), LatLon::new(b, d)))
            }
            _ => None,
        })
    }

    /// Map coverage, cached after first load.
    pub fn bounds(&mut self) -> Result<Option<(LatLon, LatLon)>, StoreError> {
        if self.bounds.is_none() {
            self.bounds = self.query_bounds()?;
        }
        Ok(self.bounds)
    }

    /// Roads with any point within `radius_m` of `centre`.
    pub fn roads_within(&self, centre: &LatLon, radius_m: f64) -> Result<Vec<Road>, StoreError> {
        let dlat = radius_m / M_PER_DEG;
        let dlon = radius_m / (M_PER_DEG * centre.lat.to_radians().cos().max(1e-6));

        let mut stmt = self.conn.prepare(
            "SELECT id FROM roads_rtree
             WHERE max_lat >= ?1 AND min_lat <= ?2 AND max_lon >= ?3 AND min_lon <= ?4",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(
                params![
                    centre.lat - dlat,
                    centre.lat + dlat,
                    centre.lon - dlon,
                    centre.lon + dlon
                ],
                |row| row.get(0),
            )?
            .collect::<Result<_, _>>()?;

        let mut out = Vec::new();
        for id in ids {
            let road = self.load_road(id)?;
            if road.points.iter().any(|p| p.distance_m(centre) <= radius_m) {
                out.push(road);
            }
        }
        Ok(out)
    }

    fn load_road(&self, id: i64) -> Result<Road, StoreError> {
        let name: Option<String> = self.conn.query_row(
            "SELECT name FROM roads WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let mut stmt = self
            .conn
            .prepare("SELECT lat, lon FROM road_points WHERE road_id = ?1 ORDER BY idx")?;
        let points = stmt
            .query_map(params![id], |row| Ok(LatLon::new(row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Road { id, name, points })
    }
}
