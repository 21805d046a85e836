//! Session lap-table CSV export, written at session end next to the lap DB.

use std::path::Path;

use serde::Serialize;

use crate::engines::lap::Lap;
use crate::store::StoreError;

#[derive(Debug, Serialize)]
struct LapRow {
    lap: u32,
    total_s: f64,
    sectors: String,
    points: usize,
}

/// Writes one row per completed lap. Unsealed laps are skipped.
pub fn export_session(path: &Path, laps: &[Lap]) -> Result<usize, StoreError> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    let mut rows = 0;
    for lap in laps {
        let Some(total) = lap.total_time else {
            continue;
        };
        let sectors = lap
            .sector_times
            .iter()
            .map(|s| format!("{:.3}", s.as_secs_f64()))
            .collect::<Vec<_>>()
            .join("|");
        writer
            .serialize(LapRow {
                lap: lap.number,
                total_s: total.as_secs_f64(),
                sectors,
                points: lap.points.len(),
            })
            .map_err(csv_err)?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

fn csv_err(e: csv::Error) -> StoreError {
    StoreError::Invalid(format!("csv export: {e}"))
}
