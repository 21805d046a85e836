//! Per-frame display models handed to the display backend.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{CameraPrefs, Units};
use crate::engines::copilot::notes::PaceNote;
use crate::engines::copilot::CopilotStatus;
use crate::engines::fuel::FuelStatus;
use crate::engines::pit::PitState;
use crate::handlers::camera::CameraFrame;
use crate::handlers::radar::RadarTrack;
use crate::handlers::WheelCorner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Telemetry,
    GMeter,
    Lap,
    Fuel,
    Copilot,
    Camera,
}

/// Freshness badge for one on-screen element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Ok,
    /// Drawn dimmed with a stale marker; data is the last known value.
    Stale,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlarmLevel {
    None,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct TyreModel {
    pub pressure_kpa: Option<f64>,
    pub temp_c: Option<f64>,
    pub surface_c: Option<(f64, f64, f64)>,
    pub brake_c: Option<(f64, f64)>,
    pub pressure_alarm: AlarmLevel,
    pub temp_alarm: AlarmLevel,
    pub badge: Badge,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryModel {
    pub tyres: HashMap<WheelCorner, TyreModel>,
    pub speed_kmh: Option<f64>,
    pub rpm: Option<f64>,
    pub coolant_c: Option<f64>,
    pub map_kpa: Option<f64>,
    pub gear: Option<u8>,
    pub radar_tracks: Vec<RadarTrack>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GMeterModel {
    pub lat_g: f64,
    pub lon_g: f64,
    pub yaw_dps: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LapModel {
    pub lap_number: Option<u32>,
    pub current_s: Option<f64>,
    pub last_s: Option<f64>,
    pub best_s: Option<f64>,
    /// `None` renders as "--".
    pub delta_s: Option<f64>,
    pub sector_times_s: Vec<f64>,
    pub track_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FuelModel {
    pub level_pct: Option<f64>,
    pub avg_pct_per_lap: Option<f64>,
    pub laps_remaining: Option<u32>,
    pub range_km: Option<f64>,
    pub status: Option<FuelStatus>,
}

#[derive(Debug, Clone)]
pub struct PitModel {
    pub state: PitState,
    pub elapsed_s: f64,
    pub countdown_s: Option<f64>,
    pub go: bool,
    pub violations: u32,
}

#[derive(Debug, Clone)]
pub struct CopilotModel {
    pub status: CopilotStatus,
    pub next_note: Option<PaceNote>,
    pub next_note_ahead_m: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CameraModel {
    pub frame: Option<Arc<CameraFrame>>,
    /// Last frame is held during a camera switch.
    pub frozen: bool,
    pub prefs: CameraPrefs,
}

#[derive(Debug, Clone)]
pub enum PageContent {
    Telemetry(TelemetryModel),
    GMeter(GMeterModel),
    Lap(LapModel),
    Fuel(FuelModel),
    Copilot(CopilotModel),
    Camera(CameraModel),
}

#[derive(Debug, Clone)]
pub struct StatusBar {
    pub gps_fix: bool,
    pub sats: u8,
    pub usb_missing: bool,
    pub sources: Vec<(&'static str, Badge)>,
    pub pit: Option<PitModel>,
    pub fuel_status: FuelStatus,
    pub banner: Option<String>,
}

/// Everything the display backend needs for one frame.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub page: Page,
    pub brightness: f64,
    pub units: Units,
    pub status: StatusBar,
    pub content: PageContent,
}
