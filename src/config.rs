//! Typed runtime configuration.
//!
//! Every tunable lives here as a plain field with a default; the settings
//! layer overlays persisted values at boot. Engines and handlers only ever
//! read typed fields; nothing looks values up by string after boot.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempUnit {
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PressureUnit {
    #[serde(rename = "PSI")]
    Psi,
    #[serde(rename = "BAR")]
    Bar,
    #[serde(rename = "kPa")]
    Kpa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedUnit {
    #[serde(rename = "kmh")]
    Kmh,
    #[serde(rename = "mph")]
    Mph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopilotMode {
    JustDrive,
    RouteFollow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitMode {
    EntranceToExit,
    StationaryOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadarKind {
    ToyotaDenso,
    TeslaBosch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CornerDetectorKind {
    Threshold,
    Asc,
    CurveFinder,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuelSmoothing {
    Median,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Units {
    pub temp: TempUnit,
    pub pressure: PressureUnit,
    pub speed: SpeedUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagesEnabled {
    pub telemetry: bool,
    pub gmeter: bool,
    pub lap: bool,
    pub fuel: bool,
    pub copilot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayConfig {
    pub brightness: f64,
    pub pages_enabled: PagesEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TyreThresholds {
    pub cold_c: f64,
    pub warn_c: f64,
    pub hot_c: f64,
    pub pressure_low_kpa: f64,
    pub pressure_high_kpa: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrakeThresholds {
    pub warn_c: f64,
    pub hot_c: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoostThresholds {
    pub warn_kpa: f64,
    pub max_kpa: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftThresholds {
    pub warn_rpm: u32,
    pub shift_rpm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub tyre: TyreThresholds,
    pub brake: BrakeThresholds,
    pub boost: BoostThresholds,
    pub shift: ShiftThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraPrefs {
    pub mirror: bool,
    /// Rotation in degrees, one of 0/90/180/270.
    pub rotation: u32,
}

/// Per-corner display flip for tyre temperature strips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TyreFlip {
    pub fl: bool,
    pub fr: bool,
    pub rl: bool,
    pub rr: bool,
}

#[derive(Debug, Clone)]
pub struct TpmsConfig {
    pub serial_port: String,
    pub baud: u32,
}

#[derive(Debug, Clone)]
pub struct GpsConfig {
    pub serial_port: String,
    pub baud: u32,
    /// Wall-clock years accepted before declaring GPS time valid.
    pub valid_year_range: (i32, i32),
}

#[derive(Debug, Clone)]
pub struct ObdConfig {
    pub channel: String,
    pub poll_interval: Duration,
    /// Consecutive negative responses before a PID is disabled.
    pub pid_disable_after: u32,
    pub smoothing_window: usize,
    pub smoothing: FuelSmoothing,
}

#[derive(Debug, Clone)]
pub struct CornerCanConfig {
    pub channel: String,
    pub stale_after: Duration,
}

#[derive(Debug, Clone)]
pub struct RadarConfig {
    pub enabled: bool,
    pub kind: RadarKind,
    pub radar_channel: String,
    pub car_channel: String,
    pub keepalive_interval: Duration,
    /// On a shared car bus exactly one unit emits keep-alive; chosen by
    /// configuration, not negotiated at runtime.
    pub keepalive_emitter: bool,
    pub merge_radius_m: f64,
    pub track_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ImuConfig {
    pub i2c_path: String,
    pub address: u8,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LapConfig {
    /// Crossing re-arm distance; also the length of driver-marked lines.
    pub line_width_m: f64,
    pub corner_detector: CornerDetectorKind,
}

#[derive(Debug, Clone)]
pub struct PitConfig {
    pub mode: PitMode,
    pub speed_limit_kmh: f64,
    pub warning_margin_kmh: f64,
    pub min_stop: Duration,
    pub stationary_speed_kmh: f64,
    pub stationary_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct FuelConfig {
    pub smoothing_window: usize,
    pub smoothing: FuelSmoothing,
    /// Smoothed rise that counts as a refuel. No baked-in default: refuel
    /// detection stays off until the installer provides one.
    pub refuel_threshold_pct: Option<f64>,
    pub min_distance_for_estimate_km: f64,
    pub warning_threshold_pct: f64,
    pub critical_threshold_pct: f64,
}

#[derive(Debug, Clone)]
pub struct CopilotConfig {
    pub enabled: bool,
    pub mode: CopilotMode,
    pub audio_enabled: bool,
    pub update_interval: Duration,
    pub road_search_radius_m: f64,
    pub heading_tolerance_deg: f64,
    /// Nearest-road fallback when nothing matches the heading gate.
    pub fallback_radius_m: f64,
    pub lookahead_m: f64,
    pub refetch_distance_m: f64,
    pub note_merge_distance_m: f64,
    /// Callout lead distances, metres, nearest first.
    pub callout_brackets_m: Vec<f64>,
    pub min_corner_radius_m: f64,
    pub min_corner_angle_deg: f64,
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub fps_target: u32,
    pub render_budget: Duration,
    pub stale_timeout: Duration,
    /// Consecutive over-budget frames before a per-section timing dump.
    pub budget_warn_after: u32,
    /// Caught display errors tolerated before the loop gives up.
    pub crash_retry_budget: u32,
}

/// Full appliance configuration with the shipped defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub units: Units,
    pub display: DisplayConfig,
    pub thresholds: Thresholds,
    pub camera_rear: CameraPrefs,
    pub camera_front: CameraPrefs,
    pub tyre_flip: TyreFlip,
    pub tpms: TpmsConfig,
    pub gps: GpsConfig,
    pub obd: ObdConfig,
    pub corner_can: CornerCanConfig,
    pub radar_rear: RadarConfig,
    pub radar_front: RadarConfig,
    pub imu: ImuConfig,
    pub lap: LapConfig,
    pub pit: PitConfig,
    pub fuel: FuelConfig,
    pub copilot: CopilotConfig,
    pub render: RenderConfig,
    pub handler_stop_timeout: Duration,
    pub i2c_acquire_timeout: Duration,
    pub log_flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            units: Units {
                temp: TempUnit::Celsius,
                pressure: PressureUnit::Psi,
                speed: SpeedUnit::Kmh,
            },
            display: DisplayConfig {
                brightness: 0.8,
                pages_enabled: PagesEnabled {
                    telemetry: true,
                    gmeter: true,
                    lap: true,
                    fuel: true,
                    copilot: true,
                },
            },
            thresholds: Thresholds {
                tyre: TyreThresholds {
                    cold_c: 40.0,
                    warn_c: 95.0,
                    hot_c: 110.0,
                    pressure_low_kpa: 160.0,
                    pressure_high_kpa: 260.0,
                },
                brake: BrakeThresholds { warn_c: 450.0, hot_c: 600.0 },
                boost: BoostThresholds { warn_kpa: 180.0, max_kpa: 220.0 },
                shift: ShiftThresholds { warn_rpm: 6_200, shift_rpm: 6_800 },
            },
            camera_rear: CameraPrefs { mirror: true, rotation: 0 },
            camera_front: CameraPrefs { mirror: false, rotation: 0 },
            tyre_flip: TyreFlip::default(),
            tpms: TpmsConfig { serial_port: "/dev/ttyUSB0".into(), baud: 19_200 },
            gps: GpsConfig {
                serial_port: "/dev/ttyAMA0".into(),
                baud: 115_200,
                valid_year_range: (2024, 2030),
            },
            obd: ObdConfig {
                channel: "can0".into(),
                poll_interval: Duration::from_millis(100),
                pid_disable_after: 5,
                smoothing_window: 5,
                smoothing: FuelSmoothing::Median,
            },
            corner_can: CornerCanConfig {
                channel: "can_b2_0".into(),
                stale_after: Duration::from_millis(500),
            },
            radar_rear: RadarConfig {
                enabled: false,
                kind: RadarKind::ToyotaDenso,
                radar_channel: "can1".into(),
                car_channel: "can2".into(),
                keepalive_interval: Duration::from_millis(10),
                keepalive_emitter: true,
                merge_radius_m: 1.0,
                track_timeout: Duration::from_millis(500),
            },
            radar_front: RadarConfig {
                enabled: false,
                kind: RadarKind::ToyotaDenso,
                radar_channel: "can3".into(),
                car_channel: "can2".into(),
                keepalive_interval: Duration::from_millis(10),
                keepalive_emitter: false,
                merge_radius_m: 1.0,
                track_timeout: Duration::from_millis(500),
            },
            imu: ImuConfig {
                i2c_path: "/dev/i2c-1".into(),
                address: 0x68,
                poll_interval: Duration::from_millis(10),
            },
            lap: LapConfig {
                line_width_m: 15.0,
                corner_detector: CornerDetectorKind::Hybrid,
            },
            pit: PitConfig {
                mode: PitMode::EntranceToExit,
                speed_limit_kmh: 60.0,
                warning_margin_kmh: 5.0,
                min_stop: Duration::from_secs(0),
                stationary_speed_kmh: 3.0,
                stationary_duration: Duration::from_secs(1),
            },
            fuel: FuelConfig {
                smoothing_window: 30,
                smoothing: FuelSmoothing::Median,
                refuel_threshold_pct: None,
                min_distance_for_estimate_km: 5.0,
                warning_threshold_pct: 15.0,
                critical_threshold_pct: 7.0,
            },
            copilot: CopilotConfig {
                enabled: false,
                mode: CopilotMode::JustDrive,
                audio_enabled: true,
                update_interval: Duration::from_millis(200),
                road_search_radius_m: 150.0,
                heading_tolerance_deg: 45.0,
                fallback_radius_m: 30.0,
                lookahead_m: 1000.0,
                refetch_distance_m: 500.0,
                note_merge_distance_m: 50.0,
                callout_brackets_m: vec![100.0, 200.0, 500.0, 1000.0],
                min_corner_radius_m: 15.0,
                min_corner_angle_deg: 12.0,
            },
            render: RenderConfig {
                fps_target: 60,
                render_budget: Duration::from_millis(12),
                stale_timeout: Duration::from_secs(1),
                budget_warn_after: 5,
                crash_retry_budget: 5,
            },
            handler_stop_timeout: Duration::from_secs(2),
            i2c_acquire_timeout: Duration::from_millis(50),
            log_flush_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let c = Config::default();
        assert_eq!(c.render.fps_target, 60);
        assert_eq!(c.render.render_budget, Duration::from_millis(12));
        assert_eq!(c.lap.line_width_m, 15.0);
        assert_eq!(c.fuel.smoothing_window, 30);
        assert!(c.fuel.refuel_threshold_pct.is_none());
        assert_eq!(c.copilot.lookahead_m, 1000.0);
        assert_eq!(c.copilot.heading_tolerance_deg, 45.0);
        assert_eq!(c.obd.pid_disable_after, 5);
    }
}
