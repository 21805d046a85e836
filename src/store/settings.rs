//! Dotted-key JSON settings with atomic replace.
//!
//! The file stores nested JSON; callers address values by dotted paths
//! (`"units.temp"`, `"pit_timer.min_stop_s"`). At boot the store overlays
//! itself onto the typed [`Config`]; after that nothing looks keys up by
//! string again.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;
use serde_json::{Map, Value};

use super::StoreError;
use crate::config::{
    Config, CopilotMode, FuelSmoothing, PitMode, PressureUnit, SpeedUnit, TempUnit,
};

pub struct SettingsStore {
    path: PathBuf,
    root: Value,
}

impl SettingsStore {
    /// Loads settings, treating a missing file as empty. A malformed file is
    /// preserved on disk but ignored in memory.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let root = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(v @ Value::Object(_)) => v,
                Ok(_) | Err(_) => {
                    warn!("settings file {} is not a JSON object; starting empty", path.display());
                    Value::Object(Map::new())
                }
            },
            Err(_) => Value::Object(Map::new()),
        };
        Self { path, root }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for part in dotted.split('.') {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    pub fn set(&mut self, dotted: &str, value: Value) {
        let parts: Vec<&str> = dotted.split('.').collect();
        let Some((last, parents)) = parts.split_last() else {
            return;
        };
        let mut cur = &mut self.root;
        for part in parents {
            if !cur.is_object() {
                // A scalar in the way of a nested key is replaced.
                *cur = Value::Object(Map::new());
            }
            let Value::Object(map) = cur else {
                return;
            };
            cur = map
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        if let Value::Object(map) = cur {
            map.insert((*last).to_string(), value);
        }
    }

    /// All dotted keys present, sorted. Used for diffing and round-trip tests.
    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_keys("", &self.root, &mut out);
        out.sort();
        out
    }

    /// Atomic replace: write a sibling temp file, fsync, rename over the
    /// target. A failed write leaves the previous file untouched; the temp
    /// file is removed on drop.
    pub fn save(&self) -> Result<(), StoreError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StoreError::Invalid(format!("settings path has no parent: {}", self.path.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.root)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    /// Overlays persisted values onto the typed config. Unknown keys are
    /// ignored; ill-typed values keep the default and log once.
    pub fn overlay(&self, cfg: &mut Config) {
        self.with_str("units.temp", |v| {
            match v {
                "C" => cfg.units.temp = TempUnit::Celsius,
                "F" => cfg.units.temp = TempUnit::Fahrenheit,
                _ => warn!("units.temp: unknown value {v:?}"),
            }
        });
        self.with_str("units.pressure", |v| {
            match v {
                "PSI" => cfg.units.pressure = PressureUnit::Psi,
                "BAR" => cfg.units.pressure = PressureUnit::Bar,
                "kPa" => cfg.units.pressure = PressureUnit::Kpa,
                _ => warn!("units.pressure: unknown value {v:?}"),
            }
        });
        self.with_str("units.speed", |v| {
            match v {
                "kmh" => cfg.units.speed = SpeedUnit::Kmh,
                "mph" => cfg.units.speed = SpeedUnit::Mph,
                _ => warn!("units.speed: unknown value {v:?}"),
            }
        });

        self.with_f64("display.brightness", |v| {
            cfg.display.brightness = v.clamp(0.0, 1.0)
        });
        self.with_bool("display.pages_enabled.telemetry", |v| cfg.display.pages_enabled.telemetry = v);
        self.with_bool("display.pages_enabled.gmeter", |v| cfg.display.pages_enabled.gmeter = v);
        self.with_bool("display.pages_enabled.lap", |v| cfg.display.pages_enabled.lap = v);
        self.with_bool("display.pages_enabled.fuel", |v| cfg.display.pages_enabled.fuel = v);
        self.with_bool("display.pages_enabled.copilot", |v| cfg.display.pages_enabled.copilot = v);

        self.with_f64("thresholds.tyre.cold_c", |v| cfg.thresholds.tyre.cold_c = v);
        self.with_f64("thresholds.tyre.warn_c", |v| cfg.thresholds.tyre.warn_c = v);
        self.with_f64("thresholds.tyre.hot_c", |v| cfg.thresholds.tyre.hot_c = v);
        self.with_f64("thresholds.tyre.pressure_low_kpa", |v| cfg.thresholds.tyre.pressure_low_kpa = v);
        self.with_f64("thresholds.tyre.pressure_high_kpa", |v| cfg.thresholds.tyre.pressure_high_kpa = v);
        self.with_f64("thresholds.brake.warn_c", |v| cfg.thresholds.brake.warn_c = v);
        self.with_f64("thresholds.brake.hot_c", |v| cfg.thresholds.brake.hot_c = v);
        self.with_f64("thresholds.boost.warn_kpa", |v| cfg.thresholds.boost.warn_kpa = v);
        self.with_f64("thresholds.boost.max_kpa", |v| cfg.thresholds.boost.max_kpa = v);
        self.with_u32("thresholds.shift.warn_rpm", |v| cfg.thresholds.shift.warn_rpm = v);
        self.with_u32("thresholds.shift.shift_rpm", |v| cfg.thresholds.shift.shift_rpm = v);

        self.with_bool("camera.rear.mirror", |v| cfg.camera_rear.mirror = v);
        self.with_u32("camera.rear.rotation", |v| cfg.camera_rear.rotation = v % 360);
        self.with_bool("camera.front.mirror", |v| cfg.camera_front.mirror = v);
        self.with_u32("camera.front.rotation", |v| cfg.camera_front.rotation = v % 360);

        self.with_bool("radar.rear.enabled", |v| cfg.radar_rear.enabled = v);
        self.with_bool("radar.front.enabled", |v| cfg.radar_front.enabled = v);

        self.with_bool("copilot.enabled", |v| cfg.copilot.enabled = v);
        self.with_str("copilot.mode", |v| {
            match v {
                "just_drive" => cfg.copilot.mode = CopilotMode::JustDrive,
                "route_follow" => cfg.copilot.mode = CopilotMode::RouteFollow,
                _ => warn!("copilot.mode: unknown value {v:?}"),
            }
        });
        self.with_bool("copilot.audio_enabled", |v| cfg.copilot.audio_enabled = v);
        self.with_f64("copilot.lookahead_m", |v| {
            if v > 0.0 {
                cfg.copilot.lookahead_m = v;
            }
        });

        self.with_str("pit_timer.mode", |v| {
            match v {
                "entrance_to_exit" => cfg.pit.mode = PitMode::EntranceToExit,
                "stationary_only" => cfg.pit.mode = PitMode::StationaryOnly,
                _ => warn!("pit_timer.mode: unknown value {v:?}"),
            }
        });
        self.with_f64("pit_timer.speed_limit_kmh", |v| cfg.pit.speed_limit_kmh = v);
        self.with_f64("pit_timer.min_stop_s", |v| {
            cfg.pit.min_stop = std::time::Duration::from_secs_f64(v.max(0.0))
        });

        self.with_bool("tyre_temps.flip.FL", |v| cfg.tyre_flip.fl = v);
        self.with_bool("tyre_temps.flip.FR", |v| cfg.tyre_flip.fr = v);
        self.with_bool("tyre_temps.flip.RL", |v| cfg.tyre_flip.rl = v);
        self.with_bool("tyre_temps.flip.RR", |v| cfg.tyre_flip.rr = v);

        self.with_f64("fuel.refuel_threshold_pct", |v| {
            if v > 0.0 {
                cfg.fuel.refuel_threshold_pct = Some(v);
            }
        });
        self.with_str("fuel.smoothing", |v| {
            match v {
                "median" => cfg.fuel.smoothing = FuelSmoothing::Median,
                "mean" => cfg.fuel.smoothing = FuelSmoothing::Mean,
                _ => warn!("fuel.smoothing: unknown value {v:?}"),
            }
        });
    }

    fn with_str(&self, key: &str, f: impl FnOnce(&str)) {
        if let Some(v) = self.get(key) {
            match v.as_str() {
                Some(s) => f(s),
                None => warn!("{key}: expected string, got {v}"),
            }
        }
    }

    fn with_bool(&self, key: &str, f: impl FnOnce(bool)) {
        if let Some(v) = self.get(key) {
            match v.as_bool() {
                Some(b) => f(b),
                None => warn!("{key}: expected bool, got {v}"),
            }
        }
    }

    fn with_f64(&self, key: &str, f: impl FnOnce(f64)) {
        if let Some(v) = self.get(key) {
            match v.as_f64() {
                Some(x) => f(x),
                None => warn!("{key}: expected number, got {v}"),
            }
        }
    }

    fn with_u32(&self, key: &str, f: impl FnOnce(u32)) {
        if let Some(v) = self.get(key) {
            match v.as_u64() {
                Some(x) if x <= u32::MAX as u64 => f(x as u32),
                _ => warn!("{key}: expected unsigned number, got {v}"),
            }
        }
    }
}

fn collect_keys(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                collect_keys(&key, v, out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push(prefix.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = SettingsStore::load(tmp.path().join("settings.json"));
        s.set("units.temp", json!("F"));
        s.set("pit_timer.min_stop_s", json!(20.0));
        assert_eq!(s.get("units.temp"), Some(&json!("F")));
        assert_eq!(s.get("pit_timer.min_stop_s"), Some(&json!(20.0)));
        assert_eq!(s.get("units.pressure"), None);
    }

    #[test]
    fn save_and_reload_preserves_keys_and_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        let mut s = SettingsStore::load(&path);
        s.set("units.speed", json!("mph"));
        s.set("display.brightness", json!(0.5));
        s.set("tyre_temps.flip.FL", json!(true));
        s.save().unwrap();

        let r = SettingsStore::load(&path);
        assert_eq!(r.keys(), s.keys());
        assert_eq!(r.get("units.speed"), Some(&json!("mph")));
        assert_eq!(r.get("display.brightness"), Some(&json!(0.5)));
        assert_eq!(r.get("tyre_temps.flip.FL"), Some(&json!(true)));
    }

    #[test]
    fn failed_save_leaves_previous_file_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        let mut s = SettingsStore::load(&path);
        s.set("units.temp", json!("C"));
        s.save().unwrap();

        // Point the store at a dead location; save must fail without touching
        // the original file.
        let mut dead = SettingsStore::load(tmp.path().join("missing").join("settings.json"));
        dead.set("units.temp", json!("F"));
        assert!(dead.save().is_err());

        let r = SettingsStore::load(&path);
        assert_eq!(r.get("units.temp"), Some(&json!("C")));
    }

    #[test]
    fn overlay_applies_known_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = SettingsStore::load(tmp.path().join("settings.json"));
        s.set("units.temp", json!("F"));
        s.set("units.pressure", json!("BAR"));
        s.set("display.brightness", json!(1.5)); // clamped
        s.set("copilot.mode", json!("route_follow"));
        s.set("pit_timer.mode", json!("stationary_only"));
        s.set("pit_timer.min_stop_s", json!(20));
        s.set("radar.rear.enabled", json!(true));
        s.set("fuel.refuel_threshold_pct", json!(10.0));

        let mut cfg = Config::default();
        s.overlay(&mut cfg);

        assert_eq!(cfg.units.temp, TempUnit::Fahrenheit);
        assert_eq!(cfg.units.pressure, PressureUnit::Bar);
        assert_eq!(cfg.display.brightness, 1.0);
        assert_eq!(cfg.copilot.mode, CopilotMode::RouteFollow);
        assert_eq!(cfg.pit.mode, PitMode::StationaryOnly);
        assert_eq!(cfg.pit.min_stop, std::time::Duration::from_secs(20));
        assert!(cfg.radar_rear.enabled);
        assert_eq!(cfg.fuel.refuel_threshold_pct, Some(10.0));
    }

    #[test]
    fn overlay_ignores_ill_typed_values() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = SettingsStore::load(tmp.path().join("settings.json"));
        s.set("display.brightness", json!("bright"));
        s.set("units.temp", json!(5));

        let mut cfg = Config::default();
        let before = cfg.display.brightness;
        s.overlay(&mut cfg);
        assert_eq!(cfg.display.brightness, before);
        assert_eq!(cfg.units.temp, TempUnit::Celsius);
    }
}
