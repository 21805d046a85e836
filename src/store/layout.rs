//! On-disk layout rooted on removable USB storage with a home fallback.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::warn;

const USB_MOUNT: &str = "/mnt/usb";
const APP_DIR: &str = ".opentpt";

/// Resolved storage root plus whether it lives on removable media.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    removable: bool,
}

impl StorageLayout {
    /// Prefers the USB mount; falls back to the home directory. The fallback
    /// keeps the appliance usable but the boot banner warns that settings and
    /// laps will not follow the stick.
    pub fn discover() -> Self {
        let usb = Path::new(USB_MOUNT);
        if usb.is_dir() {
            return Self { root: usb.join(APP_DIR), removable: true };
        }
        warn!("USB storage missing at {USB_MOUNT}; falling back to home directory");
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { root: home.join(APP_DIR), removable: false }
    }

    /// Fixed root, used by tests and the `--storage-root` override.
    pub fn at(root: impl Into<PathBuf>, removable: bool) -> Self {
        Self { root: root.into(), removable }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    /// Creates the directory tree; best-effort, returns the first error.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.lap_dir(),
            self.tracks_dir(),
            self.routes_dir(),
            self.pit_dir(),
            self.maps_dir(),
            self.copilot_routes_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn lap_dir(&self) -> PathBuf {
        self.root.join("lap_timing")
    }

    pub fn lap_db_file(&self) -> PathBuf {
        self.lap_dir().join("lap_timing.db")
    }

    pub fn tracks_dir(&self) -> PathBuf {
        self.lap_dir().join("tracks")
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.root.join("routes")
    }

    pub fn pit_dir(&self) -> PathBuf {
        self.root.join("pit_timer")
    }

    pub fn pit_db_file(&self) -> PathBuf {
        self.pit_dir().join("pit_waypoints.db")
    }

    pub fn maps_dir(&self) -> PathBuf {
        self.root.join("copilot").join("maps")
    }

    pub fn copilot_routes_dir(&self) -> PathBuf {
        self.root.join("copilot").join("routes")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Dated log file, e.g. `logs/opentpt_20260801.log`.
    pub fn log_file_today(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d");
        self.logs_dir().join(format!("opentpt_{stamp}.log"))
    }

    /// Session lap export, e.g. `lap_timing/session_20260801_141502.csv`.
    pub fn session_export_file(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        self.lap_dir().join(format!("session_{stamp}.csv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_root() {
        let l = StorageLayout::at("/tmp/tptroot", true);
        assert_eq!(l.settings_file(), PathBuf::from("/tmp/tptroot/settings.json"));
        assert_eq!(l.lap_db_file(), PathBuf::from("/tmp/tptroot/lap_timing/lap_timing.db"));
        assert_eq!(l.pit_db_file(), PathBuf::from("/tmp/tptroot/pit_timer/pit_waypoints.db"));
        assert!(l.maps_dir().ends_with("copilot/maps"));
        assert!(l.is_removable());
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let l = StorageLayout::at(tmp.path().join("store"), false);
        l.ensure_dirs().unwrap();
        assert!(l.tracks_dir().is_dir());
        assert!(l.logs_dir().is_dir());
        assert!(l.copilot_routes_dir().is_dir());
    }
}
