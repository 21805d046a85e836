//! Boot orchestrator: storage, settings, handlers, engines, render loop.
//!
//! Every subsystem that fails to initialise is recorded as absent and the
//! rest of the appliance keeps booting; the renderer shows missing sources
//! greyed out instead of refusing to start.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{info, warn};
use thiserror::Error;

use crate::config::{Config, RadarKind};
use crate::engines::copilot::Copilot;
use crate::engines::fuel::FuelTracker;
use crate::engines::lap::track::TrackDb;
use crate::engines::lap::LapTimer;
use crate::engines::pit::PitTimer;
use crate::events::event_channel;
use crate::handlers::gps::GpsWorker;
use crate::handlers::imu::{ImuWorker, Mpu6050};
use crate::handlers::obd::{ObdCanLink, ObdWorker};
use crate::handlers::radar::{DensoDecoder, RadarDecoder, RadarWorker, TeslaBoschDecoder};
use crate::handlers::tpms::{SerialTpmsReceiver, TpmsWorker};
use crate::handlers::corner::CornerWorker;
use crate::hw::{LinuxI2c, SerialNmea, SharedI2cBus, SocketCan};
use crate::render::output::{AudioSink, DisplayBackend, OledPanel, ShiftStrip};
use crate::render::renderer::{Engines, Handlers, Renderer};
use crate::render::RenderError;
use crate::runtime::{Handler, HANDLER_STOP_TIMEOUT};
use crate::store::{LapDb, PitDb, SettingsStore, StorageLayout};
use crate::utils::counters::RuntimeCounters;
use crate::utils::logfile::DiagLog;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("init: {0}")]
    Init(String),
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Debug, Clone, Default)]
pub struct BootOptions {
    pub windowed: bool,
    pub storage_root: Option<PathBuf>,
}

/// Boots the appliance and runs the render loop to completion.
///
/// The returned error maps to the process exit code: `Init` is a fatal boot
/// failure, `Render` an unrecovered render-loop failure.
pub fn run<D: DisplayBackend>(
    opts: &BootOptions,
    display: D,
    audio: Box<dyn AudioSink>,
    strip: Box<dyn ShiftStrip>,
    oled: Box<dyn OledPanel>,
) -> Result<(), AppError> {
    info!(
        "openTPT starting ({})",
        if opts.windowed { "windowed" } else { "fullscreen" }
    );

    // Storage and settings.
    let layout = match &opts.storage_root {
        Some(root) => StorageLayout::at(root.clone(), false),
        None => StorageLayout::discover(),
    };
    layout
        .ensure_dirs()
        .map_err(|e| AppError::Init(format!("storage root {}: {e}", layout.root().display())))?;

    let settings = SettingsStore::load(layout.settings_file());
    let mut config = Config::default();
    settings.overlay(&mut config);
    let cfg = Arc::new(ArcSwap::from_pointee(config));

    let diag = match DiagLog::start(layout.log_file_today(), cfg.load().log_flush_interval) {
        Ok(d) => Some(Arc::new(d)),
        Err(e) => {
            warn!("diagnostic log unavailable: {e}");
            None
        }
    };
    if let Some(d) = &diag {
        d.record("boot", format!("storage at {}", layout.root().display()));
    }

    let counters = Arc::new(RuntimeCounters::new());
    // The sender side feeds the renderer from the platform's input driver;
    // it is returned to embedders through `event_channel` wiring points.
    let (_event_tx, event_rx) = event_channel();

    // Sensor handlers: each failure leaves the slot absent.
    let c = cfg.load_full();
    let mut handlers = Handlers::default();
    let mut imu_commands = None;

    handlers.gps = match SerialNmea::open(
        &c.gps.serial_port,
        c.gps.baud,
        Duration::from_millis(200),
    ) {
        Ok(port) => Some(Handler::new(
            "gps",
            GpsWorker::new(Box::new(port), c.gps.valid_year_range),
        )),
        Err(e) => absent("gps", e),
    };

    handlers.obd = match SocketCan::open(&c.obd.channel) {
        Ok(bus) => {
            let link = ObdCanLink::new(Box::new(bus), Duration::from_millis(80));
            Some(Handler::new("obd", ObdWorker::new(Box::new(link), c.obd.clone())))
        }
        Err(e) => absent("obd", e),
    };

    handlers.corners = match SocketCan::open(&c.corner_can.channel) {
        Ok(bus) => Some(Handler::new(
            "corners",
            CornerWorker::new(Box::new(bus), c.corner_can.clone()),
        )),
        Err(e) => absent("corners", e),
    };

    handlers.tpms = match SerialTpmsReceiver::open(
        &c.tpms.serial_port,
        c.tpms.baud,
        Duration::from_millis(500),
    ) {
        Ok(rx) => Some(Handler::new("tpms", TpmsWorker::new(Box::new(rx)))),
        Err(e) => absent("tpms", e),
    };

    if c.radar_rear.enabled {
        handlers.radar_rear = build_radar("radar_rear", &c.radar_rear);
    }
    if c.radar_front.enabled {
        handlers.radar_front = build_radar("radar_front", &c.radar_front);
    }

    handlers.imu = match LinuxI2c::open(&c.imu.i2c_path) {
        Ok(dev) => {
            let bus = SharedI2cBus::new(Box::new(dev), c.i2c_acquire_timeout);
            match Mpu6050::new(bus, c.imu.address) {
                Ok(device) => {
                    let (tx, rx) = crossbeam::channel::bounded(4);
                    imu_commands = Some(tx);
                    Some(Handler::new(
                        "imu",
                        ImuWorker::new(Box::new(device), c.imu.clone()).with_commands(rx),
                    ))
                }
                Err(e) => absent("imu", e),
            }
        }
        Err(e) => absent("imu", e),
    };

    // Domain engines and their stores.
    let lap_db = open_or_warn("lap db", LapDb::open(&layout.lap_db_file()));
    let pit_db = open_or_warn("pit db", PitDb::open(&layout.pit_db_file()));

    let mut lap = LapTimer::new(c.lap.clone(), lap_db);
    let mut pit = PitTimer::new(c.pit.clone());
    let fuel = FuelTracker::new(c.fuel.clone());
    let mut copilot = Copilot::new(c.copilot.clone());

    // Optional auto-load of the last selected track.
    if let Some(name) = settings.get("lap.track").and_then(|v| v.as_str()) {
        let track_db = TrackDb::new(vec![
            layout.tracks_dir(),
            layout.routes_dir(),
            layout.copilot_routes_dir(),
        ]);
        match track_db.select_track_by_name(name, None) {
            Ok(track) => {
                if let Some(db) = &pit_db {
                    match db.load(&track.name) {
                        Ok(wp) => pit.set_waypoint(wp),
                        Err(e) => warn!("pit waypoint load failed: {e}"),
                    }
                }
                copilot.set_route(Some(track.centreline.clone()));
                lap.load_track(track);
            }
            Err(e) => warn!("track {name:?} not loaded: {e}"),
        }
    }

    if c.copilot.enabled {
        match first_map(&layout) {
            Some(map) => copilot.enable(map),
            None => warn!("copilot enabled but no roads database under {}", layout.maps_dir().display()),
        }
    }

    let engines = Engines { lap, pit, fuel, copilot };

    let mut renderer = Renderer::new(
        Arc::clone(&cfg),
        display,
        audio,
        strip,
        oled,
        handlers,
        engines,
        event_rx,
        Arc::clone(&counters),
        diag.clone(),
        layout.clone(),
        pit_db,
        Some(settings),
        imu_commands,
    );

    renderer.handlers_mut().start_all();
    if let Some(d) = &diag {
        d.record("boot", "handlers started");
    }

    // Best-effort: the frame clock benefits from beating the worker threads.
    if let Err(e) =
        thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
    {
        warn!("render thread priority not raised: {e:?}");
    }

    let outcome = renderer.run();

    renderer.handlers_mut().stop_all(HANDLER_STOP_TIMEOUT);
    if let Some(d) = &diag {
        d.record("shutdown", counters.summary());
    }
    drop(renderer);
    if let Some(d) = diag {
        if let Ok(d) = Arc::try_unwrap(d) {
            d.stop();
        }
    }

    outcome.map_err(AppError::from)
}

fn absent<T>(name: &str, e: crate::runtime::HandlerError) -> Option<T> {
    warn!("{name} unavailable, shown as absent: {e}");
    None
}

fn open_or_warn<T>(what: &str, result: Result<T, crate::store::StoreError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("{what} unavailable: {e}");
            None
        }
    }
}

fn build_radar(
    name: &'static str,
    cfg: &crate::config::RadarConfig,
) -> Option<Handler<crate::handlers::radar::RadarSnapshot>> {
    let rx = match SocketCan::open(&cfg.radar_channel) {
        Ok(b) => b,
        Err(e) => return absent(name, e),
    };
    let (tx, decoder): (Option<Box<dyn crate::hw::CanBus>>, Box<dyn RadarDecoder>) =
        match cfg.kind {
            RadarKind::ToyotaDenso => {
                let tx = match SocketCan::open(&cfg.car_channel) {
                    Ok(b) => b,
                    Err(e) => return absent(name, e),
                };
                (Some(Box::new(tx)), Box::new(DensoDecoder::new()))
            }
            // Tesla Bosch shares one bus for RX and TX.
            RadarKind::TeslaBosch => (None, Box::new(TeslaBoschDecoder::new())),
        };
    Some(Handler::new(
        name,
        RadarWorker::new(Box::new(rx), tx, decoder, cfg.clone()),
    ))
}

fn first_map(layout: &StorageLayout) -> Option<PathBuf> {
    let mut maps: Vec<PathBuf> = std::fs::read_dir(layout.maps_dir())
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |e| e == "db"))
        .collect();
    maps.sort();
    maps.into_iter().next()
}

