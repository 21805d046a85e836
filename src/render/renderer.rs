//! The render loop: snapshot fan-in, engine driving and frame assembly.
//!
//! One iteration per tick of the frame clock. Every handler is polled
//! through its wait-free `latest()`; snapshots older than the stale window
//! keep being drawn but dimmed. Display errors are caught and tolerated up
//! to the retry budget, then the loop gives up with a non-zero exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::channel::Receiver;
use log::{error, info, warn};
use serde_json::json;

use crate::config::Config;
use crate::engines::copilot::{Callout, Copilot};
use crate::engines::fuel::FuelTracker;
use crate::engines::lap::{LapEvent, LapTimer};
use crate::engines::pit::{PitEvent, PitTimer};
use crate::events::AppEvent;
use crate::handlers::camera::{CameraFrame, CameraId};
use crate::handlers::corner::CornerSnapshot;
use crate::handlers::gps::GpsFix;
use crate::handlers::imu::{ImuCommand, ImuSample};
use crate::handlers::obd::ObdSnapshot;
use crate::handlers::radar::RadarSnapshot;
use crate::handlers::tpms::TpmsSnapshot;
use crate::handlers::WheelCorner;
use crate::runtime::{Handler, Snapshot};
use crate::store::{PitDb, SettingsStore, StorageLayout};
use crate::utils::counters::{RuntimeCounters, SourceHealth};
use crate::utils::logfile::DiagLog;

use super::frame::{BudgetTracker, FrameClock, SectionTimings};
use super::model::*;
use super::output::{shift_level, AudioSink, DisplayBackend, OledPanel, ShiftStrip};
use super::RenderError;

/// Every sensor handler slot; absent hardware is simply `None`.
#[derive(Default)]
pub struct Handlers {
    pub tpms: Option<Handler<TpmsSnapshot>>,
    pub gps: Option<Handler<GpsFix>>,
    pub obd: Option<Handler<ObdSnapshot>>,
    pub corners: Option<Handler<CornerSnapshot>>,
    pub radar_rear: Option<Handler<RadarSnapshot>>,
    pub radar_front: Option<Handler<RadarSnapshot>>,
    pub imu: Option<Handler<ImuSample>>,
    pub camera_rear: Option<Handler<CameraFrame>>,
    pub camera_front: Option<Handler<CameraFrame>>,
}

/// Expands an operation over every handler slot.
macro_rules! for_each_handler {
    ($self:ident, $h:ident => $body:expr) => {
        if let Some($h) = $self.tpms.as_mut() { $body }
        if let Some($h) = $self.gps.as_mut() { $body }
        if let Some($h) = $self.obd.as_mut() { $body }
        if let Some($h) = $self.corners.as_mut() { $body }
        if let Some($h) = $self.radar_rear.as_mut() { $body }
        if let Some($h) = $self.radar_front.as_mut() { $body }
        if let Some($h) = $self.imu.as_mut() { $body }
        if let Some($h) = $self.camera_rear.as_mut() { $body }
        if let Some($h) = $self.camera_front.as_mut() { $body }
    };
}

impl Handlers {
    pub fn start_all(&mut self) {
        for_each_handler!(self, h => h.start());
    }

    pub fn stop_all(&mut self, timeout: Duration) {
        for_each_handler!(self, h => {
            h.stop(timeout);
        });
    }
}

pub struct Engines {
    pub lap: LapTimer,
    pub pit: PitTimer,
    pub fuel: FuelTracker,
    pub copilot: Copilot,
}

/// Camera page state; holds the last frame during a handover so the panel
/// never shows garbage pixels.
struct CameraView {
    active: CameraId,
    switched_at: Option<Instant>,
    last_shown: Option<Arc<Snapshot<CameraFrame>>>,
}

pub struct Renderer<D: DisplayBackend> {
    cfg: Arc<ArcSwap<Config>>,
    display: D,
    audio: Box<dyn AudioSink>,
    strip: Box<dyn ShiftStrip>,
    oled: Box<dyn OledPanel>,
    handlers: Handlers,
    engines: Engines,
    events: Receiver<AppEvent>,
    counters: Arc<RuntimeCounters>,
    diag: Option<Arc<DiagLog>>,
    layout: StorageLayout,
    pit_db: Option<PitDb>,
    settings: Option<SettingsStore>,
    imu_commands: Option<crossbeam::channel::Sender<ImuCommand>>,

    page_idx: usize,
    budget: BudgetTracker,
    display_errors: u32,
    shutdown: bool,
    banner: Option<(String, Instant)>,
    pit_go: bool,

    last_gps_seq: Option<u64>,
    prev_gps: Option<GpsFix>,
    last_obd_seq: Option<u64>,
    camera: CameraView,
}

#[allow(clippy::too_many_arguments)]
impl<D: DisplayBackend> Renderer<D> {
    pub fn new(
        cfg: Arc<ArcSwap<Config>>,
        display: D,
        audio: Box<dyn AudioSink>,
        strip: Box<dyn ShiftStrip>,
        oled: Box<dyn OledPanel>,
        handlers: Handlers,
        engines: Engines,
        events: Receiver<AppEvent>,
        counters: Arc<RuntimeCounters>,
        diag: Option<Arc<DiagLog>>,
        layout: StorageLayout,
        pit_db: Option<PitDb>,
        settings: Option<SettingsStore>,
        imu_commands: Option<crossbeam::channel::Sender<ImuCommand>>,
    ) -> Self {
        let c = cfg.load();
        let budget = BudgetTracker::new(c.render.render_budget, c.render.budget_warn_after);
        let usb_missing = !layout.is_removable();
        let mut renderer = Self {
            cfg,
            display,
            audio,
            strip,
            oled,
            handlers,
            engines,
            events,
            counters,
            diag,
            layout,
            pit_db,
            settings,
            imu_commands,
            page_idx: 0,
            budget,
            display_errors: 0,
            shutdown: false,
            banner: None,
            pit_go: false,
            last_gps_seq: None,
            prev_gps: None,
            last_obd_seq: None,
            camera: CameraView { active: CameraId::Rear, switched_at: None, last_shown: None },
        };
        if usb_missing {
            renderer.set_banner("USB storage missing - settings will not persist");
        }
        renderer
    }

    /// Fixed-rate loop; returns only on shutdown or an exhausted retry
    /// budget.
    pub fn run(&mut self) -> Result<(), RenderError> {
        let fps = self.cfg.load().render.fps_target;
        let mut clock = FrameClock::new(fps);
        info!("render loop up at {fps} fps");
        while !self.shutdown {
            clock.wait_next();
            self.tick()?;
        }
        info!("render loop shut down cleanly");
        Ok(())
    }

    /// One frame. Display failures are caught here; the error return only
    /// fires once the retry budget is spent.
    pub fn tick(&mut self) -> Result<(), RenderError> {
        let mut timings = SectionTimings::default();

        timings.time("events", || self.process_events());
        timings.time("engines", || self.drive_engines());
        let frame = timings.time("build", || self.build_frame());
        let presented = timings.time("present", || self.display.present(&frame));
        timings.time("aux", || self.drive_secondary(&frame));

        match presented {
            Ok(()) => {
                self.counters.inc_frame();
            }
            Err(e) => {
                self.display_errors += 1;
                self.counters.inc_display_error();
                error!("display error {}/{}: {e}", self.display_errors, self.crash_budget());
                if self.display_errors > self.crash_budget() {
                    return Err(RenderError::RetriesExhausted(self.display_errors));
                }
            }
        }

        if self.budget.record(&timings) {
            self.counters.inc_overrun();
        }
        self.refresh_source_health();
        Ok(())
    }

    fn crash_budget(&self) -> u32 {
        self.cfg.load().render.crash_retry_budget
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn handlers_mut(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    pub fn engines_mut(&mut self) -> &mut Engines {
        &mut self.engines
    }

    fn set_banner(&mut self, text: &str) {
        self.banner = Some((text.to_string(), Instant::now() + Duration::from_secs(4)));
    }

    // ---- input dispatch ----

    fn process_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                AppEvent::NextPage => self.cycle_page(1),
                AppEvent::PrevPage => self.cycle_page(-1),
                AppEvent::MarkPitEntry => self.mark_pit(true),
                AppEvent::MarkPitExit => self.mark_pit(false),
                AppEvent::TogglePitMode => {
                    let mode = self.engines.pit.toggle_mode();
                    self.persist_pit_waypoint();
                    self.set_banner(&format!("pit mode: {mode:?}"));
                }
                AppEvent::ToggleCopilot => self.toggle_copilot(),
                AppEvent::SelectCamera(id) => {
                    if id != self.camera.active {
                        self.camera.active = id;
                        self.camera.switched_at = Some(Instant::now());
                    }
                }
                AppEvent::BrightnessUp => self.adjust_brightness(0.1),
                AppEvent::BrightnessDown => self.adjust_brightness(-0.1),
                AppEvent::RecalibrateImu => {
                    if let Some(tx) = &self.imu_commands {
                        let _ = tx.try_send(ImuCommand::Recalibrate);
                        self.set_banner("IMU recalibrating - keep the car still");
                    }
                }
                AppEvent::ExportSession => self.export_session(),
                AppEvent::Shutdown => self.shutdown = true,
            }
        }
        if let Some((_, until)) = &self.banner {
            if Instant::now() >= *until {
                self.banner = None;
            }
        }
    }

    fn pages(&self) -> Vec<Page> {
        let cfg = self.cfg.load();
        let en = cfg.display.pages_enabled;
        let mut pages = Vec::new();
        if en.telemetry {
            pages.push(Page::Telemetry);
        }
        if en.gmeter {
            pages.push(Page::GMeter);
        }
        if en.lap {
            pages.push(Page::Lap);
        }
        if en.fuel {
            pages.push(Page::Fuel);
        }
        if en.copilot {
            pages.push(Page::Copilot);
        }
        if self.handlers.camera_rear.is_some() || self.handlers.camera_front.is_some() {
            pages.push(Page::Camera);
        }
        if pages.is_empty() {
            pages.push(Page::Telemetry);
        }
        pages
    }

    fn cycle_page(&mut self, dir: i32) {
        let n = self.pages().len() as i32;
        self.page_idx = ((self.page_idx as i32 + dir).rem_euclid(n)) as usize;
    }

    pub fn active_page(&self) -> Page {
        let pages = self.pages();
        pages[self.page_idx.min(pages.len() - 1)]
    }

    fn mark_pit(&mut self, entry: bool) {
        let Some(fix) = self.prev_gps.clone() else {
            self.set_banner("no GPS fix - cannot mark pit line");
            return;
        };
        if !fix.has_fix() {
            self.set_banner("no GPS fix - cannot mark pit line");
            return;
        }
        let line_width_m = self.cfg.load().lap.line_width_m;
        let track = self
            .engines
            .lap
            .track()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "default".to_string());
        if entry {
            self.engines.pit.mark_entry(&track, fix.position(), fix.heading_deg, line_width_m);
            self.set_banner("pit entry marked");
        } else {
            self.engines.pit.mark_exit(&track, fix.position(), fix.heading_deg, line_width_m);
            self.set_banner("pit exit marked");
        }
        self.persist_pit_waypoint();
    }

    fn persist_pit_waypoint(&mut self) {
        let Some(wp) = self.engines.pit.waypoint().cloned() else {
            return;
        };
        if let Some(db) = self.pit_db.as_mut() {
            if let Err(e) = db.save(&wp) {
                warn!("pit waypoint not saved: {e}");
                self.set_banner("pit waypoint not saved");
            }
        }
    }

    fn toggle_copilot(&mut self) {
        use crate::engines::copilot::CopilotStatus;
        if matches!(self.engines.copilot.status(), CopilotStatus::Disabled | CopilotStatus::Error(_)) {
            // First map file under copilot/maps wins.
            let map = std::fs::read_dir(self.layout.maps_dir())
                .ok()
                .and_then(|entries| {
                    let mut maps: Vec<_> = entries
                        .flatten()
                        .map(|e| e.path())
                        .filter(|p| {
                            p.to_string_lossy().ends_with(".roads.db")
                                || p.extension().map_or(false, |e| e == "db")
                        })
                        .collect();
                    maps.sort();
                    maps.into_iter().next()
                });
            match map {
                Some(path) => {
                    self.engines.copilot.enable(path);
                    self.set_banner("copilot loading...");
                }
                None => self.set_banner("no roads database on storage"),
            }
        } else {
            self.engines.copilot.disable();
            self.set_banner("copilot off");
        }
    }

    fn adjust_brightness(&mut self, delta: f64) {
        let current = self.cfg.load_full();
        let mut next = (*current).clone();
        next.display.brightness = (next.display.brightness + delta).clamp(0.05, 1.0);
        let value = next.display.brightness;
        self.cfg.store(Arc::new(next));
        if let Some(settings) = self.settings.as_mut() {
            settings.set("display.brightness", json!(value));
            if let Err(e) = settings.save() {
                warn!("settings not saved: {e}");
                self.set_banner("settings not saved");
            }
        }
    }

    fn export_session(&mut self) {
        let path = self.layout.session_export_file();
        match crate::utils::export::export_session(&path, self.engines.lap.completed_laps()) {
            Ok(rows) => {
                self.set_banner(&format!("exported {rows} laps"));
                if let Some(d) = &self.diag {
                    d.record("export", format!("{rows} laps -> {}", path.display()));
                }
            }
            Err(e) => {
                warn!("session export failed: {e}");
                self.set_banner("export failed");
            }
        }
    }

    // ---- engine driving ----

    fn drive_engines(&mut self) {
        let cfg = self.cfg.load_full();

        let gps_snap = self.handlers.gps.as_ref().and_then(|h| h.latest());
        if let Some(snap) = gps_snap {
            if Some(snap.seq) != self.last_gps_seq {
                self.last_gps_seq = Some(snap.seq);
                let fix = snap.payload.clone();

                if fix.has_fix() {
                    if let Some(prev) = &self.prev_gps {
                        if prev.has_fix() {
                            let km = prev.position().distance_m(&fix.position()) / 1_000.0;
                            self.engines.fuel.feed_distance_km(km);
                        }
                    }
                }

                let lap_events = self.engines.lap.update(&fix);
                for e in lap_events {
                    self.on_lap_event(e);
                }
                let pit_events = self.engines.pit.update(&fix);
                for e in pit_events {
                    self.on_pit_event(e);
                }
                let callouts = self.engines.copilot.update(&fix);
                for c in callouts {
                    self.on_callout(c, cfg.copilot.audio_enabled);
                }
                self.prev_gps = Some(fix);
            }
        }

        let obd_snap = self.handlers.obd.as_ref().and_then(|h| h.latest());
        if let Some(snap) = obd_snap {
            if Some(snap.seq) != self.last_obd_seq {
                self.last_obd_seq = Some(snap.seq);
                if let Some(fuel) = snap.payload.fuel_pct {
                    self.engines.fuel.feed_level(fuel);
                }
            }
        }
    }

    fn on_lap_event(&mut self, event: LapEvent) {
        match event {
            LapEvent::LapCompleted { number, total, .. } => {
                self.engines.fuel.on_lap_complete();
                self.set_banner(&format!("lap {number}: {:.1}s", total.as_secs_f64()));
                if let Some(d) = &self.diag {
                    d.record("lap", format!("lap {number} complete: {:.3}s", total.as_secs_f64()));
                }
            }
            LapEvent::NewSessionBest { total } => {
                self.set_banner(&format!("NEW BEST {:.1}s", total.as_secs_f64()));
            }
            LapEvent::StageFinished { total } => {
                self.set_banner(&format!("stage finish: {:.1}s", total.as_secs_f64()));
            }
            LapEvent::LapStarted { .. } | LapEvent::SectorCompleted { .. } => {}
        }
    }

    fn on_pit_event(&mut self, event: PitEvent) {
        let audio_on = self.cfg.load().copilot.audio_enabled;
        match event {
            PitEvent::Go => {
                self.pit_go = true;
                if audio_on {
                    self.audio.speak("go go go");
                }
            }
            PitEvent::EnteredPitLane => {
                self.pit_go = false;
                self.set_banner("pit lane");
            }
            PitEvent::SpeedViolation { speed_kmh } => {
                self.set_banner(&format!("PIT SPEED {speed_kmh:.0}"));
                if let Some(d) = &self.diag {
                    d.record("pit", format!("speed violation at {speed_kmh:.1} km/h"));
                }
            }
            PitEvent::LeftPitLane => {
                self.pit_go = false;
            }
            _ => {}
        }
    }

    fn on_callout(&mut self, c: Callout, audio_enabled: bool) {
        if audio_enabled {
            self.audio.speak(&c.text);
        }
        if let Some(d) = &self.diag {
            d.record("copilot", format!("{} at {:.0}m", c.text, c.distance_m));
        }
    }

    // ---- frame assembly ----

    fn badge_of<T: Send + Sync + 'static>(h: &Option<Handler<T>>, now: Instant, stale_after: Duration) -> Badge {
        match h {
            None => Badge::Absent,
            Some(h) if h.is_degraded() => Badge::Absent,
            Some(h) => match h.latest() {
                None => Badge::Absent,
                Some(s) if s.age(now) > stale_after => Badge::Stale,
                Some(_) => Badge::Ok,
            },
        }
    }

    fn build_frame(&mut self) -> DisplayFrame {
        let cfg = self.cfg.load_full();
        let now = Instant::now();
        let stale = cfg.render.stale_timeout;

        let gps = self.handlers.gps.as_ref().and_then(|h| h.latest());
        let page = self.active_page();

        let status = StatusBar {
            gps_fix: gps.as_ref().map_or(false, |s| s.payload.has_fix()),
            sats: gps.as_ref().map_or(0, |s| s.payload.sats),
            usb_missing: !self.layout.is_removable(),
            sources: vec![
                ("tpms", Self::badge_of(&self.handlers.tpms, now, stale)),
                ("gps", Self::badge_of(&self.handlers.gps, now, stale)),
                ("obd", Self::badge_of(&self.handlers.obd, now, stale)),
                ("corners", Self::badge_of(&self.handlers.corners, now, stale)),
                ("radar", Self::badge_of(&self.handlers.radar_rear, now, stale)),
                ("imu", Self::badge_of(&self.handlers.imu, now, stale)),
            ],
            pit: Some(PitModel {
                state: self.engines.pit.state(),
                elapsed_s: self.engines.pit.session().elapsed.as_secs_f64(),
                countdown_s: self.engines.pit.countdown_remaining().map(|d| d.as_secs_f64()),
                go: self.pit_go,
                violations: self.engines.pit.session().violations,
            }),
            fuel_status: self.engines.fuel.status(),
            banner: self.banner.as_ref().map(|(t, _)| t.clone()),
        };

        let content = match page {
            Page::Telemetry => PageContent::Telemetry(self.telemetry_model(&cfg, now, stale)),
            Page::GMeter => PageContent::GMeter(self.gmeter_model()),
            Page::Lap => PageContent::Lap(self.lap_model(now)),
            Page::Fuel => PageContent::Fuel(self.fuel_model()),
            Page::Copilot => PageContent::Copilot(CopilotModel {
                status: self.engines.copilot.status().clone(),
                next_note: self.engines.copilot.overlay().next_note.clone(),
                next_note_ahead_m: self.engines.copilot.overlay().next_note_ahead_m,
            }),
            Page::Camera => PageContent::Camera(self.camera_model(&cfg)),
        };

        DisplayFrame {
            page,
            brightness: cfg.display.brightness,
            units: cfg.units,
            status,
            content,
        }
    }

    fn telemetry_model(&self, cfg: &Config, now: Instant, stale: Duration) -> TelemetryModel {
        let tpms = self.handlers.tpms.as_ref().and_then(|h| h.latest());
        let corners = self.handlers.corners.as_ref().and_then(|h| h.latest());
        let obd = self.handlers.obd.as_ref().and_then(|h| h.latest());
        let radar = self.handlers.radar_rear.as_ref().and_then(|h| h.latest());

        let mut tyres = std::collections::HashMap::new();
        for corner in WheelCorner::ALL {
            let reading = tpms.as_ref().and_then(|s| s.payload.get(corner).copied());
            let surface = corners.as_ref().and_then(|s| s.payload.corners.get(&corner).copied());

            let pressure_alarm = match reading {
                Some(r)
                    if r.pressure_kpa < cfg.thresholds.tyre.pressure_low_kpa * 0.85
                        || r.pressure_kpa > cfg.thresholds.tyre.pressure_high_kpa * 1.15 =>
                {
                    AlarmLevel::Critical
                }
                Some(r)
                    if r.pressure_kpa < cfg.thresholds.tyre.pressure_low_kpa
                        || r.pressure_kpa > cfg.thresholds.tyre.pressure_high_kpa =>
                {
                    AlarmLevel::Warning
                }
                _ => AlarmLevel::None,
            };
            let temp_alarm = match reading.map(|r| r.temp_c) {
                Some(t) if t >= cfg.thresholds.tyre.hot_c => AlarmLevel::Critical,
                Some(t) if t >= cfg.thresholds.tyre.warn_c => AlarmLevel::Warning,
                _ => AlarmLevel::None,
            };
            let badge = match (&reading, &surface) {
                (None, None) => Badge::Absent,
                (Some(r), _) if now.saturating_duration_since(r.received_at) > stale => Badge::Stale,
                (_, Some(s)) if s.stale => Badge::Stale,
                _ => Badge::Ok,
            };

            tyres.insert(
                corner,
                TyreModel {
                    pressure_kpa: reading.map(|r| r.pressure_kpa),
                    temp_c: reading.map(|r| r.temp_c),
                    surface_c: surface.map(|s| {
                        let flip = match corner {
                            WheelCorner::FrontLeft => cfg.tyre_flip.fl,
                            WheelCorner::FrontRight => cfg.tyre_flip.fr,
                            WheelCorner::RearLeft => cfg.tyre_flip.rl,
                            WheelCorner::RearRight => cfg.tyre_flip.rr,
                        };
                        if flip {
                            (s.right_c, s.centre_c, s.left_c)
                        } else {
                            (s.left_c, s.centre_c, s.right_c)
                        }
                    }),
                    brake_c: surface.map(|s| (s.brake_inner_c, s.brake_outer_c)),
                    pressure_alarm,
                    temp_alarm,
                    badge,
                },
            );
        }

        TelemetryModel {
            tyres,
            speed_kmh: obd.as_ref().and_then(|s| s.payload.speed_kmh),
            rpm: obd.as_ref().and_then(|s| s.payload.rpm),
            coolant_c: obd.as_ref().and_then(|s| s.payload.coolant_c),
            map_kpa: obd.as_ref().and_then(|s| s.payload.map_kpa),
            gear: obd.as_ref().and_then(|s| s.payload.gear),
            radar_tracks: radar.map(|s| s.payload.tracks.clone()).unwrap_or_default(),
        }
    }

    fn gmeter_model(&self) -> GMeterModel {
        match self.handlers.imu.as_ref().and_then(|h| h.latest()) {
            Some(s) => GMeterModel {
                lat_g: s.payload.accel_g[0],
                lon_g: s.payload.accel_g[1],
                yaw_dps: s.payload.gyro_dps[2],
            },
            None => GMeterModel::default(),
        }
    }

    fn lap_model(&self, now: Instant) -> LapModel {
        let lap = &self.engines.lap;
        LapModel {
            lap_number: lap.current_lap_number(),
            current_s: lap.current_lap_time(now).map(|d| d.as_secs_f64()),
            last_s: lap
                .completed_laps()
                .last()
                .and_then(|l| l.total_time)
                .map(|d| d.as_secs_f64()),
            best_s: lap.best_time().map(|d| d.as_secs_f64()),
            delta_s: lap.delta_s(),
            sector_times_s: lap
                .completed_laps()
                .last()
                .map(|l| l.sector_times.iter().map(|d| d.as_secs_f64()).collect())
                .unwrap_or_default(),
            track_name: lap.track().map(|t| t.name.clone()),
        }
    }

    fn fuel_model(&self) -> FuelModel {
        let fuel = &self.engines.fuel;
        let est = fuel.estimate();
        FuelModel {
            level_pct: fuel.smoothed_level_pct(),
            avg_pct_per_lap: est.map(|e| e.avg_pct_per_lap),
            laps_remaining: est.map(|e| e.laps_remaining),
            range_km: fuel.range_km(),
            status: Some(fuel.status()),
        }
    }

    fn camera_model(&mut self, cfg: &Config) -> CameraModel {
        let handler = match self.camera.active {
            CameraId::Rear => &self.handlers.camera_rear,
            CameraId::Front => &self.handlers.camera_front,
        };
        let prefs = match self.camera.active {
            CameraId::Rear => cfg.camera_rear,
            CameraId::Front => cfg.camera_front,
        };
        let latest = handler.as_ref().and_then(|h| h.latest());

        // During a handover keep the previous frame until the new camera has
        // produced one after the switch.
        if let Some(switched) = self.camera.switched_at {
            match &latest {
                Some(snap) if snap.publish_ts > switched => {
                    self.camera.switched_at = None;
                }
                _ => {
                    return CameraModel {
                        frame: self
                            .camera
                            .last_shown
                            .as_ref()
                            .map(|s| Arc::new(s.payload.clone())),
                        frozen: true,
                        prefs,
                    };
                }
            }
        }

        if let Some(snap) = &latest {
            self.camera.last_shown = Some(Arc::clone(snap));
        }
        CameraModel {
            frame: latest.map(|s| Arc::new(s.payload.clone())),
            frozen: false,
            prefs,
        }
    }

    // ---- secondary outputs ----

    fn drive_secondary(&mut self, frame: &DisplayFrame) {
        let shift = self.cfg.load().thresholds.shift;

        let rpm = self
            .handlers
            .obd
            .as_ref()
            .and_then(|h| h.latest())
            .and_then(|s| s.payload.rpm);
        if let Some(rpm) = rpm {
            let (frac, over) = shift_level(rpm, shift.warn_rpm, shift.shift_rpm);
            self.strip.set_level(frac, over);
        }

        let line1 = match &frame.content {
            PageContent::Lap(l) => match l.current_s {
                Some(t) => format!("lap {:.1}", t),
                None => "lap --".to_string(),
            },
            _ => format!("{:?}", frame.page),
        };
        let line2 = match self.engines.lap.delta_s() {
            Some(d) => format!("{:+.2}", d),
            None => "--".to_string(),
        };
        self.oled.show(&line1, &line2);
    }

    fn refresh_source_health(&self) {
        let now = Instant::now();
        let stale = self.cfg.load().render.stale_timeout;
        self.counters.record_source("tpms", health_of(&self.handlers.tpms, now, stale));
        self.counters.record_source("gps", health_of(&self.handlers.gps, now, stale));
        self.counters.record_source("obd", health_of(&self.handlers.obd, now, stale));
        self.counters.record_source("corners", health_of(&self.handlers.corners, now, stale));
        self.counters
            .record_source("radar_rear", health_of(&self.handlers.radar_rear, now, stale));
        self.counters
            .record_source("radar_front", health_of(&self.handlers.radar_front, now, stale));
        self.counters.record_source("imu", health_of(&self.handlers.imu, now, stale));
    }
}

fn health_of<T: Send + Sync + 'static>(
    h: &Option<Handler<T>>,
    now: Instant,
    stale: Duration,
) -> SourceHealth {
    match h {
        None => SourceHealth { absent: true, ..Default::default() },
        Some(h) => SourceHealth {
            published: h.published(),
            frames_dropped: h.frames_dropped(),
            update_rate_hz: h.update_rate_hz(),
            stale: h.latest().map_or(false, |s| s.age(now) > stale),
            absent: h.is_degraded() || h.latest().is_none(),
        },
    }
}
