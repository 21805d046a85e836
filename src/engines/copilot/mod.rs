//! CoPilot: road projection and rally-style corner callouts.
//!
//! Once per update interval the pipeline locates the road being driven
//! (loaded-track centreline in route-follow, otherwise the roads database),
//! projects the car onto it, scans the look-ahead window for corners and
//! junctions, and emits pace-notes as they come due. Map loading runs on a
//! worker thread so enabling CoPilot never stalls a frame.

pub mod notes;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver};
use log::{error, info, warn};

use crate::config::{CopilotConfig, CopilotMode};
use crate::engines::lap::corners::{detect_corners, DetectorParams};
use crate::geo::{heading_diff_deg, LatLon, Polyline};
use crate::handlers::gps::GpsFix;
use crate::store::{RoadsDb, StoreError};

use notes::{due_distance_m, merge_notes, notes_from_corners, NoteKind, PaceNote};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopilotStatus {
    Disabled,
    Loading,
    Active,
    NoPath,
    Error(String),
}

/// A spoken/displayed callout.
#[derive(Debug, Clone, PartialEq)]
pub struct Callout {
    pub text: String,
    pub distance_m: f64,
    pub severity: Option<u8>,
}

/// Overlay model read by the renderer each frame.
#[derive(Debug, Clone, Default)]
pub struct CopilotOverlay {
    pub next_note: Option<PaceNote>,
    pub next_note_ahead_m: Option<f64>,
    pub upcoming: Vec<PaceNote>,
}

struct ActivePath {
    polyline: Polyline,
    /// Merged notes, stationed along `polyline`.
    notes: Vec<PaceNote>,
    /// Where the path was fetched; moving far from here forces a refetch.
    fetched_at: LatLon,
    road_id: Option<i64>,
}

pub struct Copilot {
    cfg: CopilotConfig,
    status: CopilotStatus,
    roads: Option<RoadsDb>,
    load_rx: Option<Receiver<Result<RoadsDb, StoreError>>>,
    /// Track centreline used in route-follow mode.
    route: Option<Polyline>,
    path: Option<ActivePath>,
    last_run: Option<Instant>,
    spoken: HashSet<String>,
    overlay: CopilotOverlay,
}

impl Copilot {
    pub fn new(cfg: CopilotConfig) -> Self {
        Self {
            cfg,
            status: CopilotStatus::Disabled,
            roads: None,
            load_rx: None,
            route: None,
            path: None,
            last_run: None,
            spoken: HashSet::new(),
            overlay: CopilotOverlay::default(),
        }
    }

    /// Test/route-follow constructor with an already-open map.
    pub fn with_roads(cfg: CopilotConfig, roads: RoadsDb) -> Self {
        let mut c = Self::new(cfg);
        c.roads = Some(roads);
        c.status = CopilotStatus::Active;
        c
    }

    pub fn status(&self) -> &CopilotStatus {
        &self.status
    }

    pub fn overlay(&self) -> &CopilotOverlay {
        &self.overlay
    }

    pub fn mode(&self) -> CopilotMode {
        self.cfg.mode
    }

    /// Installs the loaded track's centreline for route-follow mode.
    pub fn set_route(&mut self, route: Option<Polyline>) {
        self.route = route;
        self.path = None;
        self.spoken.clear();
    }

    /// Starts loading the map on a worker thread; the UI sees "loading" until
    /// it completes.
    pub fn enable(&mut self, map_path: PathBuf) {
        if matches!(self.status, CopilotStatus::Loading) {
            return;
        }
        info!("copilot enabling, loading {}", map_path.display());
        let (tx, rx) = bounded(1);
        std::thread::Builder::new()
            .name("copilot-load".into())
            .spawn(move || {
                let _ = tx.send(RoadsDb::open(&map_path));
            })
            .ok();
        self.load_rx = Some(rx);
        self.status = CopilotStatus::Loading;
    }

    pub fn disable(&mut self) {
        self.status = CopilotStatus::Disabled;
        self.path = None;
        self.overlay = CopilotOverlay::default();
        self.spoken.clear();
    }

    fn poll_load(&mut self) {
        let Some(rx) = &self.load_rx else {
            return;
        };
        match rx.try_recv() {
            Ok(Ok(db)) => {
                info!("copilot map ready");
                self.roads = Some(db);
                self.status = CopilotStatus::Active;
                self.load_rx = None;
            }
            Ok(Err(e)) => {
                // Corrupt or unreadable map: disable with a visible error.
                error!("copilot map load failed: {e}");
                self.status = CopilotStatus::Error(e.to_string());
                self.load_rx = None;
            }
            Err(_) => {}
        }
    }

    /// Drives the pipeline; returns callouts that became due this cycle.
    pub fn update(&mut self, fix: &GpsFix) -> Vec<Callout> {
        self.poll_load();
        if !matches!(self.status, CopilotStatus::Active | CopilotStatus::NoPath) {
            return Vec::new();
        }
        if !fix.has_fix() {
            return Vec::new();
        }
        if let Some(last) = self.last_run {
            if fix.ts.saturating_duration_since(last) < self.cfg.update_interval {
                return Vec::new();
            }
        }
        self.last_run = Some(fix.ts);

        let pos = fix.position();
        self.ensure_path(&pos, fix.heading_deg);
        if matches!(self.status, CopilotStatus::Error(_)) {
            self.overlay = CopilotOverlay::default();
            return Vec::new();
        }

        let Some(path) = &self.path else {
            self.status = CopilotStatus::NoPath;
            self.overlay = CopilotOverlay::default();
            return Vec::new();
        };
        self.status = CopilotStatus::Active;

        let Some(m) = path.polyline.project(&pos) else {
            return Vec::new();
        };
        let s = m.station_m;

        // Overlay: everything still ahead inside the look-ahead window.
        let upcoming: Vec<PaceNote> = path
            .notes
            .iter()
            .filter(|n| n.station_m > s && n.station_m - s <= self.cfg.lookahead_m)
            .cloned()
            .collect();
        self.overlay = CopilotOverlay {
            next_note: upcoming.first().cloned(),
            next_note_ahead_m: upcoming.first().map(|n| n.station_m - s),
            upcoming: upcoming.clone(),
        };

        // Emit notes whose lead distance has been reached, once each.
        let mut due = Vec::new();
        for note in &upcoming {
            let ahead = note.station_m - s;
            if ahead <= due_distance_m(note.severity, &self.cfg.callout_brackets_m) {
                let key = format!("{}@{:.0}", note.callout_text, note.station_m);
                if self.spoken.insert(key) {
                    due.push(Callout {
                        text: note.callout_text.clone(),
                        distance_m: ahead,
                        severity: note.severity,
                    });
                }
            }
        }
        due
    }

    /// Ensures an active path exists and is fresh enough for `pos`.
    fn ensure_path(&mut self, pos: &LatLon, heading_deg: f64) {
        let needs_refetch = match &self.path {
            None => true,
            Some(p) => p.fetched_at.distance_m(pos) > self.cfg.refetch_distance_m,
        };
        if !needs_refetch {
            return;
        }

        let built = if self.cfg.mode == CopilotMode::RouteFollow && self.route.is_some() {
            self.route
                .clone()
                .map(|polyline| self.build_path(polyline, *pos, None))
        } else {
            self.locate_road(pos, heading_deg)
                .map(|(polyline, id)| self.build_path(polyline, *pos, Some(id)))
        };
        self.path = built;
        if self.path.is_none() {
            self.spoken.clear();
        }
    }

    /// Road choice: tangent within the heading tolerance wins; otherwise the
    /// nearest road inside the fallback radius regardless of heading.
    fn locate_road(&mut self, pos: &LatLon, heading_deg: f64) -> Option<(Polyline, i64)> {
        let roads = self.roads.as_mut()?;
        let candidates = match roads.roads_within(pos, self.cfg.road_search_radius_m) {
            Ok(c) => c,
            Err(e) => {
                error!("roads query failed, disabling copilot: {e}");
                self.status = CopilotStatus::Error(e.to_string());
                return None;
            }
        };
        if candidates.is_empty() {
            return None;
        }

        let mut best: Option<(f64, Polyline, i64)> = None; // keyed by offset
        let mut fallback: Option<(f64, Polyline, i64)> = None;
        for road in candidates {
            if road.points.len() < 2 {
                continue;
            }
            let line = Polyline::new(road.points.clone());
            let Some(m) = line.project(pos) else {
                continue;
            };
            let Some(tangent) = line.tangent_deg_at(m.station_m) else {
                continue;
            };
            // A polyline can be digitised against the driving direction.
            let diff = heading_diff_deg(tangent, heading_deg)
                .min(heading_diff_deg((tangent + 180.0) % 360.0, heading_deg));

            if diff <= self.cfg.heading_tolerance_deg
                && best.as_ref().map_or(true, |(o, _, _)| m.offset_m < *o)
            {
                best = Some((m.offset_m, line.clone(), road.id));
            }
            if m.offset_m <= self.cfg.fallback_radius_m
                && fallback.as_ref().map_or(true, |(o, _, _)| m.offset_m < *o)
            {
                fallback = Some((m.offset_m, line, road.id));
            }
        }

        match best.or(fallback) {
            Some((_, line, id)) => Some((line, id)),
            None => {
                warn!("no road matches heading {heading_deg:.0} within tolerance");
                None
            }
        }
    }

    /// Detects corners over the look-ahead window and plans merged notes.
    fn build_path(&self, polyline: Polyline, fetched_at: LatLon, road_id: Option<i64>) -> ActivePath {
        let params = DetectorParams {
            min_angle_deg: self.cfg.min_corner_angle_deg,
            min_radius_m: self.cfg.min_corner_radius_m,
            ..DetectorParams::default()
        };
        let corners = detect_corners(
            polyline.points(),
            &params,
            crate::config::CornerDetectorKind::Hybrid,
        );
        let mut planned = notes_from_corners(&corners, |idx| polyline.station_of(idx));

        // Hairpins double as hazards on open roads: call caution early.
        for c in &corners {
            if c.severity_asc >= 6 {
                planned.push(PaceNote {
                    kind: NoteKind::Hazard,
                    station_m: polyline.station_of(c.entry_idx),
                    callout_text: "caution".into(),
                    severity: Some(c.severity_asc),
                });
            }
        }

        let notes = merge_notes(planned, self.cfg.note_merge_distance_m);
        ActivePath { polyline, notes, fetched_at, road_id }
    }

    pub fn active_road_id(&self) -> Option<i64> {
        self.path.as_ref().and_then(|p| p.road_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg() -> CopilotConfig {
        CopilotConfig {
            enabled: true,
            mode: CopilotMode::JustDrive,
            audio_enabled: true,
            update_interval: Duration::ZERO,
            road_search_radius_m: 150.0,
            heading_tolerance_deg: 45.0,
            fallback_radius_m: 30.0,
            lookahead_m: 1000.0,
            refetch_distance_m: 500.0,
            note_merge_distance_m: 50.0,
            callout_brackets_m: vec![100.0, 200.0, 500.0, 1000.0],
            min_corner_radius_m: 15.0,
            min_corner_angle_deg: 12.0,
        }
    }

    fn fix_at(pos: LatLon, heading: f64, t0: Instant, t_s: f64) -> GpsFix {
        GpsFix {
            lat: pos.lat,
            lon: pos.lon,
            speed_kmh: 80.0,
            heading_deg: heading,
            fix_quality: 1,
            sats: 10,
            utc: None,
            ts: t0 + Duration::from_secs_f64(t_s),
        }
    }

    fn straight_road(db: &mut RoadsDb, origin: LatLon, bearing: f64, name: &str) -> i64 {
        let pts: Vec<LatLon> =
            (0..40).map(|i| origin.destination(bearing, i as f64 * 50.0)).collect();
        db.insert_road(Some(name), &pts).unwrap()
    }

    /// Straight approach then a 90-degree right at `corner_at_m`.
    fn road_with_corner(db: &mut RoadsDb, origin: LatLon, corner_at_m: f64) -> i64 {
        let mut pts = Vec::new();
        let mut pos = origin;
        let mut heading = 90.0;
        let step = 20.0;
        let straight_steps = (corner_at_m / step) as usize;
        for _ in 0..straight_steps {
            pts.push(pos);
            pos = pos.destination(heading, step);
        }
        let turn = (step / 40.0_f64).to_degrees(); // 40 m radius
        for _ in 0..((90.0 / turn) as usize) {
            pts.push(pos);
            heading += turn;
            pos = pos.destination(heading, step);
        }
        for _ in 0..20 {
            pts.push(pos);
            pos = pos.destination(heading, step);
        }
        db.insert_road(Some("corner road"), &pts).unwrap()
    }

    #[test]
    fn heading_gate_selects_the_aligned_road() {
        let origin = LatLon::new(50.0, 8.0);
        let mut db = RoadsDb::create_in_memory().unwrap();
        let aligned = straight_road(&mut db, origin.destination(0.0, 40.0), 85.0, "aligned");
        let crossing = straight_road(&mut db, origin.destination(0.0, 60.0), 200.0, "crossing");
        let _ = crossing;

        let mut cp = Copilot::with_roads(cfg(), db);
        let t0 = Instant::now();
        cp.update(&fix_at(origin, 90.0, t0, 0.0));

        assert_eq!(cp.status(), &CopilotStatus::Active);
        assert_eq!(cp.active_road_id(), Some(aligned), "085 tangent beats 200 for heading 090");
    }

    #[test]
    fn fallback_picks_nearest_road_when_heading_disagrees() {
        let origin = LatLon::new(50.0, 8.0);
        let mut db = RoadsDb::create_in_memory().unwrap();
        // Only a perpendicular road, 20 m away: heading gate fails, the 30 m
        // nearest-road fallback still locks on.
        let id = straight_road(&mut db, origin.destination(0.0, 20.0), 0.0, "perp");
        let mut cp = Copilot::with_roads(cfg(), db);
        let t0 = Instant::now();
        cp.update(&fix_at(origin, 90.0, t0, 0.0));
        assert_eq!(cp.active_road_id(), Some(id));
    }

    #[test]
    fn no_road_in_radius_reports_no_path() {
        let origin = LatLon::new(50.0, 8.0);
        let mut db = RoadsDb::create_in_memory().unwrap();
        straight_road(&mut db, origin.destination(0.0, 5_000.0), 90.0, "far away");
        let mut cp = Copilot::with_roads(cfg(), db);
        let t0 = Instant::now();
        let out = cp.update(&fix_at(origin, 90.0, t0, 0.0));
        assert!(out.is_empty());
        assert_eq!(cp.status(), &CopilotStatus::NoPath);
        assert!(cp.overlay().next_note.is_none());
    }

    #[test]
    fn corner_callout_emitted_once_as_it_comes_due() {
        let origin = LatLon::new(50.0, 8.0);
        let mut db = RoadsDb::create_in_memory().unwrap();
        road_with_corner(&mut db, origin, 700.0);

        let mut cp = Copilot::with_roads(cfg(), db);
        let t0 = Instant::now();

        let mut emitted: Vec<(f64, Callout)> = Vec::new();
        // Drive east toward the corner in 25 m steps.
        for i in 0..28 {
            let east = i as f64 * 25.0;
            let pos = origin.destination(90.0, east);
            for c in cp.update(&fix_at(pos, 90.0, t0, i as f64)) {
                emitted.push((east, c));
            }
        }

        let corner_calls: Vec<&(f64, Callout)> =
            emitted.iter().filter(|(_, c)| c.text.contains("right")).collect();
        assert_eq!(corner_calls.len(), 1, "emitted: {emitted:?}");
        let (at_east, call) = corner_calls[0];
        assert!(call.text.starts_with("right"), "text {}", call.text);
        // 40 m radius grades 4 -> due inside the 200 m bracket.
        assert!(call.distance_m <= 200.0 + 1.0, "ahead {}", call.distance_m);
        assert!(*at_east >= 450.0, "called at {at_east} east");
    }

    #[test]
    fn overlay_lists_upcoming_notes_in_window() {
        let origin = LatLon::new(50.0, 8.0);
        let mut db = RoadsDb::create_in_memory().unwrap();
        road_with_corner(&mut db, origin, 600.0);
        let mut cp = Copilot::with_roads(cfg(), db);
        let t0 = Instant::now();
        cp.update(&fix_at(origin, 90.0, t0, 0.0));

        let overlay = cp.overlay();
        assert!(overlay.next_note.is_some());
        let ahead = overlay.next_note_ahead_m.unwrap();
        assert!(ahead > 400.0 && ahead < 900.0, "ahead {ahead}");
    }

    #[test]
    fn route_follow_uses_track_centreline() {
        let origin = LatLon::new(50.0, 8.0);
        let db = RoadsDb::create_in_memory().unwrap(); // empty map
        let mut c = cfg();
        c.mode = CopilotMode::RouteFollow;
        let mut cp = Copilot::with_roads(c, db);

        let route: Vec<LatLon> = (0..40).map(|i| origin.destination(90.0, i as f64 * 25.0)).collect();
        cp.set_route(Some(Polyline::new(route)));

        let t0 = Instant::now();
        cp.update(&fix_at(origin, 90.0, t0, 0.0));
        assert_eq!(cp.status(), &CopilotStatus::Active, "route works without any roads");
        assert_eq!(cp.active_road_id(), None);
    }

    #[test]
    fn corrupt_map_disables_with_error_status() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("roads.db");
        std::fs::write(&path, b"garbage").unwrap();

        let mut cp = Copilot::new(cfg());
        cp.enable(path);
        assert_eq!(cp.status(), &CopilotStatus::Loading);

        let deadline = Instant::now() + Duration::from_secs(2);
        while matches!(cp.status(), CopilotStatus::Loading) && Instant::now() < deadline {
            cp.poll_load();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(cp.status(), CopilotStatus::Error(_)));
    }

    #[test]
    fn update_respects_interval() {
        let origin = LatLon::new(50.0, 8.0);
        let mut db = RoadsDb::create_in_memory().unwrap();
        straight_road(&mut db, origin, 90.0, "road");
        let mut c = cfg();
        c.update_interval = Duration::from_millis(200);
        let mut cp = Copilot::with_roads(c, db);
        let t0 = Instant::now();

        cp.update(&fix_at(origin, 90.0, t0, 0.0));
        let before = cp.active_road_id();
        // 50 ms later: inside the interval, no re-run.
        cp.update(&fix_at(origin.destination(90.0, 600.0), 90.0, t0, 0.05));
        assert_eq!(cp.active_road_id(), before);
    }
}
