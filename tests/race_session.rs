//! End-to-end session: a circuit with a pit lane, driven through the lap
//! timer, pit timer and fuel tracker together the way the render loop feeds
//! them.

use std::time::{Duration, Instant};

use opentpt::config::{Config, PitMode};
use opentpt::engines::fuel::FuelTracker;
use opentpt::engines::lap::track::{Track, TrackKind};
use opentpt::engines::lap::{LapEvent, LapTimer};
use opentpt::engines::pit::{PitEvent, PitTimer, PitWaypoint};
use opentpt::geo::{LatLon, Polyline, Segment};
use opentpt::handlers::gps::GpsFix;

const LAP_LEN_M: f64 = 3_000.0;
const SPEED_KMH: f64 = 100.0;
const RADIUS_M: f64 = LAP_LEN_M / std::f64::consts::TAU;
/// The pit lane runs outside the racing line between azimuths 55 and 75.
const LANE_OFFSET_M: f64 = 50.0;

fn radial(centre: LatLon, az: f64, from: f64, to: f64) -> Segment {
    Segment::new(centre.destination(az, from), centre.destination(az, to))
}

fn circle_track(centre: LatLon) -> Track {
    let line = |az| radial(centre, az, RADIUS_M - 20.0, RADIUS_M + 20.0);
    Track {
        name: "e2e circuit".into(),
        kind: TrackKind::Circuit,
        start_line: line(0.0),
        finish_line: line(0.0),
        sectors: vec![line(120.0), line(240.0)],
        centreline: Polyline::new(
            (0..=360).step_by(5).map(|az| centre.destination(az as f64, RADIUS_M)).collect(),
        ),
        corners: Vec::new(),
    }
}

fn pit_waypoint(centre: LatLon) -> PitWaypoint {
    // Entry/exit lines only span the lane, clear of the racing line.
    let line = |az| radial(centre, az, RADIUS_M + 30.0, RADIUS_M + 70.0);
    PitWaypoint {
        track_name: "e2e circuit".into(),
        entry_line: line(55.0),
        exit_line: line(75.0),
        mode: PitMode::EntranceToExit,
        speed_limit_kmh: 60.0,
        min_stop: Duration::ZERO,
    }
}

struct Session {
    lap: LapTimer,
    pit: PitTimer,
    fuel: FuelTracker,
    centre: LatLon,
    t0: Instant,
    prev_pos: Option<LatLon>,
    lap_events: Vec<LapEvent>,
    pit_events: Vec<PitEvent>,
}

impl Session {
    fn new() -> Self {
        let centre = LatLon::new(50.0, 8.0);
        let mut cfg = Config::default();
        cfg.fuel.smoothing_window = 3;

        let mut lap = LapTimer::new(cfg.lap.clone(), None);
        lap.load_track(circle_track(centre));
        let mut pit = PitTimer::new(cfg.pit.clone());
        pit.set_waypoint(Some(pit_waypoint(centre)));

        Session {
            lap,
            pit,
            fuel: FuelTracker::new(cfg.fuel.clone()),
            centre,
            t0: Instant::now(),
            prev_pos: None,
            lap_events: Vec::new(),
            pit_events: Vec::new(),
        }
    }

    /// One 1 Hz fix at circle azimuth `az`, `radius` metres from the centre.
    fn step(&mut self, t_s: f64, az: f64, radius: f64, speed_kmh: f64, fuel_pct: f64) {
        let pos = self.centre.destination(az, radius);
        let fix = GpsFix {
            lat: pos.lat,
            lon: pos.lon,
            speed_kmh,
            heading_deg: (az + 90.0) % 360.0,
            fix_quality: 1,
            sats: 11,
            utc: None,
            ts: self.t0 + Duration::from_secs_f64(t_s),
        };

        if let Some(prev) = self.prev_pos {
            self.fuel.feed_distance_km(prev.distance_m(&pos) / 1_000.0);
        }
        self.prev_pos = Some(pos);
        self.fuel.feed_level(fuel_pct);

        for e in self.lap.update(&fix) {
            if matches!(e, LapEvent::LapCompleted { .. }) {
                self.fuel.on_lap_complete();
            }
            self.lap_events.push(e);
        }
        self.pit_events.extend(self.pit.update(&fix));
    }
}

#[test]
fn laps_pit_stop_and_fuel_track_one_session() {
    let mut s = Session::new();
    let deg_per_s =
        (SPEED_KMH / 3.6) / RADIUS_M * 180.0 / std::f64::consts::PI;

    // Fuel burns 6 % per lap, linear in azimuth driven.
    let fuel_at = |driven_deg: f64| 100.0 - driven_deg / 360.0 * 6.0;

    // Two clean laps on the racing line.
    let mut t = 0.0;
    let mut az = -10.0;
    while az < 740.0 {
        s.step(t, az, RADIUS_M, SPEED_KMH, fuel_at(az + 10.0));
        t += 1.0;
        az += deg_per_s;
    }

    let laps: Vec<&LapEvent> = s
        .lap_events
        .iter()
        .filter(|e| matches!(e, LapEvent::LapCompleted { .. }))
        .collect();
    assert_eq!(laps.len(), 2);
    for e in &laps {
        let LapEvent::LapCompleted { total, sector_times, .. } = e else {
            unreachable!()
        };
        assert!((total.as_secs_f64() - 108.0).abs() < 1.5, "lap total {total:?}");
        assert_eq!(sector_times.len(), 3);
    }
    assert!(s.pit_events.is_empty(), "racing line never touches the pit lane");

    // Fuel: ~6 % per lap, estimate valid after 6 km of running.
    let est = s.fuel.estimate().expect("estimate valid after two laps");
    assert!((est.avg_pct_per_lap - 6.0).abs() < 1.0, "avg {}", est.avg_pct_per_lap);

    // Lap three dives into the lane: offset from the racing line between
    // azimuths 50 and 80, at pit speed.
    let lap3_end = az + 360.0;
    while az < lap3_end {
        let az_in_lap = (az + 10.0).rem_euclid(360.0);
        let in_lane = (50.0..=80.0).contains(&az_in_lap);
        let (radius, speed) = if in_lane {
            (RADIUS_M + LANE_OFFSET_M, 50.0)
        } else {
            (RADIUS_M, SPEED_KMH)
        };
        s.step(t, az, radius, speed, fuel_at(az + 10.0));
        t += 1.0;
        az += deg_per_s * speed / SPEED_KMH;
    }

    assert!(s.pit_events.contains(&PitEvent::EnteredPitLane), "{:?}", s.pit_events);
    assert!(s.pit_events.contains(&PitEvent::LeftPitLane));
    assert_eq!(
        s.pit_events
            .iter()
            .filter(|e| matches!(e, PitEvent::SpeedViolation { .. }))
            .count(),
        0,
        "50 km/h through a 60 km/h lane is legal"
    );
    let session = s.pit.session();
    assert!(session.elapsed > Duration::from_secs(5), "lane time {:?}", session.elapsed);
    assert!(session.peak_speed_kmh <= 60.0);

    // Delta exists against the reference set by the clean laps.
    assert!(s.lap.delta_s().is_some());
}
