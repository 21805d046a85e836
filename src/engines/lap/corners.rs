//! Corner detection over a positional polyline.
//!
//! Used twice: on track load for per-corner statistics, and by the CoPilot
//! look-ahead window with road-tuned thresholds. Severity follows the
//! six-grade scale, 1 = flat-out to 6 = hairpin, classified from the
//! minimum curve radius.

use crate::config::CornerDetectorKind;
use crate::geo::{EnuFrame, LatLon};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CornerDirection {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    /// Indices into the analysed point list.
    pub entry_idx: usize,
    pub apex_idx: usize,
    pub exit_idx: usize,
    pub direction: CornerDirection,
    /// 1 = flat-out … 6 = hairpin.
    pub severity_asc: u8,
    pub total_angle_deg: f64,
    pub min_radius_m: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Total bearing change below which a bend is not called.
    pub min_angle_deg: f64,
    /// Radius estimates below this are treated as GPS noise and clamped.
    pub min_radius_m: f64,
    /// Radii above this never count as turning (curve-finder gate).
    pub max_radius_m: f64,
    /// Per-point bearing change that counts as turning (threshold gate).
    pub point_turn_deg: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            min_angle_deg: 12.0,
            min_radius_m: 15.0,
            max_radius_m: 200.0,
            point_turn_deg: 3.0,
        }
    }
}

/// Severity grade from the minimum radius driven through the corner.
pub fn severity_from_radius(radius_m: f64) -> u8 {
    match radius_m {
        r if r >= 200.0 => 1,
        r if r >= 120.0 => 2,
        r if r >= 70.0 => 3,
        r if r >= 40.0 => 4,
        r if r >= 25.0 => 5,
        _ => 6,
    }
}

/// Signed bearing change at each interior point, degrees in (-180, 180].
fn turn_angles(points: &[LatLon]) -> Vec<f64> {
    let mut out = vec![0.0; points.len()];
    for i in 1..points.len().saturating_sub(1) {
        let b0 = points[i - 1].bearing_deg(&points[i]);
        let b1 = points[i].bearing_deg(&points[i + 1]);
        let mut d = b1 - b0;
        if d > 180.0 {
            d -= 360.0;
        } else if d <= -180.0 {
            d += 360.0;
        }
        out[i] = d;
    }
    out
}

/// Circumcircle radius through three consecutive points, in metres.
fn radius_at(points: &[LatLon], i: usize) -> f64 {
    if i == 0 || i + 1 >= points.len() {
        return f64::INFINITY;
    }
    let frame = EnuFrame::new(points[i]);
    let a = frame.project(&points[i - 1]);
    let b = frame.project(&points[i]);
    let c = frame.project(&points[i + 1]);

    let ab = b.sub(&a).norm();
    let bc = c.sub(&b).norm();
    let ca = a.sub(&c).norm();
    let cross = b.sub(&a).cross(&c.sub(&a));
    let area2 = cross.abs();
    if area2 < 1e-9 {
        return f64::INFINITY;
    }
    (ab * bc * ca) / (2.0 * area2)
}

/// Detects corners in `points` using the configured strategy.
pub fn detect_corners(
    points: &[LatLon],
    params: &DetectorParams,
    kind: CornerDetectorKind,
) -> Vec<Corner> {
    if points.len() < 3 {
        return Vec::new();
    }
    let turns = turn_angles(points);
    let radii: Vec<f64> = (0..points.len()).map(|i| radius_at(points, i)).collect();

    let is_turning = |i: usize| -> bool {
        let by_angle = turns[i].abs() >= params.point_turn_deg;
        let by_radius = radii[i] <= params.max_radius_m;
        match kind {
            CornerDetectorKind::Threshold | CornerDetectorKind::Asc => by_angle,
            CornerDetectorKind::CurveFinder => by_radius,
            CornerDetectorKind::Hybrid => by_angle || by_radius,
        }
    };

    let mut corners = Vec::new();
    let mut i = 1;
    while i + 1 < points.len() {
        if !is_turning(i) {
            i += 1;
            continue;
        }
        let sign = turns[i].signum();
        let entry = i;
        let mut exit = i;
        let mut gap = 0usize;
        let mut j = i + 1;
        // Extend while turning the same way, tolerating one straight sample.
        while j + 1 < points.len() && gap <= 1 {
            if is_turning(j) && turns[j].signum() == sign {
                exit = j;
                gap = 0;
            } else {
                gap += 1;
            }
            j += 1;
        }

        let total: f64 = turns[entry..=exit].iter().sum();
        let (apex_off, min_r) = radii[entry..=exit]
            .iter()
            .enumerate()
            .fold((0usize, f64::INFINITY), |(ai, ar), (k, &r)| {
                if r < ar { (k, r) } else { (ai, ar) }
            });
        let min_radius = min_r.max(params.min_radius_m);

        if total.abs() >= params.min_angle_deg {
            corners.push(Corner {
                entry_idx: entry,
                apex_idx: entry + apex_off,
                exit_idx: exit,
                direction: if total < 0.0 { CornerDirection::Left } else { CornerDirection::Right },
                severity_asc: severity_from_radius(min_radius),
                total_angle_deg: total.abs(),
                min_radius_m: min_radius,
            });
        }
        i = exit + 1;
    }
    corners
}
