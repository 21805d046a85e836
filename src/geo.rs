//! Geodetic primitives: positions, segments, local ENU projection and
//! polyline math shared by the lap timer, pit timer and CoPilot.
//!
//! All heavy geometry runs in a local east/north tangent plane anchored at a
//! reference position; at track scale (< 20 km) the projection error is well
//! below GPS noise.

use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// WGS-84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in metres (haversine).
    pub fn distance_m(&self, other: &LatLon) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let dphi = (other.lat - self.lat).to_radians();
        let dlambda = (other.lon - self.lon).to_radians();

        let a = (dphi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }

    /// Initial bearing towards `other`, degrees in [0, 360).
    pub fn bearing_deg(&self, other: &LatLon) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let dlambda = (other.lon - self.lon).to_radians();

        let y = dlambda.sin() * phi2.cos();
        let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
        (y.atan2(x).to_degrees() + 360.0) % 360.0
    }

    /// Destination point after travelling `distance_m` on `bearing_deg`.
    pub fn destination(&self, bearing_deg: f64, distance_m: f64) -> LatLon {
        let delta = distance_m / EARTH_RADIUS_M;
        let theta = bearing_deg.to_radians();
        let phi1 = self.lat.to_radians();
        let lambda1 = self.lon.to_radians();

        let phi2 =
            (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
        let lambda2 = lambda1
            + (theta.sin() * delta.sin() * phi1.cos())
                .atan2(delta.cos() - phi1.sin() * phi2.sin());

        LatLon::new(phi2.to_degrees(), lambda2.to_degrees())
    }
}

/// Absolute difference between two headings, degrees in [0, 180].
pub fn heading_diff_deg(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 { 360.0 - d } else { d }
}

/// Local east/north coordinates in metres relative to an anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Enu {
    pub x: f64,
    pub y: f64,
}

impl Enu {
    pub fn cross(&self, other: &Enu) -> f64 {
        self.x * other.y - self.y * other.x
    }

    pub fn dot(&self, other: &Enu) -> f64 {
        self.x * other.x + self.y * other.y
    }

    pub fn sub(&self, other: &Enu) -> Enu {
        Enu { x: self.x - other.x, y: self.y - other.y }
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }
}

/// Tangent-plane projection anchored at a fixed position.
#[derive(Debug, Clone, Copy)]
pub struct EnuFrame {
    anchor: LatLon,
    cos_lat: f64,
}

impl EnuFrame {
    pub fn new(anchor: LatLon) -> Self {
        Self { anchor, cos_lat: anchor.lat.to_radians().cos() }
    }

    pub fn project(&self, p: &LatLon) -> Enu {
        Enu {
            x: (p.lon - self.anchor.lon).to_radians() * EARTH_RADIUS_M * self.cos_lat,
            y: (p.lat - self.anchor.lat).to_radians() * EARTH_RADIUS_M,
        }
    }
}

/// A finite line between two endpoints, e.g. a start/finish or sector line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub a: LatLon,
    pub b: LatLon,
}

/// Result of testing one GPS step against a [`Segment`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    /// Fraction along the step `[p, q]` where the line was cut, in [0, 1].
    pub step_fraction: f64,
    /// Positive when the step cut the line left-to-right of its a→b vector.
    pub direction_sign: f64,
}

impl Segment {
    pub fn new(a: LatLon, b: LatLon) -> Self {
        Self { a, b }
    }

    pub fn midpoint(&self) -> LatLon {
        LatLon::new((self.a.lat + self.b.lat) / 2.0, (self.a.lon + self.b.lon) / 2.0)
    }

    pub fn length_m(&self) -> f64 {
        self.a.distance_m(&self.b)
    }

    /// Builds a line of `width_m` centred on `pos`, perpendicular to `heading_deg`.
    pub fn perpendicular_at(pos: LatLon, heading_deg: f64, width_m: f64) -> Segment {
        let half = width_m / 2.0;
        Segment::new(
            pos.destination((heading_deg + 270.0) % 360.0, half),
            pos.destination((heading_deg + 90.0) % 360.0, half),
        )
    }

    /// Tests whether the vehicle step `p → q` cuts this line.
    ///
    /// Both the line endpoints and the step are projected into a local frame
    /// anchored at `a`; the crossing exists when the endpoint side signs flip
    /// in both orderings (proper segment intersection).
    pub fn crossing(&self, p: &LatLon, q: &LatLon) -> Option<Crossing> {
        let frame = EnuFrame::new(self.a);
        let a = frame.project(&self.a);
        let b = frame.project(&self.b);
        let p = frame.project(p);
        let q = frame.project(q);

        let line = b.sub(&a);
        let step = q.sub(&p);

        // Side of the line for each step endpoint.
        let d1 = line.cross(&p.sub(&a));
        let d2 = line.cross(&q.sub(&a));
        if d1 == d2 || d1.signum() == d2.signum() {
            return None;
        }

        // Side of the step for each line endpoint.
        let d3 = step.cross(&a.sub(&p));
        let d4 = step.cross(&b.sub(&p));
        if d3 == d4 || d3.signum() == d4.signum() {
            return None;
        }

        Some(Crossing {
            step_fraction: d1 / (d1 - d2),
            direction_sign: line.cross(&step).signum(),
        })
    }

    /// Shortest distance in metres from `p` to this segment.
    pub fn distance_to_m(&self, p: &LatLon) -> f64 {
        let frame = EnuFrame::new(self.a);
        let a = frame.project(&self.a);
        let b = frame.project(&self.b);
        let p = frame.project(p);

        let ab = b.sub(&a);
        let len2 = ab.dot(&ab);
        let t = if len2 == 0.0 {
            0.0
        } else {
            (p.sub(&a).dot(&ab) / len2).clamp(0.0, 1.0)
        };
        let closest = Enu { x: a.x + ab.x * t, y: a.y + ab.y * t };
        p.sub(&closest).norm()
    }
}

/// Closest-point match of a position against a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolylineMatch {
    /// Index of the polyline segment containing the closest point.
    pub segment_idx: usize,
    /// Fraction along that segment, in [0, 1].
    pub segment_fraction: f64,
    /// 1-D station coordinate: metres from the polyline start.
    pub station_m: f64,
    /// Distance from the query position to the closest point, metres.
    pub offset_m: f64,
}

/// Ordered polyline with precomputed cumulative stations.
#[derive(Debug, Clone)]
pub struct Polyline {
    points: Vec<LatLon>,
    stations_m: Vec<f64>,
}

impl Polyline {
    pub fn new(points: Vec<LatLon>) -> Self {
        let mut stations_m = Vec::with_capacity(points.len());
        let mut acc = 0.0;
        for (i, p) in points.iter().enumerate() {
            if i > 0 {
                acc += points[i - 1].distance_m(p);
            }
            stations_m.push(acc);
        }
        Self { points, stations_m }
    }

    pub fn points(&self) -> &[LatLon] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total_length_m(&self) -> f64 {
        *self.stations_m.last().unwrap_or(&0.0)
    }

    pub fn station_of(&self, idx: usize) -> f64 {
        self.stations_m.get(idx).copied().unwrap_or(0.0)
    }

    /// Projects `pos` onto the polyline, returning the closest-point match.
    pub fn project(&self, pos: &LatLon) -> Option<PolylineMatch> {
        if self.points.len() < 2 {
            return None;
        }
        let frame = EnuFrame::new(*pos);
        let p = frame.project(pos);

        let mut best: Option<PolylineMatch> = None;
        for i in 0..self.points.len() - 1 {
            let a = frame.project(&self.points[i]);
            let b = frame.project(&self.points[i + 1]);
            let ab = b.sub(&a);
            let len2 = ab.dot(&ab);
            let t = if len2 == 0.0 {
                0.0
            } else {
                (p.sub(&a).dot(&ab) / len2).clamp(0.0, 1.0)
            };
            let closest = Enu { x: a.x + ab.x * t, y: a.y + ab.y * t };
            let offset = p.sub(&closest).norm();

            if best.map_or(true, |m| offset < m.offset_m) {
                let seg_len = self.stations_m[i + 1] - self.stations_m[i];
                best = Some(PolylineMatch {
                    segment_idx: i,
                    segment_fraction: t,
                    station_m: self.stations_m[i] + seg_len * t,
                    offset_m: offset,
                });
            }
        }
        best
    }

    /// Bearing of the polyline tangent at the segment containing `station_m`.
    pub fn tangent_deg_at(&self, station_m: f64) -> Option<f64> {
        if self.points.len() < 2 {
            return None;
        }
        let idx = match self
            .stations_m
            .binary_search_by(|s| s.partial_cmp(&station_m).unwrap_or(std::cmp::Ordering::Less))
        {
            Ok(i) => i.min(self.points.len() - 2),
            Err(i) => i.saturating_sub(1).min(self.points.len() - 2),
        };
        Some(self.points[idx].bearing_deg(&self.points[idx + 1]))
    }

    /// Extracts the sub-polyline covering `[from_m, to_m]` along the station axis.
    ///
    /// Returned indices are into the original point list so callers can map
    /// annotations back.
    pub fn window(&self, from_m: f64, to_m: f64) -> (Vec<LatLon>, Vec<usize>) {
        let mut pts = Vec::new();
        let mut idxs = Vec::new();
        for (i, p) in self.points.iter().enumerate() {
            let s = self.stations_m[i];
            if s >= from_m && s <= to_m {
                pts.push(*p);
                idxs.push(i);
            }
        }
        (pts, idxs)
    }
}
