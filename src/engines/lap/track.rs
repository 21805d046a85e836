//! Track model and loaders.
//!
//! Circuits arrive as KMZ (zipped KML with placemark lines), stages as GPX
//! tracks; both reduce to the same `Track` shape. A circuit's start and
//! finish line are the same segment; a stage has distinct ones synthesised
//! perpendicular to the course at its endpoints.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::config::CornerDetectorKind;
use crate::geo::{LatLon, Polyline, Segment};

use super::corners::{detect_corners, Corner, DetectorParams};

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("no track named {0:?}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Circuit,
    PointToPoint,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub name: String,
    pub kind: TrackKind,
    pub start_line: Segment,
    pub finish_line: Segment,
    pub sectors: Vec<Segment>,
    pub centreline: Polyline,
    pub corners: Vec<Corner>,
}

/// Length of synthesised start/finish lines.
const SYNTH_LINE_WIDTH_M: f64 = 15.0;

impl Track {
    pub fn waypoints(&self) -> &[LatLon] {
        self.centreline.points()
    }

    pub fn is_circuit(&self) -> bool {
        self.kind == TrackKind::Circuit
    }

    /// Runs the configured corner detector over the centreline.
    pub fn detect_corners(&mut self, params: &DetectorParams, kind: CornerDetectorKind) {
        self.corners = detect_corners(self.centreline.points(), params, kind);
        debug!("{}: {} corners detected", self.name, self.corners.len());
    }

    fn from_waypoints(
        name: String,
        kind: TrackKind,
        waypoints: Vec<LatLon>,
        explicit_sf: Option<Segment>,
        explicit_finish: Option<Segment>,
        sectors: Vec<Segment>,
    ) -> Result<Self, TrackError> {
        if waypoints.len() < 2 {
            return Err(TrackError::Invalid(format!("{name}: fewer than two waypoints")));
        }

        let start_line = explicit_sf.unwrap_or_else(|| {
            let heading = waypoints[0].bearing_deg(&waypoints[1]);
            Segment::perpendicular_at(waypoints[0], heading, SYNTH_LINE_WIDTH_M)
        });
        let finish_line = match kind {
            TrackKind::Circuit => start_line,
            TrackKind::PointToPoint => explicit_finish.unwrap_or_else(|| {
                let n = waypoints.len();
                let heading = waypoints[n - 2].bearing_deg(&waypoints[n - 1]);
                Segment::perpendicular_at(waypoints[n - 1], heading, SYNTH_LINE_WIDTH_M)
            }),
        };

        Ok(Self {
            name,
            kind,
            start_line,
            finish_line,
            sectors,
            centreline: Polyline::new(waypoints),
            corners: Vec::new(),
        })
    }

    // ---- GPX (stages) ----

    pub fn from_gpx_str(name: &str, xml: &str) -> Result<Self, TrackError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut waypoints = Vec::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"trkpt" => {
                    let mut lat = None;
                    let mut lon = None;
                    for attr in e.attributes().flatten() {
                        let v = String::from_utf8_lossy(&attr.value).parse::<f64>().ok();
                        match attr.key.as_ref() {
                            b"lat" => lat = v,
                            b"lon" => lon = v,
                            _ => {}
                        }
                    }
                    if let (Some(lat), Some(lon)) = (lat, lon) {
                        waypoints.push(LatLon::new(lat, lon));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Track::from_waypoints(
            name.to_string(),
            TrackKind::PointToPoint,
            waypoints,
            None,
            None,
            Vec::new(),
        )
    }

    /// Writes the stage back out as GPX. Loading the result reproduces the
    /// same in-memory track.
    pub fn to_gpx_string(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<gpx version=\"1.1\" creator=\"opentpt\">\n");
        out.push_str(&format!("  <trk>\n    <name>{}</name>\n    <trkseg>\n", xml_escape(&self.name)));
        for p in self.centreline.points() {
            out.push_str(&format!("      <trkpt lat=\"{:.7}\" lon=\"{:.7}\"/>\n", p.lat, p.lon));
        }
        out.push_str("    </trkseg>\n  </trk>\n</gpx>\n");
        out
    }

    // ---- KML / KMZ (circuits) ----

    pub fn from_kml_str(name: &str, xml: &str) -> Result<Self, TrackError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut buf = Vec::new();

        let mut placemark_name = String::new();
        let mut in_name = false;
        let mut in_coordinates = false;
        let mut coords_text = String::new();

        let mut centreline: Vec<LatLon> = Vec::new();
        let mut sf: Option<Segment> = None;
        let mut finish: Option<Segment> = None;
        let mut sectors: Vec<(String, Segment)> = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"Placemark" => {
                        placemark_name.clear();
                    }
                    b"name" => in_name = true,
                    b"coordinates" => {
                        in_coordinates = true;
                        coords_text.clear();
                    }
                    _ => {}
                },
                Event::Text(t) => {
                    let text = t.unescape()?.into_owned();
                    if in_name {
                        placemark_name = text;
                    } else if in_coordinates {
                        coords_text.push_str(&text);
                        coords_text.push(' ');
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"name" => in_name = false,
                    b"coordinates" => {
                        in_coordinates = false;
                        let pts = parse_kml_coordinates(&coords_text);
                        classify_placemark(
                            &placemark_name,
                            pts,
                            &mut centreline,
                            &mut sf,
                            &mut finish,
                            &mut sectors,
                        );
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        sectors.sort_by(|a, b| a.0.cmp(&b.0));
        Track::from_waypoints(
            name.to_string(),
            TrackKind::Circuit,
            centreline,
            sf,
            finish,
            sectors.into_iter().map(|(_, s)| s).collect(),
        )
    }

    pub fn from_kmz_file(name: &str, path: &Path) -> Result<Self, TrackError> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let kml_name = (0..archive.len())
            .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
            .find(|n| n.to_ascii_lowercase().ends_with(".kml"))
            .ok_or_else(|| TrackError::Invalid(format!("{}: no KML inside archive", path.display())))?;
        let mut xml = String::new();
        archive.by_name(&kml_name)?.read_to_string(&mut xml)?;
        Track::from_kml_str(name, &xml)
    }

    /// Loads any supported track file by extension.
    pub fn from_file(path: &Path) -> Result<Self, TrackError> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        let ext = path
            .extension()
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.to_str() {
            Some("kmz") => Track::from_kmz_file(&name, path),
            Some("kml") => Track::from_kml_str(&name, &std::fs::read_to_string(path)?),
            Some("gpx") => Track::from_gpx_str(&name, &std::fs::read_to_string(path)?),
            _ => Err(TrackError::Invalid(format!("{}: unknown track format", path.display()))),
        }
    }
}

/// KML coordinate blob: whitespace-separated `lon,lat[,alt]` triples.
fn parse_kml_coordinates(text: &str) -> Vec<LatLon> {
    text.split_whitespace()
        .filter_map(|tuple| {
            let mut it = tuple.split(',');
            let lon = it.next()?.parse::<f64>().ok()?;
            let lat = it.next()?.parse::<f64>().ok()?;
            Some(LatLon::new(lat, lon))
        })
        .collect()
}

fn classify_placemark(
    name: &str,
    pts: Vec<LatLon>,
    centreline: &mut Vec<LatLon>,
    sf: &mut Option<Segment>,
    finish: &mut Option<Segment>,
    sectors: &mut Vec<(String, Segment)>,
) {
    let lowered = name.to_ascii_lowercase();
    let as_segment = |pts: &[LatLon]| -> Option<Segment> {
        if pts.len() == 2 {
            Some(Segment::new(pts[0], pts[1]))
        } else {
            None
        }
    };

    if lowered.contains("start") || lowered == "sf" {
        if let Some(seg) = as_segment(&pts) {
            *sf = Some(seg);
            return;
        }
    }
    if lowered.contains("finish") && !lowered.contains("start") {
        if let Some(seg) = as_segment(&pts) {
            *finish = Some(seg);
            return;
        }
    }
    if lowered.starts_with("sector") {
        if let Some(seg) = as_segment(&pts) {
            sectors.push((lowered, seg));
            return;
        }
    }
    // Longest line wins as the centreline.
    if pts.len() > centreline.len() {
        *centreline = pts;
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// File-backed track collection spanning the bundled and user directories.
pub struct TrackDb {
    dirs: Vec<PathBuf>,
}

/// Tracks whose start is within this range of the fix count as nearby.
const NEARBY_RADIUS_M: f64 = 10_000.0;

impl TrackDb {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    fn track_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let ext = path
                    .extension()
                    .map(|e| e.to_ascii_lowercase())
                    .unwrap_or_default();
                if matches!(ext.to_str(), Some("kmz" | "kml" | "gpx")) {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
    }

    pub fn track_names(&self) -> Vec<String> {
        self.track_files()
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect()
    }

    /// Resolves a track by name, preferring tracks near the current fix so a
    /// stale name still lands on the right venue; falls back to the whole
    /// collection when GPS is absent.
    pub fn select_track_by_name(
        &self,
        name: &str,
        near: Option<LatLon>,
    ) -> Result<Track, TrackError> {
        let mut loaded: Vec<Track> = Vec::new();
        for path in self.track_files() {
            match Track::from_file(&path) {
                Ok(t) => loaded.push(t),
                Err(e) => warn!("skipping unreadable track {}: {e}", path.display()),
            }
        }

        if let Some(pos) = near {
            if let Some(t) = loaded
                .iter()
                .filter(|t| {
                    t.waypoints()
                        .first()
                        .map_or(false, |w| w.distance_m(&pos) <= NEARBY_RADIUS_M)
                })
                .find(|t| t.name == name)
            {
                return Ok(t.clone());
            }
        }

        loaded
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| TrackError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle_kml(sf: bool) -> String {
        let centre = LatLon::new(50.0, 8.0);
        let r = 500.0;
        let coords: String = (0..=72)
            .map(|i| {
                let p = centre.destination(i as f64 * 5.0, r);
                format!("{:.7},{:.7},0 ", p.lon, p.lat)
            })
            .collect();
        let sf_block = if sf {
            let a = centre.destination(0.0, r - 20.0);
            let b = centre.destination(0.0, r + 20.0);
            format!(
                "<Placemark><name>start_finish</name><LineString><coordinates>\
                 {:.7},{:.7},0 {:.7},{:.7},0</coordinates></LineString></Placemark>",
                a.lon, a.lat, b.lon, b.lat
            )
        } else {
            String::new()
        };
        format!(
            "<?xml version=\"1.0\"?><kml><Document>\
             <Placemark><name>circuit</name><LineString><coordinates>{coords}</coordinates></LineString></Placemark>\
             {sf_block}</Document></kml>"
        )
    }

    #[test]
    fn kml_circuit_loads_with_explicit_start_finish() {
        let track = Track::from_kml_str("ring", &circle_kml(true)).unwrap();
        assert_eq!(track.kind, TrackKind::Circuit);
        assert_eq!(track.name, "ring");
        assert_eq!(track.waypoints().len(), 73);
        assert_eq!(track.start_line, track.finish_line);
        assert!((track.start_line.length_m() - 40.0).abs() < 1.0);
    }

    #[test]
    fn kml_without_lines_synthesises_start_finish() {
        let track = Track::from_kml_str("ring", &circle_kml(false)).unwrap();
        assert_eq!(track.start_line, track.finish_line);
        let mid = track.start_line.midpoint();
        assert!(mid.distance_m(&track.waypoints()[0]) < 1.0);
    }

    #[test]
    fn gpx_stage_has_distinct_endpoints() {
        let o = LatLon::new(45.0, 7.0);
        let mut gpx = String::from("<?xml version=\"1.0\"?><gpx><trk><trkseg>");
        for i in 0..20 {
            let p = o.destination(45.0, i as f64 * 100.0);
            gpx.push_str(&format!("<trkpt lat=\"{:.7}\" lon=\"{:.7}\"/>", p.lat, p.lon));
        }
        gpx.push_str("</trkseg></trk></gpx>");

        let track = Track::from_gpx_str("col de test", &gpx).unwrap();
        assert_eq!(track.kind, TrackKind::PointToPoint);
        assert_ne!(track.start_line, track.finish_line);
        assert_eq!(track.waypoints().len(), 20);
    }

    #[test]
    fn gpx_roundtrip_is_identical() {
        let o = LatLon::new(45.0, 7.0);
        let mut gpx = String::from("<?xml version=\"1.0\"?><gpx><trk><trkseg>");
        for i in 0..10 {
            let p = o.destination(80.0, i as f64 * 50.0);
            gpx.push_str(&format!("<trkpt lat=\"{:.7}\" lon=\"{:.7}\"/>", p.lat, p.lon));
        }
        gpx.push_str("</trkseg></trk></gpx>");

        let track = Track::from_gpx_str("stage", &gpx).unwrap();
        let track2 = Track::from_gpx_str("stage", &track.to_gpx_string()).unwrap();
        assert_eq!(track.waypoints().len(), track2.waypoints().len());
        for (a, b) in track.waypoints().iter().zip(track2.waypoints()) {
            assert!(a.distance_m(b) < 0.05);
        }
        assert_eq!(track.kind, track2.kind);
        assert_eq!(track2.name, "stage");
    }

    #[test]
    fn utf8_track_names_survive() {
        let track = Track::from_gpx_str(
            "Nürburgring Nordschleife",
            "<?xml version=\"1.0\"?><gpx><trk><trkseg>\
             <trkpt lat=\"50.33\" lon=\"6.94\"/><trkpt lat=\"50.34\" lon=\"6.95\"/>\
             </trkseg></trk></gpx>",
        )
        .unwrap();
        assert_eq!(track.name, "Nürburgring Nordschleife");
        assert!(track.to_gpx_string().contains("Nürburgring"));
    }

    #[test]
    fn malformed_file_reports_error() {
        assert!(Track::from_gpx_str("bad", "<gpx><trk>").is_err() || {
            // quick-xml may tolerate truncation; a track with no points must
            // still be rejected.
            Track::from_gpx_str("bad", "<gpx><trk></trk></gpx>").is_err()
        });
    }

    #[test]
    fn select_by_name_prefers_nearby_then_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();

        // Two same-named venues far apart, as distinct files.
        let near_o = LatLon::new(50.0, 8.0);
        let far_o = LatLon::new(40.0, -3.0);
        for (file, o) in [("ring_a.gpx", near_o), ("ring_b.gpx", far_o)] {
            let mut gpx = String::from("<gpx><trk><trkseg>");
            for i in 0..5 {
                let p = o.destination(0.0, i as f64 * 100.0);
                gpx.push_str(&format!("<trkpt lat=\"{:.7}\" lon=\"{:.7}\"/>", p.lat, p.lon));
            }
            gpx.push_str("</trkseg></trk></gpx>");
            std::fs::write(dir.join(file), gpx).unwrap();
        }

        let db = TrackDb::new(vec![dir]);
        let picked = db
            .select_track_by_name("ring_b", Some(near_o.destination(0.0, 100.0)))
            .unwrap();
        // ring_b is far away, so proximity cannot satisfy it; fallback finds it.
        assert_eq!(picked.name, "ring_b");

        let missing = db.select_track_by_name("monza", None);
        assert!(matches!(missing, Err(TrackError::NotFound(_))));
    }
}
