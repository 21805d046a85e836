//! GPS handler: serial NMEA at 10 Hz.
//!
//! `$GPRMC` carries speed, course and date; `$GPGGA` carries fix quality and
//! satellite count. A fix snapshot is published on each valid RMC, folding in
//! the most recent GGA. Sentences failing the checksum are dropped and
//! counted, never propagated.

use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use log::warn;

use crate::hw::NmeaSource;
use crate::runtime::{HandlerError, Publisher, Worker};

/// One assembled GPS fix.
#[derive(Debug, Clone)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    /// 0 = no fix, 1 = GPS, 2 = DGPS.
    pub fix_quality: u8,
    pub sats: u8,
    /// UTC time, present only when the reported year passes the sanity gate.
    pub utc: Option<DateTime<Utc>>,
    pub ts: Instant,
}

impl GpsFix {
    pub fn has_fix(&self) -> bool {
        self.fix_quality > 0
    }

    pub fn position(&self) -> crate::geo::LatLon {
        crate::geo::LatLon::new(self.lat, self.lon)
    }
}

const KNOTS_TO_KMH: f64 = 1.852;

/// Years accepted before GPS time is trusted for system sync.
fn year_plausible(year: i32, range: (i32, i32)) -> bool {
    year >= range.0 && year <= range.1
}

/// Verifies `$...*hh` checksum: XOR of all bytes between `$` and `*`.
pub fn checksum_ok(sentence: &str) -> bool {
    let Some(body) = sentence.strip_prefix('$') else {
        return false;
    };
    let Some((payload, given)) = body.rsplit_once('*') else {
        return false;
    };
    let Ok(want) = u8::from_str_radix(given.trim(), 16) else {
        return false;
    };
    let got = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    got == want
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed degrees.
fn parse_coord(raw: &str, hemi: &str) -> Option<f64> {
    if raw.len() < 4 {
        return None;
    }
    let dot = raw.find('.')?;
    if dot < 3 {
        return None;
    }
    let deg: f64 = raw[..dot - 2].parse().ok()?;
    let min: f64 = raw[dot - 2..].parse().ok()?;
    let mut val = deg + min / 60.0;
    if hemi == "S" || hemi == "W" {
        val = -val;
    }
    Some(val)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub heading_deg: f64,
    pub utc: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub lat: f64,
    pub lon: f64,
    pub fix_quality: u8,
    pub sats: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NmeaMsg {
    Rmc(Rmc),
    Gga(Gga),
    Other,
}

/// Parses one checksum-verified sentence; `None` means malformed.
pub fn parse_sentence(sentence: &str) -> Option<NmeaMsg> {
    if !checksum_ok(sentence) {
        return None;
    }
    let body = &sentence[1..sentence.rfind('*')?];
    let fields: Vec<&str> = body.split(',').collect();
    let talker = fields.first()?;
    if talker.len() != 5 {
        return None;
    }

    match &talker[2..] {
        "RMC" => {
            if fields.len() < 10 {
                return None;
            }
            let valid = fields[2] == "A";
            let lat = parse_coord(fields[3], fields[4]).unwrap_or(0.0);
            let lon = parse_coord(fields[5], fields[6]).unwrap_or(0.0);
            let speed_kmh = fields[7].parse::<f64>().unwrap_or(0.0) * KNOTS_TO_KMH;
            let heading_deg = fields[8].parse::<f64>().unwrap_or(0.0);
            let utc = parse_rmc_datetime(fields[1], fields[9]);
            Some(NmeaMsg::Rmc(Rmc { valid, lat, lon, speed_kmh, heading_deg, utc }))
        }
        "GGA" => {
            if fields.len() < 8 {
                return None;
            }
            let lat = parse_coord(fields[2], fields[3]).unwrap_or(0.0);
            let lon = parse_coord(fields[4], fields[5]).unwrap_or(0.0);
            let fix_quality = fields[6].parse::<u8>().unwrap_or(0);
            let sats = fields[7].parse::<u8>().unwrap_or(0);
            Some(NmeaMsg::Gga(Gga { lat, lon, fix_quality, sats }))
        }
        _ => Some(NmeaMsg::Other),
    }
}

/// `hhmmss.sss` + `ddmmyy` to a naive UTC datetime.
fn parse_rmc_datetime(time: &str, date: &str) -> Option<NaiveDateTime> {
    if time.len() < 6 || date.len() != 6 {
        return None;
    }
    let h: u32 = time[0..2].parse().ok()?;
    let m: u32 = time[2..4].parse().ok()?;
    let s: f64 = time[4..].parse().ok()?;
    let day: u32 = date[0..2].parse().ok()?;
    let mon: u32 = date[2..4].parse().ok()?;
    let year: i32 = 2000 + date[4..6].parse::<i32>().ok()?;

    let d = NaiveDate::from_ymd_opt(year, mon, day)?;
    let t = NaiveTime::from_hms_milli_opt(h, m, s as u32, ((s.fract()) * 1000.0) as u32)?;
    Some(NaiveDateTime::new(d, t))
}

pub struct GpsWorker {
    source: Box<dyn NmeaSource>,
    valid_year_range: (i32, i32),
    last_gga: Option<Gga>,
    bad_sentences: u64,
}

impl GpsWorker {
    pub fn new(source: Box<dyn NmeaSource>, valid_year_range: (i32, i32)) -> Self {
        Self { source, valid_year_range, last_gga: None, bad_sentences: 0 }
    }

    fn note_bad_sentence(&mut self, line: &str) {
        self.bad_sentences += 1;
        if self.bad_sentences % 100 == 1 {
            warn!("dropped malformed NMEA sentence (#{}) {:?}", self.bad_sentences, line);
        }
    }
}

impl Worker for GpsWorker {
    type Payload = GpsFix;

    fn poll(&mut self, out: &Publisher<GpsFix>) -> Result<(), HandlerError> {
        let Some(line) = self.source.read_sentence()? else {
            return Ok(());
        };

        match parse_sentence(&line) {
            Some(NmeaMsg::Gga(gga)) => {
                self.last_gga = Some(gga);
            }
            Some(NmeaMsg::Rmc(rmc)) => {
                let gga = self.last_gga.as_ref();
                let fix_quality = match gga {
                    Some(g) => g.fix_quality,
                    None if rmc.valid => 1,
                    None => 0,
                };
                let utc = rmc
                    .utc
                    .filter(|dt| {
                        use chrono::Datelike;
                        year_plausible(dt.year(), self.valid_year_range)
                    })
                    .map(|dt| Utc.from_utc_datetime(&dt));

                out.publish(GpsFix {
                    lat: rmc.lat,
                    lon: rmc.lon,
                    speed_kmh: rmc.speed_kmh,
                    heading_deg: rmc.heading_deg,
                    fix_quality,
                    sats: gga.map(|g| g.sats).unwrap_or(0),
                    utc,
                    ts: Instant::now(),
                });
            }
            Some(NmeaMsg::Other) => {}
            None => self.note_bad_sentence(&line),
        }
        Ok(())
    }
}
