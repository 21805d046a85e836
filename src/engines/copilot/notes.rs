//! Pace-note construction: corner callouts, junction marks and compound
//! merging.

use crate::engines::lap::corners::{Corner, CornerDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    Corner,
    Junction,
    Bridge,
    Hazard,
}

/// One callout, positioned along the active path.
#[derive(Debug, Clone, PartialEq)]
pub struct PaceNote {
    pub kind: NoteKind,
    /// Station of the feature along the path, metres from the path origin.
    pub station_m: f64,
    pub callout_text: String,
    pub severity: Option<u8>,
}

fn direction_word(d: CornerDirection) -> &'static str {
    match d {
        CornerDirection::Left => "left",
        CornerDirection::Right => "right",
    }
}

/// Base callout for a single corner, e.g. "left 4" or "right 6 hairpin".
pub fn corner_callout(corner: &Corner) -> String {
    let base = format!("{} {}", direction_word(corner.direction), corner.severity_asc);
    if corner.severity_asc >= 6 {
        format!("{base} hairpin")
    } else if corner.total_angle_deg >= 150.0 {
        format!("{base} long")
    } else {
        base
    }
}

/// Builds unmerged corner notes from detected corners. `station_of` maps a
/// point index in the analysed window back to an absolute path station.
pub fn notes_from_corners(
    corners: &[Corner],
    station_of: impl Fn(usize) -> f64,
) -> Vec<PaceNote> {
    corners
        .iter()
        .map(|c| PaceNote {
            kind: NoteKind::Corner,
            station_m: station_of(c.apex_idx),
            callout_text: corner_callout(c),
            severity: Some(c.severity_asc),
        })
        .collect()
}

/// Merges notes closer together than `merge_distance_m` into one compound
/// callout ("left 4 into right 3"). Severity of a compound note is the worst
/// of its parts; its position is the first feature's.
pub fn merge_notes(mut notes: Vec<PaceNote>, merge_distance_m: f64) -> Vec<PaceNote> {
    notes.sort_by(|a, b| {
        a.station_m
            .partial_cmp(&b.station_m)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out: Vec<PaceNote> = Vec::with_capacity(notes.len());
    for note in notes {
        match out.last_mut() {
            Some(prev) if note.station_m - prev.station_m <= merge_distance_m => {
                prev.callout_text = format!("{} into {}", prev.callout_text, note.callout_text);
                prev.severity = match (prev.severity, note.severity) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
            _ => out.push(note),
        }
    }
    out
}

/// Lead distance at which a note becomes due, picked from the configured
/// brackets: the fiercer the feature, the earlier the call.
pub fn due_distance_m(severity: Option<u8>, brackets: &[f64]) -> f64 {
    if brackets.is_empty() {
        return 100.0;
    }
    let idx = match severity.unwrap_or(3) {
        0..=2 => 0,
        3..=4 => 1,
        _ => 2,
    };
    brackets[idx.min(brackets.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corner(dir: CornerDirection, severity: u8, angle: f64) -> Corner {
        Corner {
            entry_idx: 0,
            apex_idx: 1,
            exit_idx: 2,
            direction: dir,
            severity_asc: severity,
            total_angle_deg: angle,
            min_radius_m: 50.0,
        }
    }

    fn note(station: f64, text: &str, severity: u8) -> PaceNote {
        PaceNote {
            kind: NoteKind::Corner,
            station_m: station,
            callout_text: text.into(),
            severity: Some(severity),
        }
    }

    #[test]
    fn callout_wording() {
        assert_eq!(corner_callout(&corner(CornerDirection::Left, 4, 80.0)), "left 4");
        assert_eq!(
            corner_callout(&corner(CornerDirection::Right, 6, 170.0)),
            "right 6 hairpin"
        );
        assert_eq!(
            corner_callout(&corner(CornerDirection::Left, 3, 160.0)),
            "left 3 long"
        );
    }

    #[test]
    fn close_notes_merge_into_compound_call() {
        let merged = merge_notes(
            vec![note(500.0, "left 4", 4), note(540.0, "right 3", 3), note(900.0, "left 2", 2)],
            50.0,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].callout_text, "left 4 into right 3");
        assert_eq!(merged[0].severity, Some(4));
        assert_eq!(merged[0].station_m, 500.0);
        assert_eq!(merged[1].callout_text, "left 2");
    }

    #[test]
    fn chain_merge_folds_three_features() {
        let merged = merge_notes(
            vec![note(100.0, "left 5", 5), note(130.0, "right 4", 4), note(160.0, "left 3", 3)],
            40.0,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].callout_text, "left 5 into right 4 into left 3");
        assert_eq!(merged[0].severity, Some(5));
    }

    #[test]
    fn distant_notes_stay_separate() {
        let merged = merge_notes(vec![note(100.0, "left 4", 4), note(400.0, "right 4", 4)], 50.0);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn unsorted_input_is_sorted_before_merging() {
        let merged = merge_notes(vec![note(540.0, "b", 3), note(500.0, "a", 4)], 50.0);
        assert_eq!(merged[0].callout_text, "a into b");
    }

    #[test]
    fn due_distance_scales_with_severity() {
        let brackets = [100.0, 200.0, 500.0, 1000.0];
        assert_eq!(due_distance_m(Some(1), &brackets), 100.0);
        assert_eq!(due_distance_m(Some(4), &brackets), 200.0);
        assert_eq!(due_distance_m(Some(6), &brackets), 500.0);
        assert_eq!(due_distance_m(None, &brackets), 200.0);
        assert_eq!(due_distance_m(Some(6), &[150.0]), 150.0);
    }
}
