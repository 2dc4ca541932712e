//! Beam, track and spot bookkeeping for altimetry datasets
//!
//! Ground tracks are encoded as `gt1l = 10 .. gt3r = 60`. A track is the
//! middle digit of the beam name and a pair is left (0) or right (1).
//! Spots depend on the spacecraft orientation.

use serde::{Deserialize, Serialize};

use crate::predicate::Predicate;
use crate::fields;

/// Spacecraft orientation values as stored in the `sc_orient` column
pub const SC_BACKWARD: i64 = 0;
pub const SC_FORWARD: i64 = 1;
pub const SC_TRANSITION: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Beam {
    Gt1l,
    Gt1r,
    Gt2l,
    Gt2r,
    Gt3l,
    Gt3r,
}

impl Beam {
    pub const ALL: [Beam; 6] = [
        Beam::Gt1l,
        Beam::Gt1r,
        Beam::Gt2l,
        Beam::Gt2r,
        Beam::Gt3l,
        Beam::Gt3r,
    ];

    /// Numeric ground track code stored in the `gt` column
    pub fn code(&self) -> i64 {
        match self {
            Beam::Gt1l => 10,
            Beam::Gt1r => 20,
            Beam::Gt2l => 30,
            Beam::Gt2r => 40,
            Beam::Gt3l => 50,
            Beam::Gt3r => 60,
        }
    }

    pub fn from_code(code: i64) -> Option<Beam> {
        Beam::ALL.into_iter().find(|b| b.code() == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Beam::Gt1l => "gt1l",
            Beam::Gt1r => "gt1r",
            Beam::Gt2l => "gt2l",
            Beam::Gt2r => "gt2r",
            Beam::Gt3l => "gt3l",
            Beam::Gt3r => "gt3r",
        }
    }

    pub fn from_name(name: &str) -> Option<Beam> {
        Beam::ALL.into_iter().find(|b| b.name().eq_ignore_ascii_case(name))
    }

    /// Reference pair track, 1..=3
    pub fn track(&self) -> i64 {
        match self {
            Beam::Gt1l | Beam::Gt1r => 1,
            Beam::Gt2l | Beam::Gt2r => 2,
            Beam::Gt3l | Beam::Gt3r => 3,
        }
    }

    /// 0 for left, 1 for right
    pub fn pair(&self) -> i64 {
        match self {
            Beam::Gt1l | Beam::Gt2l | Beam::Gt3l => 0,
            Beam::Gt1r | Beam::Gt2r | Beam::Gt3r => 1,
        }
    }
}

/// Tracks covered by a set of beams, sorted and deduplicated
pub fn tracks_for_beams(beams: &[Beam]) -> Vec<i64> {
    let mut tracks: Vec<i64> = beams.iter().map(Beam::track).collect();
    tracks.sort_unstable();
    tracks.dedup();
    tracks
}

/// Both beams of every requested track
pub fn beams_for_tracks(tracks: &[i64]) -> Vec<Beam> {
    Beam::ALL
        .into_iter()
        .filter(|b| tracks.contains(&b.track()))
        .collect()
}

fn lookup_index(sc_orient: i64, track: i64, pair: i64) -> Option<usize> {
    if !(0..=2).contains(&sc_orient) || !(1..=3).contains(&track) || !(0..=1).contains(&pair) {
        return None;
    }
    Some((sc_orient * 6 + (track - 1) * 2 + pair) as usize)
}

const SPOT_TABLE: [Option<i64>; 18] = [
    Some(1), Some(2), Some(3), Some(4), Some(5), Some(6), // backward
    Some(6), Some(5), Some(4), Some(3), Some(2), Some(1), // forward
    None, None, None, None, None, None, // transition
];

/// Laser spot number (1..=6) for an orientation/track/pair combination
pub fn spot_number(sc_orient: i64, track: i64, pair: i64) -> Option<i64> {
    lookup_index(sc_orient, track, pair).and_then(|i| SPOT_TABLE[i])
}

/// Ground track for an orientation/track/pair combination
pub fn ground_track(sc_orient: i64, track: i64, pair: i64) -> Option<Beam> {
    let index = lookup_index(sc_orient, track, pair)?;
    if sc_orient == SC_TRANSITION {
        return None;
    }
    Beam::ALL.get(index % 6).copied()
}

/// The (sc_orient, track, pair) combinations that illuminate a spot
pub fn spot_details(spot: i64) -> Vec<(i64, i64, i64)> {
    let mut out = Vec::new();
    for sc_orient in [SC_BACKWARD, SC_FORWARD] {
        for track in 1..=3 {
            for pair in 0..=1 {
                if spot_number(sc_orient, track, pair) == Some(spot) {
                    out.push((sc_orient, track, pair));
                }
            }
        }
    }
    out
}

/// Predicate selecting rows that belong to any of the given spots.
/// Derived from orientation, track and pair so it also works for
/// datasets that do not carry a `spot` column.
pub fn spot_predicate(spots: &[i64]) -> Predicate {
    let terms = spots.iter().flat_map(|spot| {
        spot_details(*spot).into_iter().map(|(sc_orient, track, pair)| {
            Predicate::and([
                Predicate::eq(fields::SC_ORIENT, sc_orient),
                Predicate::eq(fields::TRACK, track),
                Predicate::eq(fields::PAIR, pair),
            ])
        })
    });
    let terms: Vec<Predicate> = terms.collect();
    if terms.is_empty() && !spots.is_empty() {
        // only invalid spots were requested
        return Predicate::is_in(fields::SPOT, spots.iter().copied());
    }
    Predicate::or(terms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beam_codes() {
        assert_eq!(Beam::Gt1l.code(), 10);
        assert_eq!(Beam::Gt3r.code(), 60);
        assert_eq!(Beam::from_code(40), Some(Beam::Gt2r));
        assert_eq!(Beam::from_code(45), None);
        assert_eq!(Beam::from_name("GT2L"), Some(Beam::Gt2l));
    }

    #[test]
    fn test_tracks_and_beams() {
        assert_eq!(tracks_for_beams(&[Beam::Gt1r, Beam::Gt1l, Beam::Gt3l]), vec![1, 3]);
        assert_eq!(beams_for_tracks(&[2]), vec![Beam::Gt2l, Beam::Gt2r]);
    }

    #[test]
    fn test_spot_lookup() {
        assert_eq!(spot_number(SC_BACKWARD, 1, 0), Some(1));
        assert_eq!(spot_number(SC_FORWARD, 1, 0), Some(6));
        assert_eq!(spot_number(SC_FORWARD, 3, 1), Some(1));
        assert_eq!(spot_number(SC_TRANSITION, 2, 0), None);
        assert_eq!(spot_number(SC_BACKWARD, 4, 0), None);
    }

    #[test]
    fn test_ground_track_lookup() {
        assert_eq!(ground_track(SC_BACKWARD, 2, 1), Some(Beam::Gt2r));
        assert_eq!(ground_track(SC_FORWARD, 3, 0), Some(Beam::Gt3l));
        assert_eq!(ground_track(SC_TRANSITION, 1, 0), None);
    }

    #[test]
    fn test_spot_details_cover_both_orientations() {
        assert_eq!(spot_details(1), vec![(SC_BACKWARD, 1, 0), (SC_FORWARD, 3, 1)]);
        assert!(spot_details(9).is_empty());
    }

    #[test]
    fn test_spot_predicate() {
        match spot_predicate(&[3]) {
            Predicate::Or { predicates } => assert_eq!(predicates.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(spot_predicate(&[]).is_true());
    }
}
