//! Chopper positions and route planning.
//!
//! The text-command controller only knows how to step to a neighbouring
//! position. Its firmware orders them on a ring:
//!
//! ```text
//! Reference -> Antenna -> Hot -> Cold -> (Reference)
//! ```
//!
//! A move therefore becomes a list of waypoints along the shorter arc. The
//! servo variant instead classifies a continuous encoder angle against a
//! table of named angles, see [`classify_angle`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named chopper position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChopperPosition {
    Cold,
    Reference,
    Hot,
    Antenna,
}

impl ChopperPosition {
    /// Single-letter code used on the wire and in housekeeping.
    pub fn code(self) -> char {
        match self {
            ChopperPosition::Cold => 'C',
            ChopperPosition::Reference => 'R',
            ChopperPosition::Hot => 'H',
            ChopperPosition::Antenna => 'A',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'C' => Some(ChopperPosition::Cold),
            'R' => Some(ChopperPosition::Reference),
            'H' => Some(ChopperPosition::Hot),
            'A' => Some(ChopperPosition::Antenna),
            _ => None,
        }
    }

    fn ring_index(self) -> usize {
        match self {
            ChopperPosition::Reference => 0,
            ChopperPosition::Antenna => 1,
            ChopperPosition::Hot => 2,
            ChopperPosition::Cold => 3,
        }
    }
}

impl fmt::Display for ChopperPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Firmware ordering of the positions.
pub const CYCLE: [ChopperPosition; 4] = [
    ChopperPosition::Reference,
    ChopperPosition::Antenna,
    ChopperPosition::Hot,
    ChopperPosition::Cold,
];

/// What a position query returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionReading {
    At(ChopperPosition),
    /// The controller reports its error state, or the angle matches nothing.
    Error,
}

impl PositionReading {
    pub fn code(self) -> char {
        match self {
            PositionReading::At(p) => p.code(),
            PositionReading::Error => 'E',
        }
    }

    pub fn position(self) -> Option<ChopperPosition> {
        match self {
            PositionReading::At(p) => Some(p),
            PositionReading::Error => None,
        }
    }
}

/// Waypoints from `from` to `to`, excluding `from` and ending at `to`.
///
/// The shorter arc of the ring wins; when both arcs are equally long the
/// route does not wrap around. `Antenna -> Antenna` is a single step so a new
/// antenna offset can be applied in place; any other position to itself is
/// an empty route.
pub fn plan_route(from: ChopperPosition, to: ChopperPosition) -> Vec<ChopperPosition> {
    if from == to {
        return if to == ChopperPosition::Antenna {
            vec![to]
        } else {
            Vec::new()
        };
    }

    let n = CYCLE.len();
    let (i, j) = (from.ring_index(), to.ring_index());
    let forward = (j + n - i) % n;
    let backward = (i + n - j) % n;
    let go_forward = forward < backward || (forward == backward && j > i);

    let (steps, stride) = if go_forward {
        (forward, 1)
    } else {
        (backward, n - 1)
    };
    (1..=steps).map(|k| CYCLE[(i + k * stride) % n]).collect()
}

/// Angular separation on a circle, in degrees.
pub fn circular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).abs().rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Named angles of a servo chopper, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTable {
    pub hot: f64,
    pub cold: f64,
    pub reference: f64,
    pub antenna: f64,
}

impl PositionTable {
    pub fn angle(&self, position: ChopperPosition) -> f64 {
        match position {
            ChopperPosition::Hot => self.hot,
            ChopperPosition::Cold => self.cold,
            ChopperPosition::Reference => self.reference,
            ChopperPosition::Antenna => self.antenna,
        }
    }
}

/// Classify an encoder angle against `table`.
///
/// Checked in the order Cold, Reference, Hot, Antenna; the first entry closer
/// than `tolerance` degrees wins.
pub fn classify_angle(angle: f64, table: &PositionTable, tolerance: f64) -> PositionReading {
    [
        ChopperPosition::Cold,
        ChopperPosition::Reference,
        ChopperPosition::Hot,
        ChopperPosition::Antenna,
    ]
    .into_iter()
    .find(|&p| circular_distance(angle, table.angle(p)) < tolerance)
    .map_or(PositionReading::Error, PositionReading::At)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChopperPosition::*;

    #[test]
    fn neighbours_are_one_step() {
        assert_eq!(plan_route(Reference, Antenna), vec![Antenna]);
        assert_eq!(plan_route(Hot, Antenna), vec![Antenna]);
        assert_eq!(plan_route(Cold, Hot), vec![Hot]);
    }

    #[test]
    fn ring_wraps_between_cold_and_reference() {
        assert_eq!(plan_route(Cold, Reference), vec![Reference]);
        assert_eq!(plan_route(Reference, Cold), vec![Cold]);
    }

    #[test]
    fn ties_take_the_arc_without_wrap() {
        assert_eq!(plan_route(Reference, Hot), vec![Antenna, Hot]);
        assert_eq!(plan_route(Hot, Reference), vec![Antenna, Reference]);
        assert_eq!(plan_route(Antenna, Cold), vec![Hot, Cold]);
        assert_eq!(plan_route(Cold, Antenna), vec![Hot, Antenna]);
    }

    #[test]
    fn routes_are_minimal_and_never_revisit_the_start() {
        for from in CYCLE {
            for to in CYCLE {
                let route = plan_route(from, to);
                if from == to {
                    continue;
                }
                assert!(route.len() <= 2, "{from}->{to}: {route:?}");
                assert!(!route.contains(&from));
                assert_eq!(route.last(), Some(&to));
            }
        }
    }

    #[test]
    fn antenna_to_antenna_reapplies_offset() {
        assert_eq!(plan_route(Antenna, Antenna), vec![Antenna]);
        assert!(plan_route(Hot, Hot).is_empty());
    }

    #[test]
    fn codes_round_trip() {
        for p in CYCLE {
            assert_eq!(ChopperPosition::from_code(p.code()), Some(p));
        }
        assert_eq!(ChopperPosition::from_code('E'), None);
        assert_eq!(PositionReading::Error.code(), 'E');
    }

    #[test]
    fn angles_classify_across_zero() {
        let table = PositionTable {
            hot: 90.0,
            cold: 359.8,
            reference: 180.0,
            antenna: 270.0,
        };
        assert_eq!(classify_angle(0.1, &table, 0.5), PositionReading::At(Cold));
        assert_eq!(classify_angle(270.3, &table, 0.5), PositionReading::At(Antenna));
        assert_eq!(classify_angle(45.0, &table, 0.5), PositionReading::Error);
        assert!((circular_distance(359.0, 1.0) - 2.0).abs() < 1e-9);
    }
}
