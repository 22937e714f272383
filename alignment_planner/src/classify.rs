//! Accuracy tiers and quality scores for refined alignments.

use crate::{Accuracy, EventKind};

/// Upper deviation bound (degrees, inclusive) for each tier.
pub const PERFECT_MAX_DEVIATION: f64 = 0.1;
pub const EXCELLENT_MAX_DEVIATION: f64 = 0.25;
pub const GOOD_MAX_DEVIATION: f64 = 0.5;
/// Outer threshold: anything beyond it is not an event.
pub const FAIR_MAX_DEVIATION: f64 = 1.0;

/// Altitude band (degrees) regarded as ideal for a shot.
const IDEAL_ALTITUDE: (f64, f64) = (0.0, 10.0);
const ALTITUDE_FLOOR: f64 = -2.0;
const ALTITUDE_CEILING: f64 = 25.0;

/// Tier for an absolute azimuth deviation, or `None` when it is out of tolerance.
pub fn accuracy_for_deviation(deviation: f64) -> Option<Accuracy> {
    let deviation = deviation.abs();
    if !deviation.is_finite() {
        return None;
    }
    if deviation <= PERFECT_MAX_DEVIATION {
        Some(Accuracy::Perfect)
    } else if deviation <= EXCELLENT_MAX_DEVIATION {
        Some(Accuracy::Excellent)
    } else if deviation <= GOOD_MAX_DEVIATION {
        Some(Accuracy::Good)
    } else if deviation <= FAIR_MAX_DEVIATION {
        Some(Accuracy::Fair)
    } else {
        None
    }
}

/// 1.0 inside the ideal band, falling off linearly to 0 at the floor/ceiling.
fn altitude_score(altitude: f64) -> f64 {
    let (low, high) = IDEAL_ALTITUDE;
    if (low..=high).contains(&altitude) {
        1.0
    } else if altitude < low {
        ((altitude - ALTITUDE_FLOOR) / (low - ALTITUDE_FLOOR)).clamp(0.0, 1.0)
    } else {
        ((ALTITUDE_CEILING - altitude) / (ALTITUDE_CEILING - high)).clamp(0.0, 1.0)
    }
}

/// Desirability of an event in [0, 1].
///
/// Combines how closely the azimuth matched, how close the body sits to the
/// ideal low-altitude band, and for pearl events how much of the moon is lit.
pub fn quality_score(
    kind: EventKind,
    deviation: f64,
    altitude: f64,
    illumination: Option<f64>,
) -> f64 {
    let deviation_score = (1.0 - deviation.abs() / FAIR_MAX_DEVIATION).clamp(0.0, 1.0);
    let altitude_score = altitude_score(altitude);

    let score = match kind {
        EventKind::Diamond => 0.7 * deviation_score + 0.3 * altitude_score,
        EventKind::Pearl => {
            let lit = illumination.unwrap_or(0.0).clamp(0.0, 1.0);
            0.55 * deviation_score + 0.2 * altitude_score + 0.25 * lit
        }
    };
    score.clamp(0.0, 1.0)
}

/// Ranking bonus of a tier when picking best shot days.
pub fn accuracy_bonus(accuracy: Accuracy) -> f64 {
    match accuracy {
        Accuracy::Perfect => 4.0,
        Accuracy::Excellent => 3.0,
        Accuracy::Good => 2.0,
        Accuracy::Fair => 1.0,
    }
}
