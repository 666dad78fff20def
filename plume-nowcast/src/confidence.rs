use plume_core::{ChannelReading, ConfidenceTag, ReadingKind};

/// Particulate readings at or above this (ug/m3) are outside the sensor's
/// measurable range.
pub const MAX_PM_READING: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceThresholds {
    /// Channels this far apart (ug/m3) are questionable regardless of level.
    pub absolute: f64,
    /// Relative spread, against the channel mean, that marks disagreement.
    pub relative: f64,
    /// The relative rule only applies once the spread exceeds this (ug/m3).
    pub relative_floor: f64,
    /// A channel below this reads as dead.
    pub near_zero: f64,
    /// The other channel must read at least this for a dead channel to count.
    pub material: f64,
}

pub const DEFAULT_THRESHOLDS: DivergenceThresholds = DivergenceThresholds {
    absolute: 45.0,
    relative: 0.5,
    relative_floor: 5.0,
    near_zero: 0.1,
    material: 5.0,
};

impl Default for DivergenceThresholds {
    fn default() -> Self {
        DEFAULT_THRESHOLDS
    }
}

pub fn classify(reading: &ChannelReading) -> ConfidenceTag {
    classify_with(reading, &DEFAULT_THRESHOLDS)
}

pub fn classify_with(reading: &ChannelReading, thresholds: &DivergenceThresholds) -> ConfidenceTag {
    let Some(b) = reading.channel_b else {
        return ConfidenceTag::Single;
    };
    let a = reading.channel_a;

    if !in_sane_range(reading.kind, a) || !in_sane_range(reading.kind, b) {
        return ConfidenceTag::Invalid;
    }

    if a < thresholds.near_zero && b >= thresholds.material {
        return ConfidenceTag::SingleChannelABad;
    }

    if b < thresholds.near_zero && a >= thresholds.material {
        return ConfidenceTag::SingleChannelBBad;
    }

    let diff = (a - b).abs();
    let mean = (a + b) / 2.0;
    let relative_exceeded =
        diff > thresholds.relative_floor && mean > 0.0 && diff / mean > thresholds.relative;

    if diff >= thresholds.absolute || relative_exceeded {
        return ConfidenceTag::Questionable;
    }

    ConfidenceTag::Good
}

/// The value a reading contributes given its confidence: the channel mean
/// when both agree, the surviving channel when one is bad.
pub fn select_value(reading: &ChannelReading, tag: ConfidenceTag) -> Option<f64> {
    let a = reading.channel_a;
    let value = match (tag, reading.channel_b) {
        (ConfidenceTag::Invalid, _) => return None,
        (ConfidenceTag::Good | ConfidenceTag::Questionable, Some(b)) => (a + b) / 2.0,
        (ConfidenceTag::SingleChannelABad, Some(b)) => b,
        _ => a,
    };

    if !value.is_finite() {
        return None;
    }

    if reading.kind.is_particulate() && !in_sane_range(reading.kind, value) {
        return None;
    }

    Some(value)
}

fn in_sane_range(kind: ReadingKind, value: f64) -> bool {
    if !value.is_finite() {
        return false;
    }

    match kind {
        ReadingKind::Pm1_0 | ReadingKind::Pm2_5 | ReadingKind::Pm10_0 => {
            (0.0..MAX_PM_READING).contains(&value)
        }
        ReadingKind::Humidity => (0.0..=100.0).contains(&value),
        ReadingKind::Pressure => value > 0.0,
        ReadingKind::Temperature => true,
    }
}

#[cfg(test)]
mod tests {
    use plume_core::SensorId;

    use super::*;

    fn pm(a: f64, b: f64) -> ChannelReading {
        ChannelReading::dual(
            SensorId(1),
            ReadingKind::Pm2_5,
            a,
            b,
            jiff::Timestamp::UNIX_EPOCH,
        )
    }

    #[test]
    fn test_reference_pairs() {
        assert_eq!(classify(&pm(35.0, 35.0)), ConfidenceTag::Good);
        assert_eq!(classify(&pm(35.0, 0.0)), ConfidenceTag::SingleChannelBBad);
        assert_eq!(classify(&pm(0.0, 35.0)), ConfidenceTag::SingleChannelABad);
        assert_eq!(classify(&pm(35.0, 70.0)), ConfidenceTag::Questionable);
        assert_eq!(classify(&pm(-1.0, 35.0)), ConfidenceTag::Invalid);
    }

    #[test]
    fn test_single_channel_wins_over_range_checks() {
        let reading = ChannelReading::single(
            SensorId(1),
            ReadingKind::Temperature,
            -12.0,
            jiff::Timestamp::UNIX_EPOCH,
        );
        assert_eq!(classify(&reading), ConfidenceTag::Single);
    }

    #[test]
    fn test_out_of_range_and_non_finite_are_invalid() {
        assert_eq!(classify(&pm(1000.0, 10.0)), ConfidenceTag::Invalid);
        assert_eq!(classify(&pm(10.0, f64::NAN)), ConfidenceTag::Invalid);
        assert_eq!(classify(&pm(f64::INFINITY, 10.0)), ConfidenceTag::Invalid);
    }

    #[test]
    fn test_clean_air_is_not_a_dead_channel() {
        // both near zero, or the other channel too low to be material
        assert_eq!(classify(&pm(0.0, 0.0)), ConfidenceTag::Good);
        assert_eq!(classify(&pm(0.05, 3.0)), ConfidenceTag::Good);
        assert_eq!(classify(&pm(2.0, 4.0)), ConfidenceTag::Good);
    }

    #[test]
    fn test_absolute_spread_at_high_levels() {
        assert_eq!(classify(&pm(100.0, 140.0)), ConfidenceTag::Good);
        assert_eq!(classify(&pm(300.0, 345.0)), ConfidenceTag::Questionable);
    }

    #[test]
    fn test_classification_is_repeatable() {
        let reading = pm(12.3, 19.8);
        let first = classify(&reading);
        for _ in 0..10 {
            assert_eq!(classify(&reading), first);
        }
    }

    #[test]
    fn test_select_value_follows_tag() {
        let both = pm(30.0, 32.0);
        assert_eq!(select_value(&both, classify(&both)), Some(31.0));

        let b_dead = pm(35.0, 0.0);
        assert_eq!(select_value(&b_dead, classify(&b_dead)), Some(35.0));

        let a_dead = pm(0.0, 22.0);
        assert_eq!(select_value(&a_dead, classify(&a_dead)), Some(22.0));

        let invalid = pm(-1.0, 35.0);
        assert_eq!(select_value(&invalid, classify(&invalid)), None);

        let single = ChannelReading::single(
            SensorId(1),
            ReadingKind::Pm2_5,
            8.5,
            jiff::Timestamp::UNIX_EPOCH,
        );
        assert_eq!(select_value(&single, classify(&single)), Some(8.5));

        let negative_single = ChannelReading::single(
            SensorId(1),
            ReadingKind::Pm2_5,
            -3.0,
            jiff::Timestamp::UNIX_EPOCH,
        );
        assert_eq!(select_value(&negative_single, classify(&negative_single)), None);
    }
}
