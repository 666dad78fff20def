use jiff::Timestamp;
use ordered_float::NotNan;
use plume_core::{AqiResult, AqiStatus, ChannelReading};
use tracing::trace;

use crate::breakpoints::{BreakpointTable, PM25_EPA_2012};
use crate::confidence::{DEFAULT_THRESHOLDS, DivergenceThresholds, classify_with, select_value};
use crate::correction::{CorrectionTable, EPA_2021};
use crate::history::{RollingHistory, Sample};

/// Clock hours the weighted average looks back over.
pub const LOOKBACK_HOURS: u32 = 12;
/// Lower bound on the NowCast weight factor.
pub const MIN_WEIGHT_FACTOR: f64 = 0.5;
/// Expected spacing of accepted samples (the coordinator's poll interval).
pub const SAMPLE_CADENCE_SECS: u32 = 300;
/// Accepted samples that make up one full hour at the sample cadence.
pub const SAMPLES_FOR_STABLE: u32 = 3600 / SAMPLE_CADENCE_SECS;
/// Window the warm-up count is taken over.
pub const WARMUP_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct NowCastSettings {
    pub correction: &'static CorrectionTable,
    pub breakpoints: &'static BreakpointTable,
    pub lookback_hours: u32,
    pub sample_cadence_secs: u32,
    pub thresholds: DivergenceThresholds,
}

impl Default for NowCastSettings {
    fn default() -> Self {
        Self {
            correction: &EPA_2021,
            breakpoints: &PM25_EPA_2012,
            lookback_hours: LOOKBACK_HOURS,
            sample_cadence_secs: SAMPLE_CADENCE_SECS,
            thresholds: DEFAULT_THRESHOLDS,
        }
    }
}

impl NowCastSettings {
    fn samples_for_stable(&self) -> u32 {
        (3600 / self.sample_cadence_secs.max(1)).max(1)
    }
}

/// The PM2.5 inputs of one upstream row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pm25Reading {
    /// CF=1 channels, the input to the EPA correction.
    pub cf_1: ChannelReading,
    /// ATM channels, used for the instant (raw) AQI.
    pub atm: Option<ChannelReading>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NowCastEstimate {
    pub pm2_5: f64,
    pub humidity: f64,
}

/// Per-sensor calculator. Owns the sensor's rolling history; the caller is
/// responsible for serializing updates.
#[derive(Debug, Clone)]
pub struct NowCastCalculator {
    settings: NowCastSettings,
    history: RollingHistory,
    as_of: Option<Timestamp>,
}

impl NowCastCalculator {
    pub fn new(settings: NowCastSettings) -> Self {
        Self {
            history: RollingHistory::new(settings.lookback_hours),
            settings,
            as_of: None,
        }
    }

    pub fn settings(&self) -> &NowCastSettings {
        &self.settings
    }

    pub fn history(&self) -> &RollingHistory {
        &self.history
    }

    pub fn update(&mut self, reading: &Pm25Reading) -> AqiResult {
        let now = reading.cf_1.timestamp;
        let thresholds = &self.settings.thresholds;

        let confidence = classify_with(&reading.cf_1, thresholds);
        let value = select_value(&reading.cf_1, confidence);

        let instant = reading
            .atm
            .as_ref()
            .and_then(|atm| select_value(atm, classify_with(atm, thresholds)))
            .or(value);
        let raw_value = instant
            .and_then(|pm| self.settings.breakpoints.aqi(pm))
            .and_then(non_negative);

        self.history.prune(now);
        self.as_of = Some(now);

        if let (Some(pm2_5), Some(humidity)) = (value, reading.humidity) {
            self.history.push(Sample {
                timestamp: now,
                pm2_5,
                humidity,
            });
        }

        let corrected = self
            .weighted_concentration(now)
            .and_then(|estimate| self.settings.correction.correct(estimate.pm2_5, estimate.humidity));
        let aqi = corrected
            .and_then(|pm| self.settings.breakpoints.aqi(pm))
            .and_then(non_negative);
        let status = self.status_at(now);

        trace!(
            sensor = %reading.cf_1.sensor_id,
            ?confidence,
            ?corrected,
            ?aqi,
            ?status,
            "NowCast updated"
        );

        AqiResult {
            value: aqi,
            raw_value,
            corrected_pm2_5: corrected.and_then(non_negative),
            status,
            confidence,
        }
    }

    /// Warm-up status as of the latest update.
    pub fn status(&self) -> AqiStatus {
        match self.as_of {
            Some(now) => self.status_at(now),
            None => self.calculating(0),
        }
    }

    /// Stable once a full hour of samples sits in the trailing hour before
    /// `now`. A gap drains the count, so warm-up restarts after an outage.
    pub fn status_at(&self, now: Timestamp) -> AqiStatus {
        let needed = self.settings.samples_for_stable();
        let cutoff = Timestamp::from_second(now.as_second() - WARMUP_WINDOW_SECS)
            .unwrap_or(Timestamp::MIN);
        let recent = u32::try_from(self.history.samples_after(cutoff)).unwrap_or(u32::MAX);
        if recent >= needed {
            AqiStatus::Stable
        } else {
            self.calculating(recent)
        }
    }

    fn calculating(&self, recent: u32) -> AqiStatus {
        let needed = self.settings.samples_for_stable();
        AqiStatus::Calculating {
            seconds_remaining: needed.saturating_sub(recent) * self.settings.sample_cadence_secs,
        }
    }

    /// NowCast-weighted PM2.5 and humidity over the retained hours as of
    /// `now`. Normalized by the weight actually present, so missing hours
    /// just shrink the average.
    pub fn weighted_concentration(&self, now: Timestamp) -> Option<NowCastEstimate> {
        let hours = self.history.hourly_means(now);
        if hours.is_empty() {
            return None;
        }

        let (min, max) = hours
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &(_, pm, _)| {
                (min.min(pm), max.max(pm))
            });

        let factor = if max > 0.0 {
            (min / max).max(MIN_WEIGHT_FACTOR)
        } else {
            1.0
        };

        let mut total_weight = 0.0;
        let mut pm_sum = 0.0;
        let mut rh_sum = 0.0;
        for &(back, pm, rh) in &hours {
            let weight = factor.powi(back as i32);
            total_weight += weight;
            pm_sum += weight * pm;
            rh_sum += weight * rh;
        }

        if total_weight <= 0.0 {
            return None;
        }

        let estimate = NowCastEstimate {
            pm2_5: pm_sum / total_weight,
            humidity: rh_sum / total_weight,
        };

        (estimate.pm2_5.is_finite() && estimate.humidity.is_finite()).then_some(estimate)
    }
}

impl Default for NowCastCalculator {
    fn default() -> Self {
        Self::new(NowCastSettings::default())
    }
}

fn non_negative(value: f64) -> Option<NotNan<f64>> {
    if !value.is_finite() {
        return None;
    }
    NotNan::new(value.max(0.0)).ok()
}
