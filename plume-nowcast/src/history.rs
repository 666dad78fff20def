use std::collections::VecDeque;

use jiff::Timestamp;

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub pm2_5: f64,
    pub humidity: f64,
}

/// Samples that fall within one clock hour, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBucket {
    pub window_start: Timestamp,
    pub samples: Vec<Sample>,
}

impl HistoryBucket {
    fn new(window_start: Timestamp) -> Self {
        Self {
            window_start,
            samples: Vec::new(),
        }
    }

    pub fn mean_pm2_5(&self) -> Option<f64> {
        mean(self.samples.iter().map(|s| s.pm2_5))
    }

    pub fn mean_humidity(&self) -> Option<f64> {
        mean(self.samples.iter().map(|s| s.humidity))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Start of the clock hour containing `ts`.
pub fn hour_start(ts: Timestamp) -> Timestamp {
    let secs = ts.as_second().div_euclid(SECONDS_PER_HOUR) * SECONDS_PER_HOUR;
    Timestamp::from_second(secs).unwrap_or(ts)
}

/// Hourly buckets in time order. Missing hours are never backfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingHistory {
    buckets: VecDeque<HistoryBucket>,
    lookback_hours: u32,
}

impl RollingHistory {
    pub fn new(lookback_hours: u32) -> Self {
        Self {
            buckets: VecDeque::new(),
            lookback_hours: lookback_hours.max(1),
        }
    }

    pub fn lookback_hours(&self) -> u32 {
        self.lookback_hours
    }

    pub fn buckets(&self) -> impl Iterator<Item = &HistoryBucket> {
        self.buckets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.samples.len()).sum()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.buckets.back().and_then(|b| b.samples.last())
    }

    /// Samples strictly newer than `cutoff`.
    pub fn samples_after(&self, cutoff: Timestamp) -> usize {
        self.buckets
            .iter()
            .rev()
            .take_while(|b| b.window_start.as_second() + SECONDS_PER_HOUR > cutoff.as_second())
            .flat_map(|b| b.samples.iter())
            .filter(|s| s.timestamp > cutoff)
            .count()
    }

    /// Append a sample. Samples that are not strictly newer than the latest
    /// one, or that carry non-finite values, are rejected.
    pub fn push(&mut self, sample: Sample) -> bool {
        if !sample.pm2_5.is_finite() || !sample.humidity.is_finite() {
            return false;
        }

        if let Some(latest) = self.latest() {
            if sample.timestamp <= latest.timestamp {
                return false;
            }
        }

        let window_start = hour_start(sample.timestamp);
        match self.buckets.back_mut() {
            Some(bucket) if bucket.window_start == window_start => bucket.samples.push(sample),
            _ => {
                let mut bucket = HistoryBucket::new(window_start);
                bucket.samples.push(sample);
                self.buckets.push_back(bucket);
            }
        }

        true
    }

    /// Drop buckets that are `lookback_hours` or more clock hours behind `now`.
    pub fn prune(&mut self, now: Timestamp) {
        let current = hour_start(now).as_second();
        while let Some(front) = self.buckets.front() {
            if self.hours_back(current, front) < i64::from(self.lookback_hours) {
                break;
            }
            self.buckets.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// `(hours behind now, mean pm2.5, mean humidity)` for each retained bucket
    /// inside the lookback window.
    pub fn hourly_means(&self, now: Timestamp) -> Vec<(u32, f64, f64)> {
        let current = hour_start(now).as_second();
        self.buckets
            .iter()
            .filter_map(|bucket| {
                let back = self.hours_back(current, bucket);
                if !(0..i64::from(self.lookback_hours)).contains(&back) {
                    return None;
                }
                let pm = bucket.mean_pm2_5()?;
                let rh = bucket.mean_humidity()?;
                Some((back as u32, pm, rh))
            })
            .collect()
    }

    fn hours_back(&self, current_hour_secs: i64, bucket: &HistoryBucket) -> i64 {
        (current_hour_secs - bucket.window_start.as_second()) / SECONDS_PER_HOUR
    }
}

impl Default for RollingHistory {
    fn default() -> Self {
        Self::new(crate::nowcast::LOOKBACK_HOURS)
    }
}
