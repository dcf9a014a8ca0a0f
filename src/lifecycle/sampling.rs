//! Hybrid historical sampling and holdout evaluation

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::forecaster::Forecaster;
use crate::config::SamplingBand;
use crate::types::{Metric, Reading};

/// Share of the (time-ordered) sample held out for validation
pub const HOLDOUT_RATIO: f64 = 0.2;

/// Sampling rate for a reading of the given age: the rate of the youngest band
/// that still contains it. `None` when older than every band.
pub fn band_rate(bands: &[SamplingBand], age: ChronoDuration) -> Option<f64> {
    let mut sorted: Vec<&SamplingBand> = bands.iter().collect();
    sorted.sort_by_key(|b| b.span_days);
    sorted
        .into_iter()
        .find(|b| age < ChronoDuration::days(b.span_days as i64))
        .map(|b| b.rate)
}

/// Oldest instant any band reaches back to
pub fn sampling_horizon(bands: &[SamplingBand], now: DateTime<Utc>) -> DateTime<Utc> {
    let span = bands.iter().map(|b| b.span_days).max().unwrap_or(0);
    now - ChronoDuration::days(span as i64)
}

/// Deterministic band sampling. Output is ordered by (timestamp, node_id).
pub fn sample_readings(
    mut readings: Vec<Reading>,
    bands: &[SamplingBand],
    now: DateTime<Utc>,
    seed: u64,
) -> Vec<Reading> {
    readings.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    let mut rng = StdRng::seed_from_u64(seed);
    readings
        .into_iter()
        .filter(|r| match band_rate(bands, now - r.timestamp) {
            Some(rate) if rate >= 1.0 => true,
            Some(rate) => rng.gen::<f64>() < rate,
            None => false,
        })
        .collect()
}

/// Time-ordered split: the newest `ratio` of the sample is the holdout
pub fn split_holdout(readings: Vec<Reading>, ratio: f64) -> (Vec<Reading>, Vec<Reading>) {
    let holdout_len = ((readings.len() as f64) * ratio).round() as usize;
    let cut = readings.len().saturating_sub(holdout_len);
    let mut train = readings;
    let holdout = train.split_off(cut);
    (train, holdout)
}

/// Mean absolute error of `model` on the holdout; `None` if it could not
/// forecast any holdout reading
pub fn mean_absolute_error(model: &dyn Forecaster, holdout: &[Reading], metric: Metric) -> Option<f64> {
    let errors: Vec<f64> = holdout
        .iter()
        .filter_map(|r| {
            let actual = r.value(metric)?;
            let forecast = model.predict(&r.node_id, r.timestamp)?;
            Some((forecast.value - actual).abs())
        })
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands() -> Vec<SamplingBand> {
        vec![
            SamplingBand { span_days: 180, rate: 0.5 },
            SamplingBand { span_days: 30, rate: 1.0 },
            SamplingBand { span_days: 730, rate: 0.1 },
        ]
    }

    #[test]
    fn test_band_rate_uses_youngest_band() {
        let b = bands();
        assert_eq!(band_rate(&b, ChronoDuration::days(3)), Some(1.0));
        assert_eq!(band_rate(&b, ChronoDuration::days(90)), Some(0.5));
        assert_eq!(band_rate(&b, ChronoDuration::days(400)), Some(0.1));
        assert_eq!(band_rate(&b, ChronoDuration::days(800)), None);
    }

    #[test]
    fn test_sampling_is_deterministic_and_banded() {
        let now = Utc::now();
        let readings: Vec<Reading> = (0..2000)
            .map(|i| Reading::new("N1", now - ChronoDuration::hours(i * 8)).with_flow(1.0))
            .collect();

        let a = sample_readings(readings.clone(), &bands(), now, 7);
        let b = sample_readings(readings, &bands(), now, 7);
        assert_eq!(a, b);

        let recent = a.iter().filter(|r| now - r.timestamp < ChronoDuration::days(30)).count();
        // 30 days at one reading per 8h, all kept
        assert_eq!(recent, 90);
        let middle = a
            .iter()
            .filter(|r| {
                let age = now - r.timestamp;
                age >= ChronoDuration::days(30) && age < ChronoDuration::days(180)
            })
            .count();
        // 450 candidates at 50%
        assert!(middle > 150 && middle < 300, "middle band kept {}", middle);
        assert!(a.iter().all(|r| now - r.timestamp < ChronoDuration::days(730)));
    }

    #[test]
    fn test_split_is_time_ordered() {
        let now = Utc::now();
        let readings: Vec<Reading> = (0..10)
            .map(|i| Reading::new("N1", now + ChronoDuration::minutes(i)).with_flow(i as f64))
            .collect();
        let (train, holdout) = split_holdout(readings, HOLDOUT_RATIO);
        assert_eq!(train.len(), 8);
        assert_eq!(holdout.len(), 2);
        assert!(train.last().unwrap().timestamp < holdout[0].timestamp);
    }
}
