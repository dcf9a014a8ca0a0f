//! Bucket statistics, rollups and series merging

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Aggregate, Metric, Reading, Resolution, SeriesPoint};

/// Mean / min / max / population standard deviation over a set of values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub count: u32,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
}

impl BucketStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        Some(Self {
            count: values.len() as u32,
            mean,
            min,
            max,
            stddev: variance.sqrt(),
        })
    }
}

/// Whether a bucket has fully elapsed, including the late-data grace period
pub fn is_bucket_closed(
    bucket_start: DateTime<Utc>,
    resolution: Resolution,
    now: DateTime<Utc>,
    grace: ChronoDuration,
) -> bool {
    match resolution.bucket_width() {
        Some(width) => bucket_start + width + grace <= now,
        None => true,
    }
}

/// Recompute per-metric aggregates for one node from raw readings.
///
/// Output is a pure function of the input readings (plus `computed_at`), so a
/// re-run over the same window yields identical rows.
pub fn rollup_readings(
    node_id: &str,
    readings: &[Reading],
    resolution: Resolution,
    computed_at: DateTime<Utc>,
) -> Vec<Aggregate> {
    if resolution == Resolution::Raw {
        return Vec::new();
    }

    let mut buckets: BTreeMap<(DateTime<Utc>, &'static str), (Metric, Vec<f64>)> = BTreeMap::new();
    for reading in readings.iter().filter(|r| r.node_id == node_id) {
        let bucket = resolution.bucket_start(reading.timestamp);
        for metric in Metric::ALL {
            if let Some(v) = reading.value(metric) {
                buckets
                    .entry((bucket, metric.as_str()))
                    .or_insert_with(|| (metric, Vec::new()))
                    .1
                    .push(v);
            }
        }
    }

    buckets
        .into_iter()
        .filter_map(|((bucket_start, _), (metric, values))| {
            BucketStats::from_values(&values).map(|s| Aggregate {
                node_id: node_id.to_string(),
                resolution,
                bucket_start,
                metric,
                avg: s.mean,
                min: s.min,
                max: s.max,
                stddev: s.stddev,
                count: s.count,
                finalized: true,
                computed_at,
            })
        })
        .collect()
}

/// Bucket raw points in memory (used by tiers without stored rollups)
pub fn rollup_points(points: &[SeriesPoint], resolution: Resolution) -> Vec<SeriesPoint> {
    if resolution == Resolution::Raw {
        return points.to_vec();
    }

    #[derive(Default)]
    struct Acc {
        sums: [f64; 4],
        counts: [u32; 4],
        quality: f64,
        points: u32,
        samples: u32,
    }

    let mut buckets: BTreeMap<DateTime<Utc>, Acc> = BTreeMap::new();
    for p in points {
        let acc = buckets.entry(resolution.bucket_start(p.timestamp)).or_default();
        for (i, metric) in Metric::ALL.iter().enumerate() {
            if let Some(v) = p.value(*metric) {
                acc.sums[i] += v;
                acc.counts[i] += 1;
            }
        }
        acc.quality += p.quality_score;
        acc.points += 1;
        acc.samples += p.sample_count.max(1);
    }

    buckets
        .into_iter()
        .map(|(bucket, acc)| {
            let avg = |i: usize| (acc.counts[i] > 0).then(|| acc.sums[i] / acc.counts[i] as f64);
            SeriesPoint {
                timestamp: bucket,
                flow: avg(0),
                pressure: avg(1),
                temperature: avg(2),
                volume: avg(3),
                quality_score: acc.quality / acc.points.max(1) as f64,
                received_at: None,
                sample_count: acc.samples,
            }
        })
        .collect()
}

/// Sub-ranges of `[start, end)` whose buckets have no stored rollup.
///
/// Adjacent uncovered buckets are coalesced into one span. Span edges are
/// clipped to the requested range.
pub fn uncovered_spans(
    covered: &BTreeSet<DateTime<Utc>>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    resolution: Resolution,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let width = match resolution.bucket_width() {
        Some(width) if start < end => width,
        _ => return Vec::new(),
    };

    let mut spans = Vec::new();
    let mut open: Option<DateTime<Utc>> = None;
    let mut bucket = resolution.bucket_start(start);
    while bucket < end {
        if covered.contains(&bucket) {
            if let Some(span_start) = open.take() {
                spans.push((span_start.max(start), bucket));
            }
        } else if open.is_none() {
            open = Some(bucket);
        }
        bucket += width;
    }
    if let Some(span_start) = open {
        spans.push((span_start.max(start), end));
    }
    spans
}

/// Series points from stored per-metric aggregate rows
pub fn points_from_aggregates(aggregates: &[Aggregate]) -> Vec<SeriesPoint> {
    let mut buckets: BTreeMap<DateTime<Utc>, SeriesPoint> = BTreeMap::new();
    for agg in aggregates {
        let point = buckets.entry(agg.bucket_start).or_insert_with(|| SeriesPoint {
            timestamp: agg.bucket_start,
            flow: None,
            pressure: None,
            temperature: None,
            volume: None,
            quality_score: 1.0,
            received_at: None,
            sample_count: 0,
        });
        match agg.metric {
            Metric::Flow => point.flow = Some(agg.avg),
            Metric::Pressure => point.pressure = Some(agg.avg),
            Metric::Temperature => point.temperature = Some(agg.avg),
            Metric::Volume => point.volume = Some(agg.avg),
        }
        point.sample_count = point.sample_count.max(agg.count);
    }
    buckets.into_values().collect()
}

/// Merge points from a hotter and a colder tier for the same range.
///
/// For the same instant the point with the later `received_at` wins; ties (and
/// points without a receive time) resolve to the colder tier.
pub fn merge_points(hotter: Vec<SeriesPoint>, colder: Vec<SeriesPoint>) -> Vec<SeriesPoint> {
    let mut merged: BTreeMap<DateTime<Utc>, SeriesPoint> =
        colder.into_iter().map(|p| (p.timestamp, p)).collect();

    for point in hotter {
        match merged.get(&point.timestamp) {
            Some(existing) => {
                let hot_newer = match (point.received_at, existing.received_at) {
                    (Some(h), Some(c)) => h > c,
                    _ => false,
                };
                if hot_newer {
                    merged.insert(point.timestamp, point);
                }
            }
            None => {
                merged.insert(point.timestamp, point);
            }
        }
    }

    merged.into_values().collect()
}
