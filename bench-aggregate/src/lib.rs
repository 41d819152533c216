//! Per-channel tumbling-window aggregation (spec.md S4.6).

use bench_protocol::SampleValue;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::collections::HashMap;

/// One channel reading with a wall-clock timestamp, as routed by the
/// Experiment Coordinator to a post's Aggregator/Detector pair.
#[derive(Debug, Clone, Copy)]
pub struct TimedSample {
    pub channel_index: u16,
    pub value: SampleValue,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Quality {
    Ok,
    Degraded,
    Bad,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AggregatedWindow {
    pub channel_index: u16,
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub first: Option<f64>,
    pub last: Option<f64>,
    pub stddev: Option<f64>,
    pub sample_count: u32,
    pub invalid_count: u32,
    pub total_count: u32,
    pub quality: Quality,
}

struct ChannelAccumulator {
    window_start: NaiveDateTime,
    window_end: NaiveDateTime,
    count: u32,
    mean: f64,
    m2: f64,
    min: Option<f64>,
    max: Option<f64>,
    first: Option<f64>,
    last: Option<f64>,
    invalid_count: u32,
}

impl ChannelAccumulator {
    fn new(window_start: NaiveDateTime, width: ChronoDuration) -> Self {
        ChannelAccumulator {
            window_start,
            window_end: window_start + width,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: None,
            max: None,
            first: None,
            last: None,
            invalid_count: 0,
        }
    }

    fn add(&mut self, value: SampleValue) {
        match value {
            SampleValue::NoData => self.invalid_count += 1,
            SampleValue::Valid(v) => {
                self.count += 1;
                let delta = v - self.mean;
                self.mean += delta / self.count as f64;
                let delta2 = v - self.mean;
                self.m2 += delta * delta2;
                self.min = Some(self.min.map_or(v, |m| m.min(v)));
                self.max = Some(self.max.map_or(v, |m| m.max(v)));
                if self.first.is_none() {
                    self.first = Some(v);
                }
                self.last = Some(v);
            }
        }
    }

    fn reset(&mut self, window_start: NaiveDateTime, width: ChronoDuration) {
        self.window_start = window_start;
        self.window_end = window_start + width;
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
        self.min = None;
        self.max = None;
        self.first = None;
        self.last = None;
        self.invalid_count = 0;
    }

    fn finalize(&self, channel_index: u16, window_end: NaiveDateTime) -> AggregatedWindow {
        let total = self.count + self.invalid_count;
        if self.count == 0 {
            return AggregatedWindow {
                channel_index,
                window_start: self.window_start,
                window_end,
                min: None,
                max: None,
                avg: None,
                first: None,
                last: None,
                stddev: None,
                sample_count: 0,
                invalid_count: self.invalid_count,
                total_count: total,
                quality: Quality::Bad,
            };
        }
        let stddev = (self.m2 / self.count as f64).sqrt();
        let quality = if self.invalid_count == 0 {
            Quality::Ok
        } else {
            Quality::Degraded
        };
        AggregatedWindow {
            channel_index,
            window_start: self.window_start,
            window_end,
            min: self.min,
            max: self.max,
            avg: Some(self.mean),
            first: self.first,
            last: self.last,
            stddev: Some(stddev),
            sample_count: self.count,
            invalid_count: self.invalid_count,
            total_count: total,
            quality,
        }
    }
}

/// Owns one tumbling-window accumulator per selected channel for a single
/// running experiment.
pub struct Aggregator {
    width: ChronoDuration,
    experiment_start: NaiveDateTime,
    channels: HashMap<u16, ChannelAccumulator>,
}

impl Aggregator {
    pub fn new(experiment_start: NaiveDateTime, window_width_secs: i64, channels: &[u16]) -> Self {
        let width = ChronoDuration::seconds(window_width_secs);
        let mut map = HashMap::with_capacity(channels.len());
        for &ch in channels {
            map.insert(ch, ChannelAccumulator::new(experiment_start, width));
        }
        Aggregator {
            width,
            experiment_start,
            channels: map,
        }
    }

    pub fn experiment_start(&self) -> NaiveDateTime {
        self.experiment_start
    }

    /// Routes one sample to its channel's accumulator, rolling over any
    /// window boundaries the sample's timestamp has passed. A timestamp
    /// regression relative to the current window is treated as landing in
    /// the still-open window (a single boundary stutter), per spec.md S9
    /// Open Question 3.
    pub fn ingest(&mut self, sample: TimedSample) -> Vec<AggregatedWindow> {
        let Some(acc) = self.channels.get_mut(&sample.channel_index) else {
            return Vec::new();
        };
        let mut emitted = Vec::new();
        while sample.timestamp >= acc.window_end {
            let window_end = acc.window_end;
            emitted.push(acc.finalize(sample.channel_index, window_end));
            let next_start = acc.window_end;
            acc.reset(next_start, self.width);
        }
        acc.add(sample.value);
        emitted
    }

    /// Rolls forward any channel whose window has elapsed as of `now`,
    /// even without new samples, so the time grid stays regular.
    pub fn tick(&mut self, now: NaiveDateTime) -> Vec<AggregatedWindow> {
        let mut emitted = Vec::new();
        for (&channel_index, acc) in self.channels.iter_mut() {
            while now >= acc.window_end {
                let window_end = acc.window_end;
                emitted.push(acc.finalize(channel_index, window_end));
                let next_start = acc.window_end;
                acc.reset(next_start, self.width);
            }
        }
        emitted
    }

    /// Emits one final, possibly partial, window per channel with
    /// `window_end = now`, used when stopping an experiment (spec.md
    /// S4.11 `stop()`).
    pub fn flush_final(&mut self, now: NaiveDateTime) -> Vec<AggregatedWindow> {
        self.channels
            .iter()
            .map(|(&channel_index, acc)| acc.finalize(channel_index, now))
            .collect()
    }

    /// Advances every channel's window boundary past `now` without
    /// emitting the skipped windows, per spec.md S4.11 `resume()`: "no
    /// backfill."
    pub fn resume(&mut self, now: NaiveDateTime) {
        for acc in self.channels.values_mut() {
            while now >= acc.window_end {
                let next_start = acc.window_end;
                acc.reset(next_start, self.width);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    #[test]
    fn empty_window_has_no_stats_and_bad_quality() {
        let mut agg = Aggregator::new(t(0), 20, &[1]);
        let windows = agg.tick(t(20));
        assert_eq!(windows.len(), 1);
        let w = &windows[0];
        assert_eq!(w.sample_count, 0);
        assert_eq!(w.quality, Quality::Bad);
        assert!(w.avg.is_none() && w.min.is_none() && w.max.is_none());
    }

    #[test]
    fn invariant_invalid_plus_sample_equals_total() {
        let mut agg = Aggregator::new(t(0), 20, &[1]);
        agg.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(1.0), timestamp: t(1) });
        agg.ingest(TimedSample { channel_index: 1, value: SampleValue::NoData, timestamp: t(2) });
        let windows = agg.tick(t(20));
        assert_eq!(windows.len(), 1);
        let w = &windows[0];
        assert_eq!(w.invalid_count + w.sample_count, w.total_count);
        assert_eq!(w.quality, Quality::Degraded);
    }

    #[test]
    fn window_roll_over_41_samples_across_25s_emits_two_windows() {
        let mut agg = Aggregator::new(t(0), 20, &[7]);
        let mut emitted = Vec::new();
        for i in 0..41 {
            let ts_secs = (i as f64 * 25.0 / 40.0) as i64;
            emitted.extend(agg.ingest(TimedSample {
                channel_index: 7,
                value: SampleValue::Valid(i as f64),
                timestamp: t(ts_secs),
            }));
        }
        // Force the second window closed.
        emitted.extend(agg.tick(t(40)));
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].window_start, t(0));
        assert_eq!(emitted[0].window_end, t(20));
        assert_eq!(emitted[1].window_start, t(20));
        assert_eq!(emitted[1].window_end, t(40));
        assert_eq!(emitted[0].first, Some(0.0));
    }

    #[test]
    fn resume_skips_elapsed_windows_without_emitting() {
        let mut agg = Aggregator::new(t(0), 20, &[1]);
        agg.resume(t(45));
        // No windows should have been returned, and the next tick closes
        // only the window resume landed in.
        let windows = agg.tick(t(61));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].window_start, t(40));
    }

    #[test]
    fn unselected_channel_is_ignored() {
        let mut agg = Aggregator::new(t(0), 20, &[1]);
        let out = agg.ingest(TimedSample { channel_index: 99, value: SampleValue::Valid(1.0), timestamp: t(1) });
        assert!(out.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn quality_and_counts_invariant_holds_for_random_sequences(
            valids in proptest::collection::vec(proptest::prelude::any::<bool>(), 0..200)
        ) {
            let mut agg = Aggregator::new(t(0), 20, &[1]);
            let mut emitted = Vec::new();
            for (i, is_valid) in valids.iter().enumerate() {
                let value = if *is_valid { SampleValue::Valid(i as f64) } else { SampleValue::NoData };
                emitted.extend(agg.ingest(TimedSample { channel_index: 1, value, timestamp: t(i as i64) }));
            }
            emitted.extend(agg.flush_final(t(valids.len() as i64 + 1)));
            for w in emitted {
                prop_assert_eq!(w.invalid_count + w.sample_count, w.total_count);
                prop_assert_eq!(w.sample_count == 0, w.quality == Quality::Bad);
            }
        }
    }
}
