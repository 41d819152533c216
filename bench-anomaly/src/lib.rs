//! Per-channel anomaly detection: threshold violations with debounce and
//! hysteresis, delta spikes, no-data timeouts, and aggregate quality
//! tracking (spec.md S4.7).

use bench_aggregate::{AggregatedWindow, Quality, TimedSample};
use bench_protocol::SampleValue;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AnomalyKind {
    MinViolation,
    MaxViolation,
    DeltaSpike,
    NoData,
    QualityDegraded,
    QualityBad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

/// One state transition on one channel (spec.md S3 Anomaly Event).
///
/// `restored == false` means the condition just started, or — for
/// `NoData` past `2x NoDataTimeoutSec` — was re-raised at `Critical`
/// while still active. `restored == true` pairs it with the earlier
/// entering event for the same `(channel_index, kind)` and carries
/// `end_time` equal to its own `at`. `DeltaSpike` never latches: it is
/// reported as a standalone entering event with no matching restore.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnomalyEvent {
    pub channel_index: u16,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub at: NaiveDateTime,
    pub restored: bool,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub delta: Option<f64>,
    pub message: String,
    pub end_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct ChannelThresholds {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Secondary, more extreme limit. Crossing it raises the violation at
    /// `Critical` instead of `Warning` (spec.md S4.7).
    pub min_critical: Option<f64>,
    pub max_critical: Option<f64>,
    /// Margin added back to `min`/`max` that the value must clear, for
    /// `debounce_samples` consecutive samples, before the rule restores
    /// (spec.md S4.7 "clears when `value > MinLimit + MinHysteresis`").
    pub min_hysteresis: f64,
    pub max_hysteresis: f64,
    pub delta_spike: Option<f64>,
    /// Consecutive samples required to both raise and clear a
    /// min/max violation.
    pub debounce_samples: u32,
    pub no_data_timeout: ChronoDuration,
}

impl ChannelThresholds {
    pub fn new(min: Option<f64>, max: Option<f64>, no_data_timeout_secs: i64) -> Self {
        ChannelThresholds {
            min,
            max,
            min_critical: None,
            max_critical: None,
            min_hysteresis: 0.0,
            max_hysteresis: 0.0,
            delta_spike: None,
            debounce_samples: 3,
            no_data_timeout: ChronoDuration::seconds(no_data_timeout_secs),
        }
    }
}

enum Transition {
    Entered(Severity),
    Cleared(Severity),
}

/// Debounced entry / hysteresis-debounced clear for one rule on one
/// channel. `entering`/`clearing` are independent predicates so the clear
/// threshold can sit away from the entry threshold (the hysteresis gap).
#[derive(Debug, Default)]
struct ThresholdTracker {
    entry_streak: u32,
    clear_streak: u32,
    active: Option<Severity>,
}

impl ThresholdTracker {
    fn evaluate(
        &mut self,
        entering: bool,
        clearing: bool,
        debounce: u32,
        severity_if_entering: Severity,
    ) -> Option<Transition> {
        let debounce = debounce.max(1);
        match self.active {
            None => {
                self.entry_streak = if entering { self.entry_streak.saturating_add(1) } else { 0 };
                if self.entry_streak >= debounce {
                    self.entry_streak = 0;
                    self.active = Some(severity_if_entering);
                    Some(Transition::Entered(severity_if_entering))
                } else {
                    None
                }
            }
            Some(active_severity) => {
                self.clear_streak = if clearing { self.clear_streak.saturating_add(1) } else { 0 };
                if self.clear_streak >= debounce {
                    self.clear_streak = 0;
                    self.active = None;
                    Some(Transition::Cleared(active_severity))
                } else {
                    None
                }
            }
        }
    }
}

struct ChannelDetector {
    thresholds: ChannelThresholds,
    last_value: Option<f64>,
    last_valid_sample_at: NaiveDateTime,
    min_tracker: ThresholdTracker,
    max_tracker: ThresholdTracker,
    no_data_active: bool,
    no_data_escalated: bool,
    no_data_severity: Severity,
    quality_degraded: ThresholdTracker,
    quality_bad: ThresholdTracker,
}

impl ChannelDetector {
    fn new(experiment_start: NaiveDateTime, thresholds: ChannelThresholds) -> Self {
        ChannelDetector {
            thresholds,
            last_value: None,
            last_valid_sample_at: experiment_start,
            min_tracker: ThresholdTracker::default(),
            max_tracker: ThresholdTracker::default(),
            no_data_active: false,
            no_data_escalated: false,
            no_data_severity: Severity::Warning,
            quality_degraded: ThresholdTracker::default(),
            quality_bad: ThresholdTracker::default(),
        }
    }

    fn event(
        &self,
        channel_index: u16,
        kind: AnomalyKind,
        at: NaiveDateTime,
        transition: Transition,
        value: Option<f64>,
        threshold: Option<f64>,
        delta: Option<f64>,
    ) -> AnomalyEvent {
        match transition {
            Transition::Entered(severity) => AnomalyEvent {
                channel_index,
                kind,
                severity,
                at,
                restored: false,
                value,
                threshold,
                delta,
                message: enter_message(kind, severity, value, threshold),
                end_time: None,
            },
            Transition::Cleared(severity) => AnomalyEvent {
                channel_index,
                kind,
                severity,
                at,
                restored: true,
                value,
                threshold,
                delta,
                message: restored_message(kind),
                end_time: Some(at),
            },
        }
    }

    fn no_data_restore_event(&mut self, channel_index: u16, now: NaiveDateTime) -> Option<AnomalyEvent> {
        if !self.no_data_active {
            return None;
        }
        self.no_data_active = false;
        self.no_data_escalated = false;
        Some(AnomalyEvent {
            channel_index,
            kind: AnomalyKind::NoData,
            severity: self.no_data_severity,
            at: now,
            restored: true,
            value: None,
            threshold: None,
            delta: None,
            message: restored_message(AnomalyKind::NoData),
            end_time: Some(now),
        })
    }

    /// Time-based no-data enter/escalate, polled independently of sample
    /// arrival (spec.md S4.7: "Warning after timeout, Critical after 2x
    /// timeout").
    fn no_data_tick(&mut self, channel_index: u16, now: NaiveDateTime) -> Option<AnomalyEvent> {
        let elapsed = now.signed_duration_since(self.last_valid_sample_at);
        if !self.no_data_active {
            if elapsed >= self.thresholds.no_data_timeout {
                self.no_data_active = true;
                self.no_data_escalated = false;
                self.no_data_severity = Severity::Warning;
                return Some(AnomalyEvent {
                    channel_index,
                    kind: AnomalyKind::NoData,
                    severity: Severity::Warning,
                    at: now,
                    restored: false,
                    value: None,
                    threshold: None,
                    delta: None,
                    message: enter_message(AnomalyKind::NoData, Severity::Warning, None, None),
                    end_time: None,
                });
            }
            return None;
        }
        if !self.no_data_escalated && elapsed >= self.thresholds.no_data_timeout + self.thresholds.no_data_timeout {
            self.no_data_escalated = true;
            self.no_data_severity = Severity::Critical;
            return Some(AnomalyEvent {
                channel_index,
                kind: AnomalyKind::NoData,
                severity: Severity::Critical,
                at: now,
                restored: false,
                value: None,
                threshold: None,
                delta: None,
                message: enter_message(AnomalyKind::NoData, Severity::Critical, None, None),
                end_time: None,
            });
        }
        None
    }

    fn ingest(&mut self, channel_index: u16, now: NaiveDateTime, value: SampleValue) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();
        let SampleValue::Valid(v) = value else {
            return events;
        };
        self.last_valid_sample_at = now;
        if let Some(ev) = self.no_data_restore_event(channel_index, now) {
            events.push(ev);
        }
        if let Some(threshold) = self.thresholds.delta_spike {
            if let Some(prev) = self.last_value {
                let delta = v - prev;
                if delta.abs() > threshold {
                    events.push(AnomalyEvent {
                        channel_index,
                        kind: AnomalyKind::DeltaSpike,
                        severity: Severity::Warning,
                        at: now,
                        restored: false,
                        value: Some(v),
                        threshold: Some(threshold),
                        delta: Some(delta),
                        message: enter_message(AnomalyKind::DeltaSpike, Severity::Warning, Some(v), Some(threshold)),
                        end_time: None,
                    });
                }
            }
        }
        self.last_value = Some(v);

        if let Some(min) = self.thresholds.min {
            let entering = v < min;
            let clearing = v > min + self.thresholds.min_hysteresis;
            let severity = if self.thresholds.min_critical.is_some_and(|c| v <= c) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            if let Some(t) = self.min_tracker.evaluate(entering, clearing, self.thresholds.debounce_samples, severity) {
                events.push(self.event(channel_index, AnomalyKind::MinViolation, now, t, Some(v), Some(min), None));
            }
        }

        if let Some(max) = self.thresholds.max {
            let entering = v > max;
            let clearing = v < max - self.thresholds.max_hysteresis;
            let severity = if self.thresholds.max_critical.is_some_and(|c| v >= c) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            if let Some(t) = self.max_tracker.evaluate(entering, clearing, self.thresholds.debounce_samples, severity) {
                events.push(self.event(channel_index, AnomalyKind::MaxViolation, now, t, Some(v), Some(max), None));
            }
        }

        events
    }

    fn tick(&mut self, channel_index: u16, now: NaiveDateTime) -> Vec<AnomalyEvent> {
        self.no_data_tick(channel_index, now).into_iter().collect()
    }

    fn observe_window(&mut self, channel_index: u16, window: &AggregatedWindow) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();
        let is_bad = window.quality == Quality::Bad;
        let is_degraded = window.quality == Quality::Degraded;
        if let Some(t) = self.quality_bad.evaluate(is_bad, !is_bad, 1, Severity::Critical) {
            events.push(self.event(channel_index, AnomalyKind::QualityBad, window.window_end, t, None, None, None));
        }
        if let Some(t) = self.quality_degraded.evaluate(is_degraded, !is_degraded, 1, Severity::Warning) {
            events.push(self.event(channel_index, AnomalyKind::QualityDegraded, window.window_end, t, None, None, None));
        }
        events
    }
}

fn enter_message(kind: AnomalyKind, severity: Severity, value: Option<f64>, threshold: Option<f64>) -> String {
    match kind {
        AnomalyKind::MinViolation => format!(
            "channel value {:.3} below minimum limit {:.3} ({severity:?})",
            value.unwrap_or_default(),
            threshold.unwrap_or_default()
        ),
        AnomalyKind::MaxViolation => format!(
            "channel value {:.3} above maximum limit {:.3} ({severity:?})",
            value.unwrap_or_default(),
            threshold.unwrap_or_default()
        ),
        AnomalyKind::DeltaSpike => format!(
            "channel value jumped to {:.3}, exceeding delta limit {:.3}",
            value.unwrap_or_default(),
            threshold.unwrap_or_default()
        ),
        AnomalyKind::NoData => format!("channel has produced no valid sample ({severity:?})"),
        AnomalyKind::QualityDegraded => "window quality degraded: some samples invalid".to_string(),
        AnomalyKind::QualityBad => "window quality bad: no valid samples".to_string(),
    }
}

fn restored_message(kind: AnomalyKind) -> String {
    match kind {
        AnomalyKind::MinViolation | AnomalyKind::MaxViolation => "limits restored".to_string(),
        AnomalyKind::NoData => "data restored".to_string(),
        AnomalyKind::QualityDegraded | AnomalyKind::QualityBad => "window quality restored to ok".to_string(),
        AnomalyKind::DeltaSpike => "delta spike cleared".to_string(),
    }
}

/// Owns one [`ChannelDetector`] per selected channel for a single running
/// experiment.
pub struct AnomalyDetector {
    channels: HashMap<u16, ChannelDetector>,
}

impl AnomalyDetector {
    pub fn new(experiment_start: NaiveDateTime, thresholds: HashMap<u16, ChannelThresholds>) -> Self {
        let channels = thresholds
            .into_iter()
            .map(|(ch, t)| (ch, ChannelDetector::new(experiment_start, t)))
            .collect();
        AnomalyDetector { channels }
    }

    pub fn ingest(&mut self, sample: TimedSample) -> Vec<AnomalyEvent> {
        match self.channels.get_mut(&sample.channel_index) {
            Some(det) => det.ingest(sample.channel_index, sample.timestamp, sample.value),
            None => Vec::new(),
        }
    }

    pub fn observe_window(&mut self, window: &AggregatedWindow) -> Vec<AnomalyEvent> {
        match self.channels.get_mut(&window.channel_index) {
            Some(det) => det.observe_window(window.channel_index, window),
            None => Vec::new(),
        }
    }

    /// Polls every channel's no-data timeout. Must be called periodically
    /// even when no samples arrive, since a fully silent channel never
    /// triggers `ingest`.
    pub fn tick(&mut self, now: NaiveDateTime) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();
        for (&channel_index, det) in self.channels.iter_mut() {
            events.extend(det.tick(channel_index, now));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn detector_for(channel: u16, thresholds: ChannelThresholds) -> AnomalyDetector {
        let mut map = HashMap::new();
        map.insert(channel, thresholds);
        AnomalyDetector::new(t(0), map)
    }

    #[test]
    fn min_violation_requires_debounce_before_raising() {
        let mut thresholds = ChannelThresholds::new(Some(0.0), None, 60);
        thresholds.debounce_samples = 3;
        let mut det = detector_for(1, thresholds);
        for i in 0..2 {
            let ev = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(-1.0), timestamp: t(i) });
            assert!(ev.is_empty(), "should not raise before debounce count reached");
        }
        let ev = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(-1.0), timestamp: t(2) });
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, AnomalyKind::MinViolation);
        assert!(!ev[0].restored);
        assert_eq!(ev[0].severity, Severity::Warning);
        assert_eq!(ev[0].value, Some(-1.0));
        assert_eq!(ev[0].threshold, Some(0.0));
    }

    /// spec.md S8 scenario 3: MinLimit=0, DebounceCount=3, MinHysteresis=0,
    /// feeding [1, -1, -1, -1, 2, 2, 2] emits exactly one MinViolation (at
    /// the third -1) and one LimitsRestored (at the third 2).
    #[test]
    fn debounced_min_alarm_scenario_matches_spec_example() {
        let mut thresholds = ChannelThresholds::new(Some(0.0), None, 60);
        thresholds.debounce_samples = 3;
        let mut det = detector_for(1, thresholds);
        let values = [1.0, -1.0, -1.0, -1.0, 2.0, 2.0, 2.0];
        let mut all = Vec::new();
        for (i, v) in values.iter().enumerate() {
            all.extend(det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(*v), timestamp: t(i as i64) }));
        }
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, AnomalyKind::MinViolation);
        assert!(!all[0].restored);
        assert_eq!(all[0].at, t(3));
        assert!(all[1].restored);
        assert_eq!(all[1].at, t(6));
    }

    #[test]
    fn min_violation_recovers_only_once_hysteresis_margin_is_cleared() {
        let mut thresholds = ChannelThresholds::new(Some(0.0), None, 60);
        thresholds.debounce_samples = 1;
        thresholds.min_hysteresis = 2.0;
        let mut det = detector_for(1, thresholds);
        let entered = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(-1.0), timestamp: t(0) });
        assert_eq!(entered.len(), 1);
        // Back above the raw limit but still inside the hysteresis dead
        // zone (0 < v <= 0 + 2): must not clear yet.
        let dead_zone = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(1.0), timestamp: t(1) });
        assert!(dead_zone.is_empty());
        let restored = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(2.5), timestamp: t(2) });
        assert_eq!(restored.len(), 1);
        assert!(restored[0].restored);
        assert_eq!(restored[0].end_time, Some(t(2)));
    }

    #[test]
    fn min_violation_escalates_to_critical_past_secondary_threshold() {
        let mut thresholds = ChannelThresholds::new(Some(0.0), None, 60);
        thresholds.debounce_samples = 1;
        thresholds.min_critical = Some(-10.0);
        let mut det = detector_for(1, thresholds);
        let ev = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(-20.0), timestamp: t(0) });
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].severity, Severity::Critical);
    }

    #[test]
    fn delta_spike_is_instantaneous_and_never_restores() {
        let mut thresholds = ChannelThresholds::new(None, None, 60);
        thresholds.delta_spike = Some(5.0);
        let mut det = detector_for(1, thresholds);
        det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(0.0), timestamp: t(0) });
        let ev = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(10.0), timestamp: t(1) });
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, AnomalyKind::DeltaSpike);
        assert!(!ev[0].restored);
        assert_eq!(ev[0].delta, Some(10.0));
        let next = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(10.1), timestamp: t(2) });
        assert!(next.is_empty());
    }

    #[test]
    fn no_data_timeout_fires_on_tick_and_restores_on_next_sample() {
        let thresholds = ChannelThresholds::new(None, None, 30);
        let mut det = detector_for(1, thresholds);
        assert!(det.tick(t(29)).is_empty());
        let ev = det.tick(t(30));
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, AnomalyKind::NoData);
        assert_eq!(ev[0].severity, Severity::Warning);
        assert!(!ev[0].restored);
        let restored = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(1.0), timestamp: t(31) });
        assert_eq!(restored.len(), 1);
        assert!(restored[0].restored);
    }

    #[test]
    fn no_data_escalates_to_critical_after_double_timeout() {
        let thresholds = ChannelThresholds::new(None, None, 30);
        let mut det = detector_for(1, thresholds);
        let first = det.tick(t(30));
        assert_eq!(first[0].severity, Severity::Warning);
        assert!(det.tick(t(45)).is_empty());
        let escalated = det.tick(t(60));
        assert_eq!(escalated.len(), 1);
        assert_eq!(escalated[0].severity, Severity::Critical);
        assert!(!escalated[0].restored);
        let restored = det.ingest(TimedSample { channel_index: 1, value: SampleValue::Valid(1.0), timestamp: t(70) });
        assert_eq!(restored.len(), 1);
        assert!(restored[0].restored);
        assert_eq!(restored[0].severity, Severity::Critical);
    }

    #[test]
    fn no_data_marker_sample_does_not_reset_timeout() {
        let thresholds = ChannelThresholds::new(None, None, 30);
        let mut det = detector_for(1, thresholds);
        let ev = det.ingest(TimedSample { channel_index: 1, value: SampleValue::NoData, timestamp: t(0) });
        assert!(ev.is_empty());
        let ev2 = det.tick(t(30));
        assert_eq!(ev2.len(), 1);
    }

    #[test]
    fn quality_bad_and_degraded_transitions_restore_on_return_to_ok() {
        use bench_aggregate::AggregatedWindow;
        let mut det = detector_for(1, ChannelThresholds::new(None, None, 60));
        let bad = AggregatedWindow {
            channel_index: 1,
            window_start: t(0),
            window_end: t(20),
            min: None,
            max: None,
            avg: None,
            first: None,
            last: None,
            stddev: None,
            sample_count: 0,
            invalid_count: 0,
            total_count: 0,
            quality: Quality::Bad,
        };
        let ev = det.observe_window(&bad);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, AnomalyKind::QualityBad);
        assert_eq!(ev[0].severity, Severity::Critical);

        let mut ok = bad.clone();
        ok.window_start = t(20);
        ok.window_end = t(40);
        ok.sample_count = 5;
        ok.total_count = 5;
        ok.quality = Quality::Ok;
        let restored = det.observe_window(&ok);
        assert_eq!(restored.len(), 1);
        assert!(restored[0].restored);
    }
}
