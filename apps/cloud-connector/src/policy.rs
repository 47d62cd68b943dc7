//! Send policies: per-destination decisions on whether a reading is worth
//! transmitting.
//!
//! A policy owns the last reading it accepted and when. `decide` either
//! records the incoming reading as the new last send and returns `true`, or
//! leaves the state untouched and returns `false`.

use crate::error::ConnectorError;
use crate::reading::Reading;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LastSent {
    pub timestamp: Instant,
    pub data: Reading,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyKind {
    All,
    Variation {
        time_low: Duration,
        time_high: Duration,
        variability: HashMap<String, f64>,
    },
    TimeLimit {
        min_interval: Duration,
    },
    MessageLimit {
        messages_per_day: f64,
        min_interval: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendPolicy {
    kind: PolicyKind,
    last_sent: Option<LastSent>,
}

impl SendPolicy {
    pub fn all() -> Self {
        Self::from_kind(PolicyKind::All)
    }

    pub fn variation(
        time_low: Duration,
        time_high: Duration,
        variability: HashMap<String, f64>,
    ) -> Result<Self, ConnectorError> {
        if time_low > time_high {
            return Err(ConnectorError::config(format!(
                "variation time_low ({time_low:?}) is greater than time_high ({time_high:?})"
            )));
        }
        if let Some((name, threshold)) = variability
            .iter()
            .find(|(_, threshold)| !threshold.is_finite() || **threshold < 0.0)
        {
            return Err(ConnectorError::config(format!(
                "variation threshold for {name} must be a non-negative number, got {threshold}"
            )));
        }
        Ok(Self::from_kind(PolicyKind::Variation {
            time_low,
            time_high,
            variability,
        }))
    }

    pub fn time_limit(min_interval: Duration) -> Self {
        Self::from_kind(PolicyKind::TimeLimit { min_interval })
    }

    /// A time limit spreading `messages_per_day` sends evenly over a day.
    pub fn message_limit(messages_per_day: f64) -> Result<Self, ConnectorError> {
        if !messages_per_day.is_finite() || messages_per_day <= 0.0 {
            return Err(ConnectorError::config(format!(
                "messages_per_day must be positive, got {messages_per_day}"
            )));
        }
        let nanos = (SECONDS_PER_DAY * 1e9 / messages_per_day).round();
        Ok(Self::from_kind(PolicyKind::MessageLimit {
            messages_per_day,
            min_interval: Duration::from_nanos(nanos as u64),
        }))
    }

    fn from_kind(kind: PolicyKind) -> Self {
        Self {
            kind,
            last_sent: None,
        }
    }

    /// Same parameters, no history.
    pub fn fresh(&self) -> Self {
        Self::from_kind(self.kind.clone())
    }

    pub fn kind(&self) -> &PolicyKind {
        &self.kind
    }

    pub fn last_sent(&self) -> Option<&LastSent> {
        self.last_sent.as_ref()
    }

    pub fn min_interval(&self) -> Option<Duration> {
        match &self.kind {
            PolicyKind::TimeLimit { min_interval }
            | PolicyKind::MessageLimit { min_interval, .. } => Some(*min_interval),
            _ => None,
        }
    }

    pub fn decide(&mut self, reading: &Reading) -> bool {
        self.decide_at(reading, Instant::now())
    }

    pub fn decide_at(&mut self, reading: &Reading, now: Instant) -> bool {
        let Some(last) = self.last_sent.as_ref() else {
            return self.accept(reading, now);
        };
        let elapsed = now.saturating_duration_since(last.timestamp);

        let send = match &self.kind {
            PolicyKind::All => true,
            PolicyKind::TimeLimit { min_interval }
            | PolicyKind::MessageLimit { min_interval, .. } => elapsed >= *min_interval,
            PolicyKind::Variation {
                time_low,
                time_high,
                variability,
            } => {
                if elapsed > *time_high {
                    true
                } else if elapsed < *time_low {
                    false
                } else {
                    exceeds_variability(&last.data, reading, variability)
                }
            }
        };

        if send {
            self.accept(reading, now)
        } else {
            false
        }
    }

    fn accept(&mut self, reading: &Reading, now: Instant) -> bool {
        self.last_sent = Some(LastSent {
            timestamp: now,
            data: reading.clone(),
        });
        true
    }
}

fn exceeds_variability(
    previous: &Reading,
    current: &Reading,
    variability: &HashMap<String, f64>,
) -> bool {
    for (measurement, value) in current.iter() {
        let Some(threshold) = variability.get(measurement) else {
            tracing::debug!(measurement, "measurement not defined in variation policy");
            continue;
        };
        let Some(last_value) = previous.get(measurement) else {
            tracing::debug!(measurement, "measurement missing from last sent reading");
            continue;
        };
        if (last_value - value).abs() > *threshold {
            return true;
        }
    }
    false
}

/// Whether one policy state is shared by every device sending through a
/// sink, or each device gets its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    #[default]
    Sink,
    Device,
}

/// Upper bound on per-device policy states kept by one sink. Device names
/// also arrive over HTTP push, so the map is bounded; past the cap the
/// device with the oldest last send is forgotten.
pub const MAX_TRACKED_DEVICES: usize = 1024;

#[derive(Debug)]
pub enum ScopedPolicy {
    Shared(SendPolicy),
    PerDevice {
        template: SendPolicy,
        by_device: HashMap<String, SendPolicy>,
        max_devices: usize,
    },
}

impl ScopedPolicy {
    pub fn new(policy: SendPolicy, scope: PolicyScope) -> Self {
        Self::with_device_cap(policy, scope, MAX_TRACKED_DEVICES)
    }

    pub fn with_device_cap(policy: SendPolicy, scope: PolicyScope, max_devices: usize) -> Self {
        match scope {
            PolicyScope::Sink => Self::Shared(policy),
            PolicyScope::Device => Self::PerDevice {
                template: policy.fresh(),
                by_device: HashMap::new(),
                max_devices: max_devices.max(1),
            },
        }
    }

    pub fn scope(&self) -> PolicyScope {
        match self {
            Self::Shared(_) => PolicyScope::Sink,
            Self::PerDevice { .. } => PolicyScope::Device,
        }
    }

    pub fn tracked_devices(&self) -> usize {
        match self {
            Self::Shared(_) => 0,
            Self::PerDevice { by_device, .. } => by_device.len(),
        }
    }

    pub fn decide_at(&mut self, reading: &Reading, device_name: &str, now: Instant) -> bool {
        match self {
            Self::Shared(policy) => policy.decide_at(reading, now),
            Self::PerDevice {
                template,
                by_device,
                max_devices,
            } => {
                if !by_device.contains_key(device_name) && by_device.len() >= *max_devices {
                    evict_oldest(by_device);
                }
                by_device
                    .entry(device_name.to_string())
                    .or_insert_with(|| template.fresh())
                    .decide_at(reading, now)
            }
        }
    }
}

/// Drops the device whose last send is oldest; never-sent devices go first.
fn evict_oldest(by_device: &mut HashMap<String, SendPolicy>) {
    let oldest = by_device
        .iter()
        .min_by_key(|(_, policy)| policy.last_sent().map(|last| last.timestamp))
        .map(|(name, _)| name.clone());
    if let Some(name) = oldest {
        tracing::debug!(device = %name, "forgetting policy state for device");
        by_device.remove(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    fn temp(value: f64) -> Reading {
        Reading::new().with("temp", value)
    }

    fn variation() -> SendPolicy {
        let variability = HashMap::from([("temp".to_string(), 0.5)]);
        SendPolicy::variation(secs(60), secs(300), variability).unwrap()
    }

    #[test]
    fn all_always_sends_and_records_latest() {
        let mut policy = SendPolicy::all();
        let t0 = Instant::now();
        assert!(policy.decide_at(&temp(25.0), t0));
        assert!(policy.decide_at(&temp(25.0), t0));
        assert!(policy.decide_at(&temp(31.0), t0 + secs(1)));
        let last = policy.last_sent().unwrap();
        assert_eq!(last.data, temp(31.0));
        assert_eq!(last.timestamp, t0 + secs(1));
    }

    #[test]
    fn variation_sends_without_history() {
        let mut policy = variation();
        assert!(policy.decide_at(&temp(25.0), Instant::now()));
    }

    #[test]
    fn variation_forces_send_after_time_high() {
        let mut policy = variation();
        let t0 = Instant::now();
        policy.decide_at(&temp(25.0), t0);
        assert!(policy.decide_at(&temp(25.0), t0 + secs(301)));
        assert_eq!(policy.last_sent().unwrap().timestamp, t0 + secs(301));
    }

    #[test]
    fn variation_holds_back_before_time_low() {
        let mut policy = variation();
        let t0 = Instant::now();
        policy.decide_at(&temp(25.0), t0);
        assert!(!policy.decide_at(&temp(90.0), t0 + secs(10)));
        assert_eq!(policy.last_sent().unwrap().data, temp(25.0));
    }

    #[test]
    fn variation_between_limits_depends_on_delta() {
        let mut policy = variation();
        let t0 = Instant::now();
        policy.decide_at(&temp(25.0), t0);
        assert!(!policy.decide_at(&temp(25.0), t0 + secs(120)));
        assert!(policy.decide_at(&temp(26.0), t0 + secs(120)));
        assert_eq!(policy.last_sent().unwrap().data, temp(26.0));
    }

    #[test]
    fn variation_delta_equal_to_threshold_does_not_send() {
        let mut policy = variation();
        let t0 = Instant::now();
        policy.decide_at(&temp(25.0), t0);
        assert!(!policy.decide_at(&temp(25.5), t0 + secs(120)));
    }

    #[test]
    fn variation_skips_unmonitored_measurements() {
        let variability = HashMap::from([("temp".to_string(), 1.0), ("hum".to_string(), 3.0)]);
        let mut policy = SendPolicy::variation(secs(30), secs(300), variability).unwrap();
        let t0 = Instant::now();
        policy.decide_at(&Reading::new().with("temp", 25.0).with("light", 50.0), t0);

        let only_light_moved = Reading::new().with("temp", 25.0).with("light", 500.0);
        assert!(!policy.decide_at(&only_light_moved, t0 + secs(120)));

        let temp_moved = Reading::new().with("temp", 30.0).with("light", 50.0);
        assert!(policy.decide_at(&temp_moved, t0 + secs(120)));
    }

    #[test]
    fn variation_skips_measurement_missing_from_history() {
        let variability = HashMap::from([("hum".to_string(), 3.0)]);
        let mut policy = SendPolicy::variation(secs(30), secs(300), variability).unwrap();
        let t0 = Instant::now();
        policy.decide_at(&temp(25.0), t0);
        let reading = Reading::new().with("temp", 25.0).with("hum", 80.0);
        assert!(!policy.decide_at(&reading, t0 + secs(60)));
    }

    #[test]
    fn variation_rejects_inverted_limits() {
        let err = SendPolicy::variation(secs(300), secs(60), HashMap::new()).unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[test]
    fn time_limit_waits_for_interval() {
        let mut policy = SendPolicy::time_limit(secs(10));
        let t0 = Instant::now();
        assert!(policy.decide_at(&temp(25.0), t0));
        assert!(!policy.decide_at(&temp(30.0), t0 + secs(3)));
        assert!(policy.decide_at(&temp(30.0), t0 + secs(180)));
    }

    #[test]
    fn time_limit_accepts_exact_interval() {
        let mut policy = SendPolicy::time_limit(secs(10));
        let t0 = Instant::now();
        policy.decide_at(&temp(25.0), t0);
        assert!(policy.decide_at(&temp(25.0), t0 + secs(10)));
    }

    #[test]
    fn message_limit_derives_interval_from_daily_budget() {
        let policy = SendPolicy::message_limit(10_000.0).unwrap();
        assert_eq!(policy.min_interval(), Some(Duration::from_millis(8_640)));

        let policy = SendPolicy::message_limit(1.0).unwrap();
        assert_eq!(policy.min_interval(), Some(secs(86_400)));
    }

    #[test]
    fn message_limit_behaves_like_time_limit() {
        let mut policy = SendPolicy::message_limit(10_000.0).unwrap();
        let t0 = Instant::now();
        assert!(policy.decide_at(&temp(25.0), t0));
        assert!(!policy.decide_at(&temp(25.0), t0 + secs(3)));
        assert!(policy.decide_at(&temp(25.0), t0 + secs(180)));
    }

    #[test]
    fn message_limit_rejects_non_positive_budget() {
        assert!(SendPolicy::message_limit(0.0).is_err());
        assert!(SendPolicy::message_limit(-3.0).is_err());
    }

    #[test]
    fn fresh_copy_forgets_history() {
        let mut policy = SendPolicy::time_limit(secs(10));
        policy.decide_at(&temp(25.0), Instant::now());
        let fresh = policy.fresh();
        assert!(fresh.last_sent().is_none());
        assert_eq!(fresh.kind(), policy.kind());
    }

    #[test]
    fn shared_scope_lets_one_device_throttle_another() {
        let mut scoped = ScopedPolicy::new(SendPolicy::time_limit(secs(10)), PolicyScope::Sink);
        let t0 = Instant::now();
        assert!(scoped.decide_at(&temp(25.0), "sim01", t0));
        assert!(!scoped.decide_at(&temp(25.0), "sim02", t0 + secs(1)));
    }

    #[test]
    fn device_scope_keeps_independent_history() {
        let mut scoped = ScopedPolicy::new(SendPolicy::time_limit(secs(10)), PolicyScope::Device);
        let t0 = Instant::now();
        assert!(scoped.decide_at(&temp(25.0), "sim01", t0));
        assert!(scoped.decide_at(&temp(25.0), "sim02", t0 + secs(1)));
        assert!(!scoped.decide_at(&temp(25.0), "sim01", t0 + secs(2)));
        assert_eq!(scoped.scope(), PolicyScope::Device);
    }

    #[test]
    fn device_scope_is_bounded() {
        let mut scoped =
            ScopedPolicy::with_device_cap(SendPolicy::time_limit(secs(10)), PolicyScope::Device, 2);
        let t0 = Instant::now();
        assert!(scoped.decide_at(&temp(25.0), "sim01", t0));
        assert!(scoped.decide_at(&temp(25.0), "sim02", t0 + secs(1)));
        assert!(scoped.decide_at(&temp(25.0), "esp-1", t0 + secs(2)));
        assert_eq!(scoped.tracked_devices(), 2);

        // sim01 had the oldest send and was forgotten; sim02 is still throttled.
        assert!(!scoped.decide_at(&temp(25.0), "sim02", t0 + secs(3)));
        assert!(scoped.decide_at(&temp(25.0), "sim01", t0 + secs(3)));
        assert_eq!(scoped.tracked_devices(), 2);
    }
}
