//! Motion compliance monitoring.
//!
//! The monitor turns a stream of accelerometer samples into a single
//! "last activity" timestamp. Activity is any step whose L1 delta across the
//! three axes exceeds the profile threshold. Only the previous sample is kept.

use std::time::Duration;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};

use crate::error::{MotionError, SessionError};

/// Capacity of the sample funnel between a source and the session task
const SAMPLE_BUFFER: usize = 64;

/// Sampling interval and activity threshold, tuned as a pair.
///
/// A higher sampling rate sees smaller per-sample deltas, so it needs a lower
/// threshold to catch brief bursts. A lower rate needs a higher threshold to
/// reject sensor noise. Change both together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingProfile {
    pub interval: Duration,
    pub threshold: f64,
}

impl SamplingProfile {
    /// 20 Hz with a sensitive threshold
    pub const HIGH_RATE: Self = Self::new(Duration::from_millis(50), 0.05);
    /// 10 Hz with a noise-tolerant threshold
    pub const LOW_RATE: Self = Self::new(Duration::from_millis(100), 0.1);

    #[must_use]
    pub const fn new(interval: Duration, threshold: f64) -> Self {
        Self {
            interval,
            threshold,
        }
    }

    /// # Errors
    ///
    /// Returns `SessionError::InvalidConfig` for a zero interval or a
    /// non-positive threshold.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "sampling interval must be non-zero".to_string(),
            ));
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(SessionError::InvalidConfig(format!(
                "motion threshold must be a positive number, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// One accelerometer reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub captured_at: Instant,
}

impl MotionSample {
    #[must_use]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self::at(x, y, z, Instant::now())
    }

    #[must_use]
    pub const fn at(x: f64, y: f64, z: f64, captured_at: Instant) -> Self {
        Self {
            x,
            y,
            z,
            captured_at,
        }
    }

    /// L1 distance to `previous`: "did anything change", not a true magnitude.
    #[must_use]
    pub fn delta(&self, previous: &Self) -> f64 {
        (self.x - previous.x).abs() + (self.y - previous.y).abs() + (self.z - previous.z).abs()
    }
}

/// Accelerometer provider.
///
/// Implementations push samples into `sink` at roughly `interval`. Samples
/// must not be delivered after `unsubscribe` returns.
pub trait MotionSource: Send {
    /// Start delivering samples
    ///
    /// # Errors
    ///
    /// Returns `MotionError::Unavailable` if the device has no usable sensor.
    fn subscribe(
        &mut self,
        interval: Duration,
        sink: mpsc::Sender<MotionSample>,
    ) -> Result<(), MotionError>;

    /// Stop delivering samples. Calling it while not subscribed is a no-op.
    fn unsubscribe(&mut self);
}

/// Tracks the time of the last detected activity.
pub struct MotionComplianceMonitor {
    source: Box<dyn MotionSource>,
    profile: SamplingProfile,
    previous: Option<MotionSample>,
    last_activity_at: Instant,
    subscribed: bool,
    sensor_available: bool,
}

impl MotionComplianceMonitor {
    #[must_use]
    pub fn new(source: Box<dyn MotionSource>, profile: SamplingProfile, now: Instant) -> Self {
        Self {
            source,
            profile,
            previous: None,
            last_activity_at: now,
            subscribed: false,
            sensor_available: true,
        }
    }

    /// Subscribe to the source and return the sample funnel.
    ///
    /// Returns `None` when the sensor is unavailable. The monitor then never
    /// sees activity and every compliance window ends in a warning.
    pub fn start(&mut self) -> Option<mpsc::Receiver<MotionSample>> {
        self.stop();

        let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
        match self.source.subscribe(self.profile.interval, tx) {
            Ok(()) => {
                self.subscribed = true;
                self.sensor_available = true;
                log::info!(
                    "Motion monitoring started ({:?} interval, threshold {})",
                    self.profile.interval,
                    self.profile.threshold
                );
                Some(rx)
            }
            Err(e) => {
                self.sensor_available = false;
                log::warn!("{e}; reps will be treated as missed after the grace period");
                None
            }
        }
    }

    /// Unsubscribe from the source. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.subscribed {
            self.source.unsubscribe();
            self.subscribed = false;
            log::debug!("Motion monitoring stopped");
        }
    }

    /// Feed one sample. Returns `true` if it counted as activity.
    pub fn observe(&mut self, sample: MotionSample) -> bool {
        let active = self
            .previous
            .as_ref()
            .is_some_and(|prev| sample.delta(prev) > self.profile.threshold);

        if active && sample.captured_at > self.last_activity_at {
            self.last_activity_at = sample.captured_at;
        }
        self.previous = Some(sample);
        active
    }

    /// Session-start reset: forget the previous sample and restart the window at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.previous = None;
        self.last_activity_at = now;
    }

    /// Restart the compliance window after a warning so one stall warns once.
    pub fn restart_window(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    #[must_use]
    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// Time since the last detected activity
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    #[must_use]
    pub fn sensor_available(&self) -> bool {
        self.sensor_available
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.subscribed
    }
}

impl Drop for MotionComplianceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shape of the synthetic accelerometer signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionPattern {
    /// Wrist at rest: constant gravity vector
    Still,
    /// One short burst every `period`
    Rhythmic { period: Duration },
    /// Rhythmic bursts for `active_for`, then still
    RhythmicThenStill { period: Duration, active_for: Duration },
}

/// Synthetic motion source for simulations and tests.
pub struct SimulatedMotionSource {
    pattern: MotionPattern,
    task: Option<JoinHandle<()>>,
}

impl SimulatedMotionSource {
    #[must_use]
    pub fn new(pattern: MotionPattern) -> Self {
        Self {
            pattern,
            task: None,
        }
    }
}

impl MotionSource for SimulatedMotionSource {
    fn subscribe(
        &mut self,
        sample_interval: Duration,
        sink: mpsc::Sender<MotionSample>,
    ) -> Result<(), MotionError> {
        if self.task.is_some() {
            return Err(MotionError::AlreadySubscribed);
        }

        let pattern = self.pattern;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(sample_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let started = Instant::now();
            let mut last_burst = started;

            loop {
                ticker.tick().await;
                let now = Instant::now();
                let burst = match pattern {
                    MotionPattern::Still => false,
                    MotionPattern::Rhythmic { period } => now.duration_since(last_burst) >= period,
                    MotionPattern::RhythmicThenStill { period, active_for } => {
                        now.duration_since(started) < active_for
                            && now.duration_since(last_burst) >= period
                    }
                };
                if burst {
                    last_burst = now;
                }

                let x = if burst { 0.3 } else { 0.0 };
                match sink.try_send(MotionSample::at(x, 0.0, -1.0, now)) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }));
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SimulatedMotionSource {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Source for devices without an accelerometer
#[derive(Debug, Default)]
pub struct UnavailableMotionSource;

impl MotionSource for UnavailableMotionSource {
    fn subscribe(
        &mut self,
        _interval: Duration,
        _sink: mpsc::Sender<MotionSample>,
    ) -> Result<(), MotionError> {
        Err(MotionError::Unavailable(
            "no accelerometer on this device".to_string(),
        ))
    }

    fn unsubscribe(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_at(now: Instant, profile: SamplingProfile) -> MotionComplianceMonitor {
        MotionComplianceMonitor::new(Box::new(UnavailableMotionSource), profile, now)
    }

    #[test]
    fn test_delta_is_l1_norm() {
        let t = Instant::now();
        let a = MotionSample::at(0.0, 0.0, 0.0, t);
        let b = MotionSample::at(0.5, -0.25, 0.25, t);
        assert!((b.delta(&a) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_first_sample_is_never_activity() {
        let t0 = Instant::now();
        let mut monitor = monitor_at(t0, SamplingProfile::HIGH_RATE);
        let later = t0 + Duration::from_secs(1);

        assert!(!monitor.observe(MotionSample::at(5.0, 5.0, 5.0, later)));
        assert_eq!(monitor.last_activity_at(), t0);
    }

    #[test]
    fn test_activity_above_threshold_updates_timestamp() {
        let t0 = Instant::now();
        let mut monitor = monitor_at(t0, SamplingProfile::HIGH_RATE);
        let t1 = t0 + Duration::from_millis(50);
        let t2 = t0 + Duration::from_millis(100);

        monitor.observe(MotionSample::at(0.0, 0.0, -1.0, t1));
        assert!(monitor.observe(MotionSample::at(0.3, 0.0, -1.0, t2)));
        assert_eq!(monitor.last_activity_at(), t2);
        assert_eq!(monitor.idle_for(t2 + Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn test_delta_equal_to_threshold_is_not_activity() {
        let t0 = Instant::now();
        let profile = SamplingProfile::new(Duration::from_millis(50), 0.5);
        let mut monitor = monitor_at(t0, profile);

        monitor.observe(MotionSample::at(0.0, 0.0, 0.0, t0));
        assert!(!monitor.observe(MotionSample::at(0.5, 0.0, 0.0, t0)));
    }

    #[test]
    fn test_slow_drift_is_compared_step_by_step() {
        let t0 = Instant::now();
        let mut monitor = monitor_at(t0, SamplingProfile::LOW_RATE);

        // Each step moves 0.06, the total drift 0.18 never counts
        for (i, x) in [0.0, 0.06, 0.12, 0.18].into_iter().enumerate() {
            let at = t0 + Duration::from_millis(100 * (i as u64 + 1));
            assert!(!monitor.observe(MotionSample::at(x, 0.0, 0.0, at)));
        }
        assert_eq!(monitor.last_activity_at(), t0);
    }

    #[test]
    fn test_last_activity_never_moves_backwards() {
        let t0 = Instant::now();
        let mut monitor = monitor_at(t0, SamplingProfile::HIGH_RATE);
        let late = t0 + Duration::from_secs(2);

        monitor.observe(MotionSample::at(0.0, 0.0, 0.0, t0));
        monitor.observe(MotionSample::at(1.0, 0.0, 0.0, late));
        // A sample captured earlier but delivered later
        monitor.observe(MotionSample::at(0.0, 0.0, 0.0, t0 + Duration::from_secs(1)));

        assert_eq!(monitor.last_activity_at(), late);
    }

    #[test]
    fn test_reset_clears_previous_sample() {
        let t0 = Instant::now();
        let mut monitor = monitor_at(t0, SamplingProfile::HIGH_RATE);
        monitor.observe(MotionSample::at(0.0, 0.0, 0.0, t0));

        let t1 = t0 + Duration::from_secs(1);
        monitor.reset(t1);
        assert_eq!(monitor.last_activity_at(), t1);
        // Without a previous sample the jump is not activity
        assert!(!monitor.observe(MotionSample::at(9.0, 0.0, 0.0, t1)));
    }

    #[test]
    fn test_unavailable_sensor_degrades() {
        let mut monitor = monitor_at(Instant::now(), SamplingProfile::HIGH_RATE);
        assert!(monitor.start().is_none());
        assert!(!monitor.sensor_available());
        assert!(!monitor.is_running());
        monitor.stop();
        monitor.stop();
    }

    #[test]
    fn test_invalid_profile() {
        assert!(SamplingProfile::new(Duration::ZERO, 0.05).validate().is_err());
        assert!(SamplingProfile::new(Duration::from_millis(50), 0.0)
            .validate()
            .is_err());
        assert!(SamplingProfile::HIGH_RATE.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_source_delivers_bursts() {
        let profile = SamplingProfile::HIGH_RATE;
        let source = SimulatedMotionSource::new(MotionPattern::Rhythmic {
            period: Duration::from_millis(500),
        });
        let mut monitor = MotionComplianceMonitor::new(Box::new(source), profile, Instant::now());
        let mut samples = monitor.start().unwrap();
        assert!(monitor.is_running());

        let mut active = 0;
        for _ in 0..40 {
            let sample = samples.recv().await.unwrap();
            if monitor.observe(sample) {
                active += 1;
            }
        }
        monitor.stop();

        assert!(active >= 2, "expected bursts, got {active}");
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_still_source_never_reports_activity() {
        let source = SimulatedMotionSource::new(MotionPattern::Still);
        let t0 = Instant::now();
        let mut monitor = MotionComplianceMonitor::new(Box::new(source), SamplingProfile::HIGH_RATE, t0);
        let mut samples = monitor.start().unwrap();

        for _ in 0..20 {
            let sample = samples.recv().await.unwrap();
            assert!(!monitor.observe(sample));
        }
        assert_eq!(monitor.last_activity_at(), t0);
    }

    #[tokio::test]
    async fn test_double_subscribe_is_rejected() {
        let mut source = SimulatedMotionSource::new(MotionPattern::Still);
        let (tx, _rx) = mpsc::channel(1);
        source.subscribe(Duration::from_millis(50), tx.clone()).unwrap();
        assert_eq!(
            source.subscribe(Duration::from_millis(50), tx),
            Err(MotionError::AlreadySubscribed)
        );
        source.unsubscribe();
    }
}
