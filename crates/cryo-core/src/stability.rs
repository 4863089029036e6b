//! Streaming stability estimators.
//!
//! Each detector owns a bounded window of `(timestamp, value)` samples and
//! its own deadline. Callers poll [`StabilityDetector::is_finished`] and
//! decide what to do when [`StabilityDetector::is_timed_out`] is the reason.
//!
//! Timestamps come from `tokio::time::Instant`, so tests running on a paused
//! runtime see the same clock the detectors do.
//!
//! | Detector | Stable when | Finished when |
//! |----------|-------------|---------------|
//! | [`StabilityTrend`] | `-tol < slope < tol` | window full and stable, or timed out |
//! | [`StabilitySetpoint`] | `sp - tol < min` and `max < sp + tol` | window full and stable, or timed out |
//! | [`BufferedStabilityTimer`] | `max - min < band` | window full, or timed out |
//! | [`StabilityTimer`] | `max - min < band` | stable span ≥ duration, or timed out |
//! | [`CoolingOnset`] | `slope <= threshold` | slope held below threshold for the dwell, or timed out |

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Result of an ordinary least-squares fit of value against time (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinearFit {
    /// Units per second.
    pub slope: f64,
    /// Value at x = 0 (for a window, its current time origin).
    pub intercept: f64,
    /// Pearson correlation coefficient, 0 when undefined.
    pub correlation: f64,
    /// Smallest value in the window.
    pub min: f64,
    /// Largest value in the window.
    pub max: f64,
}

/// Fits a straight line through `points` (`(x, y)` pairs).
///
/// Fewer than two points, or points that share one x value, give a zero
/// slope and zero coefficients. `min`/`max` still describe the values.
pub fn linear_regression(points: &[(f64, f64)]) -> LinearFit {
    let mut sums = RegressionSums::default();
    let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        sums.add(x, y);
        min = min.min(y);
        max = max.max(y);
    }
    if points.is_empty() {
        (min, max) = (0.0, 0.0);
    }
    sums.fit(min, max)
}

/// Running sums of a least-squares fit. Samples can be added and removed in
/// constant time.
#[derive(Debug, Clone, Copy, Default)]
struct RegressionSums {
    n: usize,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
}

impl RegressionSums {
    fn add(&mut self, x: f64, y: f64) {
        self.n += 1;
        self.sx += x;
        self.sy += y;
        self.sxx += x * x;
        self.syy += y * y;
        self.sxy += x * y;
    }

    fn remove(&mut self, x: f64, y: f64) {
        self.n = self.n.saturating_sub(1);
        self.sx -= x;
        self.sy -= y;
        self.sxx -= x * x;
        self.syy -= y * y;
        self.sxy -= x * y;
    }

    fn fit(&self, min: f64, max: f64) -> LinearFit {
        if self.n <= 1 {
            return LinearFit { min, max, ..LinearFit::default() };
        }

        let n = self.n as f64;
        let x_var = n * self.sxx - self.sx * self.sx;
        let y_var = n * self.syy - self.sy * self.sy;
        let covariance = n * self.sxy - self.sx * self.sy;
        if x_var.abs() <= f64::EPSILON * self.sxx.abs().max(1.0) {
            return LinearFit { intercept: self.sy / n, min, max, ..LinearFit::default() };
        }

        let slope = covariance / x_var;
        let intercept = (self.sy - slope * self.sx) / n;
        let correlation = if y_var > 0.0 { covariance / (x_var * y_var).sqrt() } else { 0.0 };

        LinearFit { slope, intercept, correlation, min, max }
    }
}

/// Common interface of every stability estimator.
pub trait StabilityDetector: Send {
    /// Adds a sample taken at `at`.
    fn add_point_at(&mut self, at: Instant, value: f64);

    /// Adds a sample taken now.
    fn add_point(&mut self, value: f64) {
        self.add_point_at(Instant::now(), value);
    }

    /// Whether the current window satisfies the stability criterion.
    fn is_stable(&self) -> bool;

    /// Whether the wait on this detector may end.
    fn is_finished(&self) -> bool;

    /// Whether the detector's own deadline has passed.
    fn is_timed_out(&self) -> bool;
}

/// Bounded, time-ordered sample buffer with its regression kept current.
///
/// Pushing is amortized O(1): the fit comes from running sums, and min/max
/// from monotonic queues of sample sequence numbers. The sums are rebuilt
/// from the samples, against a fresh time origin, once as many samples have
/// been evicted as the window holds.
#[derive(Debug, Clone)]
pub struct StabilityWindow {
    capacity: usize,
    origin: Instant,
    samples: VecDeque<(Instant, f64)>,
    sums: RegressionSums,
    lows: VecDeque<(u64, f64)>,
    highs: VecDeque<(u64, f64)>,
    next_seq: u64,
    evicted: usize,
    fit: LinearFit,
}

impl StabilityWindow {
    /// Creates an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            origin: Instant::now(),
            samples: VecDeque::with_capacity(capacity.clamp(1, 1024)),
            sums: RegressionSums::default(),
            lows: VecDeque::new(),
            highs: VecDeque::new(),
            next_seq: 0,
            evicted: 0,
            fit: LinearFit::default(),
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn push(&mut self, at: Instant, value: f64) {
        if self.samples.is_empty() {
            self.origin = at;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.samples.push_back((at, value));
        self.sums.add(secs_between(self.origin, at), value);
        while self.lows.back().is_some_and(|&(_, v)| v >= value) {
            self.lows.pop_back();
        }
        self.lows.push_back((seq, value));
        while self.highs.back().is_some_and(|&(_, v)| v <= value) {
            self.highs.pop_back();
        }
        self.highs.push_back((seq, value));

        while self.samples.len() > self.capacity {
            if let Some((old_at, old_value)) = self.samples.pop_front() {
                self.sums.remove(secs_between(self.origin, old_at), old_value);
                self.evicted += 1;
            }
        }
        let front_seq = self.next_seq - self.samples.len() as u64;
        while self.lows.front().is_some_and(|&(s, _)| s < front_seq) {
            self.lows.pop_front();
        }
        while self.highs.front().is_some_and(|&(s, _)| s < front_seq) {
            self.highs.pop_front();
        }

        if self.evicted >= self.samples.len() {
            self.rebuild_sums();
        }
        self.refit();
    }

    /// Drops everything except the newest sample.
    pub fn reset_to_latest(&mut self) {
        if let Some((at, value)) = self.samples.back().copied() {
            self.clear();
            self.push(at, value);
        }
    }

    /// Empties the window.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.sums = RegressionSums::default();
        self.lows.clear();
        self.highs.clear();
        self.evicted = 0;
        self.fit = LinearFit::default();
    }

    fn rebuild_sums(&mut self) {
        self.evicted = 0;
        if let Some(&(first, _)) = self.samples.front() {
            self.origin = first;
        }
        let mut sums = RegressionSums::default();
        for &(at, value) in &self.samples {
            sums.add(secs_between(self.origin, at), value);
        }
        self.sums = sums;
    }

    fn refit(&mut self) {
        let min = self.lows.front().map_or(0.0, |&(_, v)| v);
        let max = self.highs.front().map_or(0.0, |&(_, v)| v);
        self.fit = self.sums.fit(min, max);
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the window holds `capacity` samples.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    /// Regression over the current samples.
    pub fn fit(&self) -> LinearFit {
        self.fit
    }

    /// Time between the oldest and newest sample.
    pub fn span(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some(&(first, _)), Some(&(last, _))) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        }
    }

    /// Timestamp of the newest sample.
    pub fn latest(&self) -> Option<Instant> {
        self.samples.back().map(|&(at, _)| at)
    }
}

fn secs_between(origin: Instant, at: Instant) -> f64 {
    if at >= origin {
        at.duration_since(origin).as_secs_f64()
    } else {
        -origin.duration_since(at).as_secs_f64()
    }
}

/// Wall-clock deadline measured from construction. `None` never expires.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    started: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self { started: Instant::now(), timeout }
    }

    fn passed_at(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|t| now.saturating_duration_since(self.started) > t)
    }

    fn reached_at(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|t| now.saturating_duration_since(self.started) >= t)
    }
}

// =============================================================================
// Trend
// =============================================================================

/// Stable while the regression slope stays within `±tolerance` units/s.
#[derive(Debug, Clone)]
pub struct StabilityTrend {
    window: StabilityWindow,
    tolerance: f64,
    deadline: Deadline,
}

impl StabilityTrend {
    /// Creates a trend detector over `window` samples.
    pub fn new(window: usize, tolerance: f64, timeout: Option<Duration>) -> Self {
        Self {
            window: StabilityWindow::new(window),
            tolerance: tolerance.abs(),
            deadline: Deadline::new(timeout),
        }
    }

    /// Current slope in units per second.
    pub fn trend(&self) -> f64 {
        self.window.fit().slope
    }

    /// Whether the window holds its full sample count.
    pub fn is_buffer_full(&self) -> bool {
        self.window.is_full()
    }
}

impl StabilityDetector for StabilityTrend {
    fn add_point_at(&mut self, at: Instant, value: f64) {
        self.window.push(at, value);
    }

    fn is_stable(&self) -> bool {
        let slope = self.trend();
        -self.tolerance < slope && slope < self.tolerance
    }

    fn is_finished(&self) -> bool {
        (self.is_buffer_full() && self.is_stable()) || self.is_timed_out()
    }

    fn is_timed_out(&self) -> bool {
        self.deadline.passed_at(Instant::now())
    }
}

// =============================================================================
// Setpoint
// =============================================================================

/// Stable while every sample in the window sits inside `setpoint ± tolerance`.
#[derive(Debug, Clone)]
pub struct StabilitySetpoint {
    window: StabilityWindow,
    lower: f64,
    upper: f64,
    deadline: Deadline,
}

impl StabilitySetpoint {
    /// Creates a setpoint detector over `window` samples.
    pub fn new(window: usize, setpoint: f64, tolerance: f64, timeout: Option<Duration>) -> Self {
        Self {
            window: StabilityWindow::new(window),
            lower: setpoint - tolerance.abs(),
            upper: setpoint + tolerance.abs(),
            deadline: Deadline::new(timeout),
        }
    }

    /// Current slope in units per second.
    pub fn trend(&self) -> f64 {
        self.window.fit().slope
    }

    /// Whether the window holds its full sample count.
    pub fn is_buffer_full(&self) -> bool {
        self.window.is_full()
    }
}

impl StabilityDetector for StabilitySetpoint {
    fn add_point_at(&mut self, at: Instant, value: f64) {
        self.window.push(at, value);
    }

    fn is_stable(&self) -> bool {
        if self.window.is_empty() {
            return false;
        }
        let fit = self.window.fit();
        self.lower < fit.min && fit.max < self.upper
    }

    fn is_finished(&self) -> bool {
        (self.is_buffer_full() && self.is_stable()) || self.is_timed_out()
    }

    fn is_timed_out(&self) -> bool {
        self.deadline.passed_at(Instant::now())
    }
}

// =============================================================================
// Min/max timers
// =============================================================================

/// Counts consecutive samples within a `max - min` band. Leaving the band
/// restarts the count from the newest sample.
#[derive(Debug, Clone)]
pub struct BufferedStabilityTimer {
    window: StabilityWindow,
    stability: f64,
    deadline: Deadline,
}

impl BufferedStabilityTimer {
    /// Creates a timer that finishes after `window` in-band samples.
    pub fn new(stability: f64, window: usize, timeout: Option<Duration>) -> Self {
        Self {
            window: StabilityWindow::new(window),
            stability,
            deadline: Deadline::new(timeout),
        }
    }

    /// `(max, min, slope)` over the current buffer.
    pub fn stats(&self) -> (f64, f64, f64) {
        let fit = self.window.fit();
        (fit.max, fit.min, fit.slope)
    }
}

impl StabilityDetector for BufferedStabilityTimer {
    fn add_point_at(&mut self, at: Instant, value: f64) {
        self.window.push(at, value);
        if !self.is_stable() {
            self.window.reset_to_latest();
        }
    }

    fn is_stable(&self) -> bool {
        let fit = self.window.fit();
        fit.max - fit.min < self.stability
    }

    fn is_finished(&self) -> bool {
        self.window.is_full() || self.is_timed_out()
    }

    fn is_timed_out(&self) -> bool {
        self.window.latest().is_some_and(|at| self.deadline.reached_at(at))
    }
}

/// Finishes once values have stayed inside a `max - min` band for a
/// continuous `duration`.
#[derive(Debug, Clone)]
pub struct StabilityTimer {
    window: StabilityWindow,
    duration: Duration,
    stability: f64,
    deadline: Deadline,
}

impl StabilityTimer {
    /// Creates a duration-based timer.
    pub fn new(duration: Duration, stability: f64, timeout: Option<Duration>) -> Self {
        Self {
            window: StabilityWindow::new(usize::MAX),
            duration,
            stability,
            deadline: Deadline::new(timeout),
        }
    }

    /// How long the values have been in band, `None` before the first sample.
    pub fn stable_time(&self) -> Option<Duration> {
        (!self.window.is_empty()).then(|| self.window.span())
    }

    /// `(max, min, slope)` over the in-band samples.
    pub fn stats(&self) -> (f64, f64, f64) {
        let fit = self.window.fit();
        (fit.max, fit.min, fit.slope)
    }
}

impl StabilityDetector for StabilityTimer {
    fn add_point_at(&mut self, at: Instant, value: f64) {
        self.window.push(at, value);
        if !self.is_stable() {
            self.window.reset_to_latest();
        }
    }

    fn is_stable(&self) -> bool {
        let fit = self.window.fit();
        fit.max - fit.min < self.stability
    }

    fn is_finished(&self) -> bool {
        self.stable_time().is_some_and(|t| t >= self.duration) || self.is_timed_out()
    }

    fn is_timed_out(&self) -> bool {
        self.window.latest().is_some_and(|at| self.deadline.reached_at(at))
    }
}

/// Detects the onset of cooling: the regression slope has stayed below
/// `threshold` for `dwell`. Any sample that brings the slope back to or above
/// the threshold restarts the window from that sample.
#[derive(Debug, Clone)]
pub struct CoolingOnset {
    window: StabilityWindow,
    threshold: f64,
    dwell: Duration,
    deadline: Deadline,
}

impl CoolingOnset {
    /// Creates an onset detector.
    pub fn new(threshold: f64, dwell: Duration, timeout: Option<Duration>) -> Self {
        Self {
            window: StabilityWindow::new(usize::MAX),
            threshold,
            dwell,
            deadline: Deadline::new(timeout),
        }
    }

    /// How long the slope has been below the threshold.
    pub fn cooling_time(&self) -> Duration {
        self.window.span()
    }
}

impl StabilityDetector for CoolingOnset {
    fn add_point_at(&mut self, at: Instant, value: f64) {
        self.window.push(at, value);
        if !self.is_stable() {
            self.window.reset_to_latest();
        }
    }

    fn is_stable(&self) -> bool {
        self.window.len() > 1 && self.window.fit().slope <= self.threshold
    }

    fn is_finished(&self) -> bool {
        self.cooling_time() >= self.dwell || self.is_timed_out()
    }

    fn is_timed_out(&self) -> bool {
        self.window.latest().is_some_and(|at| self.deadline.reached_at(at))
    }
}
