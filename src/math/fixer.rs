//! Baseline discontinuity detection and repair.
//!
//! Maintains a sliding window of samples, fits both edges with a
//! quadratic, and when the edges disagree by more than the score
//! threshold, rebases the right edge and blends the interior so the
//! observable series stays continuous. The reported output lags the input
//! by a fixed [`EDGE`] samples.

use super::SamplePoint;
use super::fit::{Fit, quadratic_fit};
use super::stats::RunningStats;

/// Retained history before the buffer is truncated back to the window.
pub const BUFFER: usize = 4096;
/// Samples analysed per call.
pub const WINDOW: usize = 10;
/// Samples fitted at each end of the window; also the output latency.
pub const EDGE: usize = 4;

const SCORE_THRESHOLD: f64 = 10.0;
const SLOPE_WEIGHT: f64 = 0.05;
const CURVE_WEIGHT: f64 = 0.01;
/// A single-sample step larger than this marks the window as straddling
/// an outlier rather than a baseline shift.
const RAW_STEP_LIMIT: f64 = 40.0;
const SCORE_STATS_WINDOW: usize = 64;

/// Analysis of one window: edge fits and their disagreement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscontinuityReport {
    pub left: Fit,
    pub right: Fit,
    /// Right-edge minus left-edge fit, evaluated at the window midpoint.
    pub delta_y: f64,
    pub delta_slope: f64,
    pub delta_curvature: f64,
    pub score: f64,
}

/// One corrected output sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixResult {
    pub x: f64,
    pub y: f64,
    /// True when this call detected a jump and rewrote the window.
    pub changed: bool,
}

#[derive(Debug)]
pub struct DiscontinuityFixer {
    data: Vec<SamplePoint>,
    /// Baseline correction applied to every newly appended point.
    current_offset_y: f64,
    last_raw_y: Option<f64>,
    last_report: Option<DiscontinuityReport>,
    score_stats: RunningStats,
}

impl Default for DiscontinuityFixer {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscontinuityFixer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUFFER),
            current_offset_y: 0.0,
            last_raw_y: None,
            last_report: None,
            score_stats: RunningStats::new(SCORE_STATS_WINDOW),
        }
    }

    /// Appends `(x, y)` and returns the delayed, possibly corrected
    /// output sample.
    pub fn fix(&mut self, x: f64, y: f64) -> FixResult {
        let raw_step = self.last_raw_y.is_some_and(|prev| (y - prev).abs() > RAW_STEP_LIMIT);
        self.last_raw_y = Some(y);

        self.data.push(SamplePoint::new(x, y, self.current_offset_y));
        if self.data.len() > BUFFER {
            let excess = self.data.len() - WINDOW;
            self.data.drain(..excess);
        }

        let len = self.data.len();
        if len < WINDOW {
            let p = self.data[len - 1];
            return FixResult { x: p.x(), y: p.y(), changed: false };
        }

        // Copy and centre the window; the quadratic fit needs conditioned
        // abscissae.
        let start = len - WINDOW;
        let mut window: Vec<SamplePoint> = self.data[start..].to_vec();
        let mean_x = window.iter().map(|p| p.x()).sum::<f64>() / WINDOW as f64;
        for p in &mut window {
            p.shift_x(-mean_x);
        }

        let out = self.data[len - 1 - EDGE];
        let unchanged = FixResult { x: out.x(), y: out.y(), changed: false };

        let left = quadratic_fit(&window[..EDGE]);
        let right = quadratic_fit(&window[WINDOW - EDGE..]);
        let (Some(left), Some(right)) = (left, right) else {
            return unchanged;
        };

        let x_mid = 0.5 * (window[EDGE - 1].x() + window[WINDOW - EDGE].x());
        let delta_y = right.evaluate(x_mid) - left.evaluate(x_mid);
        let delta_slope = right.slope_mean - left.slope_mean;
        let delta_curvature = right.curvature - left.curvature;

        let mut score =
            delta_y.abs() - SLOPE_WEIGHT * delta_slope.abs() - CURVE_WEIGHT * delta_curvature.abs();
        if raw_step || window_straddles_step(&window) {
            score = 0.0;
        }
        self.score_stats.add(score);
        self.last_report =
            Some(DiscontinuityReport { left, right, delta_y, delta_slope, delta_curvature, score });

        if score <= SCORE_THRESHOLD {
            return unchanged;
        }

        // Rebase the right edge onto the left baseline.
        for p in &mut self.data[len - EDGE..] {
            p.adjust_offset(-delta_y);
        }

        // Refit the adjusted edge, then pin each interior point to the
        // average of both curves.
        let mut right_window: Vec<SamplePoint> = self.data[len - EDGE..].to_vec();
        for p in &mut right_window {
            p.shift_x(-mean_x);
        }
        if let Some(right_adjusted) = quadratic_fit(&right_window) {
            for i in start + EDGE..len - EDGE {
                let cx = self.data[i].x() - mean_x;
                let target = 0.5 * (left.evaluate(cx) + right_adjusted.evaluate(cx));
                let delta = target - self.data[i].y();
                self.data[i].adjust_offset(delta);
            }
        }

        self.current_offset_y -= delta_y;

        let out = self.data[len - 1 - EDGE];
        FixResult { x: out.x(), y: out.y(), changed: true }
    }

    /// Analysis of the most recent full window.
    pub fn last_report(&self) -> Option<&DiscontinuityReport> {
        self.last_report.as_ref()
    }

    /// Baseline correction currently applied to incoming points.
    pub fn current_offset(&self) -> f64 {
        self.current_offset_y
    }

    /// Windowed statistics over recent scores, for diagnostics.
    pub fn score_stats(&self) -> &RunningStats {
        &self.score_stats
    }
}

/// True when a raw step sits where it would poison an edge fit: inside
/// either fitted edge, or on the boundary into the right edge.
fn window_straddles_step(window: &[SamplePoint]) -> bool {
    if window[WINDOW - EDGE].y() - window[WINDOW - EDGE - 1].y() > RAW_STEP_LIMIT {
        return true;
    }
    let edge_has_step = |points: &[SamplePoint]| {
        points.windows(2).any(|pair| (pair[1].y() - pair[0].y()).abs() > RAW_STEP_LIMIT)
    };
    edge_has_step(&window[..EDGE]) || edge_has_step(&window[WINDOW - EDGE..])
}
