//! Head-motion to cursor-target mapping and the tracking lifecycle.

use log::{debug, info, warn};
use serde::Serialize;

use crate::calibration::{CalibrationResult, Calibrator};
use crate::config::{ScreenConfig, TrackingConfig, Tuning};
use crate::landmarks::Point2;
use crate::profile::{Profile, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    Idle,
    Calibrating,
    Tracking,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CursorTarget {
    pub x: i32,
    pub y: i32,
}

/// Inclusive per-axis cursor limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Point2,
    pub max: Point2,
}

impl Bounds {
    pub fn screen(screen: &ScreenConfig) -> Self {
        let pad = f64::from(screen.padding);
        Self {
            min: Point2::new(pad, pad),
            max: Point2::new(
                f64::from(screen.width) - pad,
                f64::from(screen.height) - pad,
            ),
        }
    }

    /// Screen bounds narrowed to `region`. A region that misses the padded
    /// screen entirely on an axis leaves that axis at the screen bounds.
    pub fn with_region(self, region: Option<&Region>) -> Self {
        let Some(r) = region else { return self };
        let (x_lo, x_hi) = intersect(self.min.x, self.max.x, f64::from(r.x1), f64::from(r.x2));
        let (y_lo, y_hi) = intersect(self.min.y, self.max.y, f64::from(r.y1), f64::from(r.y2));
        Self {
            min: Point2::new(x_lo, y_lo),
            max: Point2::new(x_hi, y_hi),
        }
    }

    pub fn clamp(&self, p: Point2) -> Point2 {
        Point2::new(
            p.x.clamp(self.min.x, self.max.x),
            p.y.clamp(self.min.y, self.max.y),
        )
    }

    pub fn center(&self) -> Point2 {
        (self.min + self.max) / 2.0
    }
}

fn intersect(lo: f64, hi: f64, r_lo: f64, r_hi: f64) -> (f64, f64) {
    let (a, b) = (lo.max(r_lo), hi.min(r_hi));
    if a <= b {
        (a, b)
    } else {
        warn!("region [{r_lo}, {r_hi}] lies outside the usable screen [{lo}, {hi}]; ignoring it");
        (lo, hi)
    }
}

/// Upper bound on `smoothing * acceleration_factor`. At 1 or above the
/// velocity filter grows without input.
pub const MAX_LOOP_GAIN: f64 = 0.95;

/// Motion parameters for one frame: daemon tuning combined with the
/// active profile.
#[derive(Debug, Clone, Copy)]
pub struct MotionParams {
    pub speed_gain: f64,
    pub smooth_factor: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    pub movement_threshold: f64,
    pub max_movement: f64,
}

impl MotionParams {
    pub fn new(tracking: &TrackingConfig, profile: &Profile) -> Self {
        Self {
            speed_gain: tracking.mouse_speed * profile.sensitivity,
            smooth_factor: profile
                .smoothing
                .min(MAX_LOOP_GAIN / tracking.acceleration_factor),
            acceleration: tracking.acceleration_factor,
            deceleration: tracking.deceleration_factor,
            movement_threshold: tracking.movement_threshold,
            max_movement: tracking.max_movement,
        }
    }
}

fn expand(v: f64) -> f64 {
    v.signum() * v.abs().powf(1.5)
}

#[derive(Debug, Clone)]
pub struct PositionTracker {
    state: TrackingState,
    calibrator: Calibrator,
    reference: Option<Point2>,
    velocity: Point2,
    cursor: Point2,
    screen: Bounds,
}

impl PositionTracker {
    pub fn new(tuning: &Tuning) -> Self {
        let screen = Bounds::screen(&tuning.screen);
        Self {
            state: TrackingState::Idle,
            calibrator: Calibrator::new(
                tuning.tracking.calibration_frames,
                tuning.tracking.calibration_threshold,
            ),
            reference: None,
            velocity: Point2::ZERO,
            cursor: screen.center(),
            screen,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn reference(&self) -> Option<Point2> {
        self.reference
    }

    pub fn velocity(&self) -> Point2 {
        self.velocity
    }

    pub fn cursor(&self) -> Point2 {
        self.cursor
    }

    pub fn calibration_progress(&self) -> f64 {
        self.calibrator.progress_percent()
    }

    /// Idle -> Calibrating. Any other state is left alone.
    pub fn start(&mut self) -> TrackingState {
        if self.state == TrackingState::Idle {
            self.begin_calibration();
        }
        self.state
    }

    /// Back to Idle; calibration is discarded so the next start recalibrates.
    pub fn stop(&mut self) -> TrackingState {
        self.state = TrackingState::Idle;
        self.reference = None;
        self.calibrator.reset();
        info!("tracking stopped");
        self.state
    }

    pub fn toggle_tracking(&mut self) -> TrackingState {
        match self.state {
            TrackingState::Idle => self.start(),
            _ => self.stop(),
        }
    }

    /// Tracking <-> Paused. Calibration state is never touched.
    pub fn toggle_pause(&mut self) -> TrackingState {
        self.state = match self.state {
            TrackingState::Tracking => TrackingState::Paused,
            TrackingState::Paused => TrackingState::Tracking,
            other => {
                debug!("pause ignored while {other:?}");
                other
            }
        };
        self.state
    }

    /// Drop the reference and start a fresh calibration attempt.
    pub fn begin_calibration(&mut self) {
        self.reference = None;
        self.calibrator.reset();
        self.state = TrackingState::Calibrating;
        info!("calibrating: hold your head still");
    }

    /// Feed one reference-candidate sample. Only meaningful while Calibrating.
    pub fn calibrate(&mut self, point: Point2) -> CalibrationResult {
        if self.state != TrackingState::Calibrating {
            return CalibrationResult::Pending;
        }
        let result = self.calibrator.observe(point);
        if let CalibrationResult::Success(reference) = result {
            self.reference = Some(reference);
            self.velocity = Point2::ZERO;
            self.state = TrackingState::Tracking;
        }
        result
    }

    /// Advance the velocity model by one frame and produce a cursor target.
    ///
    /// Returns `None` unless Tracking with a reference. While Paused the
    /// velocity filter keeps running so resuming starts from the current
    /// head offset, but the cursor does not move.
    pub fn update(
        &mut self,
        point: Point2,
        dt: f64,
        params: &MotionParams,
        region: Option<&Region>,
    ) -> Option<CursorTarget> {
        if !matches!(self.state, TrackingState::Tracking | TrackingState::Paused) {
            return None;
        }
        let reference = self.reference?;
        if !(dt.is_finite() && dt > 0.0) {
            debug!("skipping motion update: dt={dt}");
            return None;
        }

        let Some(velocity) = self.next_velocity(point, reference, params) else {
            warn!(
                "position update produced a non-finite velocity (point {point:?}, reference {reference:?})"
            );
            return None;
        };
        self.velocity = velocity;
        if self.state == TrackingState::Paused {
            return None;
        }

        let mut step = velocity * dt;
        let len = step.norm();
        if len > params.max_movement {
            step = step * (params.max_movement / len);
        }
        let bounds = self.screen.with_region(region);
        let target = bounds.clamp(self.cursor + step);
        self.cursor = target;
        Some(CursorTarget {
            x: target.x.round() as i32,
            y: target.y.round() as i32,
        })
    }

    fn next_velocity(&self, point: Point2, reference: Point2, p: &MotionParams) -> Option<Point2> {
        let d = point - reference;
        let displacement = Point2::new(expand(d.x), expand(d.y));
        let target = displacement * p.speed_gain;
        let mut v = self.velocity * p.smooth_factor + target * (1.0 - p.smooth_factor);
        if v.norm() > p.movement_threshold {
            v = v * p.acceleration;
        } else {
            v = v * p.deceleration;
        }
        v.is_finite().then_some(v)
    }
}
