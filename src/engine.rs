//! One-frame-at-a-time orchestration: calibrate or track, detect gestures,
//! and collect the effects for the dispatcher.
//!
//! The engine is owned by the pipeline thread. Commands from the control
//! socket arrive through [`Engine::apply`] between frames, never during one.

use log::{debug, info};
use serde::Serialize;
use std::collections::VecDeque;

use crate::calibration::CalibrationResult;
use crate::config::Tuning;
use crate::gestures::{Gesture, GestureDetector, Ratios, Thresholds};
use crate::landmarks::{Frame, Point2};
use crate::profile::Profile;
use crate::tracker::{CursorTarget, MotionParams, PositionTracker, TrackingState};

#[derive(Debug, Clone)]
pub enum Command {
    Start,
    ToggleTracking,
    TogglePause,
    Recalibrate,
    /// Switch to another profile; always recalibrates.
    SetProfile(Profile),
    /// New settings for the active profile; calibration is kept.
    UpdateProfile(Profile),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    State { state: TrackingState },
    Calibrated { profile: String, reference: Point2 },
    CalibrationFailed,
    ProfileChanged { name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    MoveCursor(CursorTarget),
    Gesture(Gesture),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// Not admitted by the every-n-frames rule.
    Skipped,
    NoFace,
    Idle,
    Calibrating { progress: f64 },
    Tracked,
    Paused,
}

#[derive(Debug, Clone)]
pub struct FrameReport {
    pub outcome: FrameOutcome,
    pub effects: Vec<Effect>,
    pub notifications: Vec<Notification>,
}

impl FrameReport {
    fn new(outcome: FrameOutcome) -> Self {
        Self {
            outcome,
            effects: Vec::new(),
            notifications: Vec::new(),
        }
    }
}

/// Rolling frames-per-second over the last `window` intervals.
#[derive(Debug, Clone)]
pub struct FrameRate {
    window: usize,
    intervals: VecDeque<f64>,
    last: Option<f64>,
}

impl FrameRate {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            intervals: VecDeque::with_capacity(window),
            last: None,
        }
    }

    pub fn tick(&mut self, ts: f64) {
        if let Some(last) = self.last {
            let dt = ts - last;
            if dt > 0.0 && dt.is_finite() {
                if self.intervals.len() == self.window {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(dt);
            }
        }
        self.last = Some(ts);
    }

    pub fn fps(&self) -> f64 {
        let total: f64 = self.intervals.iter().sum();
        if total > 0.0 {
            self.intervals.len() as f64 / total
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: TrackingState,
    pub profile: String,
    pub reference: Option<Point2>,
    pub calibration_progress: f64,
    pub velocity: Point2,
    pub cursor: Point2,
    pub fps: f64,
    pub frames_received: u64,
    pub frames_processed: u64,
    pub face_visible: bool,
    pub ratios: Option<Ratios>,
}

pub struct Engine {
    tuning: Tuning,
    profile: Profile,
    tracker: PositionTracker,
    gestures: GestureDetector,
    rate: FrameRate,
    frames_received: u64,
    frames_processed: u64,
    last_motion_ts: Option<f64>,
    face_visible: bool,
    last_ratios: Option<Ratios>,
}

impl Engine {
    pub fn new(tuning: Tuning, profile: Profile) -> Self {
        Self {
            tracker: PositionTracker::new(&tuning),
            gestures: GestureDetector::new(&tuning.gestures),
            rate: FrameRate::new(tuning.pipeline.fps_window),
            tuning,
            profile,
            frames_received: 0,
            frames_processed: 0,
            last_motion_ts: None,
            face_visible: false,
            last_ratios: None,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.tracker.state(),
            profile: self.profile.name.clone(),
            reference: self.tracker.reference(),
            calibration_progress: self.tracker.calibration_progress(),
            velocity: self.tracker.velocity(),
            cursor: self.tracker.cursor(),
            fps: self.rate.fps(),
            frames_received: self.frames_received,
            frames_processed: self.frames_processed,
            face_visible: self.face_visible,
            ratios: self.last_ratios,
        }
    }

    pub fn apply(&mut self, cmd: Command) -> Vec<Notification> {
        let before = self.tracker.state();
        let mut out = Vec::new();
        match cmd {
            Command::Start => {
                self.tracker.start();
            }
            Command::ToggleTracking => {
                self.tracker.toggle_tracking();
            }
            Command::TogglePause => {
                self.tracker.toggle_pause();
            }
            Command::Recalibrate => {
                self.tracker.begin_calibration();
                self.gestures.reset_counters();
                out.push(Notification::State {
                    state: TrackingState::Calibrating,
                });
            }
            Command::SetProfile(profile) => {
                info!("switching to profile '{}'", profile.name);
                out.push(Notification::ProfileChanged {
                    name: profile.name.clone(),
                });
                self.profile = profile;
                self.gestures.reset_counters();
                if self.tracker.state() != TrackingState::Idle {
                    self.tracker.begin_calibration();
                    out.push(Notification::State {
                        state: TrackingState::Calibrating,
                    });
                }
            }
            Command::UpdateProfile(profile) => {
                debug!("settings updated for profile '{}'", profile.name);
                out.push(Notification::ProfileChanged {
                    name: profile.name.clone(),
                });
                self.profile = profile;
            }
        }
        let after = self.tracker.state();
        if after != before && !out.contains(&Notification::State { state: after }) {
            out.push(Notification::State { state: after });
        }
        if after == TrackingState::Idle {
            self.last_motion_ts = None;
            self.gestures.reset_counters();
        }
        out
    }

    /// Process one detector frame stamped at `ts` seconds.
    pub fn process(&mut self, frame: &Frame, ts: f64) -> FrameReport {
        self.frames_received += 1;
        self.rate.tick(ts);

        let every = u64::from(self.tuning.pipeline.process_every_n_frames.max(1));
        if self.frames_received % every != 0 {
            return FrameReport::new(FrameOutcome::Skipped);
        }
        self.frames_processed += 1;

        let Some(lm) = frame.landmarks.as_ref() else {
            self.face_visible = false;
            return FrameReport::new(FrameOutcome::NoFace);
        };
        self.face_visible = true;
        self.last_ratios = Ratios::measure(lm);
        let nose = lm.nose();

        match self.tracker.state() {
            TrackingState::Idle => FrameReport::new(FrameOutcome::Idle),
            TrackingState::Calibrating => self.calibrate_step(nose, ts),
            state @ (TrackingState::Tracking | TrackingState::Paused) => {
                let mut report = FrameReport::new(if state == TrackingState::Tracking {
                    FrameOutcome::Tracked
                } else {
                    FrameOutcome::Paused
                });
                let dt = match self.last_motion_ts {
                    Some(prev) => (ts - prev).min(self.tuning.pipeline.max_frame_dt),
                    None => 0.0,
                };
                self.last_motion_ts = Some(ts);

                let params = MotionParams::new(&self.tuning.tracking, &self.profile);
                let region = self.profile.region_bounds.as_ref();
                if let Some(target) = self.tracker.update(nose, dt, &params, region) {
                    report.effects.push(Effect::MoveCursor(target));
                }

                let th = Thresholds {
                    blink: self.profile.blink_threshold,
                    mouth: self.profile.mouth_threshold,
                };
                let gestures = self.gestures.update(lm, th, ts);
                if state == TrackingState::Tracking {
                    report
                        .effects
                        .extend(gestures.into_iter().map(Effect::Gesture));
                } else if !gestures.is_empty() {
                    debug!("paused: suppressed {gestures:?}");
                }
                report
            }
        }
    }

    fn calibrate_step(&mut self, nose: Point2, ts: f64) -> FrameReport {
        match self.tracker.calibrate(nose) {
            CalibrationResult::Pending => FrameReport::new(FrameOutcome::Calibrating {
                progress: self.tracker.calibration_progress(),
            }),
            CalibrationResult::Success(reference) => {
                self.last_motion_ts = Some(ts);
                self.gestures.reset_counters();
                let mut r = FrameReport::new(FrameOutcome::Calibrating { progress: 100.0 });
                r.notifications.push(Notification::Calibrated {
                    profile: self.profile.name.clone(),
                    reference,
                });
                r.notifications.push(Notification::State {
                    state: TrackingState::Tracking,
                });
                r
            }
            CalibrationResult::Failed => {
                let mut r = FrameReport::new(FrameOutcome::Calibrating { progress: 0.0 });
                r.notifications.push(Notification::CalibrationFailed);
                r
            }
        }
    }
}
