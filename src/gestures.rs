//! Blink and mouth-open detection from landmark geometry.

use log::{debug, warn};
use serde::Serialize;

use crate::config::GestureConfig;
use crate::error::{FaceError, FaceResult};
use crate::landmarks::{INNER_MOUTH, LEFT_EYE, LandmarkSet, Point2, RIGHT_EYE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    Blink,
    MouthOpen,
}

/// `(|p1-p5| + |p2-p4|) / (2 |p0-p3|)`, or 0 for a degenerate eye.
pub fn eye_aspect_ratio(eye: &[Point2; 6]) -> f64 {
    let v1 = eye[1].distance(eye[5]);
    let v2 = eye[2].distance(eye[4]);
    let h = eye[0].distance(eye[3]);
    if h > 0.0 { (v1 + v2) / (2.0 * h) } else { 0.0 }
}

/// `(|m2-m6| + |m3-m5|) / (2 |m0-m4|)`, or 0 for a degenerate mouth.
pub fn mouth_aspect_ratio(mouth: &[Point2; 8]) -> f64 {
    let v1 = mouth[2].distance(mouth[6]);
    let v2 = mouth[3].distance(mouth[5]);
    let h = mouth[0].distance(mouth[4]);
    if h > 0.0 { (v1 + v2) / (2.0 * h) } else { 0.0 }
}

/// Mean EAR of both eyes.
pub fn blink_ratio(lm: &LandmarkSet) -> FaceResult<f64> {
    let left = eye_aspect_ratio(&lm.pick(LEFT_EYE));
    let right = eye_aspect_ratio(&lm.pick(RIGHT_EYE));
    finite((left + right) / 2.0, "eye aspect ratio")
}

pub fn mouth_ratio(lm: &LandmarkSet) -> FaceResult<f64> {
    finite(mouth_aspect_ratio(&lm.pick(INNER_MOUTH)), "mouth aspect ratio")
}

fn finite(v: f64, what: &str) -> FaceResult<f64> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(FaceError::malformed(format!("{what} is not finite")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Condition holds while the ratio is below the threshold.
    Below,
    /// Condition holds while the ratio is above the threshold.
    Above,
}

impl Comparison {
    fn holds(self, ratio: f64, threshold: f64) -> bool {
        match self {
            Comparison::Below => ratio < threshold,
            Comparison::Above => ratio > threshold,
        }
    }
}

/// Falling-edge trigger: the condition must hold for `required` frames,
/// and the event fires on the first frame it stops holding, at most once
/// per `cooldown` seconds. The count is cleared by every false frame that
/// does not fire.
#[derive(Debug, Clone)]
pub struct Debouncer {
    comparison: Comparison,
    required: u32,
    cooldown: f64,
    consecutive: u32,
    last_trigger: Option<f64>,
}

impl Debouncer {
    pub fn new(comparison: Comparison, required: u32, cooldown: f64) -> Self {
        Self {
            comparison,
            required,
            cooldown,
            consecutive: 0,
            last_trigger: None,
        }
    }

    pub fn update(&mut self, ratio: f64, threshold: f64, now: f64) -> bool {
        if self.comparison.holds(ratio, threshold) {
            self.consecutive = self.consecutive.saturating_add(1);
            return false;
        }
        if self.consecutive >= self.required && self.cooldown_elapsed(now) {
            self.last_trigger = Some(now);
            return true;
        }
        self.consecutive = 0;
        false
    }

    /// Treat this frame as "condition false" without allowing a trigger.
    pub fn interrupt(&mut self) {
        self.consecutive = 0;
    }

    pub fn cooldown_elapsed(&self, now: f64) -> bool {
        self.last_trigger.is_none_or(|t| now - t >= self.cooldown)
    }

    #[cfg(test)]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    #[cfg(test)]
    pub fn last_trigger(&self) -> Option<f64> {
        self.last_trigger
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Ratios {
    pub eye: f64,
    pub mouth: f64,
}

impl Ratios {
    pub fn measure(lm: &LandmarkSet) -> Option<Self> {
        Some(Self {
            eye: blink_ratio(lm).ok()?,
            mouth: mouth_ratio(lm).ok()?,
        })
    }
}

/// Per-frame thresholds, taken from the active profile.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub blink: f64,
    pub mouth: f64,
}

#[derive(Debug, Clone)]
pub struct GestureDetector {
    blink: Debouncer,
    mouth: Debouncer,
}

impl GestureDetector {
    pub fn new(cfg: &GestureConfig) -> Self {
        Self {
            blink: Debouncer::new(Comparison::Below, cfg.eye_ar_consec_frames, cfg.blink_cooldown),
            mouth: Debouncer::new(
                Comparison::Above,
                cfg.mouth_ar_consec_frames,
                cfg.mouth_cooldown,
            ),
        }
    }

    /// Run both detectors for one frame; each fires independently.
    pub fn update(&mut self, lm: &LandmarkSet, th: Thresholds, now: f64) -> Vec<Gesture> {
        let mut out = Vec::new();
        if step(&mut self.blink, blink_ratio(lm), th.blink, now, "blink") {
            out.push(Gesture::Blink);
        }
        if step(&mut self.mouth, mouth_ratio(lm), th.mouth, now, "mouth") {
            out.push(Gesture::MouthOpen);
        }
        out
    }

    #[cfg(test)]
    pub fn counters(&self) -> (u32, u32) {
        (self.blink.consecutive(), self.mouth.consecutive())
    }

    #[cfg(test)]
    pub fn last_triggers(&self) -> (Option<f64>, Option<f64>) {
        (self.blink.last_trigger(), self.mouth.last_trigger())
    }

    pub fn reset_counters(&mut self) {
        self.blink.interrupt();
        self.mouth.interrupt();
    }
}

fn step(d: &mut Debouncer, ratio: FaceResult<f64>, threshold: f64, now: f64, what: &str) -> bool {
    match ratio {
        Ok(r) => {
            let fired = d.update(r, threshold, now);
            if fired {
                debug!("{what} detected (ratio {r:.3}, threshold {threshold:.3})");
            }
            fired
        }
        Err(e) => {
            warn!("{what} detection skipped: {e}");
            d.interrupt();
            false
        }
    }
}
