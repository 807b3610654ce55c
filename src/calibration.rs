//! Reference-point calibration with a single 2-sigma outlier trim.

use log::{debug, info, warn};

use crate::landmarks::Point2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationResult {
    Pending,
    Success(Point2),
    Failed,
}

#[derive(Debug, Clone)]
pub struct Calibrator {
    frames: usize,
    threshold: f64,
    buffer: Vec<Point2>,
}

impl Calibrator {
    /// `frames` samples per attempt; at least `frames * threshold` of them
    /// must survive the outlier trim.
    pub fn new(frames: usize, threshold: f64) -> Self {
        Self {
            frames: frames.max(1),
            threshold,
            buffer: Vec::with_capacity(frames),
        }
    }

    pub fn observe(&mut self, point: Point2) -> CalibrationResult {
        self.buffer.push(point);
        if self.buffer.len() < self.frames {
            return CalibrationResult::Pending;
        }

        let result = match self.evaluate() {
            Some(reference) => {
                info!(
                    "calibration successful: reference ({:.1}, {:.1})",
                    reference.x, reference.y
                );
                CalibrationResult::Success(reference)
            }
            None => {
                warn!("calibration failed - too much movement");
                CalibrationResult::Failed
            }
        };
        self.buffer.clear();
        result
    }

    fn evaluate(&self) -> Option<Point2> {
        let n = self.buffer.len() as f64;
        let centre = mean(&self.buffer)?;
        let var = self.buffer.iter().fold(Point2::ZERO, |acc, p| {
            let d = *p - centre;
            acc + Point2::new(d.x * d.x, d.y * d.y)
        }) / n;
        let sigma = Point2::new(var.x.sqrt(), var.y.sqrt());

        let good: Vec<Point2> = self
            .buffer
            .iter()
            .copied()
            .filter(|p| within(p.x - centre.x, sigma.x) && within(p.y - centre.y, sigma.y))
            .collect();

        let needed = self.frames as f64 * self.threshold;
        debug!(
            "calibration: {} of {} samples within 2 sigma (need {needed:.1})",
            good.len(),
            self.buffer.len()
        );
        if (good.len() as f64) < needed || good.is_empty() {
            return None;
        }
        let reference = mean(&good)?;
        reference.is_finite().then_some(reference)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.frames
    }

    /// Fill level of the current attempt, 0..=100.
    pub fn progress_percent(&self) -> f64 {
        self.buffer.len() as f64 / self.frames as f64 * 100.0
    }
}

// Offsets from the first sample keep identical samples exact.
fn mean(points: &[Point2]) -> Option<Point2> {
    let first = *points.first()?;
    let offset = points.iter().fold(Point2::ZERO, |acc, p| acc + (*p - first));
    Some(first + offset / points.len() as f64)
}

// A zero-spread axis keeps every sample: all of them sit on the mean.
fn within(deviation: f64, sigma: f64) -> bool {
    if sigma == 0.0 {
        return deviation == 0.0;
    }
    deviation.abs() < 2.0 * sigma
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn feed(cal: &mut Calibrator, pts: &[Point2]) -> Vec<CalibrationResult> {
        pts.iter().map(|p| cal.observe(*p)).collect()
    }

    #[test]
    fn identical_points_calibrate_to_that_point() {
        let mut cal = Calibrator::new(15, 0.7);
        let p = Point2::new(321.5, 240.25);
        let results = feed(&mut cal, &[p; 15]);
        assert!(results[..14].iter().all(|r| *r == CalibrationResult::Pending));
        assert_eq!(results[14], CalibrationResult::Success(p));
        assert_eq!(cal.len(), 0);
    }

    #[test]
    fn small_jitter_succeeds_near_mean() {
        let mut cal = Calibrator::new(15, 0.7);
        let pts: Vec<Point2> = (0..15)
            .map(|i| Point2::new(100.0 + (i % 3) as f64 * 0.5, 200.0 - (i % 2) as f64 * 0.5))
            .collect();
        let last = *feed(&mut cal, &pts).last().unwrap();
        match last {
            CalibrationResult::Success(r) => {
                assert!((r.x - 100.5).abs() < 1.0);
                assert!((r.y - 199.75).abs() < 1.0);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn single_glitch_is_trimmed() {
        let mut cal = Calibrator::new(15, 0.7);
        let mut pts = vec![Point2::new(100.0, 100.0); 15];
        pts[7] = Point2::new(400.0, 100.0);
        let last = *feed(&mut cal, &pts).last().unwrap();
        assert_eq!(last, CalibrationResult::Success(Point2::new(100.0, 100.0)));
    }

    #[test]
    fn too_many_outliers_fail_and_clear() {
        // three x-outliers and three y-outliers on distinct samples:
        // 6 of 15 fall outside 2 sigma, leaving 9 < 10.5
        let mut pts = vec![Point2::new(100.0, 100.0); 15];
        pts[0].x = 160.0;
        pts[1].x = 160.0;
        pts[2].x = 40.0;
        pts[3].y = 160.0;
        pts[4].y = 160.0;
        pts[5].y = 40.0;

        let mut cal = Calibrator::new(15, 0.7);
        let last = *feed(&mut cal, &pts).last().unwrap();
        assert_eq!(last, CalibrationResult::Failed);
        assert_eq!(cal.len(), 0);

        // next attempt starts from scratch
        assert_eq!(cal.observe(Point2::new(1.0, 1.0)), CalibrationResult::Pending);
        assert_eq!(cal.len(), 1);
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let mut cal = Calibrator::new(5, 0.7);
        for i in 0..23 {
            cal.observe(Point2::new(i as f64, 0.0));
            assert!(cal.len() < cal.capacity());
        }
    }

    #[test]
    fn progress_reports_fill_level() {
        let mut cal = Calibrator::new(4, 0.5);
        cal.observe(Point2::ZERO);
        assert_eq!(cal.progress_percent(), 25.0);
        cal.reset();
        assert_eq!(cal.progress_percent(), 0.0);
    }

    proptest! {
        #[test]
        fn identical_samples_reproduce_the_point(
            x in -1.0e6f64..1.0e6,
            y in -1.0e6f64..1.0e6,
        ) {
            let mut cal = Calibrator::new(15, 0.7);
            let p = Point2::new(x, y);
            let last = *feed(&mut cal, &[p; 15]).last().unwrap();
            prop_assert_eq!(last, CalibrationResult::Success(p));
        }
    }

    #[test]
    fn non_dyadic_point_is_exact() {
        let mut cal = Calibrator::new(15, 0.7);
        let p = Point2::new(0.1, 0.7);
        assert_eq!(*feed(&mut cal, &[p; 15]).last().unwrap(), CalibrationResult::Success(p));
    }
}
