//! Facial landmark frames as delivered by the external detector.
//!
//! The detector uses the 68-point layout. A frame is one JSON line:
//! `{"t": 12.5, "points": [[x, y], ...]}`; `points` null or absent means
//! no face was found in that frame.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Sub};

use crate::error::{FaceError, FaceResult};

pub const NUM_LANDMARKS: usize = 68;

pub const NOSE_TIP: usize = 30;
pub const LEFT_EYE: [usize; 6] = [36, 37, 38, 39, 40, 41];
pub const RIGHT_EYE: [usize; 6] = [42, 43, 44, 45, 46, 47];
pub const INNER_MOUTH: [usize; 8] = [60, 61, 62, 63, 64, 65, 66, 67];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const ZERO: Point2 = Point2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn distance(self, other: Point2) -> f64 {
        (self - other).norm()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Point2 {
    type Output = Point2;
    fn add(self, rhs: Point2) -> Point2 {
        Point2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point2 {
    type Output = Point2;
    fn sub(self, rhs: Point2) -> Point2 {
        Point2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point2 {
    type Output = Point2;
    fn mul(self, k: f64) -> Point2 {
        Point2::new(self.x * k, self.y * k)
    }
}

impl Div<f64> for Point2 {
    type Output = Point2;
    fn div(self, k: f64) -> Point2 {
        Point2::new(self.x / k, self.y / k)
    }
}

/// Exactly [`NUM_LANDMARKS`] finite points for one face.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSet {
    points: Vec<Point2>,
}

impl LandmarkSet {
    pub fn from_points(points: Vec<Point2>) -> FaceResult<Self> {
        if points.len() != NUM_LANDMARKS {
            return Err(FaceError::malformed(format!(
                "expected {NUM_LANDMARKS} points, got {}",
                points.len()
            )));
        }
        if let Some(i) = points.iter().position(|p| !p.is_finite()) {
            return Err(FaceError::malformed(format!("point {i} is not finite")));
        }
        Ok(Self { points })
    }

    pub fn nose(&self) -> Point2 {
        self.points[NOSE_TIP]
    }

    pub fn pick<const N: usize>(&self, indices: [usize; N]) -> [Point2; N] {
        indices.map(|i| self.points[i])
    }
}

/// One decoded detector frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Seconds on the detector's clock, if the detector stamps frames.
    pub timestamp: Option<f64>,
    pub landmarks: Option<LandmarkSet>,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    t: Option<f64>,
    #[serde(default)]
    points: Option<Vec<[f64; 2]>>,
}

impl Frame {
    pub fn no_face(timestamp: Option<f64>) -> Self {
        Self {
            timestamp,
            landmarks: None,
        }
    }

    pub fn with_face(timestamp: Option<f64>, landmarks: LandmarkSet) -> Self {
        Self {
            timestamp,
            landmarks: Some(landmarks),
        }
    }

    /// Decode one JSON line from the detector.
    pub fn parse_line(line: &str) -> FaceResult<Self> {
        let wire: WireFrame = serde_json::from_str(line)
            .map_err(|e| FaceError::malformed(format!("bad frame json: {e}")))?;
        if let Some(t) = wire.t {
            if !t.is_finite() {
                return Err(FaceError::malformed("timestamp is not finite"));
            }
        }
        let landmarks = match wire.points {
            None => None,
            Some(raw) => {
                let pts = raw.into_iter().map(|[x, y]| Point2::new(x, y)).collect();
                Some(LandmarkSet::from_points(pts)?)
            }
        };
        Ok(Self {
            timestamp: wire.t,
            landmarks,
        })
    }
}
