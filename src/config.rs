use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::error::FaceError;

pub fn config_dir() -> Result<PathBuf> {
    let dirs = UserDirs::new().ok_or_else(|| anyhow!("cannot resolve home directory"))?;
    Ok(dirs.home_dir().join(".config").join("facectl"))
}

pub fn profiles_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("profiles"))
}

fn tuning_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScreenConfig {
    pub width: u32,
    pub height: u32,
    pub padding: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            padding: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingConfig {
    /// Base gain; the active profile's sensitivity scales it.
    pub mouse_speed: f64,
    pub acceleration_factor: f64,
    pub deceleration_factor: f64,
    pub movement_threshold: f64,
    /// Largest cursor step in pixels per processed frame.
    pub max_movement: f64,
    pub calibration_frames: usize,
    pub calibration_threshold: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            mouse_speed: 1.2,
            acceleration_factor: 1.5,
            deceleration_factor: 0.8,
            movement_threshold: 2.0,
            max_movement: 100.0,
            calibration_frames: 15,
            calibration_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GestureConfig {
    pub eye_ar_consec_frames: u32,
    pub blink_cooldown: f64,
    pub mouth_ar_consec_frames: u32,
    pub mouth_cooldown: f64,
    /// Global rate limit across all click kinds, applied at dispatch.
    pub click_cooldown: f64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            eye_ar_consec_frames: 2,
            blink_cooldown: 1.0,
            mouth_ar_consec_frames: 3,
            mouth_cooldown: 1.0,
            click_cooldown: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub process_every_n_frames: u32,
    pub max_frame_dt: f64,
    pub fps_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            process_every_n_frames: 2,
            max_frame_dt: 0.25,
            fps_window: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Socket,
    Stdin,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Replay file for `kind = "file"`; socket path override for `"socket"`.
    pub path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Socket,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Daemon-wide tuning, shared by every profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub screen: ScreenConfig,
    pub tracking: TrackingConfig,
    pub gestures: GestureConfig,
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

impl Tuning {
    /// Load `~/.config/facectl/config.toml`, or defaults when absent.
    pub fn load() -> Result<Self> {
        let path = tuning_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(&path)
            .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
        let tuning = Self::from_toml(&txt).map_err(|e| anyhow!("{}: {e}", path.display()))?;
        info!("loaded tuning from {}", path.display());
        Ok(tuning)
    }

    pub fn from_toml(txt: &str) -> Result<Self, FaceError> {
        let tuning: Tuning =
            toml::from_str(txt).map_err(|e| FaceError::config(format!("parse error: {e}")))?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<(), FaceError> {
        let s = &self.screen;
        let span = s.padding.saturating_mul(2);
        if s.width <= span || s.height <= span {
            return Err(FaceError::config(
                "screen must be larger than twice the padding on both axes",
            ));
        }
        let t = &self.tracking;
        if !(t.mouse_speed.is_finite() && t.mouse_speed > 0.0) {
            return Err(FaceError::config("tracking.mouse_speed must be > 0"));
        }
        if !(t.acceleration_factor.is_finite() && t.acceleration_factor >= 1.0) {
            return Err(FaceError::config("tracking.acceleration_factor must be >= 1"));
        }
        if !(t.deceleration_factor > 0.0 && t.deceleration_factor <= 1.0) {
            return Err(FaceError::config(
                "tracking.deceleration_factor must be in (0, 1]",
            ));
        }
        if !(t.movement_threshold >= 0.0) || !(t.max_movement > 0.0) {
            return Err(FaceError::config(
                "tracking.movement_threshold and max_movement must be positive",
            ));
        }
        if t.calibration_frames < 2 {
            return Err(FaceError::config("tracking.calibration_frames must be >= 2"));
        }
        if !(t.calibration_threshold > 0.0 && t.calibration_threshold <= 1.0) {
            return Err(FaceError::config(
                "tracking.calibration_threshold must be in (0, 1]",
            ));
        }
        let g = &self.gestures;
        if g.eye_ar_consec_frames == 0 || g.mouth_ar_consec_frames == 0 {
            return Err(FaceError::config("gesture frame counts must be positive"));
        }
        for (name, v) in [
            ("blink_cooldown", g.blink_cooldown),
            ("mouth_cooldown", g.mouth_cooldown),
            ("click_cooldown", g.click_cooldown),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(FaceError::config(format!("gestures.{name} must be >= 0")));
            }
        }
        let p = &self.pipeline;
        if p.process_every_n_frames == 0 || p.fps_window == 0 {
            return Err(FaceError::config(
                "pipeline.process_every_n_frames and fps_window must be positive",
            ));
        }
        if !(p.max_frame_dt > 0.0) {
            return Err(FaceError::config("pipeline.max_frame_dt must be > 0"));
        }
        if self.source.kind == SourceKind::File && self.source.path.is_none() {
            return Err(FaceError::config("source.kind = \"file\" needs source.path"));
        }
        Ok(())
    }
}
