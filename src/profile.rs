//! Per-user profiles and the on-disk profile store.

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::{FaceError, FaceResult};
use crate::landmarks::Point2;
use crate::tracker::MAX_LOOP_GAIN;

pub const DEFAULT_PROFILE: &str = "default";

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

/// Screen rectangle the cursor is locked into, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Region {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Region {
    pub fn validate(&self) -> FaceResult<()> {
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(FaceError::invalid_settings(format!(
                "region_bounds must satisfy x1 < x2 and y1 < y2, got {self:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(skip)]
    pub name: String,
    pub sensitivity: f64,
    pub smoothing: f64,
    pub blink_threshold: f64,
    pub mouth_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_bounds: Option<Region>,
    /// Reference point from the last successful calibration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Point2>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sensitivity: 1.0,
            smoothing: 0.15,
            blink_threshold: 0.23,
            mouth_threshold: 0.5,
            region_bounds: None,
            calibration: None,
        }
    }

    pub fn validate(&self) -> FaceResult<()> {
        if !(self.sensitivity.is_finite() && self.sensitivity > 0.0 && self.sensitivity <= 10.0) {
            return Err(FaceError::invalid_settings("sensitivity must be in (0, 10]"));
        }
        if !(self.smoothing.is_finite() && (0.0..1.0).contains(&self.smoothing)) {
            return Err(FaceError::invalid_settings("smoothing must be in [0, 1)"));
        }
        if !(self.blink_threshold.is_finite() && self.blink_threshold > 0.0) {
            return Err(FaceError::invalid_settings("blink_threshold must be > 0"));
        }
        if !(self.mouth_threshold.is_finite() && self.mouth_threshold > 0.0) {
            return Err(FaceError::invalid_settings("mouth_threshold must be > 0"));
        }
        if let Some(r) = &self.region_bounds {
            r.validate()?;
        }
        Ok(())
    }

    /// Reject smoothing that makes the velocity filter diverge under
    /// `acceleration`.
    pub fn check_loop_gain(&self, acceleration: f64) -> FaceResult<()> {
        let gain = self.smoothing * acceleration;
        if !(gain <= MAX_LOOP_GAIN) {
            return Err(FaceError::invalid_settings(format!(
                "smoothing {} is unstable with acceleration_factor {acceleration}; keep smoothing <= {:.3}",
                self.smoothing,
                MAX_LOOP_GAIN / acceleration
            )));
        }
        Ok(())
    }

    fn parse(name: &str, txt: &str, path: &Path) -> FaceResult<Self> {
        let mut p: Profile = toml::from_str(txt).map_err(|source| FaceError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        p.name = name.to_string();
        p.validate()?;
        Ok(p)
    }
}

/// Partial update of a profile. Absent fields are left alone;
/// `region_bounds = null` (JSON) clears the region.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub sensitivity: Option<f64>,
    pub smoothing: Option<f64>,
    pub blink_threshold: Option<f64>,
    pub mouth_threshold: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub region_bounds: Option<Option<Region>>,
}

fn deserialize_some<'de, T, D>(de: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(de).map(Some)
}

impl SettingsPatch {
    pub fn from_json(v: &serde_json::Value) -> FaceResult<Self> {
        serde_json::from_value(v.clone()).map_err(|e| FaceError::invalid_settings(e.to_string()))
    }

    /// Parse CLI-style `key=value` pairs. `region_bounds=none` clears the
    /// region, `region_bounds=x1,y1,x2,y2` sets it.
    pub fn from_pairs<S: AsRef<str>>(pairs: &[S]) -> FaceResult<Self> {
        let mut patch = SettingsPatch::default();
        for pair in pairs {
            let pair = pair.as_ref();
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| FaceError::invalid_settings(format!("expected key=value: {pair}")))?;
            let (k, v) = (k.trim(), v.trim());
            let num = || {
                v.parse::<f64>()
                    .map_err(|_| FaceError::invalid_settings(format!("{k}: not a number: {v}")))
            };
            match k {
                "sensitivity" => patch.sensitivity = Some(num()?),
                "smoothing" => patch.smoothing = Some(num()?),
                "blink_threshold" => patch.blink_threshold = Some(num()?),
                "mouth_threshold" => patch.mouth_threshold = Some(num()?),
                "region_bounds" => patch.region_bounds = Some(parse_region(v)?),
                other => {
                    return Err(FaceError::invalid_settings(format!(
                        "unknown setting: {other}"
                    )));
                }
            }
        }
        Ok(patch)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut m = serde_json::Map::new();
        let mut put = |k: &str, v: Option<f64>| {
            if let Some(v) = v {
                m.insert(k.to_string(), serde_json::json!(v));
            }
        };
        put("sensitivity", self.sensitivity);
        put("smoothing", self.smoothing);
        put("blink_threshold", self.blink_threshold);
        put("mouth_threshold", self.mouth_threshold);
        if let Some(region) = &self.region_bounds {
            m.insert("region_bounds".to_string(), serde_json::json!(region));
        }
        serde_json::Value::Object(m)
    }

    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }

    /// Merge onto `base`, validating the result. `base` is not touched.
    pub fn merged(&self, base: &Profile) -> FaceResult<Profile> {
        let mut p = base.clone();
        if let Some(v) = self.sensitivity {
            p.sensitivity = v;
        }
        if let Some(v) = self.smoothing {
            p.smoothing = v;
        }
        if let Some(v) = self.blink_threshold {
            p.blink_threshold = v;
        }
        if let Some(v) = self.mouth_threshold {
            p.mouth_threshold = v;
        }
        if let Some(r) = self.region_bounds {
            p.region_bounds = r;
        }
        p.validate()?;
        Ok(p)
    }
}

fn parse_region(v: &str) -> FaceResult<Option<Region>> {
    if v.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let parts: Vec<i32> = v
        .split(',')
        .map(|s| s.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|_| FaceError::invalid_settings(format!("region_bounds: bad value {v}")))?;
    match parts.as_slice() {
        [x1, y1, x2, y2] => Ok(Some(Region {
            x1: *x1,
            y1: *y1,
            x2: *x2,
            y2: *y2,
        })),
        _ => Err(FaceError::invalid_settings(
            "region_bounds expects x1,y1,x2,y2 or none",
        )),
    }
}

/// Profiles under `<root>/profiles/<name>.toml` plus an `active` pointer.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    profiles_dir: PathBuf,
    active_ptr: PathBuf,
    active: Profile,
    acceleration: f64,
}

impl ProfileStore {
    pub fn open_default(acceleration: f64) -> anyhow::Result<Self> {
        let root = crate::config::config_dir()?;
        Ok(Self::load_or_install_default(&root, acceleration)?)
    }

    /// Profiles are checked against the daemon's `acceleration_factor`.
    pub fn load_or_install_default(root: &Path, acceleration: f64) -> FaceResult<Self> {
        let profiles_dir = root.join("profiles");
        fs::create_dir_all(&profiles_dir)?;

        let def_path = profiles_dir.join(format!("{DEFAULT_PROFILE}.toml"));
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = root.join("active");
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(DEFAULT_PROFILE.as_bytes())?;
        }

        let mut name = fs::read_to_string(&active_ptr)?.trim().to_string();
        if name.is_empty() {
            name = DEFAULT_PROFILE.to_string();
        }

        let mut store = Self {
            profiles_dir,
            active_ptr,
            active: Profile::new(&name),
            acceleration,
        };
        match store.load(&name) {
            Ok(p) => store.active = p,
            Err(e) => warn!("active profile '{name}' unusable, using defaults: {e}"),
        }
        Ok(store)
    }

    pub fn active(&self) -> &Profile {
        &self.active
    }

    pub fn active_name(&self) -> &str {
        &self.active.name
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }

    fn path_for(&self, name: &str) -> FaceResult<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(FaceError::invalid_settings(format!(
                "invalid profile name: '{name}'"
            )));
        }
        Ok(self.profiles_dir.join(format!("{name}.toml")))
    }

    pub fn load(&self, name: &str) -> FaceResult<Profile> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(FaceError::ProfileNotFound(name.to_string()));
        }
        let txt = fs::read_to_string(&path)?;
        let profile = Profile::parse(name, &txt, &path)?;
        profile.check_loop_gain(self.acceleration)?;
        Ok(profile)
    }

    pub fn save(&self, profile: &Profile) -> FaceResult<()> {
        let path = self.path_for(&profile.name)?;
        let txt = toml::to_string_pretty(profile)?;
        fs::write(&path, txt)?;
        Ok(())
    }

    /// Re-read the active profile from disk; keeps the current one on error.
    pub fn reload(&mut self) -> FaceResult<&Profile> {
        let p = self.load(&self.active.name)?;
        self.active = p;
        Ok(&self.active)
    }

    /// Switch the active profile, creating it with defaults if it is new.
    pub fn set_active(&mut self, name: &str) -> FaceResult<&Profile> {
        let profile = match self.load(name) {
            Ok(p) => p,
            Err(FaceError::ProfileNotFound(_)) => {
                let p = Profile::new(name);
                self.save(&p)?;
                info!("created new profile '{name}'");
                p
            }
            Err(e) => return Err(e),
        };
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active = profile;
        Ok(&self.active)
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        v.push(stem.to_string());
                    }
                }
            }
        }
        v.sort();
        v
    }

    /// Validate and persist a settings merge onto the active profile.
    pub fn apply_settings(&mut self, patch: &SettingsPatch) -> FaceResult<&Profile> {
        let merged = patch.merged(&self.active)?;
        merged.check_loop_gain(self.acceleration)?;
        self.save(&merged)?;
        self.active = merged;
        Ok(&self.active)
    }

    /// Record a calibration reference on the active profile.
    pub fn record_calibration(&mut self, reference: Point2) -> FaceResult<()> {
        let mut p = self.active.clone();
        p.calibration = Some(reference);
        self.save(&p)?;
        self.active = p;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCEL: f64 = 1.5;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load_or_install_default(dir.path(), ACCEL).unwrap();
        (dir, store)
    }

    #[test]
    fn installs_default_profile() {
        let (dir, store) = store();
        assert_eq!(store.active_name(), DEFAULT_PROFILE);
        assert!(dir.path().join("profiles/default.toml").exists());
        assert_eq!(store.active().smoothing, 0.15);
        assert_eq!(store.active().blink_threshold, 0.23);
        assert_eq!(store.list_profiles(), vec!["default".to_string()]);
    }

    #[test]
    fn set_active_creates_missing_profile() {
        let (dir, mut store) = store();
        store.set_active("alice").unwrap();
        assert_eq!(store.active_name(), "alice");
        assert!(dir.path().join("profiles/alice.toml").exists());
        let ptr = fs::read_to_string(dir.path().join("active")).unwrap();
        assert_eq!(ptr, "alice");
        assert_eq!(store.list_profiles(), vec!["alice", "default"]);
    }

    #[test]
    fn rejects_path_like_names() {
        let (_dir, mut store) = store();
        assert!(store.set_active("../etc").is_err());
        assert_eq!(store.active_name(), DEFAULT_PROFILE);
    }

    #[test]
    fn apply_settings_persists() {
        let (dir, mut store) = store();
        let patch = SettingsPatch::from_pairs(&["smoothing=0.4", "region_bounds=10,20,300,400"])
            .unwrap();
        store.apply_settings(&patch).unwrap();
        assert_eq!(store.active().smoothing, 0.4);

        let reopened = ProfileStore::load_or_install_default(dir.path(), ACCEL).unwrap();
        assert_eq!(reopened.active().smoothing, 0.4);
        assert_eq!(
            reopened.active().region_bounds,
            Some(Region {
                x1: 10,
                y1: 20,
                x2: 300,
                y2: 400
            })
        );
    }

    #[test]
    fn invalid_settings_leave_profile_unchanged() {
        let (_dir, mut store) = store();
        let before = store.active().clone();
        let patch = SettingsPatch::from_pairs(&["smoothing=0.3", "sensitivity=-1"]).unwrap();
        let err = store.apply_settings(&patch).unwrap_err();
        assert!(matches!(err, FaceError::InvalidSettings(_)));
        assert_eq!(store.active(), &before);
    }

    #[test]
    fn smoothing_must_stay_stable_under_acceleration() {
        let (dir, mut store) = store();
        let before = store.active().clone();
        let patch = SettingsPatch::from_pairs(&["smoothing=0.9"]).unwrap();
        let err = store.apply_settings(&patch).unwrap_err();
        assert!(matches!(err, FaceError::InvalidSettings(_)));
        assert_eq!(store.active(), &before);

        // accepted on its own, rejected under a stronger acceleration
        let patch = SettingsPatch::from_pairs(&["smoothing=0.6"]).unwrap();
        store.apply_settings(&patch).unwrap();
        let reopened = ProfileStore::load_or_install_default(dir.path(), 2.0).unwrap();
        assert_eq!(reopened.active(), &Profile::new(DEFAULT_PROFILE));
        assert!(matches!(
            reopened.load(DEFAULT_PROFILE),
            Err(FaceError::InvalidSettings(_))
        ));
    }

    #[test]
    fn json_patch_rejects_unknown_and_non_numeric() {
        let unknown = serde_json::json!({"sensitivity": 1.0, "volume": 11});
        assert!(SettingsPatch::from_json(&unknown).is_err());
        let bad = serde_json::json!({"blink_threshold": "low"});
        assert!(SettingsPatch::from_json(&bad).is_err());
    }

    #[test]
    fn json_null_region_clears() {
        let mut base = Profile::new("p");
        base.region_bounds = Some(Region {
            x1: 0,
            y1: 0,
            x2: 10,
            y2: 10,
        });
        let patch = SettingsPatch::from_json(&serde_json::json!({"region_bounds": null})).unwrap();
        assert_eq!(patch.region_bounds, Some(None));
        assert_eq!(patch.merged(&base).unwrap().region_bounds, None);

        let untouched = SettingsPatch::from_json(&serde_json::json!({"smoothing": 0.2})).unwrap();
        assert_eq!(untouched.region_bounds, None);
        assert!(untouched.merged(&base).unwrap().region_bounds.is_some());
    }

    #[test]
    fn pairs_round_trip_through_json() {
        let patch =
            SettingsPatch::from_pairs(&["mouth_threshold=0.6", "region_bounds=none"]).unwrap();
        let back = SettingsPatch::from_json(&patch.to_json()).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn inverted_region_rejected() {
        let patch = SettingsPatch::from_pairs(&["region_bounds=300,0,100,50"]).unwrap();
        assert!(patch.merged(&Profile::new("p")).is_err());
    }

    #[test]
    fn corrupt_active_profile_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("profiles")).unwrap();
        fs::write(dir.path().join("profiles/default.toml"), "sensitivity = \"x\"").unwrap();
        let store = ProfileStore::load_or_install_default(dir.path(), ACCEL).unwrap();
        assert_eq!(store.active(), &Profile::new(DEFAULT_PROFILE));
    }

    #[test]
    fn calibration_snapshot_saved() {
        let (_dir, mut store) = store();
        store.record_calibration(Point2::new(320.0, 240.0)).unwrap();
        let p = store.load(DEFAULT_PROFILE).unwrap();
        assert_eq!(p.calibration, Some(Point2::new(320.0, 240.0)));
    }
}
