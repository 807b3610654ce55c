//! Error taxonomy for the tracking core and its boundaries.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FaceError {
    /// One frame of landmark data was unusable; the frame is skipped.
    #[error("malformed landmarks: {0}")]
    MalformedLandmarks(String),

    /// A settings payload failed validation; nothing was applied.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// The landmark source (detector socket, replay file) could not be opened.
    #[error("landmark source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to parse {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type FaceResult<T> = Result<T, FaceError>;

impl FaceError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedLandmarks(msg.into())
    }

    pub fn invalid_settings(msg: impl Into<String>) -> Self {
        Self::InvalidSettings(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
