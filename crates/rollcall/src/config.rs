use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Session configuration.
///
/// Layered: built-in defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables. CLI flags are applied by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    /// One sub-directory of reference images per person.
    pub gallery_dir: PathBuf,
    /// Euclidean distance below which a face matches a gallery entry.
    pub match_threshold: f32,
    /// Arrivals after this time of day are late.
    #[serde(deserialize_with = "deserialize_time")]
    pub late_cutoff: NaiveTime,
    /// Downscale factor applied to frames before detection (0 < s <= 1).
    pub detection_scale: f32,
    /// Minimum SCRFD score for a detection.
    pub detection_confidence: f32,
    /// Most faces embedded per frame.
    pub max_faces: usize,
    /// Frames discarded after the camera opens (AGC/AE settling).
    pub warmup_frames: usize,
    /// Consecutive transient read failures before the source counts as lost.
    pub max_consecutive_failures: usize,
    /// Capacity of the render/announce queue.
    pub effects_queue: usize,
    /// Export the ledger even when the session ended because the camera was lost.
    pub export_partial: bool,
    pub export_db: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
    /// Text-to-speech command; the announcement text is appended as the last argument.
    pub announce_command: Option<String>,
    /// Where annotated frames are written when someone checks in.
    pub snapshot_dir: Option<PathBuf>,
    /// Print the status board to stdout whenever it changes.
    pub show_board: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: data_dir().join("models"),
            gallery_dir: PathBuf::from("students"),
            // ArcFace embeddings are unit length: 1.10 ≈ cosine similarity 0.40.
            match_threshold: 1.10,
            late_cutoff: NaiveTime::from_hms_opt(7, 30, 0).unwrap_or(NaiveTime::MIN),
            detection_scale: 1.0,
            detection_confidence: 0.5,
            max_faces: 16,
            warmup_frames: 4,
            max_consecutive_failures: 30,
            effects_queue: 8,
            export_partial: true,
            export_db: Some(data_dir().join("attendance.db")),
            export_json: None,
            announce_command: None,
            snapshot_dir: None,
            show_board: true,
        }
    }
}

impl Config {
    /// Load from `path`, or from `ROLLCALL_CONFIG` when no path is given,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| lookup("ROLLCALL_CONFIG").map(PathBuf::from));

        let mut config = match file {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                tracing::debug!(path = %path.display(), "loaded config file");
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };

        config.apply_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `ROLLCALL_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MATCH_THRESHOLD") {
            self.match_threshold = parse_env("ROLLCALL_MATCH_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("ROLLCALL_LATE_CUTOFF") {
            self.late_cutoff = parse_time(&v).map_err(|reason| ConfigError::Invalid {
                key: "ROLLCALL_LATE_CUTOFF",
                reason,
            })?;
        }
        if let Some(v) = lookup("ROLLCALL_DETECTION_SCALE") {
            self.detection_scale = parse_env("ROLLCALL_DETECTION_SCALE", &v)?;
        }
        if let Some(v) = lookup("ROLLCALL_WARMUP_FRAMES") {
            self.warmup_frames = parse_env("ROLLCALL_WARMUP_FRAMES", &v)?;
        }
        if let Some(v) = lookup("ROLLCALL_MAX_READ_FAILURES") {
            self.max_consecutive_failures = parse_env("ROLLCALL_MAX_READ_FAILURES", &v)?;
        }
        if let Some(v) = lookup("ROLLCALL_EXPORT_PARTIAL") {
            self.export_partial = parse_flag("ROLLCALL_EXPORT_PARTIAL", &v)?;
        }
        if let Some(v) = lookup("ROLLCALL_EXPORT_DB") {
            self.export_db = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = lookup("ROLLCALL_EXPORT_JSON") {
            self.export_json = non_empty(v).map(PathBuf::from);
        }
        if let Some(v) = lookup("ROLLCALL_ANNOUNCE_COMMAND") {
            self.announce_command = non_empty(v);
        }
        if let Some(v) = lookup("ROLLCALL_SNAPSHOT_DIR") {
            self.snapshot_dir = non_empty(v).map(PathBuf::from);
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("must be positive, got {}", self.match_threshold),
            });
        }
        if !(self.detection_scale > 0.0 && self.detection_scale <= 1.0) {
            return Err(ConfigError::Invalid {
                key: "detection_scale",
                reason: format!("must be in (0, 1], got {}", self.detection_scale),
            });
        }
        if self.effects_queue == 0 {
            return Err(ConfigError::Invalid {
                key: "effects_queue",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                key: "max_consecutive_failures",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn non_empty(v: String) -> Option<String> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

/// Accepts `1`/`0` as well as `true`/`false`.
fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => parse_env(key, &other.to_ascii_lowercase()),
    }
}

fn parse_env<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{value:?}: {e}"),
    })
}

/// Parse a time of day as `HH:MM:SS` or `HH:MM`.
pub fn parse_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|e| format!("{value:?} is not HH:MM[:SS]: {e}"))
}

fn deserialize_time<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveTime, D::Error> {
    let raw = String::deserialize(de)?;
    parse_time(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.late_cutoff, hms(7, 30, 0));
        assert!(c.export_partial);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let c = Config::from_toml(
            r#"
            gallery_dir = "/srv/faces"
            match_threshold = 0.9
            late_cutoff = "08:15"
            detection_scale = 0.5
            export_json = "/tmp/out.json"
            "#,
        )
        .unwrap();

        assert_eq!(c.gallery_dir, PathBuf::from("/srv/faces"));
        assert_eq!(c.match_threshold, 0.9);
        assert_eq!(c.late_cutoff, hms(8, 15, 0));
        assert_eq!(c.detection_scale, 0.5);
        assert_eq!(c.export_json, Some(PathBuf::from("/tmp/out.json")));
        // Untouched fields keep their defaults.
        assert_eq!(c.camera_device, "/dev/video0");
    }

    #[test]
    fn test_toml_rejects_unknown_keys_and_bad_times() {
        assert!(Config::from_toml("threshold = 1.0").is_err());
        assert!(Config::from_toml("late_cutoff = \"25:00\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
            ("ROLLCALL_LATE_CUTOFF", "07:29:59"),
            ("ROLLCALL_EXPORT_PARTIAL", "0"),
            ("ROLLCALL_EXPORT_DB", ""),
            ("ROLLCALL_ANNOUNCE_COMMAND", "espeak -v en"),
        ]
        .into_iter()
        .collect();

        let mut c = Config::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(c.match_threshold, 0.45);
        assert_eq!(c.late_cutoff, hms(7, 29, 59));
        assert!(!c.export_partial);
        assert_eq!(c.export_db, None);
        assert_eq!(c.announce_command.as_deref(), Some("espeak -v en"));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut c = Config::default();
        let err = c
            .apply_overrides(|k| (k == "ROLLCALL_WARMUP_FRAMES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ROLLCALL_WARMUP_FRAMES", .. }));
    }

    #[test]
    fn test_export_partial_flag_values() {
        for (value, expected) in [("1", true), ("0", false), ("true", true), ("FALSE", false)] {
            let mut c = Config::default();
            c.export_partial = !expected;
            c.apply_overrides(|k| (k == "ROLLCALL_EXPORT_PARTIAL").then(|| value.to_string()))
                .unwrap();
            assert_eq!(c.export_partial, expected, "{value}");
        }

        for value in ["no", "off", ""] {
            let mut c = Config::default();
            let err = c
                .apply_overrides(|k| (k == "ROLLCALL_EXPORT_PARTIAL").then(|| value.to_string()))
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: "ROLLCALL_EXPORT_PARTIAL", .. }));
        }
    }

    #[test]
    fn test_validate_rejects_bad_scale() {
        let mut c = Config::default();
        c.detection_scale = 0.0;
        assert!(c.validate().is_err());
        c.detection_scale = 1.5;
        assert!(c.validate().is_err());
        c.detection_scale = 0.25;
        c.validate().unwrap();
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "warmup_frames = 0\nshow_board = false\n").unwrap();
        let c = Config::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(c.warmup_frames, 0);
        assert!(!c.show_board);

        let missing = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "warmup_frames = 3
match_threshold = 0.5
show_board = false
").unwrap();
        let env: HashMap<String, String> = [
            ("ROLLCALL_WARMUP_FRAMES", "7"),
            ("ROLLCALL_CONFIG", "/nonexistent/ignored.toml"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let c = Config::load_with(Some(&path), |k| env.get(k).cloned()).unwrap();
        assert_eq!(c.warmup_frames, 7);
        assert_eq!(c.match_threshold, 0.5);
        assert!(!c.show_board);

        let env: HashMap<String, String> =
            [("ROLLCALL_CONFIG".to_string(), path.display().to_string())].into_iter().collect();
        let c = Config::load_with(None, |k| env.get(k).cloned()).unwrap();
        assert_eq!(c.warmup_frames, 3);
    }
}
