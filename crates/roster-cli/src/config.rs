use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Runtime configuration.
///
/// Built from defaults, then an optional TOML file, then `ROSTER_*`
/// environment variables. Later layers win.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// SCRFD detector file name, relative to `model_dir`.
    pub detector_model: String,
    /// FaceNet embedder file name, relative to `model_dir`.
    pub embedder_model: String,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: roster_core::default_model_dir(),
            db_path: default_data_dir().join("roster.db"),
            similarity_threshold: roster_core::DEFAULT_THRESHOLD,
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "facenet512.onnx".to_string(),
            intra_threads: 4,
        }
    }
}

impl Config {
    /// Load configuration, reading `path` if given and applying environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                Self::from_toml_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("ROSTER_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("ROSTER_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(name) = lookup("ROSTER_DETECTOR_MODEL") {
            self.detector_model = name;
        }
        if let Some(name) = lookup("ROSTER_EMBEDDER_MODEL") {
            self.embedder_model = name;
        }
        if let Some(threshold) = parse_var(&lookup, "ROSTER_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = threshold;
        }
        if let Some(threads) = parse_var(&lookup, "ROSTER_INTRA_THREADS") {
            self.intra_threads = threads;
        }
    }

    fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            );
        }
        if self.intra_threads == 0 {
            bail!("intra_threads must be at least 1");
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("roster")
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.model_dir, PathBuf::from("/usr/share/roster/models"));
        assert!(config.db_path.ends_with("roster/roster.db"));
        assert_eq!(
            config.detector_model_path(),
            PathBuf::from("/usr/share/roster/models/det_10g.onnx")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            db_path = "/var/lib/roster/class.db"
            similarity_threshold = 0.7
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/roster/class.db"));
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.embedder_model, "facenet512.onnx");
        assert_eq!(config.intra_threads, 4);
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(Config::from_toml_str("camera_device = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml_str("similarity_threshold = 0.7").unwrap();
        config.apply_overrides(env(&[
            ("ROSTER_SIMILARITY_THRESHOLD", "0.55"),
            ("ROSTER_MODEL_DIR", "/opt/models"),
            ("ROSTER_EMBEDDER_MODEL", "facenet-v2.onnx"),
            ("ROSTER_INTRA_THREADS", "2"),
        ]));

        assert_eq!(config.similarity_threshold, 0.55);
        assert_eq!(config.intra_threads, 2);
        assert_eq!(
            config.embedder_model_path(),
            PathBuf::from("/opt/models/facenet-v2.onnx")
        );
    }

    #[test]
    fn test_unparsable_env_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[("ROSTER_SIMILARITY_THRESHOLD", "high")]));
        assert_eq!(config.similarity_threshold, 0.6);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = Config::default();
        config.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.intra_threads = 0;
        assert!(config.validate().is_err());
    }
}
